//! 模块来源
//!
//! 宿主提供一份有序的注册表文档 `[{id, path, enabled}]`，
//! 以及按路径导入模块的能力。加载器只依赖 [`ModuleSource`] 接口。

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::descriptor::ModuleDescriptor;
use crate::utils::sync::{read, write};
use crate::utils::{CoreError, Result};

/// 注册表条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// 模块 ID
    pub id: String,
    /// 导入路径
    pub path: String,
    /// 首次发现时是否默认启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// 模块来源接口
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// 读取注册表文档
    async fn registry(&self) -> Result<Vec<RegistryEntry>>;

    /// 导入模块
    async fn import(&self, path: &str) -> Result<ModuleDescriptor>;
}

/// 静态模块来源
///
/// 注册表和可导入的模块都保存在内存中，适合把模块编译进宿主的场景。
#[derive(Default)]
pub struct StaticModuleSource {
    entries: RwLock<Vec<RegistryEntry>>,
    modules: RwLock<HashMap<String, ModuleDescriptor>>,
}

impl StaticModuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块，路径为 `modules/{id}`
    pub fn add(&self, descriptor: ModuleDescriptor, enabled: bool) -> &Self {
        let path = format!("modules/{}", descriptor.id());
        write(&self.entries).push(RegistryEntry {
            id: descriptor.id().to_string(),
            path: path.clone(),
            enabled,
        });
        write(&self.modules).insert(path, descriptor);
        self
    }

    /// 只添加注册表条目（路径可能无法导入）
    pub fn add_entry(&self, entry: RegistryEntry) -> &Self {
        write(&self.entries).push(entry);
        self
    }

    /// 只添加可导入的模块
    pub fn insert_module(&self, path: impl Into<String>, descriptor: ModuleDescriptor) -> &Self {
        write(&self.modules).insert(path.into(), descriptor);
        self
    }
}

#[async_trait]
impl ModuleSource for StaticModuleSource {
    async fn registry(&self) -> Result<Vec<RegistryEntry>> {
        Ok(read(&self.entries).clone())
    }

    async fn import(&self, path: &str) -> Result<ModuleDescriptor> {
        read(&self.modules)
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::ModuleLoadFailed {
                module_id: path.to_string(),
                reason: format!("无法导入路径: {}", path),
            })
    }
}
