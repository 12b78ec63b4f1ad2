//! 模块加载器
//!
//! 负责模块的发现、加载顺序计算和加载操作。
//!
//! 发现阶段从宿主的注册表文档读取候选模块，逐个导入并校验清单，
//! 合法的清单注册到目录中；单个模块的失败只记录日志，不影响其余模块。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::catalog::{ModuleCatalog, ModuleState};
use super::descriptor::ModuleDescriptor;
use super::source::{ModuleSource, RegistryEntry};
use crate::utils::sync::{read, write};
use crate::utils::{CoreError, Result};

/// 被跳过的模块
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedModule {
    pub id: String,
    pub reason: String,
}

/// 发现结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    /// 已注册的模块（按注册表顺序）
    pub registered: Vec<String>,
    /// 被跳过的模块及原因
    pub skipped: Vec<SkippedModule>,
    /// 注册表中默认启用的模块
    pub enabled_by_default: Vec<String>,
}

/// 批量加载结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    /// 加载成功的模块（按加载顺序）
    pub loaded: Vec<String>,
    /// 加载失败的模块及原因
    pub failed: Vec<SkippedModule>,
}

/// 模块加载器
pub struct ModuleLoader {
    catalog: Arc<ModuleCatalog>,
    source: Arc<dyn ModuleSource>,
    /// 已导入的描述符：模块 ID -> 描述符
    imported: RwLock<HashMap<String, Arc<ModuleDescriptor>>>,
}

impl ModuleLoader {
    /// 创建加载器
    pub fn new(catalog: Arc<ModuleCatalog>, source: Arc<dyn ModuleSource>) -> Self {
        Self {
            catalog,
            source,
            imported: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    // ==================== 发现 ====================

    /// 发现并注册模块
    ///
    /// 只有读取注册表文档本身失败时才返回错误。
    pub async fn discover_plugins(&self) -> Result<DiscoveryReport> {
        let entries = self.source.registry().await?;
        info!(count = entries.len(), "开始发现模块");

        let mut report = DiscoveryReport::default();
        for entry in entries {
            match self.discover_one(&entry).await {
                Ok(()) => {
                    if entry.enabled {
                        report.enabled_by_default.push(entry.id.clone());
                    }
                    report.registered.push(entry.id);
                }
                Err(e) => {
                    warn!(module_id = %entry.id, path = %entry.path, error = %e, "跳过模块");
                    report.skipped.push(SkippedModule {
                        id: entry.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            "模块发现完成"
        );
        Ok(report)
    }

    async fn discover_one(&self, entry: &RegistryEntry) -> Result<()> {
        let descriptor = self.source.import(&entry.path).await?;
        descriptor.manifest.validate()?;

        if descriptor.id() != entry.id {
            return Err(CoreError::ManifestInvalid {
                module_id: entry.id.clone(),
                reason: format!("清单 ID '{}' 与注册表不一致", descriptor.id()),
            });
        }

        self.catalog.register(descriptor.manifest.clone())?;
        write(&self.imported).insert(entry.id.clone(), Arc::new(descriptor));
        debug!(module_id = %entry.id, "模块已注册");
        Ok(())
    }

    // ==================== 加载 ====================

    /// 计算加载顺序
    pub fn resolve_load_order(&self, ids: &[String]) -> Result<Vec<String>> {
        self.catalog.resolve_order(ids)
    }

    /// 加载单个模块
    ///
    /// 已加载的模块直接返回缓存的实例。
    /// 必需依赖必须已注册且已加载，且不能与活动模块冲突。
    pub async fn load_plugin(&self, module_id: &str) -> Result<Arc<ModuleDescriptor>> {
        if !self.catalog.contains(module_id) {
            return Err(CoreError::ModuleNotFound(module_id.to_string()));
        }
        if let Some(instance) = self.catalog.instance(module_id) {
            debug!(module_id = %module_id, "模块已加载，返回缓存实例");
            return Ok(instance);
        }

        let state = self.catalog.state(module_id);
        if !matches!(state, ModuleState::Unloaded | ModuleState::Error) {
            return Err(CoreError::InvalidStateTransition {
                module: module_id.to_string(),
                state: state.to_string(),
                operation: "load".to_string(),
            });
        }

        self.check_preconditions(module_id)?;

        info!(module_id = %module_id, "开始加载模块");
        self.catalog.set_state(module_id, ModuleState::Loading)?;

        match self.import(module_id).await {
            Ok(descriptor) => {
                self.catalog.set_instance(module_id, descriptor.clone())?;
                self.catalog.clear_error(module_id)?;
                self.catalog.set_state(module_id, ModuleState::Loaded)?;
                info!(module_id = %module_id, "模块加载完成");
                Ok(descriptor)
            }
            Err(e) => {
                error!(module_id = %module_id, error = %e, "模块加载失败");
                self.catalog.set_error(module_id, e.to_string())?;
                Err(e)
            }
        }
    }

    fn check_preconditions(&self, module_id: &str) -> Result<()> {
        let manifest = self
            .catalog
            .manifest(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;

        let missing: Vec<String> = manifest
            .dependencies
            .iter()
            .filter(|dep| self.catalog.instance(dep).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            let err = CoreError::DependencyUnmet {
                module: module_id.to_string(),
                missing,
            };
            self.catalog.set_error(module_id, err.to_string())?;
            return Err(err);
        }

        let conflicts = self.catalog.check_conflicts(module_id);
        if conflicts.conflicts {
            let err = CoreError::ConflictDetected {
                module: module_id.to_string(),
                conflicting: conflicts.conflicting,
            };
            self.catalog.set_error(module_id, err.to_string())?;
            return Err(err);
        }
        Ok(())
    }

    async fn import(&self, module_id: &str) -> Result<Arc<ModuleDescriptor>> {
        if let Some(descriptor) = read(&self.imported).get(module_id).cloned() {
            return Ok(descriptor);
        }

        // 目录中直接注册的清单没有发现阶段的导入缓存，按注册表里的路径导入
        let load_failed = |reason: String| CoreError::ModuleLoadFailed {
            module_id: module_id.to_string(),
            reason,
        };
        let entry = self
            .source
            .registry()
            .await
            .map_err(|e| load_failed(e.to_string()))?
            .into_iter()
            .find(|entry| entry.id == module_id)
            .ok_or_else(|| load_failed("注册表中没有该模块的条目".to_string()))?;
        let descriptor = self
            .source
            .import(&entry.path)
            .await
            .map_err(|e| load_failed(e.to_string()))?;
        let descriptor = Arc::new(descriptor);
        write(&self.imported).insert(module_id.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// 按依赖顺序批量加载
    ///
    /// 存在环时，环上（以及依赖环）的模块记为失败，其余模块照常加载。
    pub async fn load_plugins(&self, ids: &[String]) -> LoadReport {
        let mut report = LoadReport::default();

        let order = match self.resolve_load_order(ids) {
            Ok(order) => order,
            Err(CoreError::CircularDependency(cyclic)) => {
                error!(modules = ?cyclic, "检测到循环依赖，跳过相关模块");
                let reason = CoreError::CircularDependency(cyclic.clone()).to_string();
                for id in &cyclic {
                    if let Err(e) = self.catalog.set_error(id, reason.clone()) {
                        warn!(module_id = %id, error = %e, "记录循环依赖错误失败");
                    }
                    report.failed.push(SkippedModule {
                        id: id.clone(),
                        reason: reason.clone(),
                    });
                }
                let excluded: HashSet<&String> = cyclic.iter().collect();
                let rest: Vec<String> = ids
                    .iter()
                    .filter(|id| !excluded.contains(id))
                    .cloned()
                    .collect();
                self.resolve_load_order(&rest).unwrap_or(rest)
            }
            Err(e) => {
                error!(error = %e, "计算加载顺序失败");
                ids.to_vec()
            }
        };

        for id in order {
            match self.load_plugin(&id).await {
                Ok(_) => report.loaded.push(id),
                Err(e) => report.failed.push(SkippedModule {
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "批量加载完成"
        );
        report
    }

    /// 已导入的描述符
    pub fn descriptor(&self, module_id: &str) -> Option<Arc<ModuleDescriptor>> {
        read(&self.imported).get(module_id).cloned()
    }
}
