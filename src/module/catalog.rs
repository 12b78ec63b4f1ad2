//! 模块目录
//!
//! 保存所有已注册模块的清单、实例、状态、错误与依赖图。
//! 目录是这些数据的唯一所有者，其他组件只能通过这里的方法读写。
//! 所有修改都是同步的，只作用于目录自身的表，从不调用模块代码。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::dependency::{DependencyGraph, EdgeKind};
use super::descriptor::ModuleDescriptor;
use super::manifest::ModuleManifest;
use crate::utils::sync::{read, write};
use crate::utils::{CoreError, Result};

/// 模块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    /// 已注册但未加载
    Unloaded,
    /// 正在加载
    Loading,
    /// 已加载
    Loaded,
    /// 正在启动
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已停止
    Stopped,
    /// 错误状态
    Error,
    /// 已销毁
    Destroyed,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState::Unloaded
    }
}

impl ModuleState {
    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, ModuleState::Loaded | ModuleState::Stopped)
    }

    /// 是否可以停止
    pub fn can_stop(&self) -> bool {
        matches!(self, ModuleState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Unloaded => "UNLOADED",
            ModuleState::Loading => "LOADING",
            ModuleState::Loaded => "LOADED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Stopped => "STOPPED",
            ModuleState::Error => "ERROR",
            ModuleState::Destroyed => "DESTROYED",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 依赖检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCheck {
    pub met: bool,
    /// 未处于活动状态的必需依赖
    pub missing: Vec<String>,
}

/// 冲突检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCheck {
    pub conflicts: bool,
    /// 与之冲突的活动模块
    pub conflicting: Vec<String>,
}

/// 模块运行时信息（对外展示的形状）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    /// 清单
    #[serde(flatten)]
    pub manifest: ModuleManifest,

    /// 当前状态
    pub state: ModuleState,

    /// 最后错误信息
    #[serde(default)]
    pub error: Option<String>,

    /// 是否已执行 init
    #[serde(default)]
    pub initialized: bool,

    /// 直接依赖（必需与可选）
    #[serde(default)]
    pub module_dependencies: Vec<String>,

    /// 直接依赖者
    #[serde(default)]
    pub dependents: Vec<String>,

    pub registered_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ModuleInfo {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn is_active(&self) -> bool {
        self.state == ModuleState::Active
    }
}

/// 目录统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    /// 模块总数
    pub total: usize,
    /// 各状态的模块数
    pub by_state: BTreeMap<ModuleState, usize>,
    /// 带有错误记录的模块数
    pub with_errors: usize,
}

/// 单个模块的记录
struct ModuleRecord {
    manifest: Arc<ModuleManifest>,
    state: ModuleState,
    instance: Option<Arc<ModuleDescriptor>>,
    error: Option<String>,
    registered_at: DateTime<Utc>,
    loaded_at: Option<DateTime<Utc>>,
    initialized_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CatalogInner {
    modules: HashMap<String, ModuleRecord>,
    /// 注册顺序
    order: Vec<String>,
    graph: DependencyGraph,
}

impl CatalogInner {
    fn record_mut(&mut self, module_id: &str) -> Result<&mut ModuleRecord> {
        self.modules
            .get_mut(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))
    }

    fn state(&self, module_id: &str) -> ModuleState {
        self.modules
            .get(module_id)
            .map_or(ModuleState::Unloaded, |r| r.state)
    }

    fn info(&self, module_id: &str) -> Option<ModuleInfo> {
        let record = self.modules.get(module_id)?;
        Some(ModuleInfo {
            manifest: (*record.manifest).clone(),
            state: record.state,
            error: record.error.clone(),
            initialized: record.initialized_at.is_some(),
            module_dependencies: self.graph.dependencies(module_id, None),
            dependents: self.graph.dependents(module_id, None),
            registered_at: record.registered_at,
            loaded_at: record.loaded_at,
            initialized_at: record.initialized_at,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
        })
    }
}

/// 模块目录
#[derive(Default)]
pub struct ModuleCatalog {
    inner: RwLock<CatalogInner>,
}

impl ModuleCatalog {
    /// 创建空目录
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== 注册 ====================

    /// 注册清单
    ///
    /// 新模块的状态为 `UNLOADED`，并按声明建立依赖边。
    pub fn register(&self, manifest: ModuleManifest) -> Result<()> {
        let mut inner = write(&self.inner);
        if inner.modules.contains_key(&manifest.id) {
            return Err(CoreError::DuplicateModule(manifest.id));
        }

        let id = manifest.id.clone();
        inner.graph.add_module(&id);
        for dep in &manifest.dependencies {
            inner.graph.add_dependency(&id, dep, EdgeKind::Required);
        }
        for dep in &manifest.optional_dependencies {
            inner.graph.add_dependency(&id, dep, EdgeKind::Optional);
        }

        inner.modules.insert(
            id.clone(),
            ModuleRecord {
                manifest: Arc::new(manifest),
                state: ModuleState::Unloaded,
                instance: None,
                error: None,
                registered_at: Utc::now(),
                loaded_at: None,
                initialized_at: None,
                started_at: None,
                stopped_at: None,
            },
        );
        inner.order.push(id.clone());
        drop(inner);

        debug!(module_id = %id, "模块已注册");
        Ok(())
    }

    /// 注销模块，返回其清单
    pub fn unregister(&self, module_id: &str) -> Result<Arc<ModuleManifest>> {
        let mut inner = write(&self.inner);
        let record = inner
            .modules
            .remove(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        inner.order.retain(|id| id != module_id);
        inner.graph.detach_module(module_id);
        drop(inner);

        if record.state == ModuleState::Active {
            warn!(module_id = %module_id, "注销了仍处于活动状态的模块");
        }
        info!(module_id = %module_id, "模块已注销");
        Ok(record.manifest)
    }

    pub fn contains(&self, module_id: &str) -> bool {
        read(&self.inner).modules.contains_key(module_id)
    }

    pub fn len(&self) -> usize {
        read(&self.inner).modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有模块 ID（按注册顺序）
    pub fn ids(&self) -> Vec<String> {
        read(&self.inner).order.clone()
    }

    pub fn manifest(&self, module_id: &str) -> Option<Arc<ModuleManifest>> {
        read(&self.inner)
            .modules
            .get(module_id)
            .map(|r| r.manifest.clone())
    }

    // ==================== 实例 ====================

    /// 保存模块实例
    pub fn set_instance(&self, module_id: &str, instance: Arc<ModuleDescriptor>) -> Result<()> {
        let mut inner = write(&self.inner);
        inner.record_mut(module_id)?.instance = Some(instance);
        Ok(())
    }

    pub fn instance(&self, module_id: &str) -> Option<Arc<ModuleDescriptor>> {
        read(&self.inner)
            .modules
            .get(module_id)
            .and_then(|r| r.instance.clone())
    }

    // ==================== 状态 ====================

    /// 设置状态，并记录对应的时间戳
    pub fn set_state(&self, module_id: &str, state: ModuleState) -> Result<()> {
        let mut inner = write(&self.inner);
        let record = inner.record_mut(module_id)?;
        let previous = record.state;
        record.state = state;

        let now = Utc::now();
        match state {
            ModuleState::Loaded if previous == ModuleState::Loading => record.loaded_at = Some(now),
            ModuleState::Active => record.started_at = Some(now),
            ModuleState::Stopped if previous == ModuleState::Stopping => {
                record.stopped_at = Some(now)
            }
            _ => {}
        }
        drop(inner);

        if previous != state {
            debug!(module_id = %module_id, from = %previous, to = %state, "模块状态变化");
        }
        Ok(())
    }

    /// 获取状态，未知模块返回 `UNLOADED`
    pub fn state(&self, module_id: &str) -> ModuleState {
        read(&self.inner).state(module_id)
    }

    /// 记录模块已执行 init
    pub fn mark_initialized(&self, module_id: &str) -> Result<()> {
        let mut inner = write(&self.inner);
        inner.record_mut(module_id)?.initialized_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_initialized(&self, module_id: &str) -> bool {
        read(&self.inner)
            .modules
            .get(module_id)
            .map_or(false, |r| r.initialized_at.is_some())
    }

    // ==================== 错误 ====================

    /// 记录错误，同时把状态置为 `ERROR`
    pub fn set_error(&self, module_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let mut inner = write(&self.inner);
        let record = inner.record_mut(module_id)?;
        record.state = ModuleState::Error;
        record.error = Some(error.clone());
        drop(inner);

        warn!(module_id = %module_id, error = %error, "模块进入错误状态");
        Ok(())
    }

    pub fn clear_error(&self, module_id: &str) -> Result<()> {
        let mut inner = write(&self.inner);
        inner.record_mut(module_id)?.error = None;
        Ok(())
    }

    pub fn error(&self, module_id: &str) -> Option<String> {
        read(&self.inner)
            .modules
            .get(module_id)
            .and_then(|r| r.error.clone())
    }

    // ==================== 依赖与冲突 ====================

    /// 检查必需依赖是否全部处于活动状态（可选依赖不参与）
    pub fn check_dependencies(&self, module_id: &str) -> DependencyCheck {
        let inner = read(&self.inner);
        let missing: Vec<String> = inner
            .graph
            .dependencies(module_id, Some(EdgeKind::Required))
            .into_iter()
            .filter(|dep| inner.state(dep) != ModuleState::Active)
            .collect();
        DependencyCheck {
            met: missing.is_empty(),
            missing,
        }
    }

    /// 检查与活动模块的冲突
    ///
    /// 冲突是对称的：本模块声明冲突的活动模块，以及声明与本模块冲突的活动模块。
    pub fn check_conflicts(&self, module_id: &str) -> ConflictCheck {
        let inner = read(&self.inner);
        let declared: Vec<String> = inner
            .modules
            .get(module_id)
            .map(|r| r.manifest.conflicts.clone())
            .unwrap_or_default();

        let conflicting: Vec<String> = inner
            .order
            .iter()
            .filter(|id| id.as_str() != module_id)
            .filter(|id| inner.state(id) == ModuleState::Active)
            .filter(|id| {
                declared.iter().any(|c| c == *id)
                    || inner
                        .modules
                        .get(id.as_str())
                        .map_or(false, |r| r.manifest.conflicts.iter().any(|c| c == module_id))
            })
            .cloned()
            .collect();

        ConflictCheck {
            conflicts: !conflicting.is_empty(),
            conflicting,
        }
    }

    /// 仍处于活动状态、且必需依赖本模块的模块
    pub fn active_dependents(&self, module_id: &str) -> Vec<String> {
        let inner = read(&self.inner);
        inner
            .graph
            .dependents(module_id, Some(EdgeKind::Required))
            .into_iter()
            .filter(|id| inner.state(id) == ModuleState::Active)
            .collect()
    }

    /// 直接依赖（必需与可选）
    pub fn dependencies(&self, module_id: &str) -> Vec<String> {
        read(&self.inner).graph.dependencies(module_id, None)
    }

    /// 直接依赖者
    pub fn dependents(&self, module_id: &str) -> Vec<String> {
        read(&self.inner).graph.dependents(module_id, None)
    }

    /// 计算加载顺序
    pub fn resolve_order(&self, ids: &[String]) -> Result<Vec<String>> {
        read(&self.inner).graph.resolve_order(ids)
    }

    // ==================== 查询 ====================

    /// 处于指定状态的模块（按注册顺序）
    pub fn modules_by_state(&self, state: ModuleState) -> Vec<String> {
        let inner = read(&self.inner);
        inner
            .order
            .iter()
            .filter(|id| inner.state(id) == state)
            .cloned()
            .collect()
    }

    /// 带有指定标签的模块
    pub fn by_tag(&self, tag: &str) -> Vec<String> {
        self.filter_manifests(|m| m.tags.iter().any(|t| t == tag))
    }

    /// 属于指定分类的模块
    pub fn by_category(&self, category: &str) -> Vec<String> {
        self.filter_manifests(|m| m.category.as_deref() == Some(category))
    }

    /// 按 ID、名称、描述搜索（不区分大小写）
    pub fn search(&self, query: &str) -> Vec<String> {
        let query = query.to_lowercase();
        self.filter_manifests(|m| {
            m.id.to_lowercase().contains(&query)
                || m.name.to_lowercase().contains(&query)
                || m.description.to_lowercase().contains(&query)
        })
    }

    fn filter_manifests<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&ModuleManifest) -> bool,
    {
        let inner = read(&self.inner);
        inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .modules
                    .get(id.as_str())
                    .map_or(false, |r| predicate(&r.manifest))
            })
            .cloned()
            .collect()
    }

    /// 单个模块的信息
    pub fn module_info(&self, module_id: &str) -> Option<ModuleInfo> {
        read(&self.inner).info(module_id)
    }

    /// 所有模块的信息（按注册顺序）
    pub fn all_module_info(&self) -> Vec<ModuleInfo> {
        let inner = read(&self.inner);
        inner.order.iter().filter_map(|id| inner.info(id)).collect()
    }

    /// 统计信息
    pub fn stats(&self) -> CatalogStats {
        let inner = read(&self.inner);
        let mut stats = CatalogStats {
            total: inner.modules.len(),
            ..Default::default()
        };
        for record in inner.modules.values() {
            *stats.by_state.entry(record.state).or_insert(0) += 1;
            if record.error.is_some() {
                stats.with_errors += 1;
            }
        }
        stats
    }
}
