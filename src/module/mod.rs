//! 模块管理模块
//!
//! 包含模块管理系统的核心组件：
//! - 模块清单与描述符
//! - 模块目录与依赖图
//! - 模块发现与加载
//! - 生命周期控制

pub mod catalog;
pub mod context;
pub mod dependency;
pub mod descriptor;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod source;

// 重导出常用类型
pub use catalog::{CatalogStats, ConflictCheck, DependencyCheck, ModuleCatalog, ModuleInfo, ModuleState};
pub use context::PluginContext;
pub use dependency::{DependencyGraph, EdgeKind};
pub use descriptor::{BoundHookFn, Capabilities, HookBinding, LifecycleFn, ModuleDescriptor};
pub use lifecycle::{LifecycleController, Phase};
pub use loader::{DiscoveryReport, LoadReport, ModuleLoader, SkippedModule};
pub use manifest::ModuleManifest;
pub use source::{ModuleSource, RegistryEntry, StaticModuleSource};
