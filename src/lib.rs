//! # Chips Runtime - 薯片插件运行时
//!
//! 薯片插件运行时负责在宿主进程中托管一组插件模块，提供以下核心功能：
//!
//! - **模块管理**: 清单校验、依赖与冲突检查、按依赖顺序加载
//! - **生命周期**: init / start / stop / destroy 钩子，失败时回滚
//! - **钩子总线**: 按优先级分组、组内并行的 action 与 filter 钩子
//! - **设置存储**: 按模块命名空间的设置、模式校验、防抖持久化
//! - **跨上下文通信**: 基于 request_id 的请求/响应、事件与广播
//! - **编排**: 启停命令单飞执行，存储变化在多个上下文之间收敛
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chips_runtime::{ModuleDescriptor, ModuleManifest, PluginRuntime, StaticModuleSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = StaticModuleSource::new();
//!     source.add(
//!         ModuleDescriptor::new(ModuleManifest::new("greeter", "Greeter", "1.0.0"))
//!             .on_start(|ctx| async move {
//!                 tracing::info!(module_id = %ctx.module_id(), "hello");
//!                 Ok(())
//!             }),
//!         true,
//!     );
//!
//!     let runtime = PluginRuntime::builder().source(Arc::new(source)).build();
//!     runtime.initialize().await?;
//!     runtime.disable_plugin("greeter").await?;
//!     runtime.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `api` - 运行时入口、客户端与 IPC
//! - `bus` - 钩子总线
//! - `config` - 设置存储
//! - `core` - 运行时配置与宿主环境
//! - `module` - 模块目录、加载与生命周期
//! - `utils` - 错误类型与日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod bus;
pub mod config;
pub mod core;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{InitReport, PluginRuntime, PluginRuntimeBuilder, RuntimeClient, RuntimePhase};
pub use bus::{EventBus, HookFlow, HookOptions};
pub use config::{ConfigStore, FileStore, MemoryStore, PersistentStore, SettingDefinition};
pub use core::{HostEnvironment, RuntimeConfig};
pub use module::{
    ModuleCatalog, ModuleDescriptor, ModuleInfo, ModuleManifest, ModuleState, PluginContext,
    StaticModuleSource,
};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, RotationStrategy};
pub use utils::{error_code, CoreError, Result};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
