//! API 模块
//!
//! 包含对外提供的运行时入口和跨上下文通信机制。
//!
//! # 模块概览
//!
//! - `runtime`: [`PluginRuntime`] 主接口，编排模块、设置与通信
//! - `client`: [`RuntimeClient`]，其他上下文调用运行时命令的强类型客户端
//! - `ipc`: 消息信封、传输抽象和消息代理
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::api::ipc::LocalHub;
//! use chips_runtime::api::{PluginRuntime, RuntimeClient};
//! use chips_runtime::api::ipc::MessageBroker;
//! use chips_runtime::RuntimeConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = LocalHub::new();
//!     let config = RuntimeConfig::builder().context("background").build();
//!     let runtime = PluginRuntime::builder()
//!         .config(config)
//!         .transport(hub.endpoint("background"))
//!         .build();
//!     runtime.initialize().await?;
//!
//!     let panel = MessageBroker::new(hub.endpoint("panel"), "panel", Duration::from_secs(5));
//!     let client = RuntimeClient::new(panel).with_target("background");
//!     println!("{}", client.ping().await?);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod ipc;
pub mod runtime;

// 重导出主要类型
pub use client::RuntimeClient;
pub use runtime::{
    InitReport, Operation, OperationToken, PluginRuntime, PluginRuntimeBuilder, RuntimePhase,
    RuntimeStats,
};
