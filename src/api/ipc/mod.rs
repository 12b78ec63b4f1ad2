//! 跨上下文通信
//!
//! 不同的执行上下文（页面、后台、控制面板）之间不能共享内存，
//! 只能通过消息通道交换 [`Envelope`]。本模块提供：
//!
//! - [`Transport`]：宿主消息通道的抽象，以及进程内实现 [`LocalHub`]
//! - [`MessageBroker`]：基于 request_id 的请求/响应、事件与广播
//! - [`actions`]：运行时对外暴露的 action 名称
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use chips_runtime::api::ipc::{action_handler, LocalHub, MessageBroker, RequestOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = LocalHub::new();
//!     let background = MessageBroker::new(hub.endpoint("background"), "background", Duration::from_secs(5));
//!     let panel = MessageBroker::new(hub.endpoint("panel"), "panel", Duration::from_secs(5));
//!
//!     background.on("ping", action_handler(|_| async { Ok(json!("pong")) }));
//!     let reply = panel.request("ping", json!(null), RequestOptions::default()).await?;
//!     assert_eq!(reply, json!("pong"));
//!     Ok(())
//! }
//! ```

mod broker;
mod envelope;
mod transport;

pub use broker::{action_handler, ActionHandler, BrokerStats, MessageBroker, RequestOptions};
pub use envelope::{Envelope, EnvelopeType};
pub use transport::{LocalEndpoint, LocalHub, MessageHandler, Transport, TransportListenerId};

/// 运行时注册的 action 名称
pub mod actions {
    pub const ENABLE_PLUGIN: &str = "enablePlugin";
    pub const DISABLE_PLUGIN: &str = "disablePlugin";
    pub const RELOAD_PLUGIN: &str = "reloadPlugin";
    pub const GET_ALL_PLUGIN_INFO: &str = "getAllPluginInfo";
    pub const GET_PLUGIN_INFO: &str = "getPluginInfo";
    pub const GET_SETTINGS: &str = "getSettings";
    pub const SET_SETTING: &str = "setSetting";
    pub const RESET_SETTINGS: &str = "resetSettings";
    pub const EXPORT_SETTINGS: &str = "exportSettings";
    pub const IMPORT_SETTINGS: &str = "importSettings";
    pub const PING: &str = "ping";

    /// 设置变化广播
    pub const SETTINGS_CHANGED: &str = "settingsChanged";
    /// 模块状态变化广播
    pub const PLUGIN_STATE_CHANGED: &str = "pluginStateChanged";
}
