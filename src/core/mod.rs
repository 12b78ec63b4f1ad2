//! 核心模块
//!
//! 包含运行时配置和宿主环境接口。

pub mod config;
pub mod environment;

pub use config::{
    IpcConfig, LifecycleConfig, LogConfig, OrchestratorConfig, RuntimeConfig,
    RuntimeConfigBuilder, SettingsConfig,
};
pub use environment::{EnvironmentEvent, HostEnvironment, ManualEnvironment, NullEnvironment};
