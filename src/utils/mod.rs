//! 工具模块
//!
//! 包含错误类型、日志系统和内部使用的同步辅助函数。

pub mod error;
pub mod logger;
pub(crate) mod sync;

// 重导出常用类型
pub use error::{error_code, CoreError, Result};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
