//! 钩子总线模块
//!
//! - `hook`: 处理函数签名、注册与发射选项
//! - `event_bus`: 按优先级分组、可取消的钩子总线

pub mod event_bus;
pub mod hook;

pub use event_bus::{DispatchStats, EventBus, HookRegistration};
pub use hook::{
    handler, system_hooks, EmitOptions, EmitOutcome, HookArgs, HookFlow, HookHandler,
    HookOptions, HookToken, DEFAULT_PRIORITY,
};
