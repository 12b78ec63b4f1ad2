//! 钩子定义
//!
//! 定义钩子处理函数的签名、注册选项与一次发射的结果。
//!
//! 钩子分为两类：
//! - **action**：并行通知，不关心返回值
//! - **filter**：按注册顺序串行执行，每个处理函数接收上一个的返回值

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

/// 默认优先级
pub const DEFAULT_PRIORITY: i32 = 50;

/// 运行时内置的钩子名称
pub mod system_hooks {
    /// 设置项变化：`{moduleId, key, value, oldValue}`
    pub const SETTINGS_CHANGED: &str = "settings:changed";
    /// 模块状态变化：`{id, state}`
    pub const PLUGIN_STATE_CHANGED: &str = "plugin:state-changed";
    /// 模块错误：`{id, phase, error}`
    pub const PLUGIN_ERROR: &str = "plugin:error";
    /// 运行时初始化完成
    pub const RUNTIME_READY: &str = "runtime:ready";
    /// 宿主环境动态事件批次：`{events: [...]}`
    pub const ENVIRONMENT_CHANGED: &str = "environment:changed";
}

/// 钩子注册的唯一标识，用于精确注销
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookToken(pub(crate) u64);

impl fmt::Display for HookToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// 传给处理函数的参数
#[derive(Debug, Clone)]
pub struct HookArgs {
    /// 钩子名称
    pub hook: String,
    /// 输入值（filter 为上一个处理函数的输出）
    pub value: Value,
    /// 本次发射是否允许取消
    pub cancelable: bool,
}

/// 处理函数的执行结果
///
/// 取消以返回值表达，而不是通过闭包捕获的可变标志：
/// 总线在每个优先级分组结束后检查是否有处理函数要求取消。
#[derive(Debug, Clone, PartialEq)]
pub enum HookFlow {
    /// 不产生新值，沿用输入
    Pass,
    /// 产生新值
    Next(Value),
    /// 请求取消后续分组（仅在可取消的发射中生效），可附带新值
    Cancel(Option<Value>),
}

impl HookFlow {
    /// 取出处理函数产生的新值
    pub(crate) fn into_value(self) -> Option<Value> {
        match self {
            HookFlow::Pass | HookFlow::Cancel(None) => None,
            HookFlow::Next(v) | HookFlow::Cancel(Some(v)) => Some(v),
        }
    }

    pub(crate) fn is_cancel(&self) -> bool {
        matches!(self, HookFlow::Cancel(_))
    }
}

/// 钩子处理函数
pub type HookHandler = Arc<dyn Fn(HookArgs) -> BoxFuture<'static, anyhow::Result<HookFlow>> + Send + Sync>;

/// 将异步闭包包装为 [`HookHandler`]
pub fn handler<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HookFlow>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// 注册选项
#[derive(Debug, Clone)]
pub struct HookOptions {
    /// 优先级，数值越小越早执行
    pub priority: i32,
    /// 首次调用后自动注销
    pub once: bool,
    /// 所属模块 ID
    pub owner: Option<String>,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            once: false,
            owner: None,
        }
    }
}

impl HookOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// 发射选项
#[derive(Debug, Clone, Copy)]
pub struct EmitOptions {
    /// 同一分组内并行执行
    pub parallel: bool,
    /// 允许处理函数取消后续分组
    pub cancelable: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            cancelable: false,
        }
    }
}

impl EmitOptions {
    /// 串行链式执行（filter）
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            cancelable: false,
        }
    }

    pub fn cancelable(mut self) -> Self {
        self.cancelable = true;
        self
    }
}

/// 一次发射的结果
#[derive(Debug, Clone, PartialEq)]
pub struct EmitOutcome {
    /// 最终值
    pub value: Value,
    /// 是否被取消
    pub cancelled: bool,
    /// 被调用的处理函数数量
    pub invoked: usize,
    /// 失败的处理函数数量
    pub failed: usize,
}
