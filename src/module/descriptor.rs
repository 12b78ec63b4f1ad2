//! 模块描述符
//!
//! 导入模块得到的是 [`ModuleDescriptor`]：清单加上一组可选的能力槽位。
//! 能力在构造时就确定，生命周期控制器只需检查槽位是否存在，
//! 不需要在每次调用时探测模块是否实现了某个方法。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use super::context::PluginContext;
use super::manifest::ModuleManifest;
use crate::bus::{HookArgs, HookFlow, DEFAULT_PRIORITY};

/// 生命周期钩子
pub type LifecycleFn = Arc<dyn Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 模块声明的钩子处理函数，运行时为它注入模块上下文
pub type BoundHookFn =
    Arc<dyn Fn(PluginContext, HookArgs) -> BoxFuture<'static, anyhow::Result<HookFlow>> + Send + Sync>;

/// 模块声明的钩子
#[derive(Clone)]
pub struct HookBinding {
    /// 钩子名称
    pub hook: String,
    /// 优先级
    pub priority: i32,
    /// 是否只执行一次
    pub once: bool,
    /// 处理函数
    pub handler: BoundHookFn,
}

impl fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBinding")
            .field("hook", &self.hook)
            .field("priority", &self.priority)
            .field("once", &self.once)
            .finish()
    }
}

/// 能力槽位
#[derive(Clone, Default)]
pub struct Capabilities {
    pub init: Option<LifecycleFn>,
    pub start: Option<LifecycleFn>,
    pub stop: Option<LifecycleFn>,
    pub destroy: Option<LifecycleFn>,
    pub hooks: Vec<HookBinding>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("init", &self.init.is_some())
            .field("start", &self.start.is_some())
            .field("stop", &self.stop.is_some())
            .field("destroy", &self.destroy.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// 模块描述符
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub manifest: ModuleManifest,
    pub capabilities: Capabilities,
}

fn lifecycle<F, Fut>(f: F) -> LifecycleFn
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

impl ModuleDescriptor {
    /// 创建没有任何能力的描述符
    pub fn new(manifest: ModuleManifest) -> Self {
        Self {
            manifest,
            capabilities: Capabilities::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.capabilities.init = Some(lifecycle(f));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.capabilities.start = Some(lifecycle(f));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.capabilities.stop = Some(lifecycle(f));
        self
    }

    pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.capabilities.destroy = Some(lifecycle(f));
        self
    }

    /// 声明钩子处理函数（默认优先级）
    pub fn hook<F, Fut>(self, hook: impl Into<String>, f: F) -> Self
    where
        F: Fn(PluginContext, HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HookFlow>> + Send + 'static,
    {
        self.hook_with(hook, DEFAULT_PRIORITY, false, f)
    }

    /// 声明钩子处理函数
    pub fn hook_with<F, Fut>(mut self, hook: impl Into<String>, priority: i32, once: bool, f: F) -> Self
    where
        F: Fn(PluginContext, HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HookFlow>> + Send + 'static,
    {
        self.capabilities.hooks.push(HookBinding {
            hook: hook.into(),
            priority,
            once,
            handler: Arc::new(move |ctx, args| f(ctx, args).boxed()),
        });
        self
    }
}
