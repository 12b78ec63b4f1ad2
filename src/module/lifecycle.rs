//! 模块生命周期管理
//!
//! 驱动模块在状态机上的转换：
//!
//! ```text
//! LOADED/STOPPED --start--> STARTING --> ACTIVE
//! ACTIVE --stop--> STOPPING --> STOPPED
//! * --destroy--> DESTROYED
//! ```
//!
//! 模块自身的钩子失败（返回错误、panic 或超时）都会被捕获，记录到目录，
//! 并以 `plugin:error` 事件通知观察者，不会影响其他模块。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::catalog::{ModuleCatalog, ModuleState};
use super::context::PluginContext;
use super::descriptor::{LifecycleFn, ModuleDescriptor};
use crate::api::ipc::MessageBroker;
use crate::bus::{system_hooks, EventBus, HookArgs, HookOptions, HookToken};
use crate::config::ConfigStore;
use crate::utils::{CoreError, Result};

/// 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Start,
    Stop,
    Destroy,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Destroy => "destroy",
        }
    }
}

/// 生命周期控制器
pub struct LifecycleController {
    catalog: Arc<ModuleCatalog>,
    bus: Arc<EventBus>,
    config: Arc<ConfigStore>,
    broker: Option<Arc<MessageBroker>>,
    hook_timeout: Option<Duration>,
}

impl LifecycleController {
    pub fn new(
        catalog: Arc<ModuleCatalog>,
        bus: Arc<EventBus>,
        config: Arc<ConfigStore>,
        broker: Option<Arc<MessageBroker>>,
        hook_timeout: Option<Duration>,
    ) -> Self {
        Self {
            catalog,
            bus,
            config,
            broker,
            hook_timeout,
        }
    }

    /// 为模块构建上下文
    pub fn context(&self, module_id: &str) -> PluginContext {
        PluginContext::new(
            module_id,
            self.catalog.clone(),
            self.bus.clone(),
            self.config.clone(),
            self.broker.clone(),
        )
    }

    fn instance(&self, module_id: &str) -> Result<Arc<ModuleDescriptor>> {
        if !self.catalog.contains(module_id) {
            return Err(CoreError::ModuleNotFound(module_id.to_string()));
        }
        self.catalog
            .instance(module_id)
            .ok_or_else(|| CoreError::ModuleNotLoaded(module_id.to_string()))
    }

    /// 执行模块的生命周期钩子，错误、panic 和超时都转换为错误信息
    async fn run_hook(
        &self,
        module_id: &str,
        phase: Phase,
        hook: Option<&LifecycleFn>,
    ) -> std::result::Result<(), String> {
        let Some(hook) = hook else {
            return Ok(());
        };

        debug!(module_id = %module_id, phase = phase.as_str(), "调用生命周期钩子");
        let fut = AssertUnwindSafe(hook(self.context(module_id))).catch_unwind();

        let outcome = match self.hook_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(format!("执行超时 ({}ms)", limit.as_millis())),
            },
            None => fut.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err("钩子发生 panic".to_string()),
        }
    }

    async fn notify_state(&self, module_id: &str, state: ModuleState) {
        self.bus
            .do_action(
                system_hooks::PLUGIN_STATE_CHANGED,
                json!({ "id": module_id, "state": state }),
            )
            .await;
    }

    async fn notify_error(&self, module_id: &str, phase: Phase, reason: &str) {
        self.bus
            .do_action(
                system_hooks::PLUGIN_ERROR,
                json!({ "id": module_id, "phase": phase.as_str(), "error": reason }),
            )
            .await;
    }

    fn hook_failed(module_id: &str, phase: Phase, reason: String) -> CoreError {
        CoreError::LifecycleHookFailed {
            module_id: module_id.to_string(),
            phase: phase.as_str().to_string(),
            reason,
        }
    }

    fn invalid_transition(module_id: &str, state: ModuleState, operation: &str) -> CoreError {
        CoreError::InvalidStateTransition {
            module: module_id.to_string(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }

    // ==================== init ====================

    /// 执行模块的 init 钩子
    ///
    /// 只能在 `LOADED` 状态调用，已初始化的模块直接返回成功。
    /// init 不改变状态：失败时记录错误，状态仍为 `LOADED`。
    pub async fn init_plugin(&self, module_id: &str) -> Result<()> {
        let instance = self.instance(module_id)?;
        let state = self.catalog.state(module_id);
        if state != ModuleState::Loaded {
            return Err(Self::invalid_transition(module_id, state, "init"));
        }
        if self.catalog.is_initialized(module_id) {
            return Ok(());
        }

        match self
            .run_hook(module_id, Phase::Init, instance.capabilities.init.as_ref())
            .await
        {
            Ok(()) => {
                self.catalog.mark_initialized(module_id)?;
                debug!(module_id = %module_id, "模块初始化完成");
                Ok(())
            }
            Err(reason) => {
                error!(module_id = %module_id, error = %reason, "模块初始化失败");
                self.catalog.set_error(module_id, reason.clone())?;
                self.catalog.set_state(module_id, ModuleState::Loaded)?;
                self.notify_error(module_id, Phase::Init, &reason).await;
                Err(Self::hook_failed(module_id, Phase::Init, reason))
            }
        }
    }

    // ==================== start ====================

    /// 启动模块
    ///
    /// 依赖和冲突检查在任何状态变化之前完成。
    /// 启动失败时注销本次注册的钩子并恢复启动前的状态。
    pub async fn start_plugin(&self, module_id: &str) -> Result<()> {
        let prior = self.catalog.state(module_id);
        if prior == ModuleState::Active {
            debug!(module_id = %module_id, "模块已在运行中");
            return Ok(());
        }
        let instance = self.instance(module_id)?;
        if !prior.can_start() {
            return Err(Self::invalid_transition(module_id, prior, "start"));
        }

        let deps = self.catalog.check_dependencies(module_id);
        if !deps.met {
            warn!(module_id = %module_id, missing = ?deps.missing, "依赖未满足，无法启动");
            return Err(CoreError::DependencyUnmet {
                module: module_id.to_string(),
                missing: deps.missing,
            });
        }
        let conflicts = self.catalog.check_conflicts(module_id);
        if conflicts.conflicts {
            warn!(module_id = %module_id, conflicting = ?conflicts.conflicting, "存在冲突模块，无法启动");
            return Err(CoreError::ConflictDetected {
                module: module_id.to_string(),
                conflicting: conflicts.conflicting,
            });
        }

        info!(module_id = %module_id, "启动模块");
        // init 阶段留下的订阅不属于这次启动，回滚时保留
        let hooks_before = self.bus.owner_tokens(module_id);
        let watches_before = self.config.owner_watches(module_id);
        self.catalog.set_state(module_id, ModuleState::Starting)?;

        let tokens = self.register_hooks(module_id, &instance);
        self.config
            .register_schema(module_id, instance.manifest.settings.clone());

        match self
            .run_hook(module_id, Phase::Start, instance.capabilities.start.as_ref())
            .await
        {
            Ok(()) => {
                self.catalog.set_state(module_id, ModuleState::Active)?;
                self.catalog.clear_error(module_id)?;
                info!(module_id = %module_id, hooks = tokens.len(), "模块启动成功");
                self.notify_state(module_id, ModuleState::Active).await;
                Ok(())
            }
            Err(reason) => {
                error!(module_id = %module_id, error = %reason, "模块启动失败，回滚");
                // 声明的钩子和 start 里通过上下文注册的订阅一并移除
                let mut removed = 0;
                for token in self.bus.owner_tokens(module_id).difference(&hooks_before) {
                    removed += usize::from(self.bus.unregister(*token));
                }
                for id in self.config.owner_watches(module_id) {
                    if !watches_before.contains(&id) {
                        self.config.unwatch(id);
                    }
                }
                debug!(module_id = %module_id, hooks = removed, declared = tokens.len(), "已撤销本次启动的订阅");
                self.catalog.set_error(module_id, reason.clone())?;
                self.catalog.set_state(module_id, prior)?;
                self.notify_error(module_id, Phase::Start, &reason).await;
                Err(Self::hook_failed(module_id, Phase::Start, reason))
            }
        }
    }

    /// 注册模块声明的钩子，处理函数调用时注入模块上下文
    fn register_hooks(&self, module_id: &str, instance: &ModuleDescriptor) -> Vec<HookToken> {
        instance
            .capabilities
            .hooks
            .iter()
            .map(|binding| {
                let ctx = self.context(module_id);
                let bound = binding.handler.clone();
                let handler = Arc::new(move |args: HookArgs| bound(ctx.clone(), args));

                let mut options = HookOptions::default()
                    .priority(binding.priority)
                    .owner(module_id);
                if binding.once {
                    options = options.once();
                }
                self.bus.register(binding.hook.clone(), handler, options)
            })
            .collect()
    }

    // ==================== stop ====================

    /// 停止模块
    ///
    /// 仍有活动模块依赖它时拒绝停止。stop 钩子失败时仍然完成清理，
    /// 模块最终处于 `STOPPED` 状态并记录错误。
    pub async fn stop_plugin(&self, module_id: &str) -> Result<()> {
        let state = self.catalog.state(module_id);
        if state == ModuleState::Stopped {
            debug!(module_id = %module_id, "模块已停止");
            return Ok(());
        }
        let instance = self.instance(module_id)?;
        if !state.can_stop() {
            return Err(Self::invalid_transition(module_id, state, "stop"));
        }

        let dependents = self.catalog.active_dependents(module_id);
        if !dependents.is_empty() {
            warn!(module_id = %module_id, dependents = ?dependents, "存在活动的依赖者，无法停止");
            return Err(CoreError::ModuleHasDependents {
                module: module_id.to_string(),
                dependents,
            });
        }

        info!(module_id = %module_id, "停止模块");
        self.catalog.set_state(module_id, ModuleState::Stopping)?;

        let outcome = self
            .run_hook(module_id, Phase::Stop, instance.capabilities.stop.as_ref())
            .await;

        let hooks = self.bus.unregister_owner(module_id);
        let watchers = self.config.unwatch_owner(module_id);
        debug!(module_id = %module_id, hooks = hooks, watchers = watchers, "已移除模块的订阅");

        self.catalog.set_state(module_id, ModuleState::Stopped)?;
        if let Err(reason) = outcome {
            warn!(module_id = %module_id, error = %reason, "停止钩子执行失败，继续完成清理");
            self.catalog.set_error(module_id, reason.clone())?;
            self.catalog.set_state(module_id, ModuleState::Stopped)?;
            self.notify_error(module_id, Phase::Stop, &reason).await;
        }

        info!(module_id = %module_id, "模块已停止");
        self.notify_state(module_id, ModuleState::Stopped).await;
        Ok(())
    }

    // ==================== destroy ====================

    /// 销毁模块
    ///
    /// 活动模块先停止；destroy 钩子的结果不影响最终的 `DESTROYED` 状态。
    pub async fn destroy_plugin(&self, module_id: &str) -> Result<()> {
        let state = self.catalog.state(module_id);
        if state == ModuleState::Destroyed {
            return Ok(());
        }
        if !self.catalog.contains(module_id) {
            return Err(CoreError::ModuleNotFound(module_id.to_string()));
        }
        if state == ModuleState::Active {
            self.stop_plugin(module_id).await?;
        }

        if let Some(instance) = self.catalog.instance(module_id) {
            if let Err(reason) = self
                .run_hook(module_id, Phase::Destroy, instance.capabilities.destroy.as_ref())
                .await
            {
                warn!(module_id = %module_id, error = %reason, "销毁钩子执行失败");
                self.catalog.set_error(module_id, reason.clone())?;
                self.notify_error(module_id, Phase::Destroy, &reason).await;
            }
        }

        // 模块可能在 init 中通过上下文注册过钩子或观察者
        self.bus.unregister_owner(module_id);
        self.config.unwatch_owner(module_id);

        self.catalog.set_state(module_id, ModuleState::Destroyed)?;
        info!(module_id = %module_id, "模块已销毁");
        self.notify_state(module_id, ModuleState::Destroyed).await;
        Ok(())
    }

    // ==================== reload ====================

    /// 重新加载模块：只有活动模块会被停止再启动
    pub async fn reload_plugin(&self, module_id: &str) -> Result<()> {
        if self.catalog.state(module_id) != ModuleState::Active {
            debug!(module_id = %module_id, "模块未运行，跳过重新加载");
            return Ok(());
        }
        info!(module_id = %module_id, "重新加载模块");
        self.stop_plugin(module_id).await?;
        self.start_plugin(module_id).await
    }
}
