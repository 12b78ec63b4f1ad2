//! 模块上下文
//!
//! 运行时在调用模块的生命周期钩子和钩子处理函数时传入 [`PluginContext`]，
//! 模块通过它访问钩子总线、自己的设置以及跨上下文通信。
//! 通过上下文注册的钩子和设置观察者都以模块 ID 为所有者，模块停止时统一移除。

use std::sync::Arc;

use serde_json::{Map, Value};

use super::catalog::{ModuleCatalog, ModuleState};
use crate::api::ipc::{MessageBroker, RequestOptions};
use crate::bus::{EmitOptions, EmitOutcome, EventBus, HookHandler, HookOptions, HookToken};
use crate::config::{ConfigStore, WatchId};
use crate::utils::{CoreError, Result};

/// 模块上下文
#[derive(Clone)]
pub struct PluginContext {
    module_id: String,
    catalog: Arc<ModuleCatalog>,
    bus: Arc<EventBus>,
    config: Arc<ConfigStore>,
    broker: Option<Arc<MessageBroker>>,
}

impl PluginContext {
    pub fn new(
        module_id: impl Into<String>,
        catalog: Arc<ModuleCatalog>,
        bus: Arc<EventBus>,
        config: Arc<ConfigStore>,
        broker: Option<Arc<MessageBroker>>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            catalog,
            bus,
            config,
            broker,
        }
    }

    /// 当前模块 ID
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// 当前模块状态
    pub fn state(&self) -> ModuleState {
        self.catalog.state(&self.module_id)
    }

    /// 其他模块是否处于活动状态
    pub fn is_active(&self, module_id: &str) -> bool {
        self.catalog.state(module_id) == ModuleState::Active
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    // ==================== 设置 ====================

    /// 读取本模块的设置
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.config.get(&self.module_id, key)
    }

    /// 读取本模块的全部设置
    pub fn settings(&self) -> Map<String, Value> {
        self.config.get_all(&self.module_id)
    }

    /// 写入本模块的设置
    pub async fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        self.config.set(&self.module_id, key, value).await
    }

    /// 观察本模块的设置变化，模块停止时自动移除
    pub fn watch_setting<F>(&self, key: Option<&str>, callback: F) -> WatchId
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.config
            .watch_as(&self.module_id, &self.module_id, key, callback)
    }

    // ==================== 钩子 ====================

    /// 注册钩子处理函数，所有者固定为本模块
    pub fn add_hook(&self, hook: &str, handler: HookHandler, options: HookOptions) -> HookToken {
        self.bus
            .register(hook, handler, options.owner(self.module_id.clone()))
    }

    /// 发射 action 钩子
    pub async fn do_action(&self, hook: &str, data: Value) -> EmitOutcome {
        self.bus.do_action(hook, data).await
    }

    /// 发射 filter 钩子
    pub async fn apply_filters(&self, hook: &str, value: Value) -> Value {
        self.bus.apply_filters(hook, value).await
    }

    /// 按指定选项发射钩子
    pub async fn emit(&self, hook: &str, value: Value, options: EmitOptions) -> EmitOutcome {
        self.bus.emit(hook, value, options).await
    }

    // ==================== 跨上下文通信 ====================

    fn broker(&self) -> Result<&Arc<MessageBroker>> {
        self.broker.as_ref().ok_or(CoreError::BrokerDestroyed)
    }

    /// 向其他上下文发送请求
    pub async fn request(&self, action: &str, data: Value, options: RequestOptions) -> Result<Value> {
        self.broker()?.request(action, data, options).await
    }

    /// 发送事件（不等待响应）
    pub async fn send_event(&self, action: &str, data: Value) -> Result<()> {
        self.broker()?.send_event(action, data, None).await
    }

    /// 广播到所有已知上下文，返回成功投递的数量
    pub async fn broadcast(&self, action: &str, data: Value) -> usize {
        match self.broker.as_ref() {
            Some(broker) => broker.broadcast(action, data).await,
            None => 0,
        }
    }
}
