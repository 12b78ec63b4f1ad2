//! 运行时客户端
//!
//! 其他上下文（如控制面板）通过 [`RuntimeClient`] 调用运行时注册的 IPC 命令，
//! 返回值按命令转换为强类型。

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::ipc::{actions, MessageBroker, RequestOptions};
use crate::module::ModuleInfo;
use crate::utils::Result;

/// 运行时客户端
#[derive(Clone)]
pub struct RuntimeClient {
    broker: Arc<MessageBroker>,
    target: Option<String>,
    timeout: Option<Duration>,
}

impl RuntimeClient {
    /// 通过已有的消息代理创建客户端，请求发给所有对端
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self {
            broker,
            target: None,
            timeout: None,
        }
    }

    /// 只向指定上下文发送请求
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// 覆盖代理的默认超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    async fn call(&self, action: &str, data: Value) -> Result<Value> {
        let options = RequestOptions {
            timeout: self.timeout,
            target: self.target.clone(),
        };
        debug!(action = %action, target = ?self.target, "发送运行时命令");
        self.broker.request(action, data, options).await
    }

    async fn call_as<T: DeserializeOwned>(&self, action: &str, data: Value) -> Result<T> {
        let value = self.call(action, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// 连通性检查，返回运行时所在的上下文名称
    pub async fn ping(&self) -> Result<String> {
        let reply = self.call(actions::PING, Value::Null).await?;
        Ok(reply
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn enable_plugin(&self, module_id: &str) -> Result<()> {
        self.call(actions::ENABLE_PLUGIN, json!({ "id": module_id }))
            .await
            .map(|_| ())
    }

    pub async fn disable_plugin(&self, module_id: &str) -> Result<()> {
        self.call(actions::DISABLE_PLUGIN, json!({ "id": module_id }))
            .await
            .map(|_| ())
    }

    pub async fn reload_plugin(&self, module_id: &str) -> Result<()> {
        self.call(actions::RELOAD_PLUGIN, json!({ "id": module_id }))
            .await
            .map(|_| ())
    }

    /// 单个模块的运行时信息
    pub async fn plugin_info(&self, module_id: &str) -> Result<ModuleInfo> {
        self.call_as(actions::GET_PLUGIN_INFO, json!({ "id": module_id }))
            .await
    }

    /// 所有模块的运行时信息
    pub async fn all_plugin_info(&self) -> Result<Vec<ModuleInfo>> {
        self.call_as(actions::GET_ALL_PLUGIN_INFO, Value::Null).await
    }

    /// 模块的全部设置（含默认值）
    pub async fn settings(&self, module_id: &str) -> Result<Map<String, Value>> {
        self.call_as(actions::GET_SETTINGS, json!({ "id": module_id }))
            .await
    }

    pub async fn set_setting(&self, module_id: &str, key: &str, value: Value) -> Result<()> {
        self.call(
            actions::SET_SETTING,
            json!({ "id": module_id, "key": key, "value": value }),
        )
        .await
        .map(|_| ())
    }

    /// 重置模块设置，返回重置后的设置
    pub async fn reset_settings(&self, module_id: &str) -> Result<Map<String, Value>> {
        self.call_as(actions::RESET_SETTINGS, json!({ "id": module_id }))
            .await
    }

    pub async fn export_settings(&self) -> Result<Value> {
        self.call(actions::EXPORT_SETTINGS, Value::Null).await
    }

    /// 导入设置文档，返回变化的设置项数量
    pub async fn import_settings(&self, document: Value) -> Result<usize> {
        let reply = self.call(actions::IMPORT_SETTINGS, document).await?;
        Ok(reply.get("changed").and_then(Value::as_u64).unwrap_or(0) as usize)
    }
}
