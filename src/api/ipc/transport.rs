//! IPC 传输层
//!
//! [`Transport`] 抽象宿主提供的消息通道：发送一条信封（可能得到一个响应），
//! 注册入站处理函数，以及列出可广播的对端。
//!
//! [`LocalHub`] 是进程内实现，每个上下文通过 `hub.endpoint(name)` 获得自己的端点。
//! 没有任何对端监听时发送失败，与真实的跨上下文通道一致。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tracing::trace;

use super::envelope::Envelope;
use crate::utils::sync::{read, write};
use crate::utils::{CoreError, Result};

/// 入站消息处理函数，返回值作为响应交回发送方
pub type MessageHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Option<Envelope>> + Send + Sync>;

/// 监听器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportListenerId(u64);

/// 消息传输接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 端点名称
    fn name(&self) -> &str;

    /// 发送信封
    ///
    /// `target` 为 `None` 时发给所有对端，第一个非空响应作为结果。
    async fn send(&self, envelope: Envelope, target: Option<&str>) -> Result<Option<Envelope>>;

    /// 注册入站处理函数
    fn on_message(&self, handler: MessageHandler) -> TransportListenerId;

    /// 移除入站处理函数
    fn remove_listener(&self, id: TransportListenerId) -> bool;

    /// 可广播的对端
    fn broadcast_targets(&self) -> Vec<String>;
}

#[derive(Default)]
struct EndpointState {
    listeners: RwLock<Vec<(TransportListenerId, MessageHandler)>>,
}

impl EndpointState {
    fn handlers(&self) -> Vec<MessageHandler> {
        read(&self.listeners).iter().map(|(_, h)| h.clone()).collect()
    }
}

/// 进程内传输中心
#[derive(Default)]
pub struct LocalHub {
    endpoints: RwLock<Vec<(String, Arc<EndpointState>)>>,
    next_listener_id: AtomicU64,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 获取（或创建）指定名称的端点
    pub fn endpoint(self: &Arc<Self>, name: impl Into<String>) -> Arc<LocalEndpoint> {
        let name = name.into();
        let state = {
            let mut endpoints = write(&self.endpoints);
            match endpoints.iter().find(|(n, _)| *n == name) {
                Some((_, state)) => state.clone(),
                None => {
                    let state = Arc::new(EndpointState::default());
                    endpoints.push((name.clone(), state.clone()));
                    state
                }
            }
        };
        Arc::new(LocalEndpoint {
            name,
            hub: self.clone(),
            state,
        })
    }

    /// 所有端点名称
    pub fn endpoint_names(&self) -> Vec<String> {
        read(&self.endpoints).iter().map(|(n, _)| n.clone()).collect()
    }

    fn peers(&self, from: &str, target: Option<&str>) -> Vec<(String, Arc<EndpointState>)> {
        read(&self.endpoints)
            .iter()
            .filter(|(name, _)| name != from)
            .filter(|(name, _)| target.map_or(true, |t| t == name))
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect()
    }
}

/// [`LocalHub`] 上的一个端点
pub struct LocalEndpoint {
    name: String,
    hub: Arc<LocalHub>,
    state: Arc<EndpointState>,
}

impl fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEndpoint").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Transport for LocalEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope, target: Option<&str>) -> Result<Option<Envelope>> {
        let handlers: Vec<MessageHandler> = self
            .hub
            .peers(&self.name, target)
            .iter()
            .flat_map(|(_, state)| state.handlers())
            .collect();

        if handlers.is_empty() {
            return Err(CoreError::Transport(format!(
                "没有接收方: {}",
                target.unwrap_or("*")
            )));
        }

        trace!(
            from = %self.name,
            target = target.unwrap_or("*"),
            action = %envelope.action,
            receivers = handlers.len(),
            "投递消息"
        );

        let responses = join_all(handlers.iter().map(|h| (**h)(envelope.clone()))).await;
        Ok(responses.into_iter().flatten().next())
    }

    fn on_message(&self, handler: MessageHandler) -> TransportListenerId {
        let id = TransportListenerId(self.hub.next_listener_id.fetch_add(1, Ordering::SeqCst));
        write(&self.state.listeners).push((id, handler));
        id
    }

    fn remove_listener(&self, id: TransportListenerId) -> bool {
        let mut listeners = write(&self.state.listeners);
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id);
        listeners.len() != before
    }

    fn broadcast_targets(&self) -> Vec<String> {
        self.hub
            .endpoint_names()
            .into_iter()
            .filter(|n| *n != self.name)
            .collect()
    }
}
