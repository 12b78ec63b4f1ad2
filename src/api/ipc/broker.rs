//! 消息代理
//!
//! 在任意 [`Transport`] 之上实现请求/响应协议：
//!
//! - 请求分配递增的 request_id，响应按 request_id 匹配
//! - 响应和超时先到者生效，另一方被丢弃
//! - 每个 action 只有一个处理函数，后注册的覆盖先注册的
//! - 销毁后立即拒绝所有挂起的请求，并断开入站监听

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::envelope::{Envelope, EnvelopeType};
use super::transport::{MessageHandler, Transport, TransportListenerId};
use crate::utils::sync::{lock, read, write};
use crate::utils::{CoreError, Result};

/// action 处理函数
pub type ActionHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// 将异步闭包包装为 [`ActionHandler`]
pub fn action_handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |data| f(data).boxed())
}

/// 请求选项
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// 超时时间，未设置时使用代理的默认值
    pub timeout: Option<Duration>,
    /// 目标上下文，未设置时发给所有对端
    pub target: Option<String>,
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            target: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// 代理统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// 已发送的消息数
    pub sent: u64,
    /// 已接收的消息数
    pub received: u64,
    /// 超时的请求数
    pub timeouts: u64,
    /// 当前挂起的请求数
    pub pending: usize,
}

struct PendingRequest {
    action: String,
    tx: oneshot::Sender<Result<Value>>,
    issued_at: Instant,
}

/// 请求结束（包括调用方放弃等待）时移除挂起记录
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingRequest>>,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.request_id);
    }
}

/// 消息代理
pub struct MessageBroker {
    self_ref: Weak<Self>,
    transport: Arc<dyn Transport>,
    context: String,
    instance_id: String,
    default_timeout: Duration,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    handlers: RwLock<HashMap<String, ActionHandler>>,
    listener: Mutex<Option<TransportListenerId>>,
    destroyed: AtomicBool,
    stats: Mutex<BrokerStats>,
}

impl MessageBroker {
    /// 创建代理并挂接到传输层
    pub fn new(transport: Arc<dyn Transport>, context: impl Into<String>, default_timeout: Duration) -> Arc<Self> {
        let broker = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            transport,
            context: context.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            default_timeout,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            stats: Mutex::new(BrokerStats::default()),
        });
        broker.attach();
        info!(context = %broker.context, endpoint = broker.transport.name(), "消息代理已创建");
        broker
    }

    fn attach(&self) {
        let weak = self.self_ref.clone();
        let handler: MessageHandler = Arc::new(move |envelope| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(broker) => broker.handle_incoming(envelope).await,
                    None => None,
                }
            }
            .boxed()
        });
        *lock(&self.listener) = Some(self.transport.on_message(handler));
    }

    /// 上下文名称
    pub fn context(&self) -> &str {
        &self.context
    }

    /// 实例 ID，作为发出信封的 `source`
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ==================== 处理函数 ====================

    /// 注册 action 处理函数，已有的处理函数被覆盖
    pub fn on(&self, action: impl Into<String>, handler: ActionHandler) {
        if self.is_destroyed() {
            return;
        }
        let action = action.into();
        if write(&self.handlers).insert(action.clone(), handler).is_some() {
            debug!(action = %action, "覆盖已有的处理函数");
        }
    }

    /// 移除 action 处理函数
    pub fn off(&self, action: &str) -> bool {
        write(&self.handlers).remove(action).is_some()
    }

    pub fn has_handler(&self, action: &str) -> bool {
        read(&self.handlers).contains_key(action)
    }

    // ==================== 发送 ====================

    /// 发送请求并等待响应
    ///
    /// # 错误
    ///
    /// - [`CoreError::RequestTimeout`]：超时前没有收到响应
    /// - [`CoreError::Remote`]：对端处理函数返回错误
    /// - [`CoreError::BrokerDestroyed`]：代理已销毁或在等待期间被销毁
    pub async fn request(&self, action: &str, data: Value, options: RequestOptions) -> Result<Value> {
        if self.is_destroyed() {
            return Err(CoreError::BrokerDestroyed);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            request_id,
            PendingRequest {
                action: action.to_string(),
                tx,
                issued_at: Instant::now(),
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };
        lock(&self.stats).sent += 1;

        let envelope = Envelope::request(action, data, request_id).with_source(self.instance_id.clone());
        trace!(action = %action, request_id = request_id, "发送请求");

        let send = async {
            match self.transport.send(envelope, options.target.as_deref()).await {
                Ok(Some(response)) => self.handle_response(response),
                Ok(None) => {}
                // 发送失败不立即拒绝，由超时统一收尾
                Err(e) => debug!(action = %action, request_id = request_id, error = %e, "请求发送失败"),
            }
            // 发送结束后只等待响应通道
            futures::future::pending::<()>().await
        };
        let exchange = async {
            tokio::select! {
                received = rx => received.unwrap_or(Err(CoreError::BrokerDestroyed)),
                () = send => Err(CoreError::BrokerDestroyed),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                lock(&self.stats).timeouts += 1;
                warn!(action = %action, request_id = request_id, timeout_ms = timeout.as_millis() as u64, "请求超时");
                Err(CoreError::RequestTimeout {
                    action: action.to_string(),
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// 发送事件，不等待响应；销毁后为空操作
    pub async fn send_event(&self, action: &str, data: Value, target: Option<&str>) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        let envelope = Envelope::event(action, data).with_source(self.instance_id.clone());
        lock(&self.stats).sent += 1;
        self.transport.send(envelope, target).await.map(|_| ())
    }

    /// 广播到所有对端，返回成功投递的数量
    ///
    /// 单个对端的投递失败（包括没有监听）只记录日志。
    pub async fn broadcast(&self, action: &str, data: Value) -> usize {
        if self.is_destroyed() {
            return 0;
        }

        let mut delivered = 0;
        for target in self.transport.broadcast_targets() {
            let envelope = Envelope::broadcast(action, data.clone()).with_source(self.instance_id.clone());
            lock(&self.stats).sent += 1;
            match self.transport.send(envelope, Some(&target)).await {
                Ok(_) => delivered += 1,
                Err(e) => trace!(action = %action, target = %target, error = %e, "广播投递失败"),
            }
        }
        delivered
    }

    // ==================== 接收 ====================

    fn handle_response(&self, envelope: Envelope) {
        if envelope
            .reply_to
            .as_deref()
            .map_or(false, |r| r != self.instance_id)
        {
            return;
        }
        let Some(request_id) = envelope.request_id else {
            return;
        };

        let Some(pending) = lock(&self.pending).remove(&request_id) else {
            debug!(request_id = request_id, "收到过期的响应，忽略");
            return;
        };

        trace!(
            action = %pending.action,
            request_id = request_id,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "收到响应"
        );

        let result = if envelope.success.unwrap_or(true) {
            Ok(envelope.data)
        } else {
            Err(CoreError::Remote(
                envelope.error.unwrap_or_else(|| "未知错误".to_string()),
            ))
        };
        // 接收方已超时丢弃时发送失败，忽略即可
        let _ = pending.tx.send(result);
    }

    async fn handle_incoming(&self, envelope: Envelope) -> Option<Envelope> {
        if self.is_destroyed() {
            return None;
        }
        if envelope.source.as_deref() == Some(self.instance_id.as_str()) {
            return None;
        }
        lock(&self.stats).received += 1;

        match envelope.envelope_type {
            EnvelopeType::Response => {
                self.handle_response(envelope);
                None
            }
            EnvelopeType::Request => {
                let Some(handler) = read(&self.handlers).get(&envelope.action).cloned() else {
                    trace!(action = %envelope.action, "没有对应的处理函数，不响应");
                    return None;
                };
                let response = match run_handler(&handler, envelope.data.clone()).await {
                    Ok(data) => Envelope::success(&envelope, data),
                    Err(reason) => {
                        warn!(action = %envelope.action, error = %reason, "请求处理失败");
                        Envelope::failure(&envelope, reason)
                    }
                };
                Some(response.with_source(self.instance_id.clone()))
            }
            EnvelopeType::Event | EnvelopeType::Broadcast => {
                let handler = read(&self.handlers).get(&envelope.action).cloned();
                if let Some(handler) = handler {
                    if let Err(reason) = run_handler(&handler, envelope.data).await {
                        warn!(action = %envelope.action, error = %reason, "事件处理失败");
                    }
                }
                None
            }
        }
    }

    // ==================== 统计与销毁 ====================

    pub fn stats(&self) -> BrokerStats {
        let mut stats = lock(&self.stats).clone();
        stats.pending = lock(&self.pending).len();
        stats
    }

    /// 销毁代理
    ///
    /// 挂起的请求立即以 [`CoreError::BrokerDestroyed`] 失败。重复调用为空操作。
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let rejected = pending.len();
        for request in pending {
            let _ = request.tx.send(Err(CoreError::BrokerDestroyed));
        }

        write(&self.handlers).clear();
        if let Some(id) = lock(&self.listener).take() {
            self.transport.remove_listener(id);
        }

        info!(context = %self.context, rejected = rejected, "消息代理已销毁");
    }
}

async fn run_handler(handler: &ActionHandler, data: Value) -> std::result::Result<Value, String> {
    match AssertUnwindSafe((**handler)(data)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err("处理函数发生 panic".to_string()),
    }
}
