//! 宿主环境
//!
//! 运行时在启动最后阶段需要等待宿主环境进入稳定状态（例如页面加载完成），
//! 之后持续接收宿主产生的动态事件（例如节点变化），按批次转发到钩子总线。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::utils::sync::lock;

/// 宿主环境事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentEvent {
    /// 事件类型
    pub kind: String,
    /// 事件数据
    #[serde(default)]
    pub data: Value,
    /// 发生时间
    pub timestamp: DateTime<Utc>,
}

impl EnvironmentEvent {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// 宿主环境接口
#[async_trait]
pub trait HostEnvironment: Send + Sync {
    /// 等待宿主进入稳定状态
    async fn wait_stable(&self);

    /// 订阅动态事件
    ///
    /// 发送端全部关闭时接收端返回 `None`，观察者随之退出。
    fn subscribe(&self) -> mpsc::UnboundedReceiver<EnvironmentEvent>;
}

/// 无宿主环境：立即稳定，从不产生事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEnvironment;

#[async_trait]
impl HostEnvironment for NullEnvironment {
    async fn wait_stable(&self) {}

    fn subscribe(&self) -> mpsc::UnboundedReceiver<EnvironmentEvent> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }
}

/// 手动驱动的宿主环境
///
/// 由调用方决定何时稳定、何时推送事件，用于测试和嵌入式宿主。
#[derive(Default)]
pub struct ManualEnvironment {
    stable: AtomicBool,
    notify: Notify,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EnvironmentEvent>>>,
}

impl ManualEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个已经稳定的环境
    pub fn stable() -> Self {
        let env = Self::default();
        env.stable.store(true, Ordering::SeqCst);
        env
    }

    /// 标记为稳定，唤醒所有等待者
    pub fn mark_stable(&self) {
        self.stable.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }

    /// 推送事件，返回收到事件的订阅者数量
    pub fn push(&self, event: EnvironmentEvent) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }
}

#[async_trait]
impl HostEnvironment for ManualEnvironment {
    async fn wait_stable(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stable() {
                return;
            }
            notified.await;
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<EnvironmentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}
