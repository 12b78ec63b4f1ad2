//! 持久化存储
//!
//! 运行时把设置文档整体写入宿主提供的键值存储。存储必须在每次写入后
//! 通知所有监听者，包括本进程自己发起的写入：编排器依赖这一点识别
//! 其他上下文的修改并过滤自己的回声。
//!
//! 内置两个实现：
//! - [`MemoryStore`]：内存存储，可在多个上下文间共享，模拟同一个后端
//! - [`FileStore`]：以 JSON 文件为后端

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::utils::sync::{read, write};
use crate::utils::{CoreError, Result};

/// 单个键的变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    /// 新值，被删除时为 `None`
    pub new_value: Option<Value>,
    /// 旧值，新建时为 `None`
    pub old_value: Option<Value>,
}

/// 一次写入产生的全部变化：键 -> 变化
pub type StorageChanges = HashMap<String, StorageChange>;

/// 变化监听器
pub type StorageListener = Arc<dyn Fn(&StorageChanges) + Send + Sync>;

/// 监听器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 持久化键值存储接口
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// 读取多个键，不存在的键不出现在结果中
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>>;

    /// 写入多个键
    async fn set(&self, entries: HashMap<String, Value>) -> Result<()>;

    /// 删除多个键
    async fn remove(&self, keys: &[&str]) -> Result<()>;

    /// 注册变化监听器
    fn on_changed(&self, listener: StorageListener) -> ListenerId;

    /// 移除变化监听器
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// 监听器集合
#[derive(Default)]
struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, StorageListener)>>,
}

impl ListenerSet {
    fn add(&self, listener: StorageListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        write(&self.listeners).push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// 通知所有监听者（在锁外调用回调）
    fn notify(&self, changes: &StorageChanges) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<StorageListener> =
            read(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
        trace!(keys = changes.len(), listeners = listeners.len(), "通知存储变化");
        for listener in listeners {
            listener(changes);
        }
    }
}

/// 将写入应用到数据表，返回产生的变化
fn apply_set(data: &mut Map<String, Value>, entries: HashMap<String, Value>) -> StorageChanges {
    let mut changes = StorageChanges::new();
    for (key, value) in entries {
        let old_value = data.insert(key.clone(), value.clone());
        changes.insert(
            key,
            StorageChange {
                new_value: Some(value),
                old_value,
            },
        );
    }
    changes
}

fn apply_remove(data: &mut Map<String, Value>, keys: &[&str]) -> StorageChanges {
    keys.iter()
        .filter_map(|key| {
            data.remove(*key).map(|old| {
                (
                    key.to_string(),
                    StorageChange {
                        new_value: None,
                        old_value: Some(old),
                    },
                )
            })
        })
        .collect()
}

// ==================== 内存存储 ====================

/// 内存存储
///
/// 克隆得到的实例共享同一份数据与监听器，可用来模拟多个上下文共用的后端。
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<Map<String, Value>>>,
    listeners: Arc<ListenerSet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前保存的键数量
    pub fn len(&self) -> usize {
        read(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 读取单个键的快照
    pub fn snapshot(&self, key: &str) -> Option<Value> {
        read(&self.data).get(key).cloned()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let data = read(&self.data);
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, entries: HashMap<String, Value>) -> Result<()> {
        let changes = apply_set(&mut write(&self.data), entries);
        self.listeners.notify(&changes);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        let changes = apply_remove(&mut write(&self.data), keys);
        self.listeners.notify(&changes);
        Ok(())
    }

    fn on_changed(&self, listener: StorageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

// ==================== 文件存储 ====================

/// JSON 文件存储
///
/// 整个文件是一个 JSON 对象，每次写入都重写整个文件。
/// 同一实例内的读写通过异步互斥锁串行化。
pub struct FileStore {
    path: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
    listeners: ListenerSet,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: tokio::sync::Mutex::new(()),
            listeners: ListenerSet::default(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn load(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Map::new()),
            Ok(content) => match serde_json::from_str(&content)? {
                Value::Object(map) => Ok(map),
                other => Err(CoreError::Storage(format!(
                    "存储文件 {} 的内容不是对象: {}",
                    self.path.display(),
                    other
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, content).await?;
        debug!(path = %self.path.display(), "存储文件已写入");
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let _guard = self.io_lock.lock().await;
        let mut data = self.load().await?;
        Ok(keys
            .iter()
            .filter_map(|k| data.remove(*k).map(|v| (k.to_string(), v)))
            .collect())
    }

    async fn set(&self, entries: HashMap<String, Value>) -> Result<()> {
        let changes = {
            let _guard = self.io_lock.lock().await;
            let mut data = self.load().await?;
            let changes = apply_set(&mut data, entries);
            self.save(&data).await?;
            changes
        };
        self.listeners.notify(&changes);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        let changes = {
            let _guard = self.io_lock.lock().await;
            let mut data = self.load().await?;
            let changes = apply_remove(&mut data, keys);
            if !changes.is_empty() {
                self.save(&data).await?;
            }
            changes
        };
        self.listeners.notify(&changes);
        Ok(())
    }

    fn on_changed(&self, listener: StorageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
