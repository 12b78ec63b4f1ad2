//! 设置存储
//!
//! 按模块命名空间保存设置，写入前按模式校验，写入后合并为一次持久化，
//! 并同步通知观察者、在钩子总线上发出 `settings:changed`。
//!
//! 设置文档是持久化的唯一单元：
//!
//! ```json
//! {
//!   "version": 2,
//!   "core": { "language": "zh" },
//!   "plugins": {
//!     "dark-mode": { "enabled": true, "settings": { "brightness": 80 } }
//!   }
//! }
//! ```
//!
//! 模块是否启用只以这里的 `enabled` 为准，编排器的运行时状态是它的缓存。

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::schema::{self, SettingsSchema};
use super::storage::PersistentStore;
use crate::bus::{system_hooks, EventBus};
use crate::core::SettingsConfig;
use crate::utils::sync::{lock, read, write};
use crate::utils::{CoreError, Result};

/// 保留的启用标志键，不属于任何模块的模式
pub const ENABLED_KEY: &str = "enabled";

/// 核心设置在变化事件中使用的命名空间
pub const CORE_NAMESPACE: &str = "core";

/// 当前设置文档版本
pub const SETTINGS_VERSION: u32 = 2;

/// 最多记住多少次尚未收到回声的本进程写入
const OWN_WRITE_HISTORY: usize = 16;

/// 单个模块的设置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// 是否启用
    #[serde(default)]
    pub enabled: bool,
    /// 设置值
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// 设置文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsDocument {
    /// 文档版本
    #[serde(default)]
    pub version: u32,
    /// 核心设置
    #[serde(default)]
    pub core: Map<String, Value>,
    /// 模块设置
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSettings>,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            core: Map::new(),
            plugins: BTreeMap::new(),
        }
    }
}

impl SettingsDocument {
    /// 从 JSON 值解析，旧版本文档就地升级
    ///
    /// 升级只补齐缺失字段，从不删除已有数据。
    pub fn from_value(value: Value) -> Result<Self> {
        let mut doc: SettingsDocument = serde_json::from_value(value)?;
        if doc.version < SETTINGS_VERSION {
            debug!(from = doc.version, to = SETTINGS_VERSION, "升级设置文档版本");
            doc.version = SETTINGS_VERSION;
        }
        Ok(doc)
    }

    /// 模块是否启用
    pub fn is_enabled(&self, module_id: &str) -> bool {
        self.plugins.get(module_id).map_or(false, |p| p.enabled)
    }

    /// 所有模块的启用标志
    pub fn enabled_flags(&self) -> BTreeMap<String, bool> {
        self.plugins
            .iter()
            .map(|(id, p)| (id.clone(), p.enabled))
            .collect()
    }
}

/// 一次设置变化，也是 `settings:changed` 的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingChange {
    pub module_id: String,
    pub key: String,
    pub value: Value,
    pub old_value: Value,
}

/// [`ConfigStore::adopt_external`] 的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum Adoption {
    /// 已采纳，附带产生的变化
    Adopted(Vec<SettingChange>),
    /// 本进程自己写入的文档
    OwnWrite,
    /// 本地有尚未写入的修改，本地写入优先
    LocalPending,
    /// 存储已销毁
    Destroyed,
}

impl Adoption {
    /// 采纳产生的变化；未采纳时为空
    pub fn changes(&self) -> &[SettingChange] {
        match self {
            Adoption::Adopted(changes) => changes,
            _ => &[],
        }
    }

    pub fn is_adopted(&self) -> bool {
        matches!(self, Adoption::Adopted(_))
    }
}

/// 观察者回调：`(new_value, old_value)`
pub type WatchCallback = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// 观察者标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watcher {
    id: WatchId,
    module_id: String,
    /// `None` 表示观察该模块的所有键
    key: Option<String>,
    owner: Option<String>,
    callback: WatchCallback,
}

/// 设置存储
pub struct ConfigStore {
    /// 持久化后端
    storage: Arc<dyn PersistentStore>,
    /// 用于发出 `settings:changed`
    bus: Option<Arc<EventBus>>,
    /// 文档在存储中的键
    storage_key: String,
    /// 写入合并窗口
    persist_debounce: Duration,

    document: RwLock<SettingsDocument>,
    schemas: RwLock<HashMap<String, SettingsSchema>>,
    watchers: RwLock<Vec<Watcher>>,
    next_watch_id: AtomicU64,

    /// 最近一次写入（或从存储读到）的文档
    last_persisted: Mutex<Option<Value>>,
    /// 已写入但还没有收到存储通知的文档，按写入顺序排列
    own_writes: Mutex<VecDeque<Value>>,
    /// 待执行的延迟写入
    persist_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    self_ref: Weak<ConfigStore>,
}

impl ConfigStore {
    /// 创建设置存储
    pub fn new(
        storage: Arc<dyn PersistentStore>,
        bus: Option<Arc<EventBus>>,
        config: &SettingsConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            storage,
            bus,
            storage_key: config.storage_key.clone(),
            persist_debounce: config.persist_debounce(),
            document: RwLock::new(SettingsDocument::default()),
            schemas: RwLock::new(HashMap::new()),
            watchers: RwLock::new(Vec::new()),
            next_watch_id: AtomicU64::new(1),
            last_persisted: Mutex::new(None),
            own_writes: Mutex::new(VecDeque::new()),
            persist_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// 存储键
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// 持久化后端
    pub fn storage(&self) -> &Arc<dyn PersistentStore> {
        &self.storage
    }

    /// 从持久化存储加载设置文档
    ///
    /// 存储中没有文档时使用空文档；文档损坏时记录警告并同样使用空文档。
    pub async fn initialize(&self) -> Result<()> {
        let key = self.storage_key.as_str();
        let mut stored = self.storage.get(&[key]).await?;

        let doc = match stored.remove(key) {
            Some(value) => match SettingsDocument::from_value(value) {
                Ok(doc) => {
                    // 按规范化后的文档记录，升级与补齐的字段不算本地修改
                    *lock(&self.last_persisted) = Some(serde_json::to_value(&doc)?);
                    doc
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "设置文档无法解析，使用空文档");
                    SettingsDocument::default()
                }
            },
            None => SettingsDocument::default(),
        };

        let count = doc.plugins.len();
        *write(&self.document) = doc;
        info!(key = %key, modules = count, "设置已加载");
        Ok(())
    }

    // ==================== 模式 ====================

    /// 注册模块的设置模式
    ///
    /// 从未见过的模块写入 `{enabled: false, settings: 默认值}`；
    /// 已有条目只补齐新增键的默认值，不覆盖已保存的值。
    /// 返回是否为首次写入。
    pub fn register_schema(&self, module_id: &str, schema: SettingsSchema) -> bool {
        let defaults = schema::defaults(&schema);
        write(&self.schemas).insert(module_id.to_string(), schema);

        let (seeded, added) = {
            let mut doc = write(&self.document);
            match doc.plugins.entry(module_id.to_string()) {
                Entry::Vacant(slot) => {
                    let added = defaults.len();
                    slot.insert(PluginSettings {
                        enabled: false,
                        settings: defaults,
                    });
                    (true, added)
                }
                Entry::Occupied(mut slot) => {
                    let settings = &mut slot.get_mut().settings;
                    let mut added = 0;
                    for (key, value) in defaults {
                        if !settings.contains_key(&key) {
                            settings.insert(key, value);
                            added += 1;
                        }
                    }
                    (false, added)
                }
            }
        };

        if seeded || added > 0 {
            self.schedule_persist();
        }
        debug!(module_id = %module_id, seeded = seeded, added = added, "注册设置模式");
        seeded
    }

    /// 获取模块的设置模式
    pub fn schema(&self, module_id: &str) -> Option<SettingsSchema> {
        read(&self.schemas).get(module_id).cloned()
    }

    /// 校验一个设置值
    pub fn validate(&self, module_id: &str, key: &str, value: &Value) -> Result<()> {
        let invalid = |reason: String| CoreError::ValidationFailed {
            module_id: module_id.to_string(),
            key: key.to_string(),
            reason,
        };

        if key == ENABLED_KEY {
            return if value.is_boolean() {
                Ok(())
            } else {
                Err(invalid(format!("期望 boolean，实际为 {}", value)))
            };
        }

        let schemas = read(&self.schemas);
        match schemas.get(module_id).and_then(|s| s.get(key)) {
            Some(def) => def.validate(value).map_err(invalid),
            None => {
                trace!(module_id = %module_id, key = %key, "未声明的设置项，跳过校验");
                Ok(())
            }
        }
    }

    // ==================== 读写 ====================

    /// 读取设置值，未保存时返回模式默认值
    pub fn get(&self, module_id: &str, key: &str) -> Option<Value> {
        if key == ENABLED_KEY {
            return Some(Value::Bool(self.is_enabled(module_id)));
        }
        let stored = read(&self.document)
            .plugins
            .get(module_id)
            .and_then(|p| p.settings.get(key))
            .cloned();
        stored.or_else(|| self.default_value(module_id, key))
    }

    /// 读取模块的全部设置（默认值与已保存值合并）
    pub fn get_all(&self, module_id: &str) -> Map<String, Value> {
        let mut all = read(&self.schemas)
            .get(module_id)
            .map(schema::defaults)
            .unwrap_or_default();
        if let Some(entry) = read(&self.document).plugins.get(module_id) {
            for (key, value) in &entry.settings {
                all.insert(key.clone(), value.clone());
            }
        }
        all
    }

    /// 写入设置值（校验）
    pub async fn set(&self, module_id: &str, key: &str, value: Value) -> Result<()> {
        self.set_with(module_id, key, value, false).await
    }

    /// 写入设置值
    ///
    /// `skip_validation` 只跳过模式校验，保留键 `enabled` 仍要求布尔值。
    pub async fn set_with(
        &self,
        module_id: &str,
        key: &str,
        value: Value,
        skip_validation: bool,
    ) -> Result<()> {
        if self.is_destroyed() {
            return Err(CoreError::RuntimeDestroyed);
        }
        if !skip_validation || key == ENABLED_KEY {
            self.validate(module_id, key, &value)?;
        }

        let old_value = self.write_value(module_id, key, value.clone());
        if old_value == value {
            trace!(module_id = %module_id, key = %key, "设置值未变化");
            return Ok(());
        }

        self.schedule_persist();
        let change = SettingChange {
            module_id: module_id.to_string(),
            key: key.to_string(),
            value,
            old_value,
        };
        debug!(module_id = %module_id, key = %key, "设置已更新");
        self.dispatch(std::slice::from_ref(&change)).await;
        Ok(())
    }

    /// 写入内存文档，返回旧的有效值
    fn write_value(&self, module_id: &str, key: &str, value: Value) -> Value {
        let fallback = self.default_value(module_id, key).unwrap_or(Value::Null);
        let mut doc = write(&self.document);
        let entry = doc.plugins.entry(module_id.to_string()).or_default();

        if key == ENABLED_KEY {
            let old = entry.enabled;
            entry.enabled = value.as_bool().unwrap_or(false);
            Value::Bool(old)
        } else {
            entry.settings.insert(key.to_string(), value).unwrap_or(fallback)
        }
    }

    fn default_value(&self, module_id: &str, key: &str) -> Option<Value> {
        read(&self.schemas)
            .get(module_id)
            .and_then(|s| s.get(key))
            .map(|d| d.default.clone())
    }

    /// 恢复模块的默认设置（保留启用状态）
    pub async fn reset(&self, module_id: &str) -> Result<()> {
        if self.is_destroyed() {
            return Err(CoreError::RuntimeDestroyed);
        }
        let defaults = read(&self.schemas)
            .get(module_id)
            .map(schema::defaults)
            .unwrap_or_default();

        let old = {
            let mut doc = write(&self.document);
            let entry = doc.plugins.entry(module_id.to_string()).or_default();
            std::mem::replace(&mut entry.settings, defaults.clone())
        };

        let keys: BTreeSet<&String> = old.keys().chain(defaults.keys()).collect();
        let changes: Vec<SettingChange> = keys
            .into_iter()
            .filter_map(|key| {
                let new_value = defaults.get(key).cloned().unwrap_or(Value::Null);
                let old_value = old.get(key).cloned().unwrap_or_else(|| new_value.clone());
                (new_value != old_value).then(|| SettingChange {
                    module_id: module_id.to_string(),
                    key: key.clone(),
                    value: new_value,
                    old_value,
                })
            })
            .collect();

        self.schedule_persist();
        info!(module_id = %module_id, changed = changes.len(), "设置已重置");
        self.dispatch(&changes).await;
        Ok(())
    }

    // ==================== 启用状态 ====================

    /// 模块是否启用
    pub fn is_enabled(&self, module_id: &str) -> bool {
        read(&self.document).is_enabled(module_id)
    }

    /// 启用模块（只修改设置，不影响运行时）
    pub async fn enable(&self, module_id: &str) -> Result<()> {
        self.set_with(module_id, ENABLED_KEY, Value::Bool(true), true).await
    }

    /// 禁用模块（只修改设置，不影响运行时）
    pub async fn disable(&self, module_id: &str) -> Result<()> {
        self.set_with(module_id, ENABLED_KEY, Value::Bool(false), true).await
    }

    /// 所有已启用的模块 ID（按 ID 排序）
    pub fn enabled_modules(&self) -> Vec<String> {
        read(&self.document)
            .plugins
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ==================== 核心设置 ====================

    /// 读取核心设置
    pub fn get_core(&self, key: &str) -> Option<Value> {
        read(&self.document).core.get(key).cloned()
    }

    /// 写入核心设置
    pub async fn set_core(&self, key: &str, value: Value) -> Result<()> {
        if self.is_destroyed() {
            return Err(CoreError::RuntimeDestroyed);
        }
        let old_value = write(&self.document)
            .core
            .insert(key.to_string(), value.clone())
            .unwrap_or(Value::Null);
        if old_value == value {
            return Ok(());
        }

        self.schedule_persist();
        let change = SettingChange {
            module_id: CORE_NAMESPACE.to_string(),
            key: key.to_string(),
            value,
            old_value,
        };
        self.dispatch(std::slice::from_ref(&change)).await;
        Ok(())
    }

    // ==================== 观察者 ====================

    /// 观察设置变化
    ///
    /// `key` 为 `None` 时观察该模块的所有键。
    pub fn watch<F>(&self, module_id: &str, key: Option<&str>, callback: F) -> WatchId
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.add_watcher(module_id, key, None, Arc::new(callback))
    }

    /// 以某个模块的身份观察设置变化，模块停止时统一移除
    pub fn watch_as<F>(&self, owner: &str, module_id: &str, key: Option<&str>, callback: F) -> WatchId
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.add_watcher(module_id, key, Some(owner.to_string()), Arc::new(callback))
    }

    fn add_watcher(
        &self,
        module_id: &str,
        key: Option<&str>,
        owner: Option<String>,
        callback: WatchCallback,
    ) -> WatchId {
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        write(&self.watchers).push(Watcher {
            id,
            module_id: module_id.to_string(),
            key: key.map(str::to_string),
            owner,
            callback,
        });
        id
    }

    /// 取消观察
    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut watchers = write(&self.watchers);
        let before = watchers.len();
        watchers.retain(|w| w.id != id);
        watchers.len() != before
    }

    /// 移除某个模块注册的所有观察者
    pub fn unwatch_owner(&self, owner: &str) -> usize {
        let mut watchers = write(&self.watchers);
        let before = watchers.len();
        watchers.retain(|w| w.owner.as_deref() != Some(owner));
        before - watchers.len()
    }

    /// 某个模块注册的观察者
    pub fn owner_watches(&self, owner: &str) -> Vec<WatchId> {
        read(&self.watchers)
            .iter()
            .filter(|w| w.owner.as_deref() == Some(owner))
            .map(|w| w.id)
            .collect()
    }

    /// 当前观察者数量
    pub fn watcher_count(&self) -> usize {
        read(&self.watchers).len()
    }

    /// 通知观察者并发出总线事件
    async fn dispatch(&self, changes: &[SettingChange]) {
        for change in changes {
            self.notify_watchers(change);
            if let Some(ref bus) = self.bus {
                let payload = json!({
                    "moduleId": change.module_id,
                    "key": change.key,
                    "value": change.value,
                    "oldValue": change.old_value,
                });
                bus.do_action(system_hooks::SETTINGS_CHANGED, payload).await;
            }
        }
    }

    fn notify_watchers(&self, change: &SettingChange) {
        let callbacks: Vec<WatchCallback> = read(&self.watchers)
            .iter()
            .filter(|w| {
                w.module_id == change.module_id
                    && w.key.as_deref().map_or(true, |k| k == change.key)
            })
            .map(|w| w.callback.clone())
            .collect();

        for callback in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                callback(&change.value, &change.old_value)
            }));
            if result.is_err() {
                warn!(
                    module_id = %change.module_id,
                    key = %change.key,
                    "设置观察者 panic"
                );
            }
        }
    }

    // ==================== 导入导出 ====================

    /// 导出整个设置文档
    pub fn export(&self) -> Result<Value> {
        Ok(serde_json::to_value(&*read(&self.document))?)
    }

    /// 当前设置文档的快照
    pub fn snapshot(&self) -> SettingsDocument {
        read(&self.document).clone()
    }

    /// 导入设置文档，与当前文档合并
    ///
    /// 未通过校验的值被跳过并记录警告，其余值照常导入。
    pub async fn import(&self, value: Value) -> Result<Vec<SettingChange>> {
        if self.is_destroyed() {
            return Err(CoreError::RuntimeDestroyed);
        }
        let incoming = SettingsDocument::from_value(value)?;
        let mut merged = self.snapshot();

        merged.core.extend(incoming.core);
        for (module_id, plugin) in incoming.plugins {
            let mut accepted = Map::new();
            for (key, value) in plugin.settings {
                match self.validate(&module_id, &key, &value) {
                    Ok(()) => {
                        accepted.insert(key, value);
                    }
                    Err(e) => warn!(error = %e, "导入时跳过无效设置"),
                }
            }
            let entry = merged.plugins.entry(module_id).or_default();
            entry.enabled = plugin.enabled;
            entry.settings.extend(accepted);
        }

        let changes = self.replace_document(merged);
        self.schedule_persist();
        info!(changed = changes.len(), "设置已导入");
        self.dispatch(&changes).await;
        Ok(changes)
    }

    /// 采纳其他上下文写入存储的文档
    ///
    /// 只刷新内存文档并通知观察者，不会写回存储。
    /// 存储通知按写入顺序到达：与本进程某次写入相同的文档是自己的回声，
    /// 连同更早的写入记录一起丢弃；本地还有未写入的修改时不采纳，
    /// 随后的写入会覆盖存储。
    pub async fn adopt_external(&self, value: Value) -> Result<Adoption> {
        if self.is_destroyed() {
            return Ok(Adoption::Destroyed);
        }
        {
            let mut own = lock(&self.own_writes);
            if let Some(pos) = own.iter().position(|written| written == &value) {
                own.drain(..=pos);
                trace!(remaining = own.len(), "存储变化是本进程的写入，忽略");
                return Ok(Adoption::OwnWrite);
            }
        }

        let incoming = SettingsDocument::from_value(value.clone())?;
        let changes = {
            let schemas = read(&self.schemas);
            let mut doc = write(&self.document);
            let mut last = lock(&self.last_persisted);
            let dirty = match last.as_ref() {
                Some(persisted) => *persisted != serde_json::to_value(&*doc)?,
                None => *doc != SettingsDocument::default(),
            };
            if dirty {
                debug!("本地有未写入的设置修改，不采纳外部设置");
                return Ok(Adoption::LocalPending);
            }
            let changes = diff_documents(&doc, &incoming, &schemas);
            *last = Some(serde_json::to_value(&incoming)?);
            *doc = incoming;
            changes
        };
        // 存储已经越过本进程之前的写入
        lock(&self.own_writes).clear();

        debug!(changed = changes.len(), "采纳外部设置变化");
        self.dispatch(&changes).await;
        Ok(Adoption::Adopted(changes))
    }

    /// 替换内存文档，返回产生的变化
    fn replace_document(&self, new_doc: SettingsDocument) -> Vec<SettingChange> {
        let schemas = read(&self.schemas);
        let mut doc = write(&self.document);
        let changes = diff_documents(&doc, &new_doc, &schemas);
        *doc = new_doc;
        changes
    }

    // ==================== 持久化 ====================

    /// 安排一次延迟写入，窗口内的多次写入合并为一次
    fn schedule_persist(&self) {
        if self.is_destroyed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("不在异步运行时中，跳过延迟写入");
            return;
        };

        let weak = self.self_ref.clone();
        let delay = self.persist_debounce;
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(store) = weak.upgrade() {
                if let Err(e) = store.persist_now().await {
                    error!(error = %e, "设置写入失败");
                }
            }
        });

        if let Some(previous) = lock(&self.persist_task).replace(task) {
            previous.abort();
        }
    }

    /// 立即写入待持久化的修改
    pub async fn flush(&self) -> Result<()> {
        let pending = lock(&self.persist_task).take();
        if let Some(task) = pending {
            task.abort();
        }
        self.persist_now().await
    }

    async fn persist_now(&self) -> Result<()> {
        let value = serde_json::to_value(&*read(&self.document))?;
        let previous = {
            let mut last = lock(&self.last_persisted);
            if last.as_ref() == Some(&value) {
                return Ok(());
            }
            last.replace(value.clone())
        };
        {
            let mut own = lock(&self.own_writes);
            if own.len() == OWN_WRITE_HISTORY {
                own.pop_front();
            }
            own.push_back(value.clone());
        }

        let entries = HashMap::from([(self.storage_key.clone(), value.clone())]);
        match self.storage.set(entries).await {
            Ok(()) => {
                debug!(key = %self.storage_key, "设置已写入存储");
                Ok(())
            }
            Err(e) => {
                *lock(&self.last_persisted) = previous;
                let mut own = lock(&self.own_writes);
                if let Some(pos) = own.iter().rposition(|written| written == &value) {
                    own.remove(pos);
                }
                Err(e)
            }
        }
    }

    /// 是否有尚未写入的修改
    pub fn has_pending_write(&self) -> bool {
        lock(&self.persist_task)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    // ==================== 销毁 ====================

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// 销毁：取消待执行的写入并移除所有观察者
    ///
    /// 需要保留修改时先调用 [`ConfigStore::flush`]。
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.persist_task).take() {
            task.abort();
        }
        write(&self.watchers).clear();
        debug!("设置存储已销毁");
    }
}

/// 计算两份文档之间的设置变化
///
/// 缺失的键按模式默认值比较，只有有效值不同才算变化。
fn diff_documents(
    old: &SettingsDocument,
    new: &SettingsDocument,
    schemas: &HashMap<String, SettingsSchema>,
) -> Vec<SettingChange> {
    let mut changes = Vec::new();

    let core_keys: BTreeSet<&String> = old.core.keys().chain(new.core.keys()).collect();
    for key in core_keys {
        let old_value = old.core.get(key).cloned().unwrap_or(Value::Null);
        let new_value = new.core.get(key).cloned().unwrap_or(Value::Null);
        if old_value != new_value {
            changes.push(SettingChange {
                module_id: CORE_NAMESPACE.to_string(),
                key: key.clone(),
                value: new_value,
                old_value,
            });
        }
    }

    let empty = PluginSettings::default();
    let module_ids: BTreeSet<&String> = old.plugins.keys().chain(new.plugins.keys()).collect();
    for module_id in module_ids {
        let before = old.plugins.get(module_id).unwrap_or(&empty);
        let after = new.plugins.get(module_id).unwrap_or(&empty);

        if before.enabled != after.enabled {
            changes.push(SettingChange {
                module_id: module_id.clone(),
                key: ENABLED_KEY.to_string(),
                value: Value::Bool(after.enabled),
                old_value: Value::Bool(before.enabled),
            });
        }

        let schema = schemas.get(module_id);
        let effective = |settings: &Map<String, Value>, key: &String| {
            settings
                .get(key)
                .cloned()
                .or_else(|| schema.and_then(|s| s.get(key)).map(|d| d.default.clone()))
                .unwrap_or(Value::Null)
        };

        let keys: BTreeSet<&String> = before.settings.keys().chain(after.settings.keys()).collect();
        for key in keys {
            let old_value = effective(&before.settings, key);
            let new_value = effective(&after.settings, key);
            if old_value != new_value {
                changes.push(SettingChange {
                    module_id: module_id.clone(),
                    key: key.clone(),
                    value: new_value,
                    old_value,
                });
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler, HookFlow, HookOptions};
    use crate::config::schema::SettingDefinition;
    use crate::config::storage::{MemoryStore, StorageChanges};
    use std::sync::atomic::AtomicUsize;

    fn settings_config() -> SettingsConfig {
        SettingsConfig {
            storage_key: "settings".to_string(),
            persist_debounce_ms: 20,
        }
    }

    fn number_schema() -> SettingsSchema {
        SettingsSchema::from([("x".to_string(), SettingDefinition::number(5.0))])
    }

    fn store_with(storage: MemoryStore) -> Arc<ConfigStore> {
        ConfigStore::new(Arc::new(storage), None, &settings_config())
    }

    #[tokio::test]
    async fn test_set_get_and_validation_failure() {
        let store = store_with(MemoryStore::new());
        store.register_schema("p", number_schema());

        assert_eq!(store.get("p", "x"), Some(json!(5.0)));
        store.set("p", "x", json!(10)).await.unwrap();
        assert_eq!(store.get("p", "x"), Some(json!(10)));

        let err = store.set("p", "x", json!("oops")).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        assert_eq!(store.get("p", "x"), Some(json!(10)));
    }

    #[tokio::test]
    async fn test_register_schema_is_additive() {
        let store = store_with(MemoryStore::new());
        assert!(store.register_schema("p", number_schema()));
        store.set("p", "x", json!(7)).await.unwrap();

        let mut evolved = number_schema();
        evolved.insert("y".to_string(), SettingDefinition::boolean(true));
        assert!(!store.register_schema("p", evolved));

        assert_eq!(store.get("p", "x"), Some(json!(7)));
        assert_eq!(store.get("p", "y"), Some(json!(true)));
        assert!(!store.is_enabled("p"));
    }

    #[tokio::test]
    async fn test_watchers_key_and_module_wide() {
        let store = store_with(MemoryStore::new());
        store.register_schema("p", number_schema());

        let key_calls = Arc::new(Mutex::new(Vec::new()));
        let all_calls = Arc::new(AtomicUsize::new(0));

        let sink = key_calls.clone();
        let key_watch = store.watch("p", Some("x"), move |new, old| {
            sink.lock().unwrap().push((new.clone(), old.clone()));
        });
        let counter = all_calls.clone();
        store.watch_as("owner", "p", None, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set("p", "x", json!(6)).await.unwrap();
        store.set("p", "other", json!("v")).await.unwrap();

        assert_eq!(*key_calls.lock().unwrap(), vec![(json!(6), json!(5.0))]);
        assert_eq!(all_calls.load(Ordering::SeqCst), 2);

        assert!(store.unwatch(key_watch));
        assert_eq!(store.unwatch_owner("owner"), 1);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_enabled_flag_and_enabled_modules() {
        let store = store_with(MemoryStore::new());
        store.register_schema("b", SettingsSchema::new());
        store.register_schema("a", SettingsSchema::new());

        store.enable("b").await.unwrap();
        store.enable("a").await.unwrap();
        store.disable("a").await.unwrap();

        assert!(store.is_enabled("b"));
        assert_eq!(store.get("b", ENABLED_KEY), Some(json!(true)));
        assert_eq!(store.enabled_modules(), vec!["b".to_string()]);

        let err = store.set_with("b", ENABLED_KEY, json!("yes"), true).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn test_burst_of_writes_persists_once() {
        let storage = MemoryStore::new();
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        storage.on_changed(Arc::new(move |_: &StorageChanges| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let store = store_with(storage.clone());
        store.register_schema("p", number_schema());
        for v in 0..5 {
            store.set("p", "x", json!(v)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        let persisted = storage.snapshot("settings").unwrap();
        assert_eq!(persisted["plugins"]["p"]["settings"]["x"], json!(4));
    }

    #[tokio::test]
    async fn test_flush_writes_immediately() {
        let storage = MemoryStore::new();
        let store = store_with(storage.clone());
        store.enable("p").await.unwrap();
        assert!(store.has_pending_write());

        store.flush().await.unwrap();
        assert!(!store.has_pending_write());
        assert_eq!(storage.snapshot("settings").unwrap()["plugins"]["p"]["enabled"], json!(true));
    }

    #[tokio::test]
    async fn test_initialize_and_adopt_external() {
        let storage = MemoryStore::new();
        let writer = store_with(storage.clone());
        writer.register_schema("p", number_schema());
        writer.set("p", "x", json!(9)).await.unwrap();
        writer.flush().await.unwrap();

        let reader = store_with(storage.clone());
        reader.register_schema("p", number_schema());
        reader.initialize().await.unwrap();
        assert_eq!(reader.get("p", "x"), Some(json!(9)));

        // 自己的写入不会被当作外部变化
        let own = storage.snapshot("settings").unwrap();
        assert_eq!(writer.adopt_external(own).await.unwrap(), Adoption::OwnWrite);

        writer.set("p", "x", json!(1)).await.unwrap();
        writer.enable("p").await.unwrap();
        writer.flush().await.unwrap();

        let adoption = reader
            .adopt_external(storage.snapshot("settings").unwrap())
            .await
            .unwrap();
        assert_eq!(adoption.changes().len(), 2);
        assert!(reader.is_enabled("p"));
        assert_eq!(reader.get("p", "x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_queued_own_writes_do_not_regress_document() {
        let storage = MemoryStore::new();
        let store = store_with(storage.clone());
        store.register_schema("p", number_schema());

        store.set("p", "x", json!(1)).await.unwrap();
        store.flush().await.unwrap();
        let first = storage.snapshot("settings").unwrap();
        store.set("p", "x", json!(2)).await.unwrap();
        store.flush().await.unwrap();
        let second = storage.snapshot("settings").unwrap();

        // 两次写入的通知晚到，中间夹着一次本地修改
        assert_eq!(store.adopt_external(first).await.unwrap(), Adoption::OwnWrite);
        assert_eq!(store.get("p", "x"), Some(json!(2)));
        store.set("p", "x", json!(3)).await.unwrap();
        assert_eq!(store.adopt_external(second).await.unwrap(), Adoption::OwnWrite);
        store.flush().await.unwrap();

        assert_eq!(store.get("p", "x"), Some(json!(3)));
        let persisted = storage.snapshot("settings").unwrap();
        assert_eq!(persisted["plugins"]["p"]["settings"]["x"], json!(3));
    }

    #[tokio::test]
    async fn test_foreign_document_waits_for_local_edits() {
        let storage = MemoryStore::new();
        let store = store_with(storage.clone());
        store.register_schema("p", number_schema());
        store.flush().await.unwrap();

        let mut foreign = storage.snapshot("settings").unwrap();
        foreign["plugins"]["p"]["settings"]["x"] = json!(42);

        store.set("p", "x", json!(7)).await.unwrap();
        assert_eq!(
            store.adopt_external(foreign.clone()).await.unwrap(),
            Adoption::LocalPending
        );
        assert_eq!(store.get("p", "x"), Some(json!(7)));

        store.flush().await.unwrap();
        let adoption = store.adopt_external(foreign).await.unwrap();
        assert_eq!(adoption.changes().len(), 1);
        assert_eq!(store.get("p", "x"), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_reset_keeps_enabled() {
        let store = store_with(MemoryStore::new());
        store.register_schema("p", number_schema());
        store.enable("p").await.unwrap();
        store.set("p", "x", json!(8)).await.unwrap();
        store.set("p", "extra", json!(1)).await.unwrap();

        store.reset("p").await.unwrap();
        assert_eq!(store.get("p", "x"), Some(json!(5.0)));
        assert_eq!(store.get("p", "extra"), None);
        assert!(store.is_enabled("p"));
    }

    #[tokio::test]
    async fn test_export_import() {
        let source = store_with(MemoryStore::new());
        source.register_schema("p", number_schema());
        source.set("p", "x", json!(3)).await.unwrap();
        source.set_core("language", json!("zh")).await.unwrap();
        let exported = source.export().unwrap();

        let target = store_with(MemoryStore::new());
        target.register_schema("p", number_schema());
        let changes = target.import(exported).await.unwrap();

        assert!(!changes.is_empty());
        assert_eq!(target.get("p", "x"), Some(json!(3)));
        assert_eq!(target.get_core("language"), Some(json!("zh")));

        // 无效值被跳过
        target
            .import(json!({"plugins": {"p": {"enabled": true, "settings": {"x": "bad"}}}}))
            .await
            .unwrap();
        assert_eq!(target.get("p", "x"), Some(json!(3)));
        assert!(target.is_enabled("p"));
    }

    #[tokio::test]
    async fn test_settings_changed_emitted_on_bus() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.register(
            system_hooks::SETTINGS_CHANGED,
            handler(move |args| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(args.value);
                    Ok(HookFlow::Pass)
                }
            }),
            HookOptions::default(),
        );

        let store = ConfigStore::new(Arc::new(MemoryStore::new()), Some(bus), &settings_config());
        store.register_schema("p", number_schema());
        store.set("p", "x", json!(6)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["moduleId"], json!("p"));
        assert_eq!(seen[0]["oldValue"], json!(5.0));
    }

    #[tokio::test]
    async fn test_destroyed_store_rejects_writes() {
        let store = store_with(MemoryStore::new());
        store.destroy();
        assert!(matches!(
            store.set("p", "x", json!(1)).await,
            Err(CoreError::RuntimeDestroyed)
        ));
    }

    #[test]
    fn test_old_document_upgrade() {
        let doc = SettingsDocument::from_value(json!({
            "version": 1,
            "plugins": {"a": {"enabled": true}}
        }))
        .unwrap();
        assert_eq!(doc.version, SETTINGS_VERSION);
        assert!(doc.is_enabled("a"));
        assert!(doc.plugins["a"].settings.is_empty());
    }
}
