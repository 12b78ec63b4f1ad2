//! 钩子总线
//!
//! 提供模块间的松耦合通信机制：按优先级分组、可取消的发布/订阅。
//!
//! # 执行模型
//!
//! - 同名钩子的处理函数按优先级（数值升序）分组，组与组之间严格串行，
//!   无论 `parallel` 取值如何，优先级顺序都有保证
//! - `parallel: true` 时组内处理函数并发执行，最后一个完成且产生值的结果
//!   作为本组输出（按完成顺序，而非注册位置）
//! - `parallel: false` 时组内按注册顺序串行执行，每个处理函数接收上一个的返回值
//! - 可取消的发射中，处理函数返回 [`HookFlow::Cancel`] 后，当前组照常完成，
//!   后续分组不再执行
//! - `once` 处理函数在整次发射结束后统一注销，即使它执行失败也会被注销
//! - 单个处理函数的错误或 panic 只记录日志，不影响同组和后续分组
//!
//! # 使用示例
//!
//! ```rust
//! use chips_runtime::bus::{handler, EventBus, HookFlow, HookOptions};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new();
//! bus.register(
//!     "title",
//!     handler(|args| async move {
//!         let title = args.value.as_str().unwrap_or_default().to_uppercase();
//!         Ok(HookFlow::Next(json!(title)))
//!     }),
//!     HookOptions::default().owner("upper"),
//! );
//!
//! let value = bus.apply_filters("title", json!("hello")).await;
//! assert_eq!(value, json!("HELLO"));
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::hook::{
    EmitOptions, EmitOutcome, HookArgs, HookFlow, HookHandler, HookOptions, HookToken,
};
use crate::utils::sync::{lock, read, write};

/// 内部注册条目
#[derive(Clone)]
struct HookEntry {
    token: HookToken,
    priority: i32,
    once: bool,
    owner: Option<String>,
    handler: HookHandler,
}

/// 注册信息（对外只读视图）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRegistration {
    /// 注册标识
    pub token: HookToken,
    /// 钩子名称
    pub hook: String,
    /// 优先级
    pub priority: i32,
    /// 是否只执行一次
    pub once: bool,
    /// 所属模块
    pub owner: Option<String>,
}

/// 注册表
///
/// 每个钩子名下的条目始终按（优先级，注册顺序）排序；
/// 另外维护 token -> 钩子名、owner -> token 集合两个索引，
/// 用于精确注销和按模块批量注销。
#[derive(Default)]
struct Registry {
    hooks: HashMap<String, Vec<HookEntry>>,
    by_token: HashMap<HookToken, String>,
    by_owner: HashMap<String, BTreeSet<HookToken>>,
}

impl Registry {
    fn remove(&mut self, token: HookToken) -> bool {
        let Some(hook) = self.by_token.remove(&token) else {
            return false;
        };

        let mut owner = None;
        if let Some(entries) = self.hooks.get_mut(&hook) {
            if let Some(pos) = entries.iter().position(|e| e.token == token) {
                owner = entries.remove(pos).owner;
            }
            if entries.is_empty() {
                self.hooks.remove(&hook);
            }
        }

        if let Some(owner) = owner {
            if let Some(tokens) = self.by_owner.get_mut(&owner) {
                tokens.remove(&token);
                if tokens.is_empty() {
                    self.by_owner.remove(&owner);
                }
            }
        }

        true
    }
}

/// 分发统计信息
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// 总发射次数
    pub total_emitted: u64,
    /// 处理函数调用次数
    pub handlers_invoked: u64,
    /// 处理函数失败次数
    pub handlers_failed: u64,
    /// 被取消的发射次数
    pub cancelled: u64,
    /// 最后发射时间
    pub last_emit_at: Option<DateTime<Utc>>,
}

/// 单个分组的执行状态
enum BandStatus {
    Continue(Value),
    Cancelled(Value),
}

struct BandStep {
    status: BandStatus,
    failed: usize,
}

/// 钩子总线
pub struct EventBus {
    /// 注册表
    registry: RwLock<Registry>,
    /// 下一个注册标识
    next_token: AtomicU64,
    /// 分发统计
    stats: Mutex<DispatchStats>,
}

impl EventBus {
    /// 创建新的钩子总线
    pub fn new() -> Self {
        debug!("创建钩子总线");
        Self {
            registry: RwLock::new(Registry::default()),
            next_token: AtomicU64::new(1),
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    /// 注册处理函数
    ///
    /// 返回的 [`HookToken`] 可传给 [`EventBus::unregister`] 精确注销。
    pub fn register(
        &self,
        hook: impl Into<String>,
        handler: HookHandler,
        options: HookOptions,
    ) -> HookToken {
        let hook = hook.into();
        let token = HookToken(self.next_token.fetch_add(1, Ordering::SeqCst));

        let entry = HookEntry {
            token,
            priority: options.priority,
            once: options.once,
            owner: options.owner.clone(),
            handler,
        };

        {
            let mut registry = write(&self.registry);
            let entries = registry.hooks.entry(hook.clone()).or_default();
            // 同优先级按注册顺序排在已有条目之后
            let pos = entries.partition_point(|e| e.priority <= options.priority);
            entries.insert(pos, entry);
            registry.by_token.insert(token, hook.clone());
            if let Some(ref owner) = options.owner {
                registry.by_owner.entry(owner.clone()).or_default().insert(token);
            }
        }

        trace!(
            hook = %hook,
            token = %token,
            priority = options.priority,
            once = options.once,
            owner = options.owner.as_deref().unwrap_or("-"),
            "注册钩子处理函数"
        );

        token
    }

    /// 注销单个处理函数
    ///
    /// 返回该注册是否存在。
    pub fn unregister(&self, token: HookToken) -> bool {
        let removed = write(&self.registry).remove(token);
        if removed {
            trace!(token = %token, "注销钩子处理函数");
        }
        removed
    }

    /// 注销某个模块的全部处理函数
    ///
    /// 返回注销的数量。
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let mut registry = write(&self.registry);
        let tokens = registry.by_owner.remove(owner).unwrap_or_default();
        let count = tokens.len();
        for token in tokens {
            registry.remove(token);
        }
        drop(registry);

        if count > 0 {
            debug!(owner = %owner, count = count, "注销模块的全部钩子处理函数");
        }
        count
    }

    /// 发射钩子
    pub async fn emit(&self, hook: &str, value: Value, options: EmitOptions) -> EmitOutcome {
        let bands = self.snapshot_bands(hook);

        let mut value = value;
        let mut invoked = 0;
        let mut failed = 0;
        let mut cancelled = false;
        let mut once_tokens = Vec::new();

        for band in bands {
            invoked += band.len();
            once_tokens.extend(band.iter().filter(|e| e.once).map(|e| e.token));

            let step = if options.parallel {
                Self::run_parallel(hook, &band, value, options.cancelable).await
            } else {
                Self::run_sequential(hook, &band, value, options.cancelable).await
            };

            failed += step.failed;
            match step.status {
                BandStatus::Continue(v) => value = v,
                BandStatus::Cancelled(v) => {
                    value = v;
                    cancelled = true;
                    debug!(hook = %hook, "钩子发射已取消，跳过后续分组");
                    break;
                }
            }
        }

        // once 处理函数在整次发射结束后注销，与其执行结果无关
        for token in once_tokens {
            self.unregister(token);
        }

        {
            let mut stats = lock(&self.stats);
            stats.total_emitted += 1;
            stats.handlers_invoked += invoked as u64;
            stats.handlers_failed += failed as u64;
            if cancelled {
                stats.cancelled += 1;
            }
            stats.last_emit_at = Some(Utc::now());
        }

        EmitOutcome {
            value,
            cancelled,
            invoked,
            failed,
        }
    }

    /// 发射 action 钩子（并行、不可取消）
    pub async fn do_action(&self, hook: &str, data: Value) -> EmitOutcome {
        self.emit(hook, data, EmitOptions::default()).await
    }

    /// 发射 filter 钩子（串行链式），返回最终值
    pub async fn apply_filters(&self, hook: &str, value: Value) -> Value {
        self.emit(hook, value, EmitOptions::sequential()).await.value
    }

    /// 复制当前注册表中某个钩子的分组快照
    fn snapshot_bands(&self, hook: &str) -> Vec<Vec<HookEntry>> {
        let registry = read(&self.registry);
        let Some(entries) = registry.hooks.get(hook) else {
            return Vec::new();
        };

        let mut bands: Vec<Vec<HookEntry>> = Vec::new();
        for entry in entries {
            match bands.last_mut() {
                Some(band) if band[0].priority == entry.priority => band.push(entry.clone()),
                _ => bands.push(vec![entry.clone()]),
            }
        }
        bands
    }

    /// 并发执行一个分组
    async fn run_parallel(
        hook: &str,
        band: &[HookEntry],
        input: Value,
        cancelable: bool,
    ) -> BandStep {
        let mut running: FuturesUnordered<_> = band
            .iter()
            .map(|entry| {
                let args = HookArgs {
                    hook: hook.to_string(),
                    value: input.clone(),
                    cancelable,
                };
                let handler = entry.handler.clone();
                let owner = entry.owner.clone();
                async move { (owner, Self::invoke(handler, args).await) }
            })
            .collect();

        let mut last_value = None;
        let mut cancel = false;
        let mut failed = 0;

        while let Some((owner, result)) = running.next().await {
            match result {
                Ok(flow) => {
                    cancel |= Self::accepts_cancel(hook, &flow, cancelable);
                    if let Some(v) = flow.into_value() {
                        last_value = Some(v);
                    }
                }
                Err(e) => {
                    failed += 1;
                    Self::log_failure(hook, owner.as_deref(), &e);
                }
            }
        }

        let value = last_value.unwrap_or(input);
        BandStep {
            status: if cancel {
                BandStatus::Cancelled(value)
            } else {
                BandStatus::Continue(value)
            },
            failed,
        }
    }

    /// 按注册顺序串行执行一个分组
    async fn run_sequential(
        hook: &str,
        band: &[HookEntry],
        input: Value,
        cancelable: bool,
    ) -> BandStep {
        let mut value = input;
        let mut cancel = false;
        let mut failed = 0;

        for entry in band {
            let args = HookArgs {
                hook: hook.to_string(),
                value: value.clone(),
                cancelable,
            };
            match Self::invoke(entry.handler.clone(), args).await {
                Ok(flow) => {
                    cancel |= Self::accepts_cancel(hook, &flow, cancelable);
                    if let Some(v) = flow.into_value() {
                        value = v;
                    }
                }
                Err(e) => {
                    failed += 1;
                    Self::log_failure(hook, entry.owner.as_deref(), &e);
                }
            }
        }

        BandStep {
            status: if cancel {
                BandStatus::Cancelled(value)
            } else {
                BandStatus::Continue(value)
            },
            failed,
        }
    }

    /// 调用处理函数，捕获错误与 panic
    async fn invoke(handler: HookHandler, args: HookArgs) -> std::result::Result<HookFlow, String> {
        let call = async move { handler(args).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(flow)) => Ok(flow),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err("处理函数 panic".to_string()),
        }
    }

    fn accepts_cancel(hook: &str, flow: &HookFlow, cancelable: bool) -> bool {
        if !flow.is_cancel() {
            return false;
        }
        if !cancelable {
            debug!(hook = %hook, "本次发射不可取消，忽略取消请求");
            return false;
        }
        true
    }

    fn log_failure(hook: &str, owner: Option<&str>, error: &str) {
        warn!(
            hook = %hook,
            module_id = owner.unwrap_or("-"),
            error = %error,
            "钩子处理函数执行失败"
        );
    }

    // ==================== 查询 ====================

    /// 某个钩子当前的处理函数数量
    pub fn handler_count(&self, hook: &str) -> usize {
        read(&self.registry).hooks.get(hook).map_or(0, Vec::len)
    }

    /// 是否有处理函数注册在该钩子上
    pub fn has_hook(&self, hook: &str) -> bool {
        self.handler_count(hook) > 0
    }

    /// 某个模块拥有的处理函数数量
    pub fn owner_count(&self, owner: &str) -> usize {
        read(&self.registry).by_owner.get(owner).map_or(0, BTreeSet::len)
    }

    /// 某个模块当前持有的全部注册标识
    pub fn owner_tokens(&self, owner: &str) -> BTreeSet<HookToken> {
        read(&self.registry)
            .by_owner
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    /// 所有已注册的钩子名称（排序）
    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.registry).hooks.keys().cloned().collect();
        names.sort();
        names
    }

    /// 某个钩子的注册信息（按执行顺序）
    pub fn registrations(&self, hook: &str) -> Vec<HookRegistration> {
        read(&self.registry)
            .hooks
            .get(hook)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| HookRegistration {
                        token: e.token,
                        hook: hook.to_string(),
                        priority: e.priority,
                        once: e.once,
                        owner: e.owner.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 全部注册信息（按钩子名、执行顺序）
    pub fn all_registrations(&self) -> Vec<HookRegistration> {
        self.hook_names()
            .iter()
            .flat_map(|name| self.registrations(name))
            .collect()
    }

    /// 清空所有注册
    pub fn clear(&self) {
        *write(&self.registry) = Registry::default();
        debug!("钩子总线已清空");
    }

    /// 获取分发统计信息
    pub fn stats(&self) -> DispatchStats {
        lock(&self.stats).clone()
    }

    /// 重置统计信息
    pub fn reset_stats(&self) {
        *lock(&self.stats) = DispatchStats::default();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::hook::handler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> HookHandler {
        handler(move |args| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                let input = args.value.as_str().unwrap_or_default().to_string();
                Ok(HookFlow::Next(json!(format!("{}{}", input, name))))
            }
        })
    }

    #[tokio::test]
    async fn test_priority_bands_chain_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register("text", recorder(log.clone(), "c"), HookOptions::default().priority(20));
        bus.register("text", recorder(log.clone(), "a"), HookOptions::default().priority(10));
        bus.register("text", recorder(log.clone(), "b"), HookOptions::default().priority(10));

        let outcome = bus
            .emit("text", json!(">"), EmitOptions::sequential())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(outcome.value, json!(">abc"));
        assert_eq!(outcome.invoked, 3);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_parallel_band_carries_last_settled_value() {
        let bus = EventBus::new();

        bus.register(
            "pick",
            handler(|_| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(HookFlow::Next(json!("slow")))
            }),
            HookOptions::default(),
        );
        bus.register(
            "pick",
            handler(|_| async { Ok(HookFlow::Next(json!("fast"))) }),
            HookOptions::default(),
        );

        let outcome = bus.do_action("pick", json!(null)).await;
        assert_eq!(outcome.value, json!("slow"));
    }

    #[tokio::test]
    async fn test_pass_keeps_input() {
        let bus = EventBus::new();
        bus.register(
            "noop",
            handler(|_| async { Ok(HookFlow::Pass) }),
            HookOptions::default(),
        );
        assert_eq!(bus.apply_filters("noop", json!(7)).await, json!(7));
        assert_eq!(bus.apply_filters("missing", json!(8)).await, json!(8));
    }

    #[tokio::test]
    async fn test_cancel_stops_later_bands_only_when_cancelable() {
        let bus = EventBus::new();
        let late = Arc::new(AtomicUsize::new(0));
        let same_band = Arc::new(AtomicUsize::new(0));

        bus.register(
            "guard",
            handler(|_| async { Ok(HookFlow::Cancel(None)) }),
            HookOptions::default().priority(1),
        );
        let counter = same_band.clone();
        bus.register(
            "guard",
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HookFlow::Pass)
                }
            }),
            HookOptions::default().priority(1),
        );
        let counter = late.clone();
        bus.register(
            "guard",
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HookFlow::Pass)
                }
            }),
            HookOptions::default().priority(2),
        );

        let outcome = bus
            .emit("guard", json!(null), EmitOptions::default().cancelable())
            .await;
        assert!(outcome.cancelled);
        assert_eq!(same_band.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);

        // 不可取消的发射忽略取消请求
        let outcome = bus.do_action("guard", json!(null)).await;
        assert!(!outcome.cancelled);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.register(
            "boom",
            handler(|_| async { Err(anyhow::anyhow!("handler failed")) }),
            HookOptions::default().priority(1).owner("bad"),
        );
        bus.register(
            "boom",
            handler(|_| async { panic!("handler panicked") }),
            HookOptions::default().priority(1).owner("worse"),
        );
        let counter = reached.clone();
        bus.register(
            "boom",
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HookFlow::Pass)
                }
            }),
            HookOptions::default().priority(5),
        );

        let outcome = bus.do_action("boom", json!(null)).await;
        assert_eq!(outcome.failed, 2);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handlers_failed, 2);
    }

    #[tokio::test]
    async fn test_once_removed_after_emission_even_on_failure() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bus.register(
            "once",
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("fails once"))
                }
            }),
            HookOptions::default().once(),
        );

        bus.do_action("once", json!(null)).await;
        bus.do_action("once", json!(null)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!bus.has_hook("once"));
    }

    #[tokio::test]
    async fn test_unregister_owner() {
        let bus = EventBus::new();
        let noop = || handler(|_| async { Ok(HookFlow::Pass) });

        bus.register("a", noop(), HookOptions::default().owner("m1"));
        bus.register("b", noop(), HookOptions::default().owner("m1"));
        let keep = bus.register("a", noop(), HookOptions::default().owner("m2"));

        assert_eq!(bus.owner_count("m1"), 2);
        assert_eq!(bus.unregister_owner("m1"), 2);
        assert_eq!(bus.owner_count("m1"), 0);
        assert!(!bus.has_hook("b"));
        assert_eq!(bus.registrations("a")[0].token, keep);

        assert!(bus.unregister(keep));
        assert!(!bus.unregister(keep));
        assert!(bus.hook_names().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let bus = EventBus::new();
        bus.register("a", handler(|_| async { Ok(HookFlow::Pass) }), HookOptions::default());
        bus.clear();
        assert!(bus.all_registrations().is_empty());
    }
}
