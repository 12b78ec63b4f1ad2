//! 插件运行时
//!
//! [`PluginRuntime`] 是运行时的对外入口，负责按顺序编排各个组件：
//!
//! 1. 从持久化存储加载设置
//! 2. 注册 IPC 命令处理函数和核心钩子
//! 3. 发现并注册模块
//! 4. 按依赖顺序加载模块
//! 5. 注册每个已加载模块的设置模式
//! 6. 按存储中的启用状态启动模块（不回写存储）
//! 7. 等待宿主环境稳定
//! 8. 安装环境事件观察者和存储变化监听
//! 9. 标记为就绪
//!
//! # 命令与协调
//!
//! `enable_plugin` / `disable_plugin` 先写存储再同步运行时，运行时失败时回滚存储。
//! 同一模块同一方向的并发命令共享一次执行结果（单飞）。
//!
//! 存储变化（可能来自其他上下文）经过合并窗口后只提取启用状态的变化：
//! 本上下文正在执行的命令引起的变化视为回声并忽略，其余变化通过协调路径同步运行时。
//! 协调路径从不写存储，否则会再次触发正在处理的通知。
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::api::PluginRuntime;
//! use chips_runtime::module::{ModuleDescriptor, ModuleManifest, StaticModuleSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = StaticModuleSource::new();
//!     source.add(ModuleDescriptor::new(ModuleManifest::new("hello", "Hello", "1.0.0")), true);
//!
//!     let runtime = PluginRuntime::builder().source(Arc::new(source)).build();
//!     let report = runtime.initialize().await?;
//!     println!("started: {:?}", report.started);
//!
//!     runtime.destroy().await;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::{FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::ipc::{actions, action_handler, MessageBroker, Transport};
use crate::bus::{handler, system_hooks, EventBus, HookFlow, HookOptions};
use crate::config::{
    Adoption, ConfigStore, ListenerId, MemoryStore, PersistentStore, SettingsDocument,
    StorageChanges,
};
use crate::core::{EnvironmentEvent, HostEnvironment, NullEnvironment, RuntimeConfig};
use crate::module::{
    LifecycleController, ModuleCatalog, ModuleInfo, ModuleLoader, ModuleSource, ModuleState,
    SkippedModule, StaticModuleSource,
};
use crate::utils::sync::{lock, read, write};
use crate::utils::{CoreError, Result};

/// 核心钩子的所有者
const CORE_OWNER: &str = "core";

// ============================================================================
// 类型定义
// ============================================================================

/// 运行时阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePhase {
    /// 已创建，尚未初始化
    Created,
    /// 初始化中
    Initializing,
    /// 已就绪
    Ready,
    /// 已销毁
    Destroyed,
}

/// 命令方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enable,
    Disable,
}

impl Operation {
    fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Operation::Enable
        } else {
            Operation::Disable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Enable => "enable",
            Operation::Disable => "disable",
        }
    }
}

/// 操作令牌：`{module_id}:{enable|disable}`
///
/// 令牌在执行期间存在于进行中集合里，同一令牌的并发命令共享结果。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationToken {
    pub module_id: String,
    pub operation: Operation,
}

impl OperationToken {
    pub fn new(module_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            module_id: module_id.into(),
            operation,
        }
    }
}

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module_id, self.operation.as_str())
    }
}

/// 初始化报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitReport {
    /// 发现并注册的模块
    pub discovered: Vec<String>,
    /// 发现阶段跳过的模块
    pub skipped: Vec<SkippedModule>,
    /// 加载成功的模块（按加载顺序）
    pub loaded: Vec<String>,
    /// 加载或启动失败的模块
    pub failed: Vec<SkippedModule>,
    /// 启动成功的模块
    pub started: Vec<String>,
}

/// 运行时统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// 执行的协调次数
    pub reconciles: u64,
    /// 忽略的回声次数
    pub echoes_ignored: u64,
    /// 加入进行中命令的次数
    pub commands_joined: u64,
    /// 发出的环境事件批次
    pub environment_batches: u64,
}

/// 存储变化通知（由同步监听器发往观察者任务）
struct StorageNotice {
    document: Value,
    transitions: Vec<(String, bool)>,
}

type SharedOutcome = Shared<oneshot::Receiver<bool>>;

enum Flight {
    Leader(oneshot::Sender<bool>),
    Joiner(SharedOutcome),
}

/// 领导者结束（包括被取消）时移除令牌
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<OperationToken, SharedOutcome>>,
    token: OperationToken,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.token);
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 运行时构建器
#[derive(Default)]
pub struct PluginRuntimeBuilder {
    config: RuntimeConfig,
    storage: Option<Arc<dyn PersistentStore>>,
    transport: Option<Arc<dyn Transport>>,
    source: Option<Arc<dyn ModuleSource>>,
    environment: Option<Arc<dyn HostEnvironment>>,
}

impl PluginRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 运行时配置
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 持久化存储，默认为内存存储
    pub fn storage(mut self, storage: Arc<dyn PersistentStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 跨上下文通信通道，未设置时不创建消息代理
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 模块来源，默认为空
    pub fn source(mut self, source: Arc<dyn ModuleSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// 宿主环境，默认为 [`NullEnvironment`]
    pub fn environment(mut self, environment: Arc<dyn HostEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn build(self) -> Arc<PluginRuntime> {
        let config = self.config;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(StaticModuleSource::new()));
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(NullEnvironment));

        let catalog = Arc::new(ModuleCatalog::new());
        let bus = Arc::new(EventBus::new());
        let settings = ConfigStore::new(storage, Some(bus.clone()), &config.settings);
        let broker = self.transport.map(|transport| {
            MessageBroker::new(transport, config.ipc.context.clone(), config.ipc.request_timeout())
        });
        let loader = ModuleLoader::new(catalog.clone(), source);
        let lifecycle = LifecycleController::new(
            catalog.clone(),
            bus.clone(),
            settings.clone(),
            broker.clone(),
            config.lifecycle.hook_timeout(),
        );

        info!(context = %config.ipc.context, version = crate::VERSION, "创建插件运行时");

        Arc::new_cyclic(|self_ref| PluginRuntime {
            self_ref: self_ref.clone(),
            config,
            catalog,
            bus,
            settings,
            broker,
            loader,
            lifecycle,
            environment,
            phase: Mutex::new(RuntimePhase::Created),
            report: Mutex::new(None),
            load_order: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            storage_listener: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stats: Mutex::new(RuntimeStats::default()),
        })
    }
}

// ============================================================================
// 运行时
// ============================================================================

/// 插件运行时
pub struct PluginRuntime {
    self_ref: Weak<Self>,
    config: RuntimeConfig,
    catalog: Arc<ModuleCatalog>,
    bus: Arc<EventBus>,
    settings: Arc<ConfigStore>,
    broker: Option<Arc<MessageBroker>>,
    loader: ModuleLoader,
    lifecycle: LifecycleController,
    environment: Arc<dyn HostEnvironment>,

    phase: Mutex<RuntimePhase>,
    report: Mutex<Option<InitReport>>,
    /// 初始化时计算的加载顺序
    load_order: RwLock<Vec<String>>,
    /// 进行中的命令
    in_flight: Mutex<HashMap<OperationToken, SharedOutcome>>,
    storage_listener: Mutex<Option<ListenerId>>,
    /// 观察者任务
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Mutex<RuntimeStats>,
}

impl PluginRuntime {
    /// 创建构建器
    pub fn builder() -> PluginRuntimeBuilder {
        PluginRuntimeBuilder::new()
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn settings(&self) -> &Arc<ConfigStore> {
        &self.settings
    }

    pub fn broker(&self) -> Option<&Arc<MessageBroker>> {
        self.broker.as_ref()
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn phase(&self) -> RuntimePhase {
        *lock(&self.phase)
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == RuntimePhase::Ready
    }

    pub fn stats(&self) -> RuntimeStats {
        lock(&self.stats).clone()
    }

    /// 初始化报告（初始化完成后可用）
    pub fn report(&self) -> Option<InitReport> {
        lock(&self.report).clone()
    }

    /// 初始化时计算的加载顺序
    pub fn load_order(&self) -> Vec<String> {
        read(&self.load_order).clone()
    }

    pub fn module_info(&self, module_id: &str) -> Option<ModuleInfo> {
        self.catalog.module_info(module_id)
    }

    pub fn all_module_info(&self) -> Vec<ModuleInfo> {
        self.catalog.all_module_info()
    }

    /// 指定方向的命令是否正在执行
    pub fn is_in_flight(&self, module_id: &str, operation: Operation) -> bool {
        lock(&self.in_flight).contains_key(&OperationToken::new(module_id, operation))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.phase() == RuntimePhase::Destroyed {
            return Err(CoreError::RuntimeDestroyed);
        }
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut RuntimeStats)) {
        f(&mut lock(&self.stats));
    }

    // ========================================================================
    // 初始化
    // ========================================================================

    /// 初始化运行时
    ///
    /// 每个运行时只初始化一次：重复或并发调用只记录警告，返回已有的报告。
    pub async fn initialize(&self) -> Result<InitReport> {
        {
            let mut phase = lock(&self.phase);
            match *phase {
                RuntimePhase::Created => *phase = RuntimePhase::Initializing,
                RuntimePhase::Destroyed => return Err(CoreError::RuntimeDestroyed),
                current => {
                    warn!(phase = ?current, "运行时已初始化或正在初始化，忽略");
                    return Ok(self.report().unwrap_or_default());
                }
            }
        }

        info!(version = crate::VERSION, context = %self.config.ipc.context, "开始初始化插件运行时");
        match self.run_startup().await {
            Ok(report) => {
                *lock(&self.report) = Some(report.clone());
                {
                    let mut phase = lock(&self.phase);
                    if *phase == RuntimePhase::Initializing {
                        *phase = RuntimePhase::Ready;
                    }
                }
                info!(
                    discovered = report.discovered.len(),
                    loaded = report.loaded.len(),
                    started = report.started.len(),
                    failed = report.failed.len(),
                    "插件运行时初始化完成"
                );
                self.bus
                    .do_action(system_hooks::RUNTIME_READY, json!({ "started": report.started }))
                    .await;
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "插件运行时初始化失败");
                self.bus.unregister_owner(CORE_OWNER);
                let mut phase = lock(&self.phase);
                if *phase == RuntimePhase::Initializing {
                    *phase = RuntimePhase::Created;
                }
                Err(CoreError::InitFailed(e.to_string()))
            }
        }
    }

    async fn run_startup(&self) -> Result<InitReport> {
        let mut report = InitReport::default();

        // 1. 设置
        self.settings.initialize().await?;

        // 2. 命令处理函数与核心钩子
        self.install_commands();
        self.install_core_hooks();

        // 3. 发现
        let discovery = self.loader.discover_plugins().await?;
        report.discovered = discovery.registered.clone();
        report.skipped = discovery.skipped;

        // 4. 加载
        let load = self.loader.load_plugins(&discovery.registered).await;
        report.loaded = load.loaded.clone();
        report.failed = load.failed;
        *write(&self.load_order) = load.loaded.clone();

        // 5. 设置模式
        let mut seeded = false;
        for id in &load.loaded {
            let Some(manifest) = self.catalog.manifest(id) else {
                continue;
            };
            if self.settings.register_schema(id, manifest.settings.clone()) {
                seeded = true;
                if discovery.enabled_by_default.contains(id) {
                    self.settings.enable(id).await?;
                }
            }
        }
        if seeded {
            self.settings.flush().await?;
        }

        // 6. 按存储启动
        let enabled = self.settings.enabled_modules();
        for id in load.loaded.iter().filter(|id| enabled.contains(id)) {
            match self.runtime_start(id).await {
                Ok(()) => report.started.push(id.clone()),
                Err(e) => {
                    warn!(module_id = %id, error = %e, "模块启动失败");
                    report.failed.push(SkippedModule {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        for id in enabled.iter().filter(|id| !load.loaded.contains(id)) {
            debug!(module_id = %id, "已启用的模块未加载，跳过启动");
        }

        // 7. 等待宿主稳定
        let limit = self.config.orchestrator.stable_timeout();
        if tokio::time::timeout(limit, self.environment.wait_stable())
            .await
            .is_err()
        {
            warn!(timeout_ms = limit.as_millis() as u64, "等待宿主环境稳定超时，继续初始化");
        }

        // 8. 观察者
        self.install_observers();

        Ok(report)
    }

    /// 注册核心钩子：把设置和状态变化转发给其他上下文
    fn install_core_hooks(&self) {
        let Some(broker) = self.broker.clone() else {
            return;
        };

        for (hook, action) in [
            (system_hooks::SETTINGS_CHANGED, actions::SETTINGS_CHANGED),
            (system_hooks::PLUGIN_STATE_CHANGED, actions::PLUGIN_STATE_CHANGED),
        ] {
            let broker = broker.clone();
            self.bus.register(
                hook,
                handler(move |args| {
                    let broker = broker.clone();
                    async move {
                        broker.broadcast(action, args.value).await;
                        Ok(HookFlow::Pass)
                    }
                }),
                HookOptions::default().owner(CORE_OWNER),
            );
        }
    }

    /// 注册 IPC 命令处理函数
    fn install_commands(&self) {
        self.command(actions::PING, |rt, _| async move {
            Ok(json!({ "pong": true, "context": rt.config.ipc.context, "phase": rt.phase() }))
        });
        self.command(actions::ENABLE_PLUGIN, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            rt.enable_plugin(&id).await?;
            Ok(json!({ "id": id, "state": rt.catalog.state(&id) }))
        });
        self.command(actions::DISABLE_PLUGIN, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            rt.disable_plugin(&id).await?;
            Ok(json!({ "id": id, "state": rt.catalog.state(&id) }))
        });
        self.command(actions::RELOAD_PLUGIN, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            rt.reload_plugin(&id).await?;
            Ok(json!({ "id": id, "state": rt.catalog.state(&id) }))
        });
        self.command(actions::GET_ALL_PLUGIN_INFO, |rt, _| async move {
            Ok(serde_json::to_value(rt.all_module_info())?)
        });
        self.command(actions::GET_PLUGIN_INFO, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            let info = rt
                .module_info(&id)
                .ok_or(CoreError::ModuleNotFound(id))?;
            Ok(serde_json::to_value(info)?)
        });
        self.command(actions::GET_SETTINGS, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            Ok(Value::Object(rt.settings.get_all(&id)))
        });
        self.command(actions::SET_SETTING, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            let key = string_arg(&data, "key")?;
            let value = data.get("value").cloned().unwrap_or(Value::Null);
            rt.settings.set(&id, &key, value).await?;
            Ok(json!({ "id": id, "key": key }))
        });
        self.command(actions::RESET_SETTINGS, |rt, data| async move {
            let id = string_arg(&data, "id")?;
            rt.settings.reset(&id).await?;
            Ok(Value::Object(rt.settings.get_all(&id)))
        });
        self.command(actions::EXPORT_SETTINGS, |rt, _| async move {
            rt.settings.export()
        });
        self.command(actions::IMPORT_SETTINGS, |rt, data| async move {
            let changes = rt.settings.import(data).await?;
            Ok(json!({ "changed": changes.len() }))
        });
    }

    fn command<F, Fut>(&self, action: &'static str, f: F)
    where
        F: Fn(Arc<PluginRuntime>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let Some(broker) = self.broker.as_ref() else {
            return;
        };
        let weak = self.self_ref.clone();
        let f = Arc::new(f);
        broker.on(
            action,
            action_handler(move |data| {
                let weak = weak.clone();
                let f = f.clone();
                async move {
                    let runtime = weak.upgrade().ok_or(CoreError::RuntimeDestroyed)?;
                    runtime.ensure_alive()?;
                    Ok(f(runtime, data).await?)
                }
            }),
        );
    }

    /// 安装存储变化监听和环境事件观察者
    fn install_observers(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("不在异步运行时中，跳过观察者");
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let weak = self.self_ref.clone();
        let key = self.settings.storage_key().to_string();
        let listener = self
            .settings
            .storage()
            .on_changed(Arc::new(move |changes: &StorageChanges| {
                if let Some(runtime) = weak.upgrade() {
                    runtime.on_storage_changed(&key, changes, &tx);
                }
            }));
        *lock(&self.storage_listener) = Some(listener);

        let storage_task = handle.spawn(observe_storage(
            self.self_ref.clone(),
            rx,
            self.config.orchestrator.reconcile_debounce(),
        ));
        let environment_task = handle.spawn(observe_environment(
            self.self_ref.clone(),
            self.environment.subscribe(),
            self.config.orchestrator.observer_batch(),
        ));
        lock(&self.tasks).extend([storage_task, environment_task]);
        debug!("观察者已安装");
    }

    // ========================================================================
    // 命令
    // ========================================================================

    /// 启用模块
    ///
    /// 先写存储，再启动模块；启动失败时把存储恢复为原值。
    pub async fn enable_plugin(&self, module_id: &str) -> Result<()> {
        self.command_guard(module_id)?;
        let token = OperationToken::new(module_id, Operation::Enable);
        self.single_flight(token, async {
            let was_enabled = self.settings.is_enabled(module_id);
            if was_enabled && self.catalog.state(module_id) == ModuleState::Active {
                debug!(module_id = %module_id, "模块已启用");
                return Ok(());
            }

            info!(module_id = %module_id, "启用模块");
            self.settings.enable(module_id).await?;
            self.settings.flush().await?;

            if let Err(e) = self.runtime_start(module_id).await {
                error!(module_id = %module_id, error = %e, "启用失败，回滚设置");
                if !was_enabled {
                    self.settings.disable(module_id).await?;
                    self.settings.flush().await?;
                }
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    /// 禁用模块
    ///
    /// 先写存储，再停止模块；停止失败时把存储恢复为原值。
    pub async fn disable_plugin(&self, module_id: &str) -> Result<()> {
        self.command_guard(module_id)?;
        let token = OperationToken::new(module_id, Operation::Disable);
        self.single_flight(token, async {
            let was_enabled = self.settings.is_enabled(module_id);
            if !was_enabled && self.catalog.state(module_id) != ModuleState::Active {
                debug!(module_id = %module_id, "模块已禁用");
                return Ok(());
            }

            info!(module_id = %module_id, "禁用模块");
            self.settings.disable(module_id).await?;
            self.settings.flush().await?;

            if let Err(e) = self.runtime_stop(module_id).await {
                error!(module_id = %module_id, error = %e, "禁用失败，回滚设置");
                if was_enabled {
                    self.settings.enable(module_id).await?;
                    self.settings.flush().await?;
                }
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    /// 重新加载模块（只对活动模块生效）
    pub async fn reload_plugin(&self, module_id: &str) -> Result<()> {
        self.command_guard(module_id)?;
        self.lifecycle.reload_plugin(module_id).await
    }

    fn command_guard(&self, module_id: &str) -> Result<()> {
        self.ensure_alive()?;
        if !self.catalog.contains(module_id) {
            return Err(CoreError::ModuleNotFound(module_id.to_string()));
        }
        Ok(())
    }

    /// 单飞执行：同一令牌的并发调用等待第一次调用的结果
    ///
    /// 加入者不直接复用领导者的返回值，而是检查运行时是否达到了期望状态。
    async fn single_flight<F>(&self, token: OperationToken, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let flight = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&token) {
                Some(outcome) => Flight::Joiner(outcome.clone()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    in_flight.insert(token.clone(), rx.shared());
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Joiner(outcome) => {
                self.bump(|s| s.commands_joined += 1);
                debug!(token = %token, "加入进行中的命令");
                let _ = outcome.await;

                let active = self.catalog.state(&token.module_id) == ModuleState::Active;
                if active == (token.operation == Operation::Enable) {
                    Ok(())
                } else {
                    Err(CoreError::OperationFailed {
                        module_id: token.module_id.clone(),
                        operation: token.operation.as_str().to_string(),
                    })
                }
            }
            Flight::Leader(tx) => {
                let guard = FlightGuard {
                    in_flight: &self.in_flight,
                    token,
                };
                let result = work.await;
                drop(guard);
                let _ = tx.send(result.is_ok());
                result
            }
        }
    }

    /// 只同步运行时的启动路径：按需加载、初始化，然后启动，不写存储
    async fn runtime_start(&self, module_id: &str) -> Result<()> {
        if self.catalog.state(module_id) == ModuleState::Active {
            return Ok(());
        }
        if self.catalog.instance(module_id).is_none() {
            self.loader.load_plugin(module_id).await?;
        }
        if self.catalog.state(module_id) == ModuleState::Loaded
            && !self.catalog.is_initialized(module_id)
        {
            self.lifecycle.init_plugin(module_id).await?;
        }
        self.lifecycle.start_plugin(module_id).await
    }

    /// 只同步运行时的停止路径，不写存储
    async fn runtime_stop(&self, module_id: &str) -> Result<()> {
        if self.catalog.state(module_id) != ModuleState::Active {
            return Ok(());
        }
        self.lifecycle.stop_plugin(module_id).await
    }

    // ========================================================================
    // 协调
    // ========================================================================

    /// 存储变化监听（同步）
    ///
    /// 只关心设置文档本身，过滤掉本上下文进行中命令造成的回声。
    fn on_storage_changed(
        &self,
        key: &str,
        changes: &StorageChanges,
        tx: &mpsc::UnboundedSender<StorageNotice>,
    ) {
        if self.phase() == RuntimePhase::Destroyed {
            return;
        }
        let Some(change) = changes.get(key) else {
            return;
        };
        let Some(document) = change.new_value.clone() else {
            return;
        };

        let mut transitions = Vec::new();
        for (module_id, enabled) in enabled_transitions(change.old_value.as_ref(), &document) {
            if self.is_in_flight(&module_id, Operation::from_enabled(enabled)) {
                self.bump(|s| s.echoes_ignored += 1);
                trace!(module_id = %module_id, enabled = enabled, "忽略本上下文命令的回声");
                continue;
            }
            transitions.push((module_id, enabled));
        }

        if tx.send(StorageNotice { document, transitions }).is_err() {
            trace!("存储观察者已退出");
        }
    }

    /// 把运行时同步到存储中的启用状态，从不写存储
    pub async fn reconcile(&self, module_id: &str, enabled: bool) -> Result<()> {
        if self.phase() == RuntimePhase::Destroyed {
            return Ok(());
        }
        self.bump(|s| s.reconciles += 1);
        if !self.catalog.contains(module_id) {
            debug!(module_id = %module_id, "协调的模块不在目录中，跳过");
            return Ok(());
        }

        info!(module_id = %module_id, enabled = enabled, "协调模块状态");
        let token = OperationToken::new(module_id, Operation::from_enabled(enabled));
        self.single_flight(token, async {
            if enabled {
                self.runtime_start(module_id).await
            } else {
                self.runtime_stop(module_id).await
            }
        })
        .await
    }

    async fn flush_transitions(&self, pending: BTreeMap<String, bool>) {
        for (module_id, enabled) in pending {
            if self.is_in_flight(&module_id, Operation::from_enabled(enabled)) {
                self.bump(|s| s.echoes_ignored += 1);
                continue;
            }
            if self.settings.is_enabled(&module_id) != enabled {
                trace!(module_id = %module_id, enabled = enabled, "启用状态已被更新的写入取代");
                continue;
            }
            if let Err(e) = self.reconcile(&module_id, enabled).await {
                warn!(module_id = %module_id, error = %e, "协调失败");
            }
        }
    }

    async fn emit_environment_batch(&self, events: Vec<EnvironmentEvent>) {
        self.bump(|s| s.environment_batches += 1);
        trace!(events = events.len(), "发出环境事件批次");
        self.bus
            .do_action(system_hooks::ENVIRONMENT_CHANGED, json!({ "events": events }))
            .await;
    }

    // ========================================================================
    // 销毁
    // ========================================================================

    /// 销毁运行时
    ///
    /// 先销毁消息代理，再按加载顺序的逆序停止活动模块，写入待保存的设置，
    /// 最后断开监听并清空钩子总线。重复调用为空操作。
    pub async fn destroy(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase == RuntimePhase::Destroyed {
                return;
            }
            *phase = RuntimePhase::Destroyed;
        }
        info!(context = %self.config.ipc.context, "销毁插件运行时");

        lock(&self.in_flight).clear();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        if let Some(broker) = &self.broker {
            broker.destroy();
        }

        let mut order = self.load_order();
        for id in self.catalog.modules_by_state(ModuleState::Active) {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        for id in order.iter().rev() {
            if self.catalog.state(id) != ModuleState::Active {
                continue;
            }
            if let Err(e) = self.lifecycle.stop_plugin(id).await {
                warn!(module_id = %id, error = %e, "销毁时停止模块失败");
            }
        }

        if let Err(e) = self.settings.flush().await {
            warn!(error = %e, "销毁时写入设置失败");
        }
        if let Some(listener) = lock(&self.storage_listener).take() {
            self.settings.storage().remove_listener(listener);
        }
        self.settings.destroy();
        self.bus.clear();
        info!("插件运行时已销毁");
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// 观察者任务
// ============================================================================

/// 存储变化观察者：立即采纳文档，启用状态变化经过合并窗口后再协调
async fn observe_storage(
    weak: Weak<PluginRuntime>,
    mut rx: mpsc::UnboundedReceiver<StorageNotice>,
    debounce: Duration,
) {
    let mut pending: BTreeMap<String, bool> = BTreeMap::new();
    loop {
        let notice = if pending.is_empty() {
            rx.recv().await
        } else {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(notice) => notice,
                Err(_) => {
                    let Some(runtime) = weak.upgrade() else {
                        break;
                    };
                    runtime.flush_transitions(std::mem::take(&mut pending)).await;
                    continue;
                }
            }
        };

        let Some(notice) = notice else {
            break;
        };
        let Some(runtime) = weak.upgrade() else {
            break;
        };
        match runtime.settings.adopt_external(notice.document).await {
            // 未采纳的文档会被本地的下一次写入覆盖，不据此协调
            Ok(Adoption::LocalPending | Adoption::Destroyed) => {}
            Ok(_) => pending.extend(notice.transitions),
            Err(e) => warn!(error = %e, "采纳外部设置失败"),
        }
    }
    trace!("存储观察者退出");
}

/// 环境事件观察者：窗口内的事件合并为一批
async fn observe_environment(
    weak: Weak<PluginRuntime>,
    mut rx: mpsc::UnboundedReceiver<EnvironmentEvent>,
    window: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            batch.push(event);
        }

        let Some(runtime) = weak.upgrade() else {
            break;
        };
        runtime.emit_environment_batch(batch).await;
    }
    trace!("环境观察者退出");
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 两份设置文档之间启用状态的变化
fn enabled_transitions(old: Option<&Value>, new: &Value) -> Vec<(String, bool)> {
    let flags = |value: Option<&Value>| -> BTreeMap<String, bool> {
        value
            .and_then(|v| SettingsDocument::from_value(v.clone()).ok())
            .map(|doc| doc.enabled_flags())
            .unwrap_or_default()
    };
    let before = flags(old);
    let after = flags(Some(new));

    let mut transitions: Vec<(String, bool)> = after
        .iter()
        .filter(|(id, enabled)| before.get(*id).copied().unwrap_or(false) != **enabled)
        .map(|(id, enabled)| (id.clone(), *enabled))
        .collect();
    transitions.extend(
        before
            .iter()
            .filter(|(id, enabled)| **enabled && !after.contains_key(*id))
            .map(|(id, _)| (id.clone(), false)),
    );
    transitions
}

fn string_arg(data: &Value, name: &str) -> Result<String> {
    data.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::Internal(format!("缺少参数: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(flags: &[(&str, bool)]) -> Value {
        let plugins: serde_json::Map<String, Value> = flags
            .iter()
            .map(|(id, enabled)| (id.to_string(), json!({ "enabled": enabled })))
            .collect();
        json!({ "version": 2, "plugins": plugins })
    }

    #[test]
    fn test_operation_token_display() {
        assert_eq!(OperationToken::new("theme", Operation::Enable).to_string(), "theme:enable");
        assert_eq!(OperationToken::new("theme", Operation::Disable).to_string(), "theme:disable");
    }

    #[test]
    fn test_enabled_transitions() {
        let old = doc(&[("a", true), ("b", false), ("gone", true)]);
        let new = doc(&[("a", true), ("b", true), ("c", false), ("d", true)]);

        let transitions = enabled_transitions(Some(&old), &new);
        assert_eq!(
            transitions,
            vec![
                ("b".to_string(), true),
                ("d".to_string(), true),
                ("gone".to_string(), false),
            ]
        );

        assert_eq!(enabled_transitions(None, &doc(&[("x", true)])), vec![("x".to_string(), true)]);
        assert!(enabled_transitions(Some(&json!("garbage")), &doc(&[])).is_empty());
    }

    #[test]
    fn test_string_arg() {
        let data = json!({ "id": "m", "n": 1 });
        assert_eq!(string_arg(&data, "id").unwrap(), "m");
        assert!(string_arg(&data, "n").is_err());
        assert!(string_arg(&Value::Null, "id").is_err());
    }

    #[tokio::test]
    async fn test_initialize_once_and_destroy() {
        let runtime = PluginRuntime::builder().build();
        runtime.initialize().await.unwrap();
        assert!(runtime.is_ready());

        // 重复初始化只返回已有报告
        runtime.initialize().await.unwrap();
        assert!(runtime.is_ready());

        runtime.destroy().await;
        assert_eq!(runtime.phase(), RuntimePhase::Destroyed);
        assert!(matches!(runtime.initialize().await, Err(CoreError::RuntimeDestroyed)));
        assert!(matches!(
            runtime.enable_plugin("x").await,
            Err(CoreError::RuntimeDestroyed)
        ));
    }
}
