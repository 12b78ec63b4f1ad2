//! # 运行时集成测试
//!
//! 覆盖插件运行时的完整流程：
//! - 启动：发现 → 加载 → 按存储启动
//! - 启停命令：存储回滚、单飞执行
//! - 存储变化：回声过滤、合并后协调、多个上下文收敛
//! - 宿主环境：稳定等待与事件批次
//! - 通过 IPC 客户端调用运行时命令
//! - 销毁顺序

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chips_runtime::api::ipc::{action_handler, LocalHub, MessageBroker};
use chips_runtime::bus::{handler, system_hooks, HookFlow, HookOptions};
use chips_runtime::core::{EnvironmentEvent, ManualEnvironment};
use chips_runtime::{
    CoreError, MemoryStore, ModuleDescriptor, ModuleManifest, ModuleState, PersistentStore,
    PluginRuntime, RuntimeClient, RuntimeConfig, RuntimePhase, SettingDefinition,
    StaticModuleSource,
};
use serde_json::{json, Value};

// ============================================================================
// 测试辅助
// ============================================================================

const STORAGE_KEY: &str = "chips_settings";

fn config(context: &str) -> RuntimeConfig {
    RuntimeConfig::builder()
        .context(context)
        .reconcile_debounce(Duration::from_millis(20))
        .observer_batch(Duration::from_millis(30))
        .build()
}

fn manifest(id: &str) -> ModuleManifest {
    ModuleManifest::new(id, id.to_uppercase(), "1.0.0")
}

/// 统计 start / stop 次数的模块
fn counted(manifest: ModuleManifest, starts: Arc<AtomicUsize>, stops: Arc<AtomicUsize>) -> ModuleDescriptor {
    ModuleDescriptor::new(manifest)
        .on_start(move |_| {
            let starts = starts.clone();
            async move {
                starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .on_stop(move |_| {
            let stops = stops.clone();
            async move {
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
}

/// 轮询直到条件成立或超时
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn stored_flag(store: &MemoryStore, id: &str) -> Option<bool> {
    store
        .snapshot(STORAGE_KEY)
        .and_then(|doc| doc["plugins"][id]["enabled"].as_bool())
}

// ============================================================================
// 启动
// ============================================================================

#[tokio::test]
async fn test_startup_follows_stored_flags() {
    let source = StaticModuleSource::new();
    source
        .add(ModuleDescriptor::new(manifest("base")), true)
        .add(ModuleDescriptor::new(manifest("ui").depends_on("base")), true)
        .add(ModuleDescriptor::new(manifest("extra")), false);

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();

    let report = runtime.initialize().await.unwrap();
    assert_eq!(report.discovered.len(), 3);
    assert_eq!(report.started, vec!["base".to_string(), "ui".to_string()]);
    assert!(report.failed.is_empty());

    let order = runtime.load_order();
    let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(pos("base") < pos("ui"));

    assert_eq!(runtime.catalog().state("ui"), ModuleState::Active);
    assert_eq!(runtime.catalog().state("extra"), ModuleState::Loaded);
    assert_eq!(runtime.phase(), RuntimePhase::Ready);

    // 首次见到的模块写入存储
    assert_eq!(stored_flag(&store, "base"), Some(true));
    assert_eq!(stored_flag(&store, "extra"), Some(false));

    runtime.destroy().await;
}

#[tokio::test]
async fn test_startup_uses_existing_document() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(HashMap::from([(
            STORAGE_KEY.to_string(),
            json!({ "version": 2, "plugins": { "a": { "enabled": false }, "b": { "enabled": true } } }),
        )]))
        .await
        .unwrap();

    let source = StaticModuleSource::new();
    source
        .add(ModuleDescriptor::new(manifest("a")), true)
        .add(ModuleDescriptor::new(manifest("b")), false);

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    let report = runtime.initialize().await.unwrap();

    // 存储优先于注册表的默认值
    assert_eq!(report.started, vec!["b".to_string()]);
    assert_eq!(stored_flag(&store, "a"), Some(false));
    runtime.destroy().await;
}

#[tokio::test]
async fn test_startup_failure_does_not_touch_storage() {
    let source = StaticModuleSource::new();
    source.add(
        ModuleDescriptor::new(manifest("broken")).on_start(|_| async { anyhow::bail!("boom") }),
        true,
    );

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    let report = runtime.initialize().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "broken");
    assert!(runtime.catalog().error("broken").is_some());
    assert_eq!(stored_flag(&store, "broken"), Some(true));
    runtime.destroy().await;
}

// ============================================================================
// 启停命令
// ============================================================================

#[tokio::test]
async fn test_enable_failure_rolls_back_storage() {
    let source = StaticModuleSource::new();
    source.add(
        ModuleDescriptor::new(manifest("flaky")).on_start(|_| async { anyhow::bail!("not today") }),
        false,
    );

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    let err = runtime.enable_plugin("flaky").await.unwrap_err();
    assert!(matches!(err, CoreError::LifecycleHookFailed { .. }));
    assert!(!runtime.settings().is_enabled("flaky"));
    assert_eq!(stored_flag(&store, "flaky"), Some(false));
    assert_ne!(runtime.catalog().state("flaky"), ModuleState::Active);
    assert!(runtime.catalog().error("flaky").is_some());

    assert!(matches!(
        runtime.enable_plugin("missing").await,
        Err(CoreError::ModuleNotFound(_))
    ));
    runtime.destroy().await;
}

#[tokio::test]
async fn test_disable_blocked_by_dependents_keeps_flag() {
    let source = StaticModuleSource::new();
    source
        .add(ModuleDescriptor::new(manifest("base")), true)
        .add(ModuleDescriptor::new(manifest("ui").depends_on("base")), true);

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    let err = runtime.disable_plugin("base").await.unwrap_err();
    assert!(matches!(err, CoreError::ModuleHasDependents { .. }));
    assert!(runtime.settings().is_enabled("base"));
    assert_eq!(stored_flag(&store, "base"), Some(true));
    assert_eq!(runtime.catalog().state("base"), ModuleState::Active);

    // 先停依赖者即可
    runtime.disable_plugin("ui").await.unwrap();
    runtime.disable_plugin("base").await.unwrap();
    assert_eq!(runtime.catalog().state("base"), ModuleState::Stopped);
    assert_eq!(stored_flag(&store, "base"), Some(false));
    runtime.destroy().await;
}

#[tokio::test]
async fn test_enable_and_disable_are_idempotent() {
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let source = StaticModuleSource::new();
    source.add(counted(manifest("theme"), starts.clone(), stops.clone()), false);

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    runtime.enable_plugin("theme").await.unwrap();
    runtime.enable_plugin("theme").await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    runtime.disable_plugin("theme").await.unwrap();
    runtime.disable_plugin("theme").await.unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    // 停止后可以再次启动
    runtime.enable_plugin("theme").await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    runtime.destroy().await;
}

#[tokio::test]
async fn test_concurrent_enables_share_one_start() {
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = starts.clone();
    let source = StaticModuleSource::new();
    source.add(
        ModuleDescriptor::new(manifest("slow")).on_start(move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        false,
    );

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    let (first, second) = tokio::join!(runtime.enable_plugin("slow"), runtime.enable_plugin("slow"));
    first.unwrap();
    second.unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.stats().commands_joined, 1);
    assert!(!runtime.is_in_flight("slow", chips_runtime::api::Operation::Enable));
    runtime.destroy().await;
}

#[tokio::test]
async fn test_reload_restarts_active_module() {
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let source = StaticModuleSource::new();
    source.add(counted(manifest("theme"), starts.clone(), stops.clone()), true);

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    runtime.reload_plugin("theme").await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.catalog().state("theme"), ModuleState::Active);
    runtime.destroy().await;
}

#[tokio::test]
async fn test_module_hooks_follow_lifecycle() {
    let source = StaticModuleSource::new();
    source.add(
        ModuleDescriptor::new(manifest("shout")).hook("text:render", |ctx, args| async move {
            let text = args.value.as_str().unwrap_or_default().to_uppercase();
            Ok(HookFlow::Next(json!(format!("{} ({})", text, ctx.module_id()))))
        }),
        true,
    );

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    let rendered = runtime.bus().apply_filters("text:render", json!("hi")).await;
    assert_eq!(rendered, json!("HI (shout)"));

    runtime.disable_plugin("shout").await.unwrap();
    let rendered = runtime.bus().apply_filters("text:render", json!("hi")).await;
    assert_eq!(rendered, json!("hi"));
    runtime.destroy().await;
}

// ============================================================================
// 存储变化与协调
// ============================================================================

#[tokio::test]
async fn test_external_write_is_reconciled() {
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let source = StaticModuleSource::new();
    source.add(counted(manifest("theme"), starts.clone(), stops.clone()), false);

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    let mut doc = runtime.settings().export().unwrap();
    doc["plugins"]["theme"]["enabled"] = json!(true);
    store
        .set(HashMap::from([(STORAGE_KEY.to_string(), doc.clone())]))
        .await
        .unwrap();

    assert!(eventually(|| runtime.catalog().state("theme") == ModuleState::Active).await);
    assert!(runtime.settings().is_enabled("theme"));
    assert_eq!(runtime.stats().reconciles, 1);

    // 合并窗口内的来回切换只留下最终状态
    let mut off = doc.clone();
    off["plugins"]["theme"]["enabled"] = json!(false);
    store
        .set(HashMap::from([(STORAGE_KEY.to_string(), off)]))
        .await
        .unwrap();
    store
        .set(HashMap::from([(STORAGE_KEY.to_string(), doc)]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(runtime.catalog().state("theme"), ModuleState::Active);
    assert_eq!(stops.load(Ordering::SeqCst), 0);
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    runtime.destroy().await;
}

#[tokio::test]
async fn test_own_writes_are_ignored_as_echoes() {
    let source = StaticModuleSource::new();
    source.add(ModuleDescriptor::new(manifest("theme")), false);

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    runtime.enable_plugin("theme").await.unwrap();
    runtime.disable_plugin("theme").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let stats = runtime.stats();
    assert_eq!(stats.echoes_ignored, 2);
    assert_eq!(stats.reconciles, 0);
    runtime.destroy().await;
}

#[tokio::test]
async fn test_rapid_local_writes_survive_queued_notices() {
    let source = StaticModuleSource::new();
    source.add(
        ModuleDescriptor::new(manifest("reader").setting("size", SettingDefinition::number(12.0))),
        true,
    );

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    // 异步订阅者让通知处理跨越挂起点，本地写入可以插进来
    runtime.bus().register(
        system_hooks::SETTINGS_CHANGED,
        handler(|_| async {
            tokio::task::yield_now().await;
            Ok(HookFlow::Pass)
        }),
        HookOptions::default(),
    );

    let settings = runtime.settings();
    settings.set("reader", "size", json!(14)).await.unwrap();
    settings.flush().await.unwrap();
    settings.set("reader", "size", json!(16)).await.unwrap();
    settings.flush().await.unwrap();
    tokio::task::yield_now().await;

    settings.set("reader", "size", json!(18)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    settings.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(settings.get("reader", "size"), Some(json!(18)));
    let stored = store.snapshot(STORAGE_KEY).unwrap();
    assert_eq!(stored["plugins"]["reader"]["settings"]["size"], json!(18));
    assert_eq!(runtime.stats().reconciles, 0);
    runtime.destroy().await;
}

#[tokio::test]
async fn test_two_contexts_converge_through_shared_storage() {
    fn source() -> Arc<StaticModuleSource> {
        let source = StaticModuleSource::new();
        source
            .add(ModuleDescriptor::new(manifest("base")), true)
            .add(ModuleDescriptor::new(manifest("theme")), false);
        Arc::new(source)
    }

    let store = Arc::new(MemoryStore::new());
    let background = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(source())
        .build();
    let page = PluginRuntime::builder()
        .config(config("page"))
        .storage(store.clone())
        .source(source())
        .build();
    background.initialize().await.unwrap();
    page.initialize().await.unwrap();
    assert_eq!(page.catalog().state("base"), ModuleState::Active);

    background.enable_plugin("theme").await.unwrap();
    assert!(eventually(|| page.catalog().state("theme") == ModuleState::Active).await);
    assert!(page.settings().is_enabled("theme"));
    assert_eq!(background.stats().reconciles, 0);

    page.disable_plugin("theme").await.unwrap();
    assert!(eventually(|| background.catalog().state("theme") == ModuleState::Stopped).await);
    assert!(!background.settings().is_enabled("theme"));
    assert_eq!(stored_flag(&store, "theme"), Some(false));

    // 协调路径不写存储：存储里的文档就是最后一次命令写入的文档
    assert_eq!(store.snapshot(STORAGE_KEY), Some(page.settings().export().unwrap()));

    background.destroy().await;
    page.destroy().await;
}

// ============================================================================
// 宿主环境
// ============================================================================

#[tokio::test]
async fn test_environment_events_are_batched() {
    let env = Arc::new(ManualEnvironment::stable());
    let runtime = PluginRuntime::builder()
        .config(config("page"))
        .environment(env.clone())
        .build();

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = sizes.clone();
    runtime.bus().register(
        system_hooks::ENVIRONMENT_CHANGED,
        handler(move |args| {
            let seen = seen.clone();
            async move {
                let n = args.value["events"].as_array().map_or(0, |a| a.len());
                seen.lock().unwrap().push(n);
                Ok(HookFlow::Pass)
            }
        }),
        HookOptions::default(),
    );
    runtime.initialize().await.unwrap();

    for i in 0..3 {
        assert_eq!(env.push(EnvironmentEvent::new("node:added", json!({ "n": i }))), 1);
    }
    assert!(eventually(|| !sizes.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(*sizes.lock().unwrap(), vec![3]);
    assert_eq!(runtime.stats().environment_batches, 1);
    runtime.destroy().await;
}

#[tokio::test]
async fn test_unstable_environment_does_not_block_startup() {
    let mut config = config("page");
    config.orchestrator.stable_timeout_ms = 30;

    let runtime = PluginRuntime::builder()
        .config(config)
        .environment(Arc::new(ManualEnvironment::new()))
        .build();
    runtime.initialize().await.unwrap();
    assert!(runtime.is_ready());
    runtime.destroy().await;
}

// ============================================================================
// IPC 客户端
// ============================================================================

#[tokio::test]
async fn test_runtime_client_commands() {
    let hub = LocalHub::new();
    let source = StaticModuleSource::new();
    source.add(
        ModuleDescriptor::new(
            manifest("dark-mode")
                .setting("brightness", SettingDefinition::number(80.0).range(0.0, 100.0)),
        ),
        false,
    );

    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .transport(hub.endpoint("background"))
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();

    let panel = MessageBroker::new(hub.endpoint("panel"), "panel", Duration::from_secs(2));
    let state_changes = Arc::new(AtomicUsize::new(0));
    let counter = state_changes.clone();
    panel.on(
        "pluginStateChanged",
        action_handler(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );
    let client = RuntimeClient::new(panel.clone()).with_target("background");

    assert_eq!(client.ping().await.unwrap(), "background");
    assert_eq!(client.all_plugin_info().await.unwrap().len(), 1);

    client.enable_plugin("dark-mode").await.unwrap();
    let info = client.plugin_info("dark-mode").await.unwrap();
    assert_eq!(info.state, ModuleState::Active);
    assert!(state_changes.load(Ordering::SeqCst) >= 1);

    client.set_setting("dark-mode", "brightness", json!(40)).await.unwrap();
    assert_eq!(client.settings("dark-mode").await.unwrap()["brightness"], json!(40));
    let err = client
        .set_setting("dark-mode", "brightness", json!(400))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Remote(_)));

    let reset = client.reset_settings("dark-mode").await.unwrap();
    assert_eq!(reset["brightness"], json!(80.0));

    let mut exported = client.export_settings().await.unwrap();
    exported["plugins"]["dark-mode"]["settings"]["brightness"] = json!(10);
    assert_eq!(client.import_settings(exported).await.unwrap(), 1);
    assert_eq!(runtime.settings().get("dark-mode", "brightness"), Some(json!(10)));

    client.disable_plugin("dark-mode").await.unwrap();
    assert_eq!(runtime.catalog().state("dark-mode"), ModuleState::Stopped);

    assert!(matches!(
        client.plugin_info("nope").await,
        Err(CoreError::Remote(_))
    ));

    runtime.destroy().await;
    // 运行时销毁后没有接收方
    assert!(client
        .with_timeout(Duration::from_millis(50))
        .ping()
        .await
        .is_err());
}

// ============================================================================
// 销毁
// ============================================================================

#[tokio::test]
async fn test_destroy_stops_in_reverse_load_order() {
    let stopped = Arc::new(Mutex::new(Vec::new()));
    let source = StaticModuleSource::new();
    for m in [manifest("base"), manifest("ui").depends_on("base")] {
        let stopped = stopped.clone();
        let id = m.id.clone();
        source.add(
            ModuleDescriptor::new(m).on_stop(move |_| {
                let stopped = stopped.clone();
                let id = id.clone();
                async move {
                    stopped.lock().unwrap().push(id);
                    Ok(())
                }
            }),
            true,
        );
    }

    let store = Arc::new(MemoryStore::new());
    let runtime = PluginRuntime::builder()
        .config(config("background"))
        .storage(store.clone())
        .source(Arc::new(source))
        .build();
    runtime.initialize().await.unwrap();
    runtime
        .settings()
        .set("ui", "layout", json!("compact"))
        .await
        .unwrap();

    runtime.destroy().await;
    assert_eq!(*stopped.lock().unwrap(), vec!["ui".to_string(), "base".to_string()]);
    assert_eq!(runtime.phase(), RuntimePhase::Destroyed);
    assert!(runtime.bus().hook_names().is_empty());

    // 销毁前写入待保存的设置
    let doc = store.snapshot(STORAGE_KEY).unwrap();
    assert_eq!(doc["plugins"]["ui"]["settings"]["layout"], json!("compact"));

    // 重复销毁为空操作
    runtime.destroy().await;
}
