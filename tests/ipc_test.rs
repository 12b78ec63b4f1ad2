//! # 跨上下文通信集成测试
//!
//! 多个上下文通过同一个 [`LocalHub`] 通信：
//! - 模块通过上下文向其他上下文的运行时发请求
//! - 定向事件与广播
//! - 超时与销毁

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chips_runtime::api::ipc::{action_handler, LocalHub, MessageBroker, RequestOptions};
use chips_runtime::{
    CoreError, ModuleDescriptor, ModuleManifest, PluginRuntime, RuntimeConfig, SettingDefinition,
    StaticModuleSource,
};
use serde_json::{json, Value};

fn broker(hub: &Arc<LocalHub>, name: &str) -> Arc<MessageBroker> {
    MessageBroker::new(hub.endpoint(name), name, Duration::from_millis(500))
}

#[tokio::test]
async fn test_module_requests_settings_from_other_context() {
    let hub = LocalHub::new();

    let background_source = StaticModuleSource::new();
    background_source.add(
        ModuleDescriptor::new(
            ModuleManifest::new("reader", "Reader", "1.0.0")
                .setting("font", SettingDefinition::string("serif")),
        ),
        true,
    );
    let background = PluginRuntime::builder()
        .config(RuntimeConfig::builder().context("background").build())
        .transport(hub.endpoint("background"))
        .source(Arc::new(background_source))
        .build();
    background.initialize().await.unwrap();

    // 页面上下文里的模块在启动时读取后台保存的设置
    let fetched = Arc::new(Mutex::new(Value::Null));
    let sink = fetched.clone();
    let page_source = StaticModuleSource::new();
    page_source.add(
        ModuleDescriptor::new(ModuleManifest::new("reader-page", "Reader Page", "1.0.0")).on_start(
            move |ctx| {
                let sink = sink.clone();
                async move {
                    let settings = ctx
                        .request(
                            "getSettings",
                            json!({ "id": "reader" }),
                            RequestOptions::default().target("background"),
                        )
                        .await?;
                    *sink.lock().unwrap() = settings;
                    Ok(())
                }
            },
        ),
        true,
    );
    let page = PluginRuntime::builder()
        .config(RuntimeConfig::builder().context("page").build())
        .transport(hub.endpoint("page"))
        .source(Arc::new(page_source))
        .build();
    let report = page.initialize().await.unwrap();

    assert_eq!(report.started, vec!["reader-page".to_string()]);
    assert_eq!(*fetched.lock().unwrap(), json!({ "font": "serif" }));

    page.destroy().await;
    background.destroy().await;
}

#[tokio::test]
async fn test_targeted_event_and_broadcast() {
    let hub = LocalHub::new();
    let sender = broker(&hub, "background");
    let panel = broker(&hub, "panel");
    let page = broker(&hub, "page");

    let panel_hits = Arc::new(AtomicUsize::new(0));
    let page_hits = Arc::new(AtomicUsize::new(0));
    for (b, hits) in [(&panel, panel_hits.clone()), (&page, page_hits.clone())] {
        b.on(
            "refresh",
            action_handler(move |_| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );
    }

    sender.send_event("refresh", json!({}), Some("panel")).await.unwrap();
    assert_eq!(panel_hits.load(Ordering::SeqCst), 1);
    assert_eq!(page_hits.load(Ordering::SeqCst), 0);

    assert_eq!(sender.broadcast("refresh", json!({})).await, 2);
    assert_eq!(panel_hits.load(Ordering::SeqCst), 2);
    assert_eq!(page_hits.load(Ordering::SeqCst), 1);

    // 没有对端的定向事件报告传输错误
    assert!(matches!(
        sender.send_event("refresh", json!({}), Some("options")).await,
        Err(CoreError::Transport(_))
    ));
}

#[tokio::test]
async fn test_request_times_out_and_is_cleaned_up() {
    let hub = LocalHub::new();
    let caller = broker(&hub, "panel");
    let callee = broker(&hub, "background");
    callee.on(
        "slow",
        action_handler(|_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!("late"))
        }),
    );

    let err = caller
        .request("slow", Value::Null, RequestOptions::timeout(Duration::from_millis(40)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RequestTimeout { .. }));
    assert_eq!(caller.stats().pending, 0);
    assert_eq!(caller.stats().timeouts, 1);
}

#[tokio::test]
async fn test_destroyed_runtime_stops_answering() {
    let hub = LocalHub::new();
    let runtime = PluginRuntime::builder()
        .config(RuntimeConfig::builder().context("background").build())
        .transport(hub.endpoint("background"))
        .build();
    runtime.initialize().await.unwrap();

    let panel = broker(&hub, "panel");
    let reply = panel
        .request("ping", Value::Null, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["context"], json!("background"));

    runtime.destroy().await;
    assert!(runtime.broker().unwrap().is_destroyed());
    assert!(panel
        .request("ping", Value::Null, RequestOptions::timeout(Duration::from_millis(40)))
        .await
        .is_err());
}
