//! # 设置存储集成测试
//!
//! 使用文件存储测试设置的持久化、重新加载、导入和变化通知。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chips_runtime::bus::{handler, system_hooks, HookFlow, HookOptions};
use chips_runtime::config::{ConfigStore, FileStore, PersistentStore, SettingsSchema};
use chips_runtime::core::SettingsConfig;
use chips_runtime::{EventBus, SettingDefinition};
use serde_json::json;
use tempfile::TempDir;

fn schema() -> SettingsSchema {
    let mut schema = SettingsSchema::new();
    schema.insert("brightness".to_string(), SettingDefinition::number(80.0).range(0.0, 100.0));
    schema.insert("mode".to_string(), SettingDefinition::select("auto", &["auto", "dark", "light"]));
    schema
}

fn settings_config(debounce_ms: u64) -> SettingsConfig {
    SettingsConfig {
        persist_debounce_ms: debounce_ms,
        ..SettingsConfig::default()
    }
}

async fn open(dir: &TempDir, debounce_ms: u64) -> Arc<ConfigStore> {
    let storage = Arc::new(FileStore::new(dir.path().join("settings.json")));
    let store = ConfigStore::new(storage, None, &settings_config(debounce_ms));
    store.initialize().await.unwrap();
    store.register_schema("dark-mode", schema());
    store
}

#[tokio::test]
async fn test_settings_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let store = open(&dir, 10).await;
    store.enable("dark-mode").await.unwrap();
    store.set("dark-mode", "brightness", json!(55)).await.unwrap();
    store.set("dark-mode", "mode", json!("dark")).await.unwrap();
    store.flush().await.unwrap();
    store.destroy();

    let reopened = open(&dir, 10).await;
    assert!(reopened.is_enabled("dark-mode"));
    assert_eq!(reopened.get("dark-mode", "brightness"), Some(json!(55)));
    assert_eq!(reopened.get("dark-mode", "mode"), Some(json!("dark")));
}

#[tokio::test]
async fn test_debounced_writes_are_coalesced() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    let storage = Arc::new(FileStore::new(&path));

    let writes = Arc::new(AtomicUsize::new(0));
    let counter = writes.clone();
    storage.on_changed(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let store = ConfigStore::new(storage.clone(), None, &settings_config(30));
    store.initialize().await.unwrap();
    store.register_schema("dark-mode", schema());
    for value in [10, 20, 30, 40] {
        store.set("dark-mode", "brightness", json!(value)).await.unwrap();
    }
    assert!(store.has_pending_write());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert!(!store.has_pending_write());

    let content: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
    assert_eq!(
        content["chips_settings"]["plugins"]["dark-mode"]["settings"]["brightness"],
        json!(40)
    );
}

#[tokio::test]
async fn test_corrupt_document_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(
        dir.path().join("settings.json"),
        r#"{ "chips_settings": { "plugins": "not a map" } }"#,
    )
    .await
    .unwrap();

    let store = open(&dir, 10).await;
    assert!(!store.is_enabled("dark-mode"));
    assert_eq!(store.get("dark-mode", "brightness"), Some(json!(80.0)));
}

#[tokio::test]
async fn test_import_skips_invalid_values() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, 10).await;

    let changes = store
        .import(json!({
            "version": 1,
            "core": { "language": "zh" },
            "plugins": {
                "dark-mode": {
                    "enabled": true,
                    "settings": { "brightness": 250, "mode": "light" }
                }
            }
        }))
        .await
        .unwrap();

    assert!(changes.iter().any(|c| c.key == "mode"));
    assert!(changes.iter().all(|c| c.key != "brightness"));
    assert!(store.is_enabled("dark-mode"));
    assert_eq!(store.get("dark-mode", "brightness"), Some(json!(80.0)));
    assert_eq!(store.get_core("language"), Some(json!("zh")));
}

#[tokio::test]
async fn test_changes_reach_watchers_and_bus() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FileStore::new(dir.path().join("settings.json")));
    let bus = Arc::new(EventBus::new());

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    bus.register(
        system_hooks::SETTINGS_CHANGED,
        handler(move |args| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(args.value);
                Ok(HookFlow::Pass)
            }
        }),
        HookOptions::default(),
    );

    let store = ConfigStore::new(storage, Some(bus), &settings_config(10));
    store.initialize().await.unwrap();
    store.register_schema("dark-mode", schema());

    let watched = Arc::new(Mutex::new(Vec::new()));
    let sink = watched.clone();
    store.watch("dark-mode", Some("mode"), move |new, old| {
        sink.lock().unwrap().push((new.clone(), old.clone()));
    });

    store.set("dark-mode", "mode", json!("dark")).await.unwrap();
    store.set("dark-mode", "brightness", json!(10)).await.unwrap();
    // 相同的值不产生变化
    store.set("dark-mode", "mode", json!("dark")).await.unwrap();

    assert_eq!(*watched.lock().unwrap(), vec![(json!("dark"), json!("auto"))]);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["moduleId"], json!("dark-mode"));
    assert_eq!(events[0]["oldValue"], json!("auto"));

    // 校验失败不写入
    assert!(store.set("dark-mode", "mode", json!("sepia")).await.is_err());
    assert_eq!(store.get("dark-mode", "mode"), Some(json!("dark")));
}
