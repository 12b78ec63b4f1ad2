//! 设置模块
//!
//! - `schema`: 设置项定义与校验
//! - `storage`: 持久化存储接口及内置实现
//! - `store`: 按模块命名空间的设置存储

pub mod schema;
pub mod storage;
pub mod store;

pub use schema::{SettingDefinition, SettingType, SettingValidator, SettingsSchema};
pub use storage::{
    FileStore, ListenerId, MemoryStore, PersistentStore, StorageChange, StorageChanges,
    StorageListener,
};
pub use store::{
    Adoption, ConfigStore, PluginSettings, SettingChange, SettingsDocument, WatchCallback, WatchId,
    CORE_NAMESPACE, ENABLED_KEY, SETTINGS_VERSION,
};
