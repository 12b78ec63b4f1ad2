//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。配置文件支持 YAML 与 JSON，
//! 扩展名为 `.json` 时按 JSON 解析，其余按 YAML 解析。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 设置存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// 设置文档在持久化存储中的键
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// 写入合并窗口（毫秒）
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_storage_key() -> String {
    "chips_settings".to_string()
}

fn default_persist_debounce_ms() -> u64 {
    100
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl SettingsConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// IPC 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// 当前上下文名称（如 background、content、popup）
    #[serde(default = "default_context")]
    pub context: String,

    /// 默认请求超时（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_context() -> String {
    "background".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            context: default_context(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl IpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// 单个生命周期钩子的超时（毫秒），0 表示不限制
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,
}

fn default_hook_timeout_ms() -> u64 {
    10_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hook_timeout_ms: default_hook_timeout_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn hook_timeout(&self) -> Option<Duration> {
        (self.hook_timeout_ms > 0).then(|| Duration::from_millis(self.hook_timeout_ms))
    }
}

/// 编排器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// 外部配置变化的合并窗口（毫秒）
    #[serde(default = "default_reconcile_debounce_ms")]
    pub reconcile_debounce_ms: u64,

    /// 宿主环境事件的批处理窗口（毫秒）
    #[serde(default = "default_observer_batch_ms")]
    pub observer_batch_ms: u64,

    /// 等待宿主环境稳定的超时（毫秒）
    #[serde(default = "default_stable_timeout_ms")]
    pub stable_timeout_ms: u64,
}

fn default_reconcile_debounce_ms() -> u64 {
    50
}

fn default_observer_batch_ms() -> u64 {
    100
}

fn default_stable_timeout_ms() -> u64 {
    3000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_debounce_ms: default_reconcile_debounce_ms(),
            observer_batch_ms: default_observer_batch_ms(),
            stable_timeout_ms: default_stable_timeout_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_ms)
    }

    pub fn observer_batch(&self) -> Duration {
        Duration::from_millis(self.observer_batch_ms)
    }

    pub fn stable_timeout(&self) -> Duration {
        Duration::from_millis(self.stable_timeout_ms)
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 设置存储配置
    #[serde(default)]
    pub settings: SettingsConfig,

    /// IPC 配置
    #[serde(default)]
    pub ipc: IpcConfig,

    /// 生命周期配置
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// 编排器配置
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置
    pub async fn from_file(path: impl Into<PathBuf>) -> crate::utils::Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await?;

        let mut config: RuntimeConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        Ok(config)
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: RuntimeConfig) {
        // 只覆盖非默认值的配置
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.settings.storage_key != default_storage_key() {
            self.settings.storage_key = other.settings.storage_key;
        }
        if other.settings.persist_debounce_ms != default_persist_debounce_ms() {
            self.settings.persist_debounce_ms = other.settings.persist_debounce_ms;
        }
        if other.ipc.context != default_context() {
            self.ipc.context = other.ipc.context;
        }
        if other.ipc.request_timeout_ms != default_request_timeout_ms() {
            self.ipc.request_timeout_ms = other.ipc.request_timeout_ms;
        }
        if other.lifecycle.hook_timeout_ms != default_hook_timeout_ms() {
            self.lifecycle.hook_timeout_ms = other.lifecycle.hook_timeout_ms;
        }
        if other.orchestrator.reconcile_debounce_ms != default_reconcile_debounce_ms() {
            self.orchestrator.reconcile_debounce_ms = other.orchestrator.reconcile_debounce_ms;
        }
        if other.orchestrator.observer_batch_ms != default_observer_batch_ms() {
            self.orchestrator.observer_batch_ms = other.orchestrator.observer_batch_ms;
        }
        if other.orchestrator.stable_timeout_ms != default_stable_timeout_ms() {
            self.orchestrator.stable_timeout_ms = other.orchestrator.stable_timeout_ms;
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 设置存储键
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.config.settings.storage_key = key.into();
        self
    }

    /// 设置写入合并窗口
    pub fn persist_debounce(mut self, debounce: Duration) -> Self {
        self.config.settings.persist_debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// 设置上下文名称
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.config.ipc.context = context.into();
        self
    }

    /// 设置默认请求超时
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.ipc.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置生命周期钩子超时
    pub fn hook_timeout(mut self, timeout: Duration) -> Self {
        self.config.lifecycle.hook_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置外部变化合并窗口
    pub fn reconcile_debounce(mut self, debounce: Duration) -> Self {
        self.config.orchestrator.reconcile_debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// 设置宿主事件批处理窗口
    pub fn observer_batch(mut self, window: Duration) -> Self {
        self.config.orchestrator.observer_batch_ms = window.as_millis() as u64;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
