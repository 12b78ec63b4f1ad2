//! 插件运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。
//!
//! 错误分为两类：
//! - **模块级错误**：某个模块自身的生命周期钩子失败、配置写入不合法等，
//!   会被记录到模块目录中，不会影响其他模块
//! - **基础设施错误**：重复注册、循环依赖、非法状态转换等，
//!   说明调用方存在编程或配置缺陷，直接返回给调用方

use thiserror::Error;

/// 运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 清单与目录错误 ====================

    /// 模块清单无效
    #[error("模块清单无效: '{module_id}' - {reason}")]
    ManifestInvalid {
        module_id: String,
        reason: String,
    },

    /// 模块重复注册
    #[error("模块已注册: '{0}'")]
    DuplicateModule(String),

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 模块未加载
    #[error("模块未加载: '{0}'")]
    ModuleNotLoaded(String),

    /// 模块加载失败
    #[error("模块加载失败: '{module_id}' - {reason}")]
    ModuleLoadFailed {
        module_id: String,
        reason: String,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0:?}")]
    CircularDependency(Vec<String>),

    // ==================== 生命周期错误 ====================

    /// 依赖未满足
    #[error("模块 '{module}' 的依赖未满足: {missing:?}")]
    DependencyUnmet {
        module: String,
        missing: Vec<String>,
    },

    /// 存在冲突模块
    #[error("模块 '{module}' 与以下活动模块冲突: {conflicting:?}")]
    ConflictDetected {
        module: String,
        conflicting: Vec<String>,
    },

    /// 模块有活动的依赖者，无法停止
    #[error("模块 '{module}' 被以下活动模块依赖，无法停止: {dependents:?}")]
    ModuleHasDependents {
        module: String,
        dependents: Vec<String>,
    },

    /// 非法状态转换
    #[error("模块 '{module}' 处于 {state} 状态，不允许执行 {operation}")]
    InvalidStateTransition {
        module: String,
        state: String,
        operation: String,
    },

    /// 模块生命周期钩子执行失败
    #[error("模块 '{module_id}' 的 {phase} 钩子执行失败: {reason}")]
    LifecycleHookFailed {
        module_id: String,
        phase: String,
        reason: String,
    },

    /// 单飞操作未达到期望状态
    #[error("模块 '{module_id}' 的 {operation} 操作失败")]
    OperationFailed {
        module_id: String,
        operation: String,
    },

    // ==================== 配置错误 ====================

    /// 配置值校验失败
    #[error("配置校验失败: '{module_id}.{key}' - {reason}")]
    ValidationFailed {
        module_id: String,
        key: String,
        reason: String,
    },

    /// 持久化存储错误
    #[error("存储错误: {0}")]
    Storage(String),

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    // ==================== IPC 错误 ====================

    /// 请求超时
    #[error("请求超时: action '{action}' (request_id {request_id}, {timeout_ms}ms)")]
    RequestTimeout {
        action: String,
        request_id: u64,
        timeout_ms: u64,
    },

    /// 消息代理已销毁
    #[error("消息代理已销毁")]
    BrokerDestroyed,

    /// 传输层错误
    #[error("传输错误: {0}")]
    Transport(String),

    /// 远端处理器返回错误
    #[error("远端处理失败: {0}")]
    Remote(String),

    // ==================== 运行时错误 ====================

    /// 运行时已销毁
    #[error("运行时已销毁")]
    RuntimeDestroyed,

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_MANIFEST_INVALID: &str = "MODULE-001";
    pub const MODULE_DUPLICATE: &str = "MODULE-002";
    pub const MODULE_NOT_FOUND: &str = "MODULE-003";
    pub const MODULE_LOAD_FAILED: &str = "MODULE-004";
    pub const MODULE_CIRCULAR_DEPENDENCY: &str = "MODULE-005";

    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_DEPENDENCY_UNMET: &str = "LIFECYCLE-001";
    pub const LIFECYCLE_CONFLICT: &str = "LIFECYCLE-002";
    pub const LIFECYCLE_INVALID_TRANSITION: &str = "LIFECYCLE-003";
    pub const LIFECYCLE_HOOK_FAILED: &str = "LIFECYCLE-004";
    pub const LIFECYCLE_HAS_DEPENDENTS: &str = "LIFECYCLE-005";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_VALIDATION_FAILED: &str = "CONFIG-001";
    pub const CONFIG_STORAGE: &str = "CONFIG-002";

    // IPC 错误 (IPC-xxx)
    pub const IPC_TIMEOUT: &str = "IPC-001";
    pub const IPC_DESTROYED: &str = "IPC-002";
    pub const IPC_TRANSPORT: &str = "IPC-003";
    pub const IPC_REMOTE: &str = "IPC-004";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ManifestInvalid { .. } => error_code::MODULE_MANIFEST_INVALID,
            CoreError::DuplicateModule(_) => error_code::MODULE_DUPLICATE,
            CoreError::ModuleNotFound(_) | CoreError::ModuleNotLoaded(_) => {
                error_code::MODULE_NOT_FOUND
            }
            CoreError::ModuleLoadFailed { .. } => error_code::MODULE_LOAD_FAILED,
            CoreError::CircularDependency(_) => error_code::MODULE_CIRCULAR_DEPENDENCY,
            CoreError::DependencyUnmet { .. } => error_code::LIFECYCLE_DEPENDENCY_UNMET,
            CoreError::ConflictDetected { .. } => error_code::LIFECYCLE_CONFLICT,
            CoreError::InvalidStateTransition { .. } => error_code::LIFECYCLE_INVALID_TRANSITION,
            CoreError::LifecycleHookFailed { .. } => error_code::LIFECYCLE_HOOK_FAILED,
            CoreError::ModuleHasDependents { .. } => error_code::LIFECYCLE_HAS_DEPENDENTS,
            CoreError::ValidationFailed { .. } => error_code::CONFIG_VALIDATION_FAILED,
            CoreError::Storage(_) => error_code::CONFIG_STORAGE,
            CoreError::RequestTimeout { .. } => error_code::IPC_TIMEOUT,
            CoreError::BrokerDestroyed => error_code::IPC_DESTROYED,
            CoreError::Transport(_) => error_code::IPC_TRANSPORT,
            CoreError::Remote(_) => error_code::IPC_REMOTE,
            _ => "UNKNOWN",
        }
    }

    /// 是否为模块级错误
    ///
    /// 模块级错误只影响单个模块，由运行时记录到目录中；
    /// 其余错误属于基础设施缺陷，应直接返回给调用方。
    pub fn is_module_scoped(&self) -> bool {
        matches!(
            self,
            CoreError::ManifestInvalid { .. }
                | CoreError::ModuleLoadFailed { .. }
                | CoreError::LifecycleHookFailed { .. }
                | CoreError::DependencyUnmet { .. }
                | CoreError::ConflictDetected { .. }
                | CoreError::ValidationFailed { .. }
        )
    }
}
