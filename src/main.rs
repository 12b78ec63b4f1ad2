//! Chips Runtime 命令行入口
//!
//! 插件运行时的命令行工具，用于检查配置、校验模块清单和试运行。
//!
//! # 命令概览
//!
//! - `run` - 用一个清单目录启动运行时（模块只有清单，没有代码）
//! - `version` - 显示版本信息
//! - `check-config` - 验证配置文件
//! - `validate-manifest` - 校验模块清单
//! - `load-order` - 计算一组清单的加载顺序
//!
//! # 使用示例
//!
//! ```bash
//! # 检查配置文件
//! chips-runtime check-config -c runtime.yaml
//!
//! # 校验清单
//! chips-runtime validate-manifest plugins/theme/manifest.yaml
//!
//! # 计算加载顺序
//! chips-runtime load-order plugins/*/manifest.yaml
//!
//! # 试运行，设置保存到 settings.json
//! chips-runtime run --modules plugins --settings settings.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use chips_runtime::module::{DependencyGraph, EdgeKind};
use chips_runtime::{
    FileStore, Logger, LoggerConfig, ModuleDescriptor, ModuleManifest, PluginRuntime,
    RuntimeConfig, StaticModuleSource,
};

/// Chips Runtime - 薯片插件运行时
#[derive(Parser)]
#[command(name = "chips-runtime")]
#[command(version, about = "薯片插件运行时", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "runtime.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 开发模式
    #[arg(long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动运行时
    ///
    /// 从清单目录发现模块（每个子目录一个 manifest.yaml 或 manifest.json），
    /// 按 Ctrl+C 销毁运行时并退出。
    Run {
        /// 清单目录
        #[arg(short, long, default_value = "plugins")]
        modules: PathBuf,

        /// 设置文件
        #[arg(short, long, default_value = "settings.json")]
        settings: PathBuf,
    },

    /// 查看版本信息
    Version,

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 校验模块清单
    ValidateManifest {
        /// 清单文件
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// 计算加载顺序
    LoadOrder {
        /// 清单文件
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { modules, settings } => {
            let mut config = load_config(&cli.config).await?;
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }
            config.dev_mode |= cli.dev;
            let _guard = Logger::try_init(LoggerConfig::from_log_config(&config.logging));
            run(config, &modules, settings).await?;
        }
        Commands::Version => print_version(),
        Commands::CheckConfig { config } => {
            check_config(&config.unwrap_or(cli.config)).await?;
        }
        Commands::ValidateManifest { paths } => validate_manifests(&paths).await?,
        Commands::LoadOrder { paths } => load_order(&paths).await?,
    }

    Ok(())
}

/// 加载配置文件，不存在时使用默认配置
async fn load_config(path: &Path) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(RuntimeConfig::from_file(path).await?)
    } else {
        Ok(RuntimeConfig::default())
    }
}

async fn run(
    config: RuntimeConfig,
    modules: &Path,
    settings: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = StaticModuleSource::new();
    for manifest in discover_manifests(modules).await? {
        source.add(ModuleDescriptor::new(manifest), true);
    }

    let runtime = PluginRuntime::builder()
        .config(config)
        .storage(Arc::new(FileStore::new(settings)))
        .source(Arc::new(source))
        .build();

    let report = runtime.initialize().await?;
    println!("已启动 {} 个模块: {:?}", report.started.len(), report.started);
    for failed in &report.failed {
        println!("  失败 {}: {}", failed.id, failed.reason);
    }
    for skipped in &report.skipped {
        println!("  跳过 {}: {}", skipped.id, skipped.reason);
    }
    println!("按 Ctrl+C 退出");

    signal::ctrl_c().await?;
    info!("收到关闭信号");
    runtime.destroy().await;
    Ok(())
}

/// 每个子目录中的 manifest.yaml / manifest.json
async fn discover_manifests(dir: &Path) -> Result<Vec<ModuleManifest>, Box<dyn std::error::Error>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut manifests = Vec::new();
    for dir in dirs {
        let Some(path) = ["manifest.yaml", "manifest.yml", "manifest.json"]
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
        else {
            continue;
        };
        match ModuleManifest::from_file(&path).await {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!(path = %path.display(), error = %e, "清单无效，跳过"),
        }
    }
    Ok(manifests)
}

fn print_version() {
    println!();
    println!("Chips Runtime - 薯片插件运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_runtime::VERSION);
    println!("  设置文档版本:     {}", chips_runtime::config::SETTINGS_VERSION);
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    if !path.exists() {
        println!("⚠️  配置文件不存在，将使用默认配置");
        print_config(&RuntimeConfig::default());
        return Ok(());
    }

    match RuntimeConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &RuntimeConfig) {
    println!("────────────────────────────────────────");
    println!("  [日志]");
    println!("    级别:           {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!("  [设置]");
    println!("    存储键:         {}", config.settings.storage_key);
    println!("    写入防抖:       {} ms", config.settings.persist_debounce_ms);
    println!("  [IPC]");
    println!("    上下文:         {}", config.ipc.context);
    println!("    请求超时:       {} ms", config.ipc.request_timeout_ms);
    println!("  [编排]");
    println!("    协调合并窗口:   {} ms", config.orchestrator.reconcile_debounce_ms);
    println!("    环境事件窗口:   {} ms", config.orchestrator.observer_batch_ms);
    println!("    稳定等待上限:   {} ms", config.orchestrator.stable_timeout_ms);
    println!("  开发模式:         {}", if config.dev_mode { "是" } else { "否" });
    println!("────────────────────────────────────────");
}

async fn validate_manifests(paths: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    let mut invalid = 0;
    for path in paths {
        match ModuleManifest::from_file(path).await {
            Ok(manifest) => println!("✅ {} ({} {})", path.display(), manifest.id, manifest.version),
            Err(e) => {
                invalid += 1;
                println!("❌ {}: {}", path.display(), e);
            }
        }
    }
    if invalid > 0 {
        return Err(format!("{} 个清单无效", invalid).into());
    }
    Ok(())
}

async fn load_order(paths: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    let mut graph = DependencyGraph::new();
    let mut ids = Vec::new();
    for path in paths {
        let manifest = ModuleManifest::from_file(path).await?;
        graph.add_module(&manifest.id);
        for dep in &manifest.dependencies {
            graph.add_dependency(&manifest.id, dep, EdgeKind::Required);
        }
        for dep in &manifest.optional_dependencies {
            graph.add_dependency(&manifest.id, dep, EdgeKind::Optional);
        }
        ids.push(manifest.id);
    }

    for (i, id) in graph.resolve_order(&ids)?.iter().enumerate() {
        println!("{:>3}. {}", i + 1, id);
    }
    Ok(())
}
