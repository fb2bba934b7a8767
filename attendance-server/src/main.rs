//! 就诊流转命令行工具

mod scenario;

use anyhow::{Context, Result};
use attendance_admin::{init_logging, AttendanceConfig, ConfigManager, ConfigValidator, StoreBackend};
use clap::{Parser, Subcommand};
use tracing::{error, info};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "attendance-server")]
#[command(about = "Attendance flow engine: configuration checks and scenario replay")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 校验配置文件
    ValidateConfig {
        /// 同时连接存储后端并建表
        #[arg(long)]
        connect: bool,
    },
    /// 回放场景文件并输出每一步结果
    Replay {
        /// 场景 JSON 文件
        scenario: String,
    },
}

async fn load_config(path: Option<&str>) -> Result<AttendanceConfig> {
    match path {
        Some(path) => {
            let manager = ConfigManager::new(path)?;
            Ok(manager.get_config().await)
        }
        None => {
            let config = AttendanceConfig::default();
            ConfigValidator::new().validate(&config)?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref()).await?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;

    match args.command {
        Commands::ValidateConfig { connect } => validate(&config, connect).await,
        Commands::Replay { scenario } => replay(&config, &scenario).await,
    }
}

async fn validate(config: &AttendanceConfig, connect: bool) -> Result<()> {
    info!(
        "Configuration OK: {} stations, store backend {:?}",
        config.stations.len(),
        config.store.backend
    );

    if connect && config.store.backend == StoreBackend::Postgres {
        connect_store(config).await?;
    } else if connect {
        info!("Memory backend selected, nothing to connect");
    }

    println!("{}", serde_json::to_string_pretty(config).context("Failed to render configuration")?);
    Ok(())
}

#[cfg(feature = "postgres")]
async fn connect_store(config: &AttendanceConfig) -> Result<()> {
    let url = config
        .store
        .database_url
        .as_deref()
        .context("store.database_url is required for the postgres backend")?;
    let store = attendance_store::PgEncounterStore::connect(url, config.store.max_connections).await?;
    store.create_tables().await?;
    info!("Connected to postgres and ensured tables exist");
    Ok(())
}

#[cfg(not(feature = "postgres"))]
async fn connect_store(_config: &AttendanceConfig) -> Result<()> {
    tracing::warn!("Built without the postgres feature, skipping connection check");
    Ok(())
}

async fn replay(config: &AttendanceConfig, path: &str) -> Result<()> {
    let scenario = scenario::Scenario::load(path).await?;
    info!("Replaying {} steps from {}", scenario.steps.len(), path);

    let report = scenario::replay(config, &scenario).await?;
    println!("{}", serde_json::to_string_pretty(&report).context("Failed to render report")?);

    let failures = report.failures();
    if failures > 0 {
        error!("{} of {} steps did not match expectations", failures, report.steps.len());
        anyhow::bail!("scenario {} failed", path);
    }
    Ok(())
}
