//! 配置管理
//!
//! 从配置文件和 `ATTENDANCE_` 环境变量加载配置，校验后保存在读写锁中，支持写回文件。

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use attendance_core::{FlowPolicy, StationDescriptor, StationId, StationRole};
use attendance_notify::NotifierConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: Arc<RwLock<AttendanceConfig>>,
    /// 配置文件路径
    config_path: String,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 完整配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AttendanceConfig {
    /// 流程策略
    pub flow: FlowPolicy,
    /// 通知器配置
    pub notifier: NotifierConfig,
    /// 叫号屏配置
    pub display: DisplayConfig,
    /// 存储配置
    pub store: StoreConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 工作站列表
    pub stations: Vec<StationDescriptor>,
}

impl AttendanceConfig {
    pub fn station(&self, id: &str) -> Option<&StationDescriptor> {
        self.stations.iter().find(|s| s.id.as_str() == id)
    }

    pub fn stations_with_role(&self, role: StationRole) -> impl Iterator<Item = &StationDescriptor> {
        self.stations.iter().filter(move |s| s.role == role)
    }
}

/// 叫号屏配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    /// 叫号横幅显示时长（秒）
    pub page_banner_ttl_secs: u64,
}

impl DisplayConfig {
    pub fn banner_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.page_banner_ttl_secs.min(MAX_BANNER_TTL_SECS) as i64)
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            page_banner_ttl_secs: 30,
        }
    }
}

pub const MAX_BANNER_TTL_SECS: u64 = 3600;

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// 存储后端
    pub backend: StoreBackend,
    /// 连接字符串
    pub database_url: Option<String>,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或 EnvFilter 指令
    pub level: String,
    /// 日志格式：full、compact、pretty
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

pub const LOG_FORMATS: &[&str] = &["full", "compact", "pretty"];

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: String,
    /// 验证函数
    validator: fn(&AttendanceConfig) -> Result<()>,
    /// 错误消息
    error_message: String,
}

impl ConfigManager {
    /// 从文件加载并校验配置
    pub fn new(config_path: &str) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        Self::with_config(config_path, config)
    }

    /// 使用已有配置，保存时写到 `config_path`
    pub fn with_config(config_path: &str, config: AttendanceConfig) -> Result<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.to_string(),
            validator,
        })
    }

    /// 从文件加载配置，环境变量覆盖文件中的值
    fn load_config(config_path: &str) -> Result<AttendanceConfig> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Self::environment())
            .build()
            .with_context(|| format!("Failed to read configuration from {}", config_path))?;

        let config: AttendanceConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        info!("Configuration loaded successfully from: {}", config_path);
        Ok(config)
    }

    /// 解析 TOML 文本，不读取环境变量
    pub fn parse_str(content: &str) -> Result<AttendanceConfig> {
        let settings = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;

        settings
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// 例如 `ATTENDANCE_FLOW__MAX_CALLS=3`
    fn environment() -> Environment {
        Environment::with_prefix("ATTENDANCE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// 获取配置
    pub async fn get_config(&self) -> AttendanceConfig {
        let config = self.config.read().await;
        config.clone()
    }

    pub fn config_path(&self) -> &str {
        &self.config_path
    }

    /// 更新配置
    pub async fn update_config(&self, new_config: AttendanceConfig) -> Result<()> {
        self.validator.validate(&new_config)?;

        {
            let mut config = self.config.write().await;
            *config = new_config;
        }

        self.save_config().await?;

        info!("Configuration updated successfully");
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_config(&self) -> Result<()> {
        let config = self.config.read().await;
        let config_str = toml::to_string_pretty(&*config).context("Failed to serialize configuration")?;

        tokio::fs::write(&self.config_path, config_str)
            .await
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {}", self.config_path);
        Ok(())
    }

    /// 重新加载配置
    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(&self.config_path)?;
        self.validator.validate(&new_config)?;

        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded from: {}", self.config_path);
        Ok(())
    }

    /// 验证配置
    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "flow.max_calls".to_string(),
                validator: |config| {
                    if config.flow.max_calls == Some(0) {
                        Err(anyhow::anyhow!("Call limit cannot be 0, omit it for no limit"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid call limit".to_string(),
            },
            ValidationRule {
                field_path: "flow.absence_auto_cancel_after_secs".to_string(),
                validator: |config| {
                    if config.flow.absence_auto_cancel_after_secs == Some(0) {
                        Err(anyhow::anyhow!("Auto-cancel delay cannot be 0, omit it to disable"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid absence auto-cancel delay".to_string(),
            },
            ValidationRule {
                field_path: "notifier.channel_capacity".to_string(),
                validator: |config| {
                    if config.notifier.channel_capacity == 0 {
                        Err(anyhow::anyhow!("Notifier channel capacity cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid notifier channel capacity".to_string(),
            },
            ValidationRule {
                field_path: "display.page_banner_ttl_secs".to_string(),
                validator: |config| {
                    let ttl = config.display.page_banner_ttl_secs;
                    if ttl == 0 || ttl > MAX_BANNER_TTL_SECS {
                        Err(anyhow::anyhow!("Page banner TTL must be between 1 and {} seconds", MAX_BANNER_TTL_SECS))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid page banner TTL".to_string(),
            },
            ValidationRule {
                field_path: "store".to_string(),
                validator: |config| {
                    if config.store.max_connections == 0 {
                        return Err(anyhow::anyhow!("Store max connections cannot be 0"));
                    }
                    let missing_url = config
                        .store
                        .database_url
                        .as_deref()
                        .map(|url| url.trim().is_empty())
                        .unwrap_or(true);
                    if config.store.backend == StoreBackend::Postgres && missing_url {
                        return Err(anyhow::anyhow!("Postgres backend requires store.database_url"));
                    }
                    Ok(())
                },
                error_message: "Invalid store configuration".to_string(),
            },
            ValidationRule {
                field_path: "stations".to_string(),
                validator: |config| {
                    let mut seen: HashSet<&StationId> = HashSet::new();
                    for station in &config.stations {
                        if station.id.as_str().trim().is_empty() {
                            return Err(anyhow::anyhow!("Station id cannot be empty"));
                        }
                        if station.label.trim().is_empty() {
                            return Err(anyhow::anyhow!("Station {} has no label", station.id));
                        }
                        if !seen.insert(&station.id) {
                            return Err(anyhow::anyhow!("Duplicate station id: {}", station.id));
                        }
                    }
                    Ok(())
                },
                error_message: "Invalid station list".to_string(),
            },
            ValidationRule {
                field_path: "logging".to_string(),
                validator: |config| {
                    tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                        .map_err(|e| anyhow::anyhow!("Bad log level '{}': {}", config.logging.level, e))?;
                    if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
                        return Err(anyhow::anyhow!("Unknown log format: {}", config.logging.format));
                    }
                    Ok(())
                },
                error_message: "Invalid logging configuration".to_string(),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &AttendanceConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("{}: {}", rule.error_message, e));
            }
        }

        info!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
