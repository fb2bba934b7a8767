//! # 就诊流转管理模块
//!
//! 配置加载与校验、日志初始化。

pub mod config;
pub mod logging;

pub use config::{AttendanceConfig, ConfigManager, ConfigValidator, DisplayConfig, LoggingConfig, StoreBackend, StoreConfig};
pub use logging::init_logging;
