//! 错误定义模块

use thiserror::Error;
use uuid::Uuid;

use crate::models::EncounterStatus;

/// 就诊流转统一错误类型
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("无效状态转换: 从 {from} 执行 {command}")]
    InvalidTransition { from: String, command: String },

    #[error("前置条件不满足: {0}")]
    PreconditionFailed(String),

    #[error("清单项已执行: {0}")]
    AlreadyAdministered(Uuid),

    #[error("并发修改冲突: {id} 期望版本 {expected}, 实际版本 {actual}")]
    ConcurrentModification { id: Uuid, expected: u64, actual: u64 },

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// 构造无效状态转换错误
    pub fn invalid_transition(from: EncounterStatus, command: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.as_str().to_string(),
            command: command.into(),
        }
    }

    /// 存储暂时不可用，调用方可提示用户重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// 无需向用户展示的良性结果
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyAdministered(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

/// 就诊流转统一结果类型
pub type Result<T> = std::result::Result<T, FlowError>;
