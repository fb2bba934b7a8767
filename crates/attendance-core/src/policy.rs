//! 流程策略
//!
//! 由配置驱动的可调规则：呼叫上限、缺席自动取消、缺席名单排序等。

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// 缺席名单排序方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbsenteeOrder {
    /// 最近缺席的排在前面
    #[default]
    MostRecentFirst,
    /// 缺席最久的排在前面
    OldestFirst,
}

/// 流程策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlowPolicy {
    /// 单次激活内允许的最大呼叫次数，None 表示不限
    pub max_calls: Option<u32>,
    /// 缺席超过该秒数后自动取消，None 表示不自动取消
    pub absence_auto_cancel_after_secs: Option<u64>,
    pub absentee_order: AbsenteeOrder,
    /// 观察结束前要求清单全部执行
    pub require_checklist_complete: bool,
}

impl FlowPolicy {
    pub fn absence_auto_cancel_after(&self) -> Option<Duration> {
        self.absence_auto_cancel_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(Duration::seconds)
    }

    /// 是否还允许再呼叫一次
    pub fn allows_call(&self, call_count: u32) -> bool {
        match self.max_calls {
            Some(max) => call_count < max,
            None => true,
        }
    }
}

impl Default for FlowPolicy {
    fn default() -> Self {
        Self {
            max_calls: None,
            absence_auto_cancel_after_secs: None,
            absentee_order: AbsenteeOrder::MostRecentFirst,
            require_checklist_complete: true,
        }
    }
}
