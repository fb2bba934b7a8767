//! 通知事件定义

use attendance_core::{FlowError, StationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 实体集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Encounters,
    ChecklistItems,
    Vitals,
    Notes,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Self::Encounters,
        Self::ChecklistItems,
        Self::Vitals,
        Self::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encounters => "encounters",
            Self::ChecklistItems => "checklist_items",
            Self::Vitals => "vitals",
            Self::Notes => "notes",
        }
    }
}

impl TryFrom<&str> for Collection {
    type Error = FlowError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "encounters" => Ok(Self::Encounters),
            "checklist_items" => Ok(Self::ChecklistItems),
            "vitals" => Ok(Self::Vitals),
            "notes" => Ok(Self::Notes),
            _ => Err(FlowError::Validation(format!("Unknown collection: {}", value))),
        }
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// 集合变更事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub collection: Collection,
    pub kind: ChangeKind,
    pub entity_id: Uuid,
    /// 所属就诊，就诊集合中与 entity_id 相同
    pub encounter_id: Uuid,
    /// 触发该变更的命令
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(collection: Collection, kind: ChangeKind, entity_id: Uuid, encounter_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection,
            kind,
            entity_id,
            encounter_id,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn encounter(kind: ChangeKind, encounter_id: Uuid) -> Self {
        Self::new(Collection::Encounters, kind, encounter_id, encounter_id)
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// 订阅者收到的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Change(ChangeEvent),
    /// 订阅者落后并丢失了事件，需要全量刷新
    Resync,
}

/// 叫号事件，由外部负责显示、提示音和语音播报
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEvent {
    pub id: Uuid,
    pub encounter_id: Uuid,
    pub patient_display_name: String,
    pub destination_label: String,
    pub station_id: StationId,
    pub call_count: u32,
    /// 是否为缺席后召回
    pub recall: bool,
    pub at: DateTime<Utc>,
}
