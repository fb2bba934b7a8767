//! 存储接口定义

use async_trait::async_trait;
use attendance_core::{ChecklistItem, Encounter, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 就诊存储接口
///
/// 写入方法都以 `expected_version` 做条件更新，版本不一致时返回
/// `FlowError::ConcurrentModification`，不做任何修改。
#[async_trait]
pub trait EncounterStore: Send + Sync {
    /// 存储端当前时间
    fn now(&self) -> DateTime<Utc>;

    async fn insert_encounter(&self, encounter: Encounter) -> Result<Encounter>;

    async fn get_encounter(&self, id: Uuid) -> Result<Encounter>;

    async fn list_encounters(&self) -> Result<Vec<Encounter>>;

    /// 替换整行；状态变化时由存储端刷新 `state_changed_at`
    async fn update_encounter(&self, next: Encounter, expected_version: u64) -> Result<Encounter>;

    async fn insert_item(&self, item: ChecklistItem) -> Result<ChecklistItem>;

    async fn get_item(&self, id: Uuid) -> Result<ChecklistItem>;

    async fn list_items(&self, encounter_id: Uuid) -> Result<Vec<ChecklistItem>>;

    async fn update_item(&self, next: ChecklistItem, expected_version: u64) -> Result<ChecklistItem>;

    async fn delete_item(&self, id: Uuid, expected_version: u64) -> Result<()>;
}
