//! 用药清单
//!
//! 每个就诊的可执行医嘱列表。"已执行" 只能从 false 变为 true，
//! 执行后描述字段只读，清单项不可删除。

use std::sync::Arc;

use attendance_core::utils::is_blank;
use attendance_core::{ChecklistItem, ChecklistItemDetails, FlowError, Result};
use attendance_notify::{ChangeEvent, ChangeKind, Collection, EventSink};
use attendance_store::EncounterStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// 清单执行进度（派生值，不存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistProgress {
    pub administered: usize,
    pub total: usize,
}

impl ChecklistProgress {
    pub fn from_items(items: &[ChecklistItem]) -> Self {
        Self {
            administered: items.iter().filter(|i| i.administered).count(),
            total: items.len(),
        }
    }

    /// 空清单返回 0.0
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.administered as f64 / self.total as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.administered == self.total
    }
}

/// 清单管理器
#[derive(Clone)]
pub struct ChecklistManager {
    store: Arc<dyn EncounterStore>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ChecklistManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecklistManager").finish_non_exhaustive()
    }
}

impl ChecklistManager {
    pub fn new(store: Arc<dyn EncounterStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    fn publish(&self, kind: ChangeKind, item: &ChecklistItem, correlation_id: Option<Uuid>) {
        let mut event = ChangeEvent::new(Collection::ChecklistItems, kind, item.id, item.encounter_id);
        event.correlation_id = correlation_id;
        self.sink.publish_change(event);
    }

    /// 新增清单项，仅在可用药状态下允许
    pub async fn add_item(
        &self,
        encounter_id: Uuid,
        details: ChecklistItemDetails,
        correlation_id: Option<Uuid>,
    ) -> Result<ChecklistItem> {
        if is_blank(Some(details.name.as_str())) {
            return Err(FlowError::Validation("Checklist item name is required".to_string()));
        }

        let encounter = self.store.get_encounter(encounter_id).await?;
        if !encounter.status.is_medication_eligible() {
            return Err(FlowError::PreconditionFailed(format!(
                "Encounter {} is {} and cannot receive checklist items",
                encounter_id, encounter.status
            )));
        }

        let item = ChecklistItem::new(encounter_id, details, self.store.now());
        let stored = self.store.insert_item(item).await?;

        info!("Added checklist item {} to encounter {}", stored.id, encounter_id);
        self.publish(ChangeKind::Created, &stored, correlation_id);
        Ok(stored)
    }

    /// 标记已执行
    pub async fn administer(&self, item_id: Uuid, by: &str, correlation_id: Option<Uuid>) -> Result<ChecklistItem> {
        if is_blank(Some(by)) {
            return Err(FlowError::Validation("administered_by is required".to_string()));
        }

        let current = self.store.get_item(item_id).await?;
        if current.administered {
            debug!("Checklist item {} already administered", item_id);
            return Err(FlowError::AlreadyAdministered(item_id));
        }

        let mut next = current.clone();
        next.administered = true;
        next.administered_at = Some(self.store.now());
        next.administered_by = Some(by.to_string());

        let stored = match self.store.update_item(next, current.version).await {
            Ok(stored) => stored,
            Err(FlowError::ConcurrentModification { .. }) => {
                // 并发执行时以先写入者为准
                let latest = self.store.get_item(item_id).await?;
                if latest.administered {
                    return Err(FlowError::AlreadyAdministered(item_id));
                }
                return Err(FlowError::ConcurrentModification {
                    id: item_id,
                    expected: current.version,
                    actual: latest.version,
                });
            }
            Err(e) => return Err(e),
        };

        info!("Checklist item {} administered by {}", item_id, by);
        self.publish(ChangeKind::Updated, &stored, correlation_id);
        Ok(stored)
    }

    /// 修改未执行清单项的描述
    pub async fn update_item(
        &self,
        item_id: Uuid,
        details: ChecklistItemDetails,
        correlation_id: Option<Uuid>,
    ) -> Result<ChecklistItem> {
        let current = self.store.get_item(item_id).await?;
        if current.administered {
            return Err(FlowError::PreconditionFailed(format!(
                "Checklist item {} is administered and read-only",
                item_id
            )));
        }

        let mut next = current.clone();
        next.apply_details(details);
        let stored = self.store.update_item(next, current.version).await?;

        self.publish(ChangeKind::Updated, &stored, correlation_id);
        Ok(stored)
    }

    /// 删除未执行的清单项
    pub async fn remove_item(&self, item_id: Uuid, correlation_id: Option<Uuid>) -> Result<()> {
        let current = self.store.get_item(item_id).await?;
        if current.administered {
            return Err(FlowError::PreconditionFailed(format!(
                "Checklist item {} is administered and cannot be removed",
                item_id
            )));
        }

        self.store.delete_item(item_id, current.version).await?;
        info!("Removed checklist item {}", item_id);
        self.publish(ChangeKind::Deleted, &current, correlation_id);
        Ok(())
    }

    pub async fn items(&self, encounter_id: Uuid) -> Result<Vec<ChecklistItem>> {
        self.store.list_items(encounter_id).await
    }

    pub async fn progress(&self, encounter_id: Uuid) -> Result<ChecklistProgress> {
        let items = self.store.list_items(encounter_id).await?;
        Ok(ChecklistProgress::from_items(&items))
    }
}
