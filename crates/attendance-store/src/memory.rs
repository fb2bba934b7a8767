//! 进程内存储实现

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use attendance_core::{ChecklistItem, Clock, Encounter, FlowError, Result, SystemClock};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::store::EncounterStore;
use crate::validation::{check_encounter_write, check_item_delete, check_item_write, stamp_encounter};

/// 内存存储
///
/// 每张表一把读写锁，条件更新在写锁内完成，等价于单行原子更新。
#[derive(Debug)]
pub struct MemoryStore {
    encounters: RwLock<HashMap<Uuid, Encounter>>,
    items: RwLock<HashMap<Uuid, ChecklistItem>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            encounters: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// 模拟存储中断
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FlowError::StoreUnavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncounterStore for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn insert_encounter(&self, mut encounter: Encounter) -> Result<Encounter> {
        self.ensure_available()?;
        if let Some(vitals) = &encounter.vitals {
            vitals.validate()?;
        }
        let now = self.clock.now();
        encounter.version = 1;
        encounter.created_at = now;
        encounter.updated_at = now;

        let mut encounters = self.encounters.write().await;
        if encounters.contains_key(&encounter.id) {
            return Err(FlowError::Validation(format!("Encounter {} already exists", encounter.id)));
        }
        encounters.insert(encounter.id, encounter.clone());
        debug!("Inserted encounter {}", encounter.id);
        Ok(encounter)
    }

    async fn get_encounter(&self, id: Uuid) -> Result<Encounter> {
        self.ensure_available()?;
        let encounters = self.encounters.read().await;
        encounters
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("Encounter {} not found", id)))
    }

    async fn list_encounters(&self) -> Result<Vec<Encounter>> {
        self.ensure_available()?;
        let encounters = self.encounters.read().await;
        Ok(encounters.values().cloned().collect())
    }

    async fn update_encounter(&self, next: Encounter, expected_version: u64) -> Result<Encounter> {
        self.ensure_available()?;
        let mut encounters = self.encounters.write().await;
        let current = encounters
            .get(&next.id)
            .ok_or_else(|| FlowError::NotFound(format!("Encounter {} not found", next.id)))?;

        check_encounter_write(current, &next, expected_version)?;
        let stored = stamp_encounter(current, next, self.clock.now());
        encounters.insert(stored.id, stored.clone());
        debug!("Updated encounter {} to version {}", stored.id, stored.version);
        Ok(stored)
    }

    async fn insert_item(&self, mut item: ChecklistItem) -> Result<ChecklistItem> {
        self.ensure_available()?;
        if item.administered {
            return Err(FlowError::Validation(format!(
                "Checklist item {} must be created as not administered",
                item.id
            )));
        }
        {
            let encounters = self.encounters.read().await;
            if !encounters.contains_key(&item.encounter_id) {
                return Err(FlowError::NotFound(format!("Encounter {} not found", item.encounter_id)));
            }
        }
        item.version = 1;
        item.created_at = self.clock.now();

        let mut items = self.items.write().await;
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_item(&self, id: Uuid) -> Result<ChecklistItem> {
        self.ensure_available()?;
        let items = self.items.read().await;
        items
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("Checklist item {} not found", id)))
    }

    async fn list_items(&self, encounter_id: Uuid) -> Result<Vec<ChecklistItem>> {
        self.ensure_available()?;
        let items = self.items.read().await;
        let mut list: Vec<ChecklistItem> = items
            .values()
            .filter(|item| item.encounter_id == encounter_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn update_item(&self, mut next: ChecklistItem, expected_version: u64) -> Result<ChecklistItem> {
        self.ensure_available()?;
        let mut items = self.items.write().await;
        let current = items
            .get(&next.id)
            .ok_or_else(|| FlowError::NotFound(format!("Checklist item {} not found", next.id)))?;

        check_item_write(current, &next, expected_version)?;
        next.version = current.version + 1;
        next.created_at = current.created_at;
        items.insert(next.id, next.clone());
        Ok(next)
    }

    async fn delete_item(&self, id: Uuid, expected_version: u64) -> Result<()> {
        self.ensure_available()?;
        let mut items = self.items.write().await;
        let current = items
            .get(&id)
            .ok_or_else(|| FlowError::NotFound(format!("Checklist item {} not found", id)))?;

        check_item_delete(current, expected_version)?;
        items.remove(&id);
        Ok(())
    }
}
