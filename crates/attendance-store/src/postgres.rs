//! PostgreSQL 存储实现
//!
//! 条件更新在事务中以 `SELECT ... FOR UPDATE` 锁定单行后完成。

use async_trait::async_trait;
use attendance_core::{
    Acuity, ChecklistItem, Encounter, EncounterStatus, FlowError, Result, StationId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::store::EncounterStore;
use crate::validation::{check_encounter_write, check_item_delete, check_item_write, stamp_encounter};

const ENCOUNTER_COLUMNS: &str = "id, patient_ref, patient, status, acuity, arrival_time, \
    state_changed_at, absence_anchor, call_count, examiner_locked, active_station, called_from, \
    bed_request_priority, bed_request_time, bed_justification, narrative, vitals, version, \
    created_at, updated_at";

const ITEM_COLUMNS: &str = "id, encounter_id, name, dose, route, instructions, components, \
    administered, administered_at, administered_by, version, created_at";

/// PostgreSQL 就诊存储
#[derive(Debug, Clone)]
pub struct PgEncounterStore {
    pool: PgPool,
}

impl PgEncounterStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::info!("Connected to encounter database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS encounters (
                id UUID PRIMARY KEY,
                patient_ref UUID NOT NULL,
                patient TEXT NOT NULL,
                status VARCHAR(32) NOT NULL,
                acuity VARCHAR(16),
                arrival_time TIMESTAMP WITH TIME ZONE NOT NULL,
                state_changed_at TIMESTAMP WITH TIME ZONE NOT NULL,
                absence_anchor TIMESTAMP WITH TIME ZONE,
                call_count INTEGER NOT NULL DEFAULT 0,
                examiner_locked BOOLEAN NOT NULL DEFAULT FALSE,
                active_station VARCHAR(64),
                called_from VARCHAR(32),
                bed_request_priority VARCHAR(16),
                bed_request_time TIMESTAMP WITH TIME ZONE,
                bed_justification TEXT,
                narrative TEXT NOT NULL,
                vitals TEXT,
                version BIGINT NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checklist_items (
                id UUID PRIMARY KEY,
                encounter_id UUID NOT NULL REFERENCES encounters(id),
                name TEXT NOT NULL,
                dose TEXT,
                route TEXT,
                instructions TEXT,
                components TEXT NOT NULL,
                administered BOOLEAN NOT NULL DEFAULT FALSE,
                administered_at TIMESTAMP WITH TIME ZONE,
                administered_by VARCHAR(128),
                version BIGINT NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_encounters_status ON encounters(status)",
            "CREATE INDEX IF NOT EXISTS idx_checklist_items_encounter_id ON checklist_items(encounter_id)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        tracing::info!("Encounter tables created successfully");
        Ok(())
    }
}

fn version_to_db(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| FlowError::Validation(format!("Version {} out of range", version)))
}

fn version_from_db(version: i64) -> Result<u64> {
    u64::try_from(version).map_err(|_| FlowError::Validation(format!("Stored version {} is negative", version)))
}

fn optional_acuity(value: Option<String>) -> Result<Option<Acuity>> {
    value.as_deref().map(Acuity::try_from).transpose()
}

fn optional_status(value: Option<String>) -> Result<Option<EncounterStatus>> {
    value.as_deref().map(EncounterStatus::try_from).transpose()
}

fn encounter_from_row(row: &PgRow) -> Result<Encounter> {
    let patient: String = row.try_get("patient")?;
    let status: String = row.try_get("status")?;
    let narrative: String = row.try_get("narrative")?;
    let vitals: Option<String> = row.try_get("vitals")?;
    let call_count: i32 = row.try_get("call_count")?;
    let active_station: Option<String> = row.try_get("active_station")?;

    Ok(Encounter {
        id: row.try_get("id")?,
        patient_ref: row.try_get("patient_ref")?,
        patient: serde_json::from_str(&patient)?,
        status: EncounterStatus::try_from(status.as_str())?,
        acuity: optional_acuity(row.try_get("acuity")?)?,
        arrival_time: row.try_get("arrival_time")?,
        state_changed_at: row.try_get("state_changed_at")?,
        absence_anchor: row.try_get("absence_anchor")?,
        call_count: u32::try_from(call_count).unwrap_or(0),
        examiner_locked: row.try_get("examiner_locked")?,
        active_station: active_station.map(StationId),
        called_from: optional_status(row.try_get("called_from")?)?,
        bed_request_priority: optional_acuity(row.try_get("bed_request_priority")?)?,
        bed_request_time: row.try_get("bed_request_time")?,
        bed_justification: row.try_get("bed_justification")?,
        narrative: serde_json::from_str(&narrative)?,
        vitals: vitals.map(|v| serde_json::from_str(&v)).transpose()?,
        version: version_from_db(row.try_get("version")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// 按 ENCOUNTER_COLUMNS 的顺序绑定参数
fn bind_encounter<'q>(
    query: Query<'q, Postgres, PgArguments>,
    e: &Encounter,
) -> Result<Query<'q, Postgres, PgArguments>> {
    Ok(query
        .bind(e.id)
        .bind(e.patient_ref)
        .bind(serde_json::to_string(&e.patient)?)
        .bind(e.status.as_str().to_string())
        .bind(e.acuity.map(|a| a.as_str().to_string()))
        .bind(e.arrival_time)
        .bind(e.state_changed_at)
        .bind(e.absence_anchor)
        .bind(i32::try_from(e.call_count).unwrap_or(i32::MAX))
        .bind(e.examiner_locked)
        .bind(e.active_station.as_ref().map(|s| s.0.clone()))
        .bind(e.called_from.map(|s| s.as_str().to_string()))
        .bind(e.bed_request_priority.map(|a| a.as_str().to_string()))
        .bind(e.bed_request_time)
        .bind(e.bed_justification.clone())
        .bind(serde_json::to_string(&e.narrative)?)
        .bind(e.vitals.as_ref().map(serde_json::to_string).transpose()?)
        .bind(version_to_db(e.version)?)
        .bind(e.created_at)
        .bind(e.updated_at))
}

fn item_from_row(row: &PgRow) -> Result<ChecklistItem> {
    let components: String = row.try_get("components")?;
    Ok(ChecklistItem {
        id: row.try_get("id")?,
        encounter_id: row.try_get("encounter_id")?,
        name: row.try_get("name")?,
        dose: row.try_get("dose")?,
        route: row.try_get("route")?,
        instructions: row.try_get("instructions")?,
        components: serde_json::from_str(&components)?,
        administered: row.try_get("administered")?,
        administered_at: row.try_get("administered_at")?,
        administered_by: row.try_get("administered_by")?,
        version: version_from_db(row.try_get("version")?)?,
        created_at: row.try_get("created_at")?,
    })
}

/// 按 ITEM_COLUMNS 的顺序绑定参数
fn bind_item<'q>(
    query: Query<'q, Postgres, PgArguments>,
    item: &ChecklistItem,
) -> Result<Query<'q, Postgres, PgArguments>> {
    Ok(query
        .bind(item.id)
        .bind(item.encounter_id)
        .bind(item.name.clone())
        .bind(item.dose.clone())
        .bind(item.route.clone())
        .bind(item.instructions.clone())
        .bind(serde_json::to_string(&item.components)?)
        .bind(item.administered)
        .bind(item.administered_at)
        .bind(item.administered_by.clone())
        .bind(version_to_db(item.version)?)
        .bind(item.created_at))
}

#[async_trait]
impl EncounterStore for PgEncounterStore {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn insert_encounter(&self, mut encounter: Encounter) -> Result<Encounter> {
        if let Some(vitals) = &encounter.vitals {
            vitals.validate()?;
        }
        let now = self.now();
        encounter.version = 1;
        encounter.created_at = now;
        encounter.updated_at = now;

        let sql = format!(
            "INSERT INTO encounters ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
             $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
            ENCOUNTER_COLUMNS
        );
        bind_encounter(sqlx::query(&sql), &encounter)?
            .execute(&self.pool)
            .await?;
        Ok(encounter)
    }

    async fn get_encounter(&self, id: Uuid) -> Result<Encounter> {
        let sql = format!("SELECT {} FROM encounters WHERE id = $1", ENCOUNTER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Encounter {} not found", id)))?;
        encounter_from_row(&row)
    }

    async fn list_encounters(&self) -> Result<Vec<Encounter>> {
        let sql = format!("SELECT {} FROM encounters", ENCOUNTER_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(encounter_from_row).collect()
    }

    async fn update_encounter(&self, next: Encounter, expected_version: u64) -> Result<Encounter> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {} FROM encounters WHERE id = $1 FOR UPDATE", ENCOUNTER_COLUMNS);
        let row = sqlx::query(&select)
            .bind(next.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Encounter {} not found", next.id)))?;
        let current = encounter_from_row(&row)?;

        check_encounter_write(&current, &next, expected_version)?;
        let stored = stamp_encounter(&current, next, self.now());

        let update = "UPDATE encounters SET patient_ref = $2, patient = $3, status = $4, acuity = $5, \
             arrival_time = $6, state_changed_at = $7, absence_anchor = $8, call_count = $9, \
             examiner_locked = $10, active_station = $11, called_from = $12, \
             bed_request_priority = $13, bed_request_time = $14, bed_justification = $15, \
             narrative = $16, vitals = $17, version = $18, created_at = $19, updated_at = $20 \
             WHERE id = $1";
        bind_encounter(sqlx::query(update), &stored)?
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(stored)
    }

    async fn insert_item(&self, mut item: ChecklistItem) -> Result<ChecklistItem> {
        if item.administered {
            return Err(FlowError::Validation(format!(
                "Checklist item {} must be created as not administered",
                item.id
            )));
        }
        item.version = 1;
        item.created_at = self.now();

        let sql = format!(
            "INSERT INTO checklist_items ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            ITEM_COLUMNS
        );
        bind_item(sqlx::query(&sql), &item)?.execute(&self.pool).await?;
        Ok(item)
    }

    async fn get_item(&self, id: Uuid) -> Result<ChecklistItem> {
        let sql = format!("SELECT {} FROM checklist_items WHERE id = $1", ITEM_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Checklist item {} not found", id)))?;
        item_from_row(&row)
    }

    async fn list_items(&self, encounter_id: Uuid) -> Result<Vec<ChecklistItem>> {
        let sql = format!(
            "SELECT {} FROM checklist_items WHERE encounter_id = $1 ORDER BY created_at, id",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(encounter_id).fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn update_item(&self, mut next: ChecklistItem, expected_version: u64) -> Result<ChecklistItem> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {} FROM checklist_items WHERE id = $1 FOR UPDATE", ITEM_COLUMNS);
        let row = sqlx::query(&select)
            .bind(next.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Checklist item {} not found", next.id)))?;
        let current = item_from_row(&row)?;

        check_item_write(&current, &next, expected_version)?;
        next.version = current.version + 1;
        next.created_at = current.created_at;

        let update = "UPDATE checklist_items SET encounter_id = $2, name = $3, dose = $4, route = $5, \
             instructions = $6, components = $7, administered = $8, administered_at = $9, \
             administered_by = $10, version = $11, created_at = $12 WHERE id = $1";
        bind_item(sqlx::query(update), &next)?.execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(next)
    }

    async fn delete_item(&self, id: Uuid, expected_version: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {} FROM checklist_items WHERE id = $1 FOR UPDATE", ITEM_COLUMNS);
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Checklist item {} not found", id)))?;
        let current = item_from_row(&row)?;

        check_item_delete(&current, expected_version)?;
        sqlx::query("DELETE FROM checklist_items WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }
}
