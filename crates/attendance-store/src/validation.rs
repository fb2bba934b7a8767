//! 存储边界校验
//!
//! 不论哪个后端，写入前都执行同样的行级规则。

use attendance_core::{ChecklistItem, Encounter, FlowError, Result};
use chrono::{DateTime, Utc};

/// 校验就诊行的替换
pub fn check_encounter_write(current: &Encounter, next: &Encounter, expected_version: u64) -> Result<()> {
    if current.version != expected_version {
        return Err(FlowError::ConcurrentModification {
            id: current.id,
            expected: expected_version,
            actual: current.version,
        });
    }
    if current.id != next.id || current.patient_ref != next.patient_ref {
        return Err(FlowError::Validation(format!(
            "Encounter {} identity is immutable",
            current.id
        )));
    }
    if current.arrival_time != next.arrival_time {
        return Err(FlowError::Validation(format!(
            "Encounter {} arrival_time is immutable",
            current.id
        )));
    }
    if current.status.is_terminal() && current.status != next.status {
        return Err(FlowError::Validation(format!(
            "Encounter {} is {} and cannot change status",
            current.id, current.status
        )));
    }
    if let Some(vitals) = &next.vitals {
        vitals.validate()?;
    }
    Ok(())
}

/// 写入时由存储端分配的字段
pub fn stamp_encounter(current: &Encounter, mut next: Encounter, now: DateTime<Utc>) -> Encounter {
    next.version = current.version + 1;
    next.created_at = current.created_at;
    next.updated_at = now;
    next.state_changed_at = if next.status != current.status {
        now
    } else {
        current.state_changed_at
    };
    next
}

/// 校验清单项的替换，保证已执行状态单调
pub fn check_item_write(current: &ChecklistItem, next: &ChecklistItem, expected_version: u64) -> Result<()> {
    if current.version != expected_version {
        return Err(FlowError::ConcurrentModification {
            id: current.id,
            expected: expected_version,
            actual: current.version,
        });
    }
    if current.id != next.id || current.encounter_id != next.encounter_id {
        return Err(FlowError::Validation(format!(
            "Checklist item {} identity is immutable",
            current.id
        )));
    }
    if current.administered {
        if !next.administered {
            return Err(FlowError::Validation(format!(
                "Checklist item {} cannot be un-administered",
                current.id
            )));
        }
        if next.administered_at != current.administered_at
            || next.administered_by != current.administered_by
            || !current.same_details(next)
        {
            return Err(FlowError::Validation(format!(
                "Checklist item {} is administered and read-only",
                current.id
            )));
        }
    } else if next.administered && (next.administered_at.is_none() || next.administered_by.is_none()) {
        return Err(FlowError::Validation(format!(
            "Checklist item {} must record administered_at and administered_by",
            current.id
        )));
    }
    Ok(())
}

pub fn check_item_delete(current: &ChecklistItem, expected_version: u64) -> Result<()> {
    if current.version != expected_version {
        return Err(FlowError::ConcurrentModification {
            id: current.id,
            expected: expected_version,
            actual: current.version,
        });
    }
    if current.administered {
        return Err(FlowError::PreconditionFailed(format!(
            "Checklist item {} is administered and cannot be removed",
            current.id
        )));
    }
    Ok(())
}
