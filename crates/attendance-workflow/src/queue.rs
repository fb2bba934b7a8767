//! 优先级队列构建
//!
//! 纯函数：给定就诊集合和工作站角色，按分诊等级、到达时间排序。
//! 每次收到变更通知都可以直接重算，结果确定且无副作用。

use attendance_core::{AbsenteeOrder, Encounter, EncounterStatus, StationRole};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const TRIAGE_STATUSES: &[EncounterStatus] = &[EncounterStatus::AwaitingTriage, EncounterStatus::InTriage];

const PHYSICIAN_STATUSES: &[EncounterStatus] = &[
    EncounterStatus::AwaitingPhysician,
    EncounterStatus::AwaitingReevaluation,
    EncounterStatus::InConsultation,
];

const NURSING_STATUSES: &[EncounterStatus] = &[EncounterStatus::InObservation];

const BED_STATUSES: &[EncounterStatus] = &[EncounterStatus::AwaitingBed];

const DISPLAY_STATUSES: &[EncounterStatus] = &[
    EncounterStatus::AwaitingTriage,
    EncounterStatus::InTriage,
    EncounterStatus::AwaitingPhysician,
    EncounterStatus::AwaitingReevaluation,
    EncounterStatus::InConsultation,
];

/// 工作站关注的主队列状态
pub fn role_statuses(role: StationRole) -> &'static [EncounterStatus] {
    match role {
        StationRole::Triage => TRIAGE_STATUSES,
        StationRole::Physician => PHYSICIAN_STATUSES,
        StationRole::Nursing => NURSING_STATUSES,
        StationRole::BedDesk => BED_STATUSES,
        StationRole::Display => DISPLAY_STATUSES,
    }
}

/// 工作站的缺席名单状态
pub fn absentee_status(role: StationRole) -> Option<EncounterStatus> {
    match role {
        StationRole::Triage => Some(EncounterStatus::AwaitingTriageAbsent),
        StationRole::Physician => Some(EncounterStatus::Absent),
        _ => None,
    }
}

fn clinical_order(a: &Encounter, b: &Encounter) -> Ordering {
    a.acuity_rank()
        .cmp(&b.acuity_rank())
        .then_with(|| a.arrival_time.cmp(&b.arrival_time))
        .then_with(|| a.id.cmp(&b.id))
}

fn bed_order(a: &Encounter, b: &Encounter) -> Ordering {
    a.bed_rank()
        .cmp(&b.bed_rank())
        .then_with(|| a.bed_request_time.cmp(&b.bed_request_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// 构建工作站主队列
pub fn build_queue(encounters: &[Encounter], role: StationRole) -> Vec<Encounter> {
    let statuses = role_statuses(role);
    let mut queue: Vec<Encounter> = encounters
        .iter()
        .filter(|e| statuses.contains(&e.status))
        .cloned()
        .collect();

    match role {
        StationRole::BedDesk => queue.sort_by(bed_order),
        _ => queue.sort_by(clinical_order),
    }
    queue
}

/// 构建缺席名单，按首次缺席时间排序，召回不会打乱顺序
pub fn build_absentees(encounters: &[Encounter], role: StationRole, order: AbsenteeOrder) -> Vec<Encounter> {
    let Some(status) = absentee_status(role) else {
        return Vec::new();
    };

    let mut absentees: Vec<Encounter> = encounters
        .iter()
        .filter(|e| e.status == status)
        .cloned()
        .collect();

    absentees.sort_by(|a, b| {
        let by_anchor = match order {
            AbsenteeOrder::MostRecentFirst => b.absence_anchor.cmp(&a.absence_anchor),
            AbsenteeOrder::OldestFirst => a.absence_anchor.cmp(&b.absence_anchor),
        };
        by_anchor.then_with(|| a.id.cmp(&b.id))
    });
    absentees
}

/// 某个工作站的队列视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueView {
    pub role: StationRole,
    pub queue: Vec<Encounter>,
    pub absentees: Vec<Encounter>,
}

impl QueueView {
    pub fn build(encounters: &[Encounter], role: StationRole, order: AbsenteeOrder) -> Self {
        Self {
            role,
            queue: build_queue(encounters, role),
            absentees: build_absentees(encounters, role, order),
        }
    }

    pub fn empty(role: StationRole) -> Self {
        Self {
            role,
            queue: Vec::new(),
            absentees: Vec::new(),
        }
    }

    /// 队列中第一个可呼叫的候诊者
    pub fn next_waiting(&self) -> Option<&Encounter> {
        self.queue.iter().find(|e| e.status.is_waiting())
    }

    pub fn position_of(&self, id: uuid::Uuid) -> Option<usize> {
        self.queue.iter().position(|e| e.id == id)
    }
}
