//! 就诊状态机
//!
//! 校验并计算就诊状态转换，包括呼叫、缺席、召回、结束和换号，
//! 以及召回后的检查锁规则。状态机本身不访问存储。

use attendance_core::utils::is_blank;
use attendance_core::{
    Acuity, Disposition, Encounter, EncounterStatus, FlowError, FlowPolicy, Result,
    StationDescriptor, StationRole,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 流转命令
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FlowCommand {
    Call,
    MarkAbsent,
    Recall,
    CancelFromAbsence,
    CompleteTriage,
    FinalizeConsultation { disposition: Disposition },
    ReleaseObservation,
    AssignBed,
    SwapOut,
    Reclassify { acuity: Acuity },
}

impl FlowCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::MarkAbsent => "mark_absent",
            Self::Recall => "recall",
            Self::CancelFromAbsence => "cancel_from_absence",
            Self::CompleteTriage => "complete_triage",
            Self::FinalizeConsultation { .. } => "finalize_consultation",
            Self::ReleaseObservation => "release_observation",
            Self::AssignBed => "assign_bed",
            Self::SwapOut => "swap_out",
            Self::Reclassify { .. } => "reclassify",
        }
    }

    /// 可以发出该命令的工作站角色
    pub fn allowed_roles(&self) -> &'static [StationRole] {
        match self {
            Self::Call
            | Self::MarkAbsent
            | Self::Recall
            | Self::CancelFromAbsence
            | Self::SwapOut
            | Self::Reclassify { .. } => &[StationRole::Triage, StationRole::Physician],
            Self::CompleteTriage => &[StationRole::Triage],
            Self::FinalizeConsultation { .. } => &[StationRole::Physician],
            Self::ReleaseObservation => &[StationRole::Nursing, StationRole::Physician],
            Self::AssignBed => &[StationRole::BedDesk],
        }
    }
}

/// 叫号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageKind {
    Call,
    Recall,
}

/// 已计算的转换结果
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Encounter,
    pub page: Option<PageKind>,
}

/// 状态机判定
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Transition),
    /// 检查锁生效，换号被忽略且没有任何副作用
    Locked,
}

/// 负责某状态的工作台角色
pub fn desk_role(status: EncounterStatus) -> Option<StationRole> {
    match status {
        EncounterStatus::AwaitingTriage
        | EncounterStatus::InTriage
        | EncounterStatus::AwaitingTriageAbsent => Some(StationRole::Triage),
        EncounterStatus::AwaitingPhysician
        | EncounterStatus::AwaitingReevaluation
        | EncounterStatus::InConsultation
        | EncounterStatus::Absent => Some(StationRole::Physician),
        EncounterStatus::InObservation => Some(StationRole::Nursing),
        EncounterStatus::AwaitingBed => Some(StationRole::BedDesk),
        EncounterStatus::Finalized | EncounterStatus::Cancelled => None,
    }
}

/// 就诊状态机
#[derive(Debug, Clone, Default)]
pub struct FlowStateMachine {
    policy: FlowPolicy,
}

impl FlowStateMachine {
    pub fn new(policy: FlowPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FlowPolicy {
        &self.policy
    }

    /// 检查命令在当前状态下是否有效
    pub fn can_apply(
        &self,
        current: &Encounter,
        command: &FlowCommand,
        station: &StationDescriptor,
        now: DateTime<Utc>,
    ) -> bool {
        matches!(
            self.apply(current, command, station, now),
            Ok(TransitionOutcome::Applied(_))
        )
    }

    /// 计算转换；失败时不修改任何状态
    pub fn apply(
        &self,
        current: &Encounter,
        command: &FlowCommand,
        station: &StationDescriptor,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let status = current.status;
        if status.is_terminal() || !command.allowed_roles().contains(&station.role) {
            return Err(invalid(status, command, station));
        }

        let mut next = current.clone();
        let mut page = None;

        match command {
            FlowCommand::Call => {
                if status.is_waiting() {
                    ensure_desk(status, command, station)?;
                    self.ensure_call_allowed(current)?;
                    next.status = match status {
                        EncounterStatus::AwaitingTriage => EncounterStatus::InTriage,
                        _ => EncounterStatus::InConsultation,
                    };
                    next.called_from = Some(status);
                    next.active_station = Some(station.id.clone());
                    next.examiner_locked = false;
                    next.call_count += 1;
                } else if status.is_active() {
                    ensure_owner(current, station)?;
                    self.ensure_call_allowed(current)?;
                    next.call_count += 1;
                } else {
                    return Err(invalid(status, command, station));
                }
                page = Some(PageKind::Call);
            }
            FlowCommand::MarkAbsent => {
                if !status.is_active() {
                    return Err(invalid(status, command, station));
                }
                ensure_owner(current, station)?;
                if current.call_count == 0 {
                    return Err(FlowError::PreconditionFailed(format!(
                        "Encounter {} has not been called yet",
                        current.id
                    )));
                }
                next.status = match status {
                    EncounterStatus::InTriage => EncounterStatus::AwaitingTriageAbsent,
                    _ => EncounterStatus::Absent,
                };
                if next.absence_anchor.is_none() {
                    next.absence_anchor = Some(now);
                }
                next.examiner_locked = false;
                next.active_station = None;
            }
            FlowCommand::Recall => {
                if !status.is_absent() {
                    return Err(invalid(status, command, station));
                }
                ensure_desk(status, command, station)?;
                if status == EncounterStatus::AwaitingTriageAbsent {
                    next.status = EncounterStatus::InTriage;
                    next.called_from = Some(EncounterStatus::AwaitingTriage);
                } else {
                    next.status = EncounterStatus::InConsultation;
                    if next.called_from.is_none() {
                        next.called_from = Some(EncounterStatus::AwaitingPhysician);
                    }
                }
                next.call_count = 1;
                next.examiner_locked = true;
                next.active_station = Some(station.id.clone());
                page = Some(PageKind::Recall);
            }
            FlowCommand::CancelFromAbsence => {
                if !status.is_absent() {
                    return Err(invalid(status, command, station));
                }
                ensure_desk(status, command, station)?;
                next.status = EncounterStatus::Cancelled;
                close_activation(&mut next);
                next.absence_anchor = None;
            }
            FlowCommand::CompleteTriage => {
                if status != EncounterStatus::InTriage {
                    return Err(invalid(status, command, station));
                }
                ensure_owner(current, station)?;
                if current.acuity.is_none() {
                    return Err(FlowError::PreconditionFailed(format!(
                        "Encounter {} needs an acuity before leaving triage",
                        current.id
                    )));
                }
                next.status = EncounterStatus::AwaitingPhysician;
                close_activation(&mut next);
                next.absence_anchor = None;
            }
            FlowCommand::FinalizeConsultation { disposition } => {
                if status != EncounterStatus::InConsultation {
                    return Err(invalid(status, command, station));
                }
                ensure_owner(current, station)?;
                match disposition {
                    Disposition::Discharge => {
                        next.status = EncounterStatus::Finalized;
                    }
                    Disposition::Observation => {
                        next.status = EncounterStatus::InObservation;
                    }
                    Disposition::BedRequest {
                        justification,
                        priority,
                    } => {
                        if is_blank(Some(justification.as_str())) {
                            return Err(FlowError::PreconditionFailed(format!(
                                "Bed request for encounter {} requires a clinical justification",
                                current.id
                            )));
                        }
                        next.status = EncounterStatus::AwaitingBed;
                        next.bed_justification = Some(justification.trim().to_string());
                        next.bed_request_priority = priority.or(current.acuity);
                        next.bed_request_time = Some(now);
                    }
                }
                close_activation(&mut next);
                next.absence_anchor = None;
            }
            FlowCommand::ReleaseObservation => {
                if status != EncounterStatus::InObservation {
                    return Err(invalid(status, command, station));
                }
                next.status = EncounterStatus::AwaitingReevaluation;
            }
            FlowCommand::AssignBed => {
                if status != EncounterStatus::AwaitingBed {
                    return Err(invalid(status, command, station));
                }
                next.status = EncounterStatus::Finalized;
            }
            FlowCommand::SwapOut => {
                if !status.is_active() {
                    return Err(invalid(status, command, station));
                }
                if current.examiner_locked {
                    return Ok(TransitionOutcome::Locked);
                }
                ensure_owner(current, station)?;
                next.status = current.called_from.unwrap_or(match status {
                    EncounterStatus::InTriage => EncounterStatus::AwaitingTriage,
                    _ => EncounterStatus::AwaitingPhysician,
                });
                close_activation(&mut next);
            }
            FlowCommand::Reclassify { acuity } => {
                if status.is_active() {
                    ensure_owner(current, station)?;
                }
                next.acuity = Some(*acuity);
            }
        }

        if next.status != current.status {
            next.state_changed_at = now;
        }
        next.updated_at = now;

        Ok(TransitionOutcome::Applied(Transition { next, page }))
    }

    fn ensure_call_allowed(&self, current: &Encounter) -> Result<()> {
        if self.policy.allows_call(current.call_count) {
            Ok(())
        } else {
            Err(FlowError::PreconditionFailed(format!(
                "Encounter {} reached the call limit of {}",
                current.id,
                self.policy.max_calls.unwrap_or_default()
            )))
        }
    }
}

fn invalid(status: EncounterStatus, command: &FlowCommand, station: &StationDescriptor) -> FlowError {
    FlowError::invalid_transition(
        status,
        format!("{} ({})", command.name(), station.role.as_str()),
    )
}

fn ensure_desk(status: EncounterStatus, command: &FlowCommand, station: &StationDescriptor) -> Result<()> {
    if desk_role(status) == Some(station.role) {
        Ok(())
    } else {
        Err(invalid(status, command, station))
    }
}

/// 正在检查中的就诊只接受其所在工作站的命令
fn ensure_owner(current: &Encounter, station: &StationDescriptor) -> Result<()> {
    match &current.active_station {
        Some(owner) if owner != &station.id => Err(FlowError::PreconditionFailed(format!(
            "Encounter {} is being examined at station {}",
            current.id, owner
        ))),
        _ => Ok(()),
    }
}

/// 离开工作站：清除检查锁并重置呼叫计数
fn close_activation(next: &mut Encounter) {
    next.call_count = 0;
    next.examiner_locked = false;
    next.active_station = None;
    next.called_from = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendance_core::NewEncounter;
    use chrono::Duration;

    fn triage_desk() -> StationDescriptor {
        StationDescriptor::new("triage-1", StationRole::Triage, "Triage 1")
    }

    fn physician_desk(n: u8) -> StationDescriptor {
        StationDescriptor::new(format!("room-{}", n), StationRole::Physician, format!("Room {}", n))
    }

    fn applied(outcome: TransitionOutcome) -> Transition {
        match outcome {
            TransitionOutcome::Applied(t) => t,
            TransitionOutcome::Locked => panic!("unexpected lock"),
        }
    }

    fn waiting_for_physician(now: DateTime<Utc>) -> Encounter {
        let mut e = Encounter::register(NewEncounter::new("Ana").with_acuity(Acuity::Yellow), now);
        e.status = EncounterStatus::AwaitingPhysician;
        e
    }

    #[test]
    fn test_call_moves_to_examination_and_pages() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let e = Encounter::register(NewEncounter::new("Ana"), now);

        let t = applied(sm.apply(&e, &FlowCommand::Call, &triage_desk(), now).unwrap());
        assert_eq!(t.next.status, EncounterStatus::InTriage);
        assert_eq!(t.next.call_count, 1);
        assert_eq!(t.next.called_from, Some(EncounterStatus::AwaitingTriage));
        assert_eq!(t.page, Some(PageKind::Call));

        let again = applied(sm.apply(&t.next, &FlowCommand::Call, &triage_desk(), now).unwrap());
        assert_eq!(again.next.status, EncounterStatus::InTriage);
        assert_eq!(again.next.call_count, 2);
        assert_eq!(again.next.state_changed_at, t.next.state_changed_at);
    }

    #[test]
    fn test_call_requires_matching_desk() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let e = Encounter::register(NewEncounter::new("Ana"), now);
        let err = sm.apply(&e, &FlowCommand::Call, &physician_desk(1), now).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));

        let bed_desk = StationDescriptor::new("beds", StationRole::BedDesk, "Beds");
        assert!(sm.apply(&e, &FlowCommand::Call, &bed_desk, now).is_err());
    }

    #[test]
    fn test_finalize_from_waiting_is_invalid() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let e = Encounter::register(NewEncounter::new("Ana"), now);
        let command = FlowCommand::FinalizeConsultation {
            disposition: Disposition::Discharge,
        };
        let err = sm.apply(&e, &command, &physician_desk(1), now).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_absence_anchor_is_kept_across_repeated_absence() {
        let sm = FlowStateMachine::default();
        let t0 = Utc::now();
        let desk = physician_desk(1);
        let e = waiting_for_physician(t0);

        let called = applied(sm.apply(&e, &FlowCommand::Call, &desk, t0).unwrap()).next;
        let absent = applied(sm.apply(&called, &FlowCommand::MarkAbsent, &desk, t0).unwrap()).next;
        assert_eq!(absent.status, EncounterStatus::Absent);
        assert_eq!(absent.absence_anchor, Some(t0));

        let t1 = t0 + Duration::minutes(10);
        let recalled = applied(sm.apply(&absent, &FlowCommand::Recall, &desk, t1).unwrap()).next;
        assert!(recalled.examiner_locked);
        assert_eq!(recalled.call_count, 1);
        assert_eq!(recalled.absence_anchor, Some(t0));

        let t2 = t1 + Duration::minutes(5);
        let absent_again = applied(sm.apply(&recalled, &FlowCommand::MarkAbsent, &desk, t2).unwrap()).next;
        assert_eq!(absent_again.absence_anchor, Some(t0));
        assert!(!absent_again.examiner_locked);
    }

    #[test]
    fn test_mark_absent_requires_a_call() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let mut e = waiting_for_physician(now);
        e.status = EncounterStatus::InConsultation;
        e.call_count = 0;
        let err = sm.apply(&e, &FlowCommand::MarkAbsent, &physician_desk(1), now).unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));
    }

    #[test]
    fn test_swap_out_restores_waiting_state() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let desk = physician_desk(1);
        let mut e = waiting_for_physician(now);
        e.status = EncounterStatus::AwaitingReevaluation;

        let called = applied(sm.apply(&e, &FlowCommand::Call, &desk, now).unwrap()).next;
        let swapped = applied(sm.apply(&called, &FlowCommand::SwapOut, &desk, now).unwrap()).next;
        assert_eq!(swapped.status, EncounterStatus::AwaitingReevaluation);
        assert_eq!(swapped.call_count, 0);
        assert_eq!(swapped.arrival_time, e.arrival_time);
        assert!(swapped.active_station.is_none());
    }

    #[test]
    fn test_swap_out_of_recalled_encounter_is_a_no_op() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let desk = physician_desk(1);
        let mut e = waiting_for_physician(now);
        e.status = EncounterStatus::Absent;
        e.absence_anchor = Some(now);

        let recalled = applied(sm.apply(&e, &FlowCommand::Recall, &desk, now).unwrap()).next;
        assert_eq!(
            sm.apply(&recalled, &FlowCommand::SwapOut, &desk, now).unwrap(),
            TransitionOutcome::Locked
        );
        assert_eq!(
            sm.apply(&recalled, &FlowCommand::SwapOut, &physician_desk(2), now).unwrap(),
            TransitionOutcome::Locked
        );
    }

    #[test]
    fn test_other_station_cannot_finalize_active_encounter() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let e = waiting_for_physician(now);
        let called = applied(sm.apply(&e, &FlowCommand::Call, &physician_desk(1), now).unwrap()).next;

        let command = FlowCommand::FinalizeConsultation {
            disposition: Disposition::Discharge,
        };
        let err = sm.apply(&called, &command, &physician_desk(2), now).unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));
    }

    #[test]
    fn test_bed_request_requires_justification() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let desk = physician_desk(1);
        let called = applied(sm.apply(&waiting_for_physician(now), &FlowCommand::Call, &desk, now).unwrap()).next;

        let blank = FlowCommand::FinalizeConsultation {
            disposition: Disposition::BedRequest {
                justification: "  ".into(),
                priority: None,
            },
        };
        assert!(matches!(
            sm.apply(&called, &blank, &desk, now).unwrap_err(),
            FlowError::PreconditionFailed(_)
        ));

        let later = now + Duration::minutes(1);
        let justified = FlowCommand::FinalizeConsultation {
            disposition: Disposition::BedRequest {
                justification: "sepsis, needs ward admission".into(),
                priority: None,
            },
        };
        let t = applied(sm.apply(&called, &justified, &desk, later).unwrap());
        assert_eq!(t.next.status, EncounterStatus::AwaitingBed);
        assert_eq!(t.next.bed_request_time, Some(later));
        assert_eq!(t.next.bed_request_priority, Some(Acuity::Yellow));
        assert_eq!(t.next.call_count, 0);
    }

    #[test]
    fn test_complete_triage_requires_acuity() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let desk = triage_desk();
        let e = Encounter::register(NewEncounter::new("Ana"), now);
        let called = applied(sm.apply(&e, &FlowCommand::Call, &desk, now).unwrap()).next;
        assert!(sm.apply(&called, &FlowCommand::CompleteTriage, &desk, now).is_err());

        let classified = applied(
            sm.apply(&called, &FlowCommand::Reclassify { acuity: Acuity::Orange }, &desk, now)
                .unwrap(),
        )
        .next;
        let done = applied(sm.apply(&classified, &FlowCommand::CompleteTriage, &desk, now).unwrap()).next;
        assert_eq!(done.status, EncounterStatus::AwaitingPhysician);
        assert_eq!(done.call_count, 0);
    }

    #[test]
    fn test_call_limit_from_policy() {
        let sm = FlowStateMachine::new(FlowPolicy {
            max_calls: Some(2),
            ..Default::default()
        });
        let now = Utc::now();
        let desk = triage_desk();
        let e = Encounter::register(NewEncounter::new("Ana"), now);

        let first = applied(sm.apply(&e, &FlowCommand::Call, &desk, now).unwrap()).next;
        let second = applied(sm.apply(&first, &FlowCommand::Call, &desk, now).unwrap()).next;
        let err = sm.apply(&second, &FlowCommand::Call, &desk, now).unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));
    }

    #[test]
    fn test_cancel_from_either_absence_list() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();

        let mut no_show = Encounter::register(NewEncounter::new("Ana"), now);
        no_show.status = EncounterStatus::AwaitingTriageAbsent;
        no_show.absence_anchor = Some(now);
        let cancelled = applied(sm.apply(&no_show, &FlowCommand::CancelFromAbsence, &triage_desk(), now).unwrap());
        assert_eq!(cancelled.next.status, EncounterStatus::Cancelled);
        assert!(cancelled.next.absence_anchor.is_none());
        assert!(cancelled.page.is_none());
        assert!(sm
            .apply(&no_show, &FlowCommand::CancelFromAbsence, &physician_desk(1), now)
            .is_err());

        let mut absent = waiting_for_physician(now);
        absent.status = EncounterStatus::Absent;
        absent.absence_anchor = Some(now);
        let cancelled = applied(sm.apply(&absent, &FlowCommand::CancelFromAbsence, &physician_desk(1), now).unwrap());
        assert_eq!(cancelled.next.status, EncounterStatus::Cancelled);
        assert!(!sm.can_apply(&cancelled.next, &FlowCommand::Recall, &physician_desk(1), now));
    }

    #[test]
    fn test_cancel_requires_absence() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let desk = physician_desk(1);
        let called = applied(sm.apply(&waiting_for_physician(now), &FlowCommand::Call, &desk, now).unwrap()).next;

        let err = sm.apply(&called, &FlowCommand::CancelFromAbsence, &desk, now).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
        let err = sm
            .apply(&waiting_for_physician(now), &FlowCommand::CancelFromAbsence, &desk, now)
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_recall_from_triage_absence() {
        let sm = FlowStateMachine::default();
        let t0 = Utc::now();
        let desk = triage_desk();
        let e = Encounter::register(NewEncounter::new("Ana"), t0);

        let called = applied(sm.apply(&e, &FlowCommand::Call, &desk, t0).unwrap()).next;
        let called = applied(sm.apply(&called, &FlowCommand::Call, &desk, t0).unwrap()).next;
        let absent = applied(sm.apply(&called, &FlowCommand::MarkAbsent, &desk, t0).unwrap()).next;
        assert_eq!(absent.status, EncounterStatus::AwaitingTriageAbsent);

        let t1 = t0 + Duration::minutes(4);
        let recalled = applied(sm.apply(&absent, &FlowCommand::Recall, &desk, t1).unwrap());
        assert_eq!(recalled.page, Some(PageKind::Recall));
        assert_eq!(recalled.next.status, EncounterStatus::InTriage);
        assert_eq!(recalled.next.called_from, Some(EncounterStatus::AwaitingTriage));
        assert_eq!(recalled.next.call_count, 1);
        assert!(recalled.next.examiner_locked);
        assert_eq!(recalled.next.absence_anchor, Some(t0));
        assert_eq!(recalled.next.active_station, Some(desk.id.clone()));

        assert!(sm.apply(&absent, &FlowCommand::Recall, &physician_desk(1), t1).is_err());
    }

    #[test]
    fn test_assign_bed_only_from_bed_queue() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let bed_desk = StationDescriptor::new("beds", StationRole::BedDesk, "Beds");
        let mut waiting = waiting_for_physician(now);
        waiting.status = EncounterStatus::AwaitingBed;
        waiting.bed_request_time = Some(now);

        let assigned = applied(sm.apply(&waiting, &FlowCommand::AssignBed, &bed_desk, now).unwrap()).next;
        assert_eq!(assigned.status, EncounterStatus::Finalized);
        assert!(sm.apply(&waiting, &FlowCommand::AssignBed, &physician_desk(1), now).is_err());

        let err = sm
            .apply(&waiting_for_physician(now), &FlowCommand::AssignBed, &bed_desk, now)
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_reclassify_of_active_encounter_is_owner_only() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let called = applied(sm.apply(&waiting_for_physician(now), &FlowCommand::Call, &physician_desk(1), now).unwrap()).next;
        let command = FlowCommand::Reclassify { acuity: Acuity::Red };

        let err = sm.apply(&called, &command, &physician_desk(2), now).unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));

        let owner = applied(sm.apply(&called, &command, &physician_desk(1), now).unwrap()).next;
        assert_eq!(owner.acuity, Some(Acuity::Red));

        let waiting = applied(sm.apply(&waiting_for_physician(now), &command, &physician_desk(2), now).unwrap()).next;
        assert_eq!(waiting.acuity, Some(Acuity::Red));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let sm = FlowStateMachine::default();
        let now = Utc::now();
        let mut e = Encounter::register(NewEncounter::new("Ana"), now);
        e.status = EncounterStatus::Cancelled;
        assert!(!sm.can_apply(&e, &FlowCommand::Recall, &triage_desk(), now));
        assert!(!sm.can_apply(&e, &FlowCommand::Reclassify { acuity: Acuity::Red }, &triage_desk(), now));
    }
}
