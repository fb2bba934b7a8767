//! 流转引擎
//!
//! 读取 → 状态机校验 → 条件写入 → 发布通知。所有工作站命令都经过这里。

use std::sync::Arc;

use attendance_core::{
    ClinicalNarrative, Disposition, DocumentKind, DocumentRequest, Encounter, EncounterStatus, FlowError, FlowPolicy,
    NewEncounter, Result, StationDescriptor, StationRole, VitalSigns,
};
use attendance_notify::{ChangeEvent, ChangeKind, Collection, EventSink, PageEvent};
use attendance_store::EncounterStore;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checklist::ChecklistManager;
use crate::metrics::FlowMetrics;
use crate::queue::QueueView;
use crate::state_machine::{desk_role, FlowCommand, FlowStateMachine, PageKind, TransitionOutcome};

/// 命令上下文
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub station: StationDescriptor,
    /// 随本次命令产生的所有变更事件一起发布
    pub correlation_id: Uuid,
    /// 调用方看到的版本；为空时以引擎读取到的版本为准
    pub expected_version: Option<u64>,
}

impl CommandContext {
    pub fn new(station: StationDescriptor) -> Self {
        Self {
            station,
            correlation_id: Uuid::new_v4(),
            expected_version: None,
        }
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// 命令执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// 已写入，携带存储返回的记录
    Applied(Encounter),
    /// 检查锁生效，未做任何修改
    Locked(Encounter),
}

impl CommandOutcome {
    pub fn encounter(&self) -> &Encounter {
        match self {
            Self::Applied(e) | Self::Locked(e) => e,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// 选择候诊者的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    Called {
        called: Encounter,
        /// 为让位而被换出的原就诊
        swapped_out: Option<Encounter>,
    },
    /// 工作站当前就诊处于检查锁，选择被忽略
    Locked { current: Encounter },
}

/// 流转引擎
pub struct FlowEngine {
    store: Arc<dyn EncounterStore>,
    sink: Arc<dyn EventSink>,
    machine: FlowStateMachine,
    checklist: ChecklistManager,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("policy", self.machine.policy())
            .finish_non_exhaustive()
    }
}

impl FlowEngine {
    pub fn new(store: Arc<dyn EncounterStore>, sink: Arc<dyn EventSink>, policy: FlowPolicy) -> Result<Self> {
        Ok(Self {
            checklist: ChecklistManager::new(store.clone(), sink.clone()),
            machine: FlowStateMachine::new(policy),
            metrics: FlowMetrics::new()?,
            store,
            sink,
        })
    }

    pub fn policy(&self) -> &FlowPolicy {
        self.machine.policy()
    }

    pub fn checklist(&self) -> &ChecklistManager {
        &self.checklist
    }

    pub fn metrics(&self) -> &FlowMetrics {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }

    pub async fn get_encounter(&self, id: Uuid) -> Result<Encounter> {
        self.store.get_encounter(id).await
    }

    pub async fn list_encounters(&self) -> Result<Vec<Encounter>> {
        self.store.list_encounters().await
    }

    /// 登记到达，新就诊进入分诊候诊
    pub async fn register_arrival(&self, new: NewEncounter) -> Result<Encounter> {
        let encounter = Encounter::register(new, self.store.now());
        let stored = self.store.insert_encounter(encounter).await?;

        info!("Registered encounter {} for patient {}", stored.id, stored.patient_ref);
        self.sink
            .publish_change(ChangeEvent::encounter(ChangeKind::Created, stored.id));
        Ok(stored)
    }

    /// 执行流转命令
    pub async fn execute(&self, encounter_id: Uuid, command: FlowCommand, ctx: &CommandContext) -> Result<CommandOutcome> {
        match self.try_execute(encounter_id, &command, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.metrics.record_rejection(command.name(), &err);
                warn!(
                    "Rejected {} on encounter {} from {}: {}",
                    command.name(),
                    encounter_id,
                    ctx.station.id,
                    err
                );
                Err(err)
            }
        }
    }

    async fn try_execute(&self, encounter_id: Uuid, command: &FlowCommand, ctx: &CommandContext) -> Result<CommandOutcome> {
        let current = self.store.get_encounter(encounter_id).await?;
        if let Some(expected) = ctx.expected_version {
            if expected != current.version {
                return Err(FlowError::ConcurrentModification {
                    id: encounter_id,
                    expected,
                    actual: current.version,
                });
            }
        }

        if claims_station(&current, command) {
            if let Some(occupant) = self.active_for_station(&ctx.station).await? {
                if occupant.id != current.id {
                    return Err(FlowError::PreconditionFailed(format!(
                        "Station {} is already examining encounter {}",
                        ctx.station.id, occupant.id
                    )));
                }
            }
        }

        if matches!(command, FlowCommand::ReleaseObservation) && self.policy().require_checklist_complete {
            let progress = self.checklist.progress(encounter_id).await?;
            if !progress.is_complete() {
                return Err(FlowError::PreconditionFailed(format!(
                    "Encounter {} has {} of {} checklist items administered",
                    encounter_id, progress.administered, progress.total
                )));
            }
        }

        let transition = match self.machine.apply(&current, command, &ctx.station, self.store.now())? {
            TransitionOutcome::Applied(transition) => transition,
            TransitionOutcome::Locked => {
                self.metrics.record_locked_swap();
                info!(
                    "Ignored {} on encounter {}: examiner lock is set",
                    command.name(),
                    encounter_id
                );
                return Ok(CommandOutcome::Locked(current));
            }
        };

        let stored = self.store.update_encounter(transition.next, current.version).await?;

        self.metrics.record_transition(command.name());
        info!(
            "Encounter {} {} -> {} via {} at {}",
            stored.id,
            current.status,
            stored.status,
            command.name(),
            ctx.station.id
        );

        self.sink.publish_change(
            ChangeEvent::encounter(ChangeKind::Updated, stored.id).with_correlation(ctx.correlation_id),
        );
        if let Some(kind) = transition.page {
            self.publish_page(&stored, &ctx.station, kind);
        }

        Ok(CommandOutcome::Applied(stored))
    }

    fn publish_page(&self, encounter: &Encounter, station: &StationDescriptor, kind: PageKind) {
        self.metrics.record_page();
        self.sink.publish_page(PageEvent {
            id: Uuid::new_v4(),
            encounter_id: encounter.id,
            patient_display_name: encounter.patient.paging_name().to_string(),
            destination_label: station.label.clone(),
            station_id: station.id.clone(),
            call_count: encounter.call_count,
            recall: kind == PageKind::Recall,
            at: encounter.updated_at,
        });
    }

    /// 工作站当前正在检查的就诊
    pub async fn active_for_station(&self, station: &StationDescriptor) -> Result<Option<Encounter>> {
        let encounters = self.store.list_encounters().await?;
        Ok(encounters
            .into_iter()
            .filter(|e| e.status.is_active() && e.active_station.as_ref() == Some(&station.id))
            .max_by_key(|e| e.state_changed_at))
    }

    /// 选择候诊者：先换出工作站当前就诊，再呼叫所选就诊
    pub async fn select(&self, target_id: Uuid, ctx: &CommandContext) -> Result<SelectOutcome> {
        let active = self.active_for_station(&ctx.station).await?;

        let swap_candidate = match active {
            Some(current) if current.id == target_id => None,
            Some(current) if current.examiner_locked => {
                self.metrics.record_locked_swap();
                info!(
                    "Selection of {} at {} ignored: encounter {} is locked",
                    target_id, ctx.station.id, current.id
                );
                return Ok(SelectOutcome::Locked { current });
            }
            other => other,
        };

        // 目标不可呼叫时不换出当前就诊
        let target = self.store.get_encounter(target_id).await?;
        if let Some(expected) = ctx.expected_version {
            if expected != target.version {
                return Err(FlowError::ConcurrentModification {
                    id: target_id,
                    expected,
                    actual: target.version,
                });
            }
        }
        if let Err(err) = self.machine.apply(&target, &FlowCommand::Call, &ctx.station, self.store.now()) {
            self.metrics.record_rejection(FlowCommand::Call.name(), &err);
            warn!("Cannot select encounter {} at {}: {}", target_id, ctx.station.id, err);
            return Err(err);
        }

        let swap_ctx = CommandContext {
            expected_version: None,
            ..ctx.clone()
        };
        let swapped_out = match &swap_candidate {
            Some(current) => match self.execute(current.id, FlowCommand::SwapOut, &swap_ctx).await? {
                CommandOutcome::Applied(swapped) => Some(swapped),
                CommandOutcome::Locked(current) => return Ok(SelectOutcome::Locked { current }),
            },
            None => None,
        };

        let called = match self.execute(target_id, FlowCommand::Call, ctx).await {
            Ok(CommandOutcome::Applied(called)) => called,
            Ok(CommandOutcome::Locked(current)) => return Ok(SelectOutcome::Locked { current }),
            Err(err) => {
                if let (Some(original), Some(swapped)) = (&swap_candidate, &swapped_out) {
                    if let Err(restore_err) = self.restore_activation(original, swapped, ctx).await {
                        error!(
                            "Failed to restore encounter {} at {} after rejected selection: {}",
                            original.id, ctx.station.id, restore_err
                        );
                    }
                }
                return Err(err);
            }
        };

        Ok(SelectOutcome::Called { called, swapped_out })
    }

    /// 目标呼叫失败时撤销换出，恢复原就诊在本工作站的激活状态
    async fn restore_activation(
        &self,
        original: &Encounter,
        swapped: &Encounter,
        ctx: &CommandContext,
    ) -> Result<Encounter> {
        let mut next = swapped.clone();
        next.status = original.status;
        next.active_station = original.active_station.clone();
        next.called_from = original.called_from;
        next.call_count = original.call_count;
        next.examiner_locked = original.examiner_locked;

        let stored = self.store.update_encounter(next, swapped.version).await?;
        info!(
            "Restored encounter {} to {} at {} after rejected selection",
            stored.id, stored.status, ctx.station.id
        );
        self.sink.publish_change(
            ChangeEvent::encounter(ChangeKind::Updated, stored.id).with_correlation(ctx.correlation_id),
        );
        Ok(stored)
    }

    pub async fn call(&self, encounter_id: Uuid, ctx: &CommandContext) -> Result<CommandOutcome> {
        self.execute(encounter_id, FlowCommand::Call, ctx).await
    }

    pub async fn mark_absent(&self, encounter_id: Uuid, ctx: &CommandContext) -> Result<CommandOutcome> {
        self.execute(encounter_id, FlowCommand::MarkAbsent, ctx).await
    }

    pub async fn recall(&self, encounter_id: Uuid, ctx: &CommandContext) -> Result<CommandOutcome> {
        self.execute(encounter_id, FlowCommand::Recall, ctx).await
    }

    pub async fn swap_out(&self, encounter_id: Uuid, ctx: &CommandContext) -> Result<CommandOutcome> {
        self.execute(encounter_id, FlowCommand::SwapOut, ctx).await
    }

    pub async fn finalize(
        &self,
        encounter_id: Uuid,
        disposition: Disposition,
        ctx: &CommandContext,
    ) -> Result<CommandOutcome> {
        self.execute(encounter_id, FlowCommand::FinalizeConsultation { disposition }, ctx)
            .await
    }

    /// 合并病历文本
    pub async fn update_narrative(
        &self,
        encounter_id: Uuid,
        update: ClinicalNarrative,
        ctx: &CommandContext,
    ) -> Result<Encounter> {
        let current = self.store.get_encounter(encounter_id).await?;
        let expected = ctx.expected_version.unwrap_or(current.version);

        let mut next = current.clone();
        next.narrative.merge(update);
        let stored = self.store.update_encounter(next, expected).await?;

        debug!("Updated narrative of encounter {} to version {}", stored.id, stored.version);
        self.sink.publish_change(
            ChangeEvent::new(Collection::Notes, ChangeKind::Updated, stored.id, stored.id)
                .with_correlation(ctx.correlation_id),
        );
        Ok(stored)
    }

    /// 记录生命体征
    pub async fn record_vitals(&self, encounter_id: Uuid, vitals: VitalSigns, ctx: &CommandContext) -> Result<Encounter> {
        vitals.validate()?;
        let current = self.store.get_encounter(encounter_id).await?;
        if current.status.is_terminal() {
            return Err(FlowError::PreconditionFailed(format!(
                "Encounter {} is {} and no longer accepts vitals",
                encounter_id, current.status
            )));
        }
        let expected = ctx.expected_version.unwrap_or(current.version);

        let mut next = current.clone();
        next.vitals = Some(vitals);
        let stored = self.store.update_encounter(next, expected).await?;

        self.sink.publish_change(
            ChangeEvent::new(Collection::Vitals, ChangeKind::Updated, stored.id, stored.id)
                .with_correlation(ctx.correlation_id),
        );
        Ok(stored)
    }

    /// 生成文书请求，只使用已持久化的病历内容
    pub async fn prepare_document(
        &self,
        encounter_id: Uuid,
        kind: DocumentKind,
        expected_version: Option<u64>,
    ) -> Result<DocumentRequest> {
        let encounter = self.store.get_encounter(encounter_id).await?;
        if let Some(expected) = expected_version {
            if expected != encounter.version {
                return Err(FlowError::ConcurrentModification {
                    id: encounter_id,
                    expected,
                    actual: encounter.version,
                });
            }
        }

        Ok(DocumentRequest {
            encounter_id,
            kind,
            patient: encounter.patient,
            narrative: encounter.narrative,
            version: encounter.version,
            requested_at: self.store.now(),
        })
    }

    /// 按工作站角色构建队列视图
    pub async fn queue_view(&self, role: StationRole) -> Result<QueueView> {
        let encounters = self.store.list_encounters().await?;
        let view = QueueView::build(&encounters, role, self.policy().absentee_order);
        debug!(
            "Built {} queue: {} waiting, {} absent",
            role.as_str(),
            view.queue.len(),
            view.absentees.len()
        );
        Ok(view)
    }

    /// 取消超过缺席时限的就诊；未配置时限时不做任何事
    pub async fn sweep_absences(&self) -> Result<Vec<Encounter>> {
        let Some(limit) = self.policy().absence_auto_cancel_after() else {
            return Ok(Vec::new());
        };
        let now = self.store.now();

        let expired: Vec<Encounter> = self
            .store
            .list_encounters()
            .await?
            .into_iter()
            .filter(|e| e.status.is_absent())
            .filter(|e| e.absence_anchor.map(|anchor| anchor + limit <= now).unwrap_or(false))
            .collect();

        let mut cancelled = Vec::with_capacity(expired.len());
        for encounter in expired {
            let Some(role) = desk_role(encounter.status) else {
                continue;
            };
            let system = StationDescriptor::new("system", role, "System");
            let ctx = CommandContext::new(system).with_expected_version(encounter.version);
            match self.execute(encounter.id, FlowCommand::CancelFromAbsence, &ctx).await {
                Ok(CommandOutcome::Applied(stored)) => cancelled.push(stored),
                Ok(CommandOutcome::Locked(_)) => {}
                // 期间被召回等，留给工作站处理
                Err(FlowError::ConcurrentModification { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !cancelled.is_empty() {
            info!("Auto-cancelled {} absent encounters", cancelled.len());
        }
        Ok(cancelled)
    }

    /// 按状态统计就诊数
    pub async fn status_counts(&self) -> Result<Vec<(EncounterStatus, usize)>> {
        let encounters = self.store.list_encounters().await?;
        Ok(EncounterStatus::ALL
            .iter()
            .map(|status| (*status, encounters.iter().filter(|e| e.status == *status).count()))
            .collect())
    }
}

/// 呼叫候诊者或召回缺席者会占用工作站
fn claims_station(current: &Encounter, command: &FlowCommand) -> bool {
    match command {
        FlowCommand::Call => current.status.is_waiting(),
        FlowCommand::Recall => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendance_core::{Acuity, ChecklistItem, ChecklistItemDetails, Clock, ManualClock};
    use attendance_notify::{ChangeNotifier, Notification};
    use attendance_store::MemoryStore;
    use chrono::Duration;

    struct Harness {
        engine: FlowEngine,
        store: Arc<MemoryStore>,
        notifier: Arc<ChangeNotifier>,
        clock: Arc<ManualClock>,
    }

    fn harness(policy: FlowPolicy) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let notifier = Arc::new(ChangeNotifier::default());
        let engine = FlowEngine::new(store.clone(), notifier.clone(), policy).unwrap();
        Harness {
            engine,
            store,
            notifier,
            clock,
        }
    }

    fn room(n: u8) -> StationDescriptor {
        StationDescriptor::new(format!("room-{}", n), StationRole::Physician, format!("Room {}", n))
    }

    fn triage() -> StationDescriptor {
        StationDescriptor::new("triage-1", StationRole::Triage, "Triage 1")
    }

    fn ctx(station: StationDescriptor) -> CommandContext {
        CommandContext::new(station)
    }

    async fn waiting_physician(h: &Harness, name: &str, acuity: Acuity) -> Encounter {
        let e = h
            .engine
            .register_arrival(NewEncounter::new(name).with_acuity(acuity))
            .await
            .unwrap();
        let desk = ctx(triage());
        h.engine.call(e.id, &desk).await.unwrap();
        h.engine
            .execute(e.id, FlowCommand::CompleteTriage, &desk)
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(1));
        h.engine.get_encounter(e.id).await.unwrap()
    }

    fn applied(outcome: CommandOutcome) -> Encounter {
        match outcome {
            CommandOutcome::Applied(e) => e,
            CommandOutcome::Locked(_) => panic!("unexpected lock"),
        }
    }

    #[tokio::test]
    async fn test_call_publishes_change_and_page() {
        let h = harness(FlowPolicy::default());
        let mut changes = h.notifier.subscribe(&[Collection::Encounters]);
        let mut pages = h.notifier.subscribe_pages();

        let mut new = NewEncounter::new("Maria Silva");
        new.patient.social_name = Some("Mari".into());
        let e = h.engine.register_arrival(new).await.unwrap();

        let context = ctx(triage());
        let called = applied(h.engine.call(e.id, &context).await.unwrap());
        assert_eq!(called.status, EncounterStatus::InTriage);
        assert_eq!(called.version, 2);

        assert!(matches!(changes.try_recv(), Some(Notification::Change(c)) if c.kind == ChangeKind::Created));
        match changes.try_recv() {
            Some(Notification::Change(c)) => assert_eq!(c.correlation_id, Some(context.correlation_id)),
            other => panic!("unexpected notification: {:?}", other),
        }

        let page = pages.try_recv().unwrap();
        assert_eq!(page.patient_display_name, "Mari");
        assert_eq!(page.destination_label, "Triage 1");
        assert_eq!(page.call_count, 1);
        assert!(!page.recall);
        assert_eq!(h.engine.metrics().pages(), 1);
    }

    #[tokio::test]
    async fn test_rejected_command_changes_nothing() {
        let h = harness(FlowPolicy::default());
        let e = h.engine.register_arrival(NewEncounter::new("Ana")).await.unwrap();

        let err = h
            .engine
            .finalize(e.id, Disposition::Discharge, &ctx(room(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
        assert_eq!(h.engine.get_encounter(e.id).await.unwrap(), e);
    }

    #[tokio::test]
    async fn test_state_changed_at_comes_from_store_clock() {
        let h = harness(FlowPolicy::default());
        let e = waiting_physician(&h, "Ana", Acuity::Green).await;

        h.clock.advance(Duration::minutes(3));
        let t = h.clock.now();
        let called = applied(h.engine.call(e.id, &ctx(room(1))).await.unwrap());
        assert_eq!(called.state_changed_at, t);

        h.clock.advance(Duration::minutes(1));
        let recalled = applied(h.engine.call(e.id, &ctx(room(1))).await.unwrap());
        assert_eq!(recalled.call_count, 2);
        assert_eq!(recalled.state_changed_at, t);
    }

    #[tokio::test]
    async fn test_competing_calls_one_wins() {
        let h = harness(FlowPolicy::default());
        let e = waiting_physician(&h, "Ana", Acuity::Yellow).await;

        let first = ctx(room(1)).with_expected_version(e.version);
        let second = ctx(room(2)).with_expected_version(e.version);
        applied(h.engine.call(e.id, &first).await.unwrap());

        let err = h.engine.call(e.id, &second).await.unwrap_err();
        assert!(matches!(err, FlowError::ConcurrentModification { .. }));

        let stored = h.engine.get_encounter(e.id).await.unwrap();
        assert_eq!(stored.active_station, Some(room(1).id));
        assert_eq!(stored.call_count, 1);
    }

    #[tokio::test]
    async fn test_select_swaps_out_current_encounter() {
        let h = harness(FlowPolicy::default());
        let a = waiting_physician(&h, "Ana", Acuity::Green).await;
        let b = waiting_physician(&h, "Bruno", Acuity::Yellow).await;
        let desk = ctx(room(1));

        h.engine.select(a.id, &desk).await.unwrap();
        match h.engine.select(b.id, &desk).await.unwrap() {
            SelectOutcome::Called { called, swapped_out } => {
                assert_eq!(called.id, b.id);
                let swapped = swapped_out.unwrap();
                assert_eq!(swapped.id, a.id);
                assert_eq!(swapped.status, EncounterStatus::AwaitingPhysician);
                assert_eq!(swapped.call_count, 0);
                assert_eq!(swapped.arrival_time, a.arrival_time);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recall_lock_survives_competing_selection() {
        let h = harness(FlowPolicy::default());
        let a = waiting_physician(&h, "Ana", Acuity::Green).await;
        let b = waiting_physician(&h, "Bruno", Acuity::Red).await;
        let desk = ctx(room(1));

        h.engine.call(a.id, &desk).await.unwrap();
        h.engine.mark_absent(a.id, &desk).await.unwrap();
        let recalled = applied(h.engine.recall(a.id, &desk).await.unwrap());
        assert!(recalled.examiner_locked);

        match h.engine.select(b.id, &desk).await.unwrap() {
            SelectOutcome::Locked { current } => assert_eq!(current.id, a.id),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.engine.get_encounter(a.id).await.unwrap(), recalled);
        assert_eq!(
            h.engine.get_encounter(b.id).await.unwrap().status,
            EncounterStatus::AwaitingPhysician
        );

        let outcome = h.engine.swap_out(a.id, &desk).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(h.engine.metrics().locked_swaps(), 2);
    }

    #[tokio::test]
    async fn test_select_of_unavailable_target_keeps_current() {
        let h = harness(FlowPolicy::default());
        let a = waiting_physician(&h, "Ana", Acuity::Green).await;
        let b = waiting_physician(&h, "Bruno", Acuity::Green).await;

        h.engine.select(a.id, &ctx(room(1))).await.unwrap();
        h.engine.select(b.id, &ctx(room(2))).await.unwrap();

        let err = h.engine.select(b.id, &ctx(room(1))).await.unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));
        let still = h.engine.get_encounter(a.id).await.unwrap();
        assert_eq!(still.status, EncounterStatus::InConsultation);
        assert_eq!(still.active_station, Some(room(1).id));
    }

    #[tokio::test]
    async fn test_release_observation_requires_complete_checklist() {
        let h = harness(FlowPolicy::default());
        let e = waiting_physician(&h, "Ana", Acuity::Orange).await;
        let desk = ctx(room(1));
        h.engine.call(e.id, &desk).await.unwrap();
        h.engine.finalize(e.id, Disposition::Observation, &desk).await.unwrap();

        let item = h
            .engine
            .checklist()
            .add_item(e.id, ChecklistItemDetails::new("saline 0.9%").with_dose("500 ml"), None)
            .await
            .unwrap();

        let nursing = ctx(StationDescriptor::new("nursing", StationRole::Nursing, "Nursing"));
        let err = h
            .engine
            .execute(e.id, FlowCommand::ReleaseObservation, &nursing)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));

        h.engine.checklist().administer(item.id, "nurse-1", None).await.unwrap();
        let released = applied(
            h.engine
                .execute(e.id, FlowCommand::ReleaseObservation, &nursing)
                .await
                .unwrap(),
        );
        assert_eq!(released.status, EncounterStatus::AwaitingReevaluation);
    }

    #[tokio::test]
    async fn test_queue_view_orders_by_acuity() {
        let h = harness(FlowPolicy::default());
        let yellow = waiting_physician(&h, "Ana", Acuity::Yellow).await;
        let red = waiting_physician(&h, "Bruno", Acuity::Red).await;

        let view = h.engine.queue_view(StationRole::Physician).await.unwrap();
        assert_eq!(view.queue.iter().map(|e| e.id).collect::<Vec<_>>(), vec![red.id, yellow.id]);
        assert_eq!(view.next_waiting().map(|e| e.id), Some(red.id));
    }

    #[tokio::test]
    async fn test_sweep_cancels_only_when_configured() {
        let h = harness(FlowPolicy {
            absence_auto_cancel_after_secs: Some(600),
            ..Default::default()
        });
        let e = waiting_physician(&h, "Ana", Acuity::Green).await;
        let desk = ctx(room(1));
        h.engine.call(e.id, &desk).await.unwrap();
        h.engine.mark_absent(e.id, &desk).await.unwrap();

        h.clock.advance(Duration::minutes(5));
        assert!(h.engine.sweep_absences().await.unwrap().is_empty());

        h.clock.advance(Duration::minutes(6));
        let cancelled = h.engine.sweep_absences().await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].status, EncounterStatus::Cancelled);
        assert!(cancelled[0].absence_anchor.is_none());

        let off = harness(FlowPolicy::default());
        assert!(off.engine.sweep_absences().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_document_uses_persisted_narrative() {
        let h = harness(FlowPolicy::default());
        let e = h.engine.register_arrival(NewEncounter::new("Ana")).await.unwrap();

        let update = ClinicalNarrative {
            diagnosis: Some("acute gastroenteritis".into()),
            ..Default::default()
        };
        let stored = h.engine.update_narrative(e.id, update, &ctx(room(1))).await.unwrap();

        let stale = h
            .engine
            .prepare_document(e.id, DocumentKind::Prescription, Some(e.version))
            .await
            .unwrap_err();
        assert!(matches!(stale, FlowError::ConcurrentModification { .. }));

        let request = h
            .engine
            .prepare_document(e.id, DocumentKind::Prescription, Some(stored.version))
            .await
            .unwrap();
        assert_eq!(request.narrative.diagnosis.as_deref(), Some("acute gastroenteritis"));
        assert_eq!(request.version, stored.version);
    }

    #[tokio::test]
    async fn test_recall_into_occupied_station_is_rejected() {
        let h = harness(FlowPolicy::default());
        let a = waiting_physician(&h, "Ana", Acuity::Green).await;
        let b = waiting_physician(&h, "Bruno", Acuity::Green).await;
        let desk = ctx(room(1));

        h.engine.call(a.id, &desk).await.unwrap();
        h.engine.mark_absent(a.id, &desk).await.unwrap();
        h.engine.select(b.id, &desk).await.unwrap();

        let err = h.engine.recall(a.id, &desk).await.unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));
        assert_eq!(h.engine.get_encounter(a.id).await.unwrap().status, EncounterStatus::Absent);

        let active: Vec<Uuid> = h
            .engine
            .list_encounters()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.status.is_active() && e.active_station == Some(room(1).id))
            .map(|e| e.id)
            .collect();
        assert_eq!(active, vec![b.id]);

        // 换出当前就诊后召回可以进行
        h.engine.swap_out(b.id, &desk).await.unwrap();
        let recalled = applied(h.engine.recall(a.id, &desk).await.unwrap());
        assert!(recalled.examiner_locked);
    }

    #[tokio::test]
    async fn test_direct_call_into_occupied_station_is_rejected() {
        let h = harness(FlowPolicy::default());
        let a = waiting_physician(&h, "Ana", Acuity::Green).await;
        let b = waiting_physician(&h, "Bruno", Acuity::Red).await;
        let desk = ctx(room(1));

        h.engine.call(a.id, &desk).await.unwrap();
        let err = h.engine.call(b.id, &desk).await.unwrap_err();
        assert!(matches!(err, FlowError::PreconditionFailed(_)));
        assert_eq!(
            h.engine.get_encounter(b.id).await.unwrap().status,
            EncounterStatus::AwaitingPhysician
        );

        let again = applied(h.engine.call(a.id, &desk).await.unwrap());
        assert_eq!(again.call_count, 2);
        applied(h.engine.call(b.id, &ctx(room(2))).await.unwrap());
    }

    /// 对指定就诊的写入返回版本冲突，模拟其他工作站抢先
    struct ContestedStore {
        inner: MemoryStore,
        contested: std::sync::Mutex<Option<Uuid>>,
    }

    #[async_trait::async_trait]
    impl EncounterStore for ContestedStore {
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }

        async fn insert_encounter(&self, encounter: Encounter) -> Result<Encounter> {
            self.inner.insert_encounter(encounter).await
        }

        async fn get_encounter(&self, id: Uuid) -> Result<Encounter> {
            self.inner.get_encounter(id).await
        }

        async fn list_encounters(&self) -> Result<Vec<Encounter>> {
            self.inner.list_encounters().await
        }

        async fn update_encounter(&self, next: Encounter, expected_version: u64) -> Result<Encounter> {
            let contested = *self.contested.lock().unwrap();
            if contested == Some(next.id) {
                return Err(FlowError::ConcurrentModification {
                    id: next.id,
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            self.inner.update_encounter(next, expected_version).await
        }

        async fn insert_item(&self, item: ChecklistItem) -> Result<ChecklistItem> {
            self.inner.insert_item(item).await
        }

        async fn get_item(&self, id: Uuid) -> Result<ChecklistItem> {
            self.inner.get_item(id).await
        }

        async fn list_items(&self, encounter_id: Uuid) -> Result<Vec<ChecklistItem>> {
            self.inner.list_items(encounter_id).await
        }

        async fn update_item(&self, next: ChecklistItem, expected_version: u64) -> Result<ChecklistItem> {
            self.inner.update_item(next, expected_version).await
        }

        async fn delete_item(&self, id: Uuid, expected_version: u64) -> Result<()> {
            self.inner.delete_item(id, expected_version).await
        }
    }

    #[tokio::test]
    async fn test_failed_select_restores_current_encounter() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(ContestedStore {
            inner: MemoryStore::with_clock(clock.clone()),
            contested: std::sync::Mutex::new(None),
        });
        let notifier = Arc::new(ChangeNotifier::default());
        let engine = FlowEngine::new(store.clone(), notifier.clone(), FlowPolicy::default()).unwrap();

        let triage_desk = ctx(triage());
        let mut ids = Vec::new();
        for name in ["Ana", "Bruno"] {
            let e = engine
                .register_arrival(NewEncounter::new(name).with_acuity(Acuity::Yellow))
                .await
                .unwrap();
            engine.call(e.id, &triage_desk).await.unwrap();
            engine.execute(e.id, FlowCommand::CompleteTriage, &triage_desk).await.unwrap();
            clock.advance(Duration::seconds(1));
            ids.push(e.id);
        }
        let (a, b) = (ids[0], ids[1]);

        let desk = ctx(room(1));
        engine.select(a, &desk).await.unwrap();
        let before = engine.get_encounter(a).await.unwrap();
        let mut changes = notifier.subscribe(&[Collection::Encounters]);

        *store.contested.lock().unwrap() = Some(b);
        let err = engine.select(b, &desk).await.unwrap_err();
        assert!(matches!(err, FlowError::ConcurrentModification { .. }));

        let restored = engine.get_encounter(a).await.unwrap();
        assert_eq!(restored.status, EncounterStatus::InConsultation);
        assert_eq!(restored.active_station, Some(room(1).id));
        assert_eq!(restored.called_from, before.called_from);
        assert_eq!(restored.call_count, before.call_count);
        assert_eq!(restored.arrival_time, before.arrival_time);
        assert_eq!(engine.active_for_station(&room(1)).await.unwrap().map(|e| e.id), Some(a));
        assert_eq!(engine.get_encounter(b).await.unwrap().status, EncounterStatus::AwaitingPhysician);

        let mut seen = 0;
        while let Some(Notification::Change(event)) = changes.try_recv() {
            assert_eq!(event.entity_id, a);
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn test_offline_store_surfaces_unavailable() {
        let h = harness(FlowPolicy::default());
        let e = h.engine.register_arrival(NewEncounter::new("Ana")).await.unwrap();

        h.store.set_available(false);
        let err = h.engine.call(e.id, &ctx(triage())).await.unwrap_err();
        assert!(err.is_retryable());

        h.store.set_available(true);
        assert_eq!(h.engine.get_encounter(e.id).await.unwrap().status, EncounterStatus::AwaitingTriage);
    }
}
