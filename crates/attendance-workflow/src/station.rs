//! 工作站控制器
//!
//! 每个工作站持有一份就诊快照和通知订阅。命令确认后先把返回的记录作为
//! 推测更新叠加到本地，收到该就诊的权威通知时整体丢弃推测并重新拉取。

use std::collections::HashMap;
use std::sync::Arc;

use attendance_core::{ChecklistItem, Encounter, FlowError, Result, StationDescriptor, StationRole};
use attendance_notify::{ChangeNotifier, Collection, Notification, PageEvent, PageSubscription, Subscription};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{CommandContext, CommandOutcome, FlowEngine, SelectOutcome};
use crate::queue::QueueView;
use crate::state_machine::FlowCommand;

/// 已确认但尚未收到权威通知的本地更新
#[derive(Debug, Clone)]
struct Speculation {
    correlation_id: Uuid,
    encounter: Encounter,
}

/// 大屏上的叫号横幅
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBanner {
    pub page: PageEvent,
    pub expires_at: DateTime<Utc>,
}

/// 工作站控制器
#[derive(Debug)]
pub struct StationController {
    descriptor: StationDescriptor,
    engine: Arc<FlowEngine>,
    subscription: Subscription,
    pages: Option<PageSubscription>,
    authoritative: HashMap<Uuid, Encounter>,
    speculative: HashMap<Uuid, Speculation>,
    checklist: HashMap<Uuid, Vec<ChecklistItem>>,
    banners: Vec<PageBanner>,
    banner_ttl: Duration,
}

fn collections_for(role: StationRole) -> &'static [Collection] {
    match role {
        StationRole::Display => &[Collection::Encounters],
        StationRole::BedDesk => &[Collection::Encounters, Collection::Notes],
        _ => &Collection::ALL,
    }
}

impl StationController {
    /// 订阅后立即全量拉取，订阅先于拉取建立，期间的变更不会丢失
    pub async fn connect(
        descriptor: StationDescriptor,
        engine: Arc<FlowEngine>,
        notifier: &ChangeNotifier,
        banner_ttl: Duration,
    ) -> Result<Self> {
        let subscription = notifier.subscribe(collections_for(descriptor.role));
        let pages = (descriptor.role == StationRole::Display).then(|| notifier.subscribe_pages());

        let mut controller = Self {
            descriptor,
            engine,
            subscription,
            pages,
            authoritative: HashMap::new(),
            speculative: HashMap::new(),
            checklist: HashMap::new(),
            banners: Vec::new(),
            banner_ttl,
        };
        controller.refresh().await?;

        info!(
            "Station {} ({}) connected with {} encounters",
            controller.descriptor.id,
            controller.descriptor.role.as_str(),
            controller.authoritative.len()
        );
        Ok(controller)
    }

    pub fn descriptor(&self) -> &StationDescriptor {
        &self.descriptor
    }

    fn tracks_checklist(&self) -> bool {
        matches!(self.descriptor.role, StationRole::Physician | StationRole::Nursing)
    }

    /// 全量刷新，丢弃所有推测更新
    pub async fn refresh(&mut self) -> Result<()> {
        let encounters = self.engine.list_encounters().await?;
        self.authoritative = encounters.into_iter().map(|e| (e.id, e)).collect();
        self.speculative.clear();

        self.checklist.clear();
        if self.tracks_checklist() {
            let eligible: Vec<Uuid> = self
                .authoritative
                .values()
                .filter(|e| e.status.is_medication_eligible())
                .map(|e| e.id)
                .collect();
            for encounter_id in eligible {
                self.reload_items(encounter_id).await?;
            }
        }
        Ok(())
    }

    async fn reload_encounter(&mut self, id: Uuid) -> Result<()> {
        self.speculative.remove(&id);
        match self.engine.get_encounter(id).await {
            Ok(encounter) => {
                self.authoritative.insert(id, encounter);
                Ok(())
            }
            Err(FlowError::NotFound(_)) => {
                self.authoritative.remove(&id);
                self.checklist.remove(&id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn reload_items(&mut self, encounter_id: Uuid) -> Result<()> {
        let items = self.engine.checklist().items(encounter_id).await?;
        self.checklist.insert(encounter_id, items);
        Ok(())
    }

    /// 处理一条通知
    pub async fn handle_notification(&mut self, notification: Notification) -> Result<()> {
        match notification {
            Notification::Resync => {
                warn!("Station {} resyncing after lost notifications", self.descriptor.id);
                self.refresh().await
            }
            Notification::Change(event) => {
                if let Some(speculation) = self.speculative.get(&event.encounter_id) {
                    if event.correlation_id == Some(speculation.correlation_id) {
                        debug!(
                            "Station {} received confirmation for command {}",
                            self.descriptor.id, speculation.correlation_id
                        );
                    }
                }
                match event.collection {
                    Collection::ChecklistItems => {
                        if self.tracks_checklist() {
                            self.reload_items(event.encounter_id).await?;
                        }
                        Ok(())
                    }
                    Collection::Encounters | Collection::Vitals | Collection::Notes => {
                        self.reload_encounter(event.encounter_id).await?;
                        let eligible = self
                            .authoritative
                            .get(&event.encounter_id)
                            .map(|e| e.status.is_medication_eligible())
                            .unwrap_or(false);
                        if self.tracks_checklist() && eligible && !self.checklist.contains_key(&event.encounter_id) {
                            self.reload_items(event.encounter_id).await?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// 处理所有已到达的通知和叫号，返回处理的通知数
    pub async fn poll(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(notification) = self.subscription.try_recv() {
            self.handle_notification(notification).await?;
            handled += 1;
        }
        self.poll_pages();
        Ok(handled)
    }

    /// 等待下一条通知；通知器关闭后返回 false
    pub async fn next_notification(&mut self) -> Result<bool> {
        match self.subscription.recv().await {
            Some(notification) => {
                self.handle_notification(notification).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 本地视图中的就诊（推测更新优先）
    pub fn encounter(&self, id: Uuid) -> Option<&Encounter> {
        self.speculative
            .get(&id)
            .map(|s| &s.encounter)
            .or_else(|| self.authoritative.get(&id))
    }

    pub fn has_speculation(&self, id: Uuid) -> bool {
        self.speculative.contains_key(&id)
    }

    fn merged(&self) -> Vec<Encounter> {
        self.authoritative
            .keys()
            .filter_map(|id| self.encounter(*id).cloned())
            .collect()
    }

    /// 当前工作站的队列视图
    pub fn view(&self) -> QueueView {
        QueueView::build(&self.merged(), self.descriptor.role, self.engine.policy().absentee_order)
    }

    pub fn checklist_items(&self, encounter_id: Uuid) -> &[ChecklistItem] {
        self.checklist.get(&encounter_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn context_for(&self, id: Uuid) -> CommandContext {
        let ctx = CommandContext::new(self.descriptor.clone());
        match self.encounter(id) {
            Some(local) => ctx.with_expected_version(local.version),
            None => ctx,
        }
    }

    fn speculate(&mut self, correlation_id: Uuid, encounter: Encounter) {
        self.speculative.insert(
            encounter.id,
            Speculation {
                correlation_id,
                encounter,
            },
        );
    }

    async fn on_conflict(&mut self, id: Uuid, err: &FlowError) -> Result<()> {
        if matches!(err, FlowError::ConcurrentModification { .. }) {
            info!("Station {} lost a race on encounter {}, refetching", self.descriptor.id, id);
            self.reload_encounter(id).await?;
        }
        Ok(())
    }

    /// 以本地看到的版本执行命令
    pub async fn execute(&mut self, id: Uuid, command: FlowCommand) -> Result<CommandOutcome> {
        let ctx = self.context_for(id);
        match self.engine.execute(id, command, &ctx).await {
            Ok(CommandOutcome::Applied(encounter)) => {
                self.speculate(ctx.correlation_id, encounter.clone());
                Ok(CommandOutcome::Applied(encounter))
            }
            Ok(locked) => Ok(locked),
            Err(err) => {
                self.on_conflict(id, &err).await?;
                Err(err)
            }
        }
    }

    pub async fn call(&mut self, id: Uuid) -> Result<CommandOutcome> {
        self.execute(id, FlowCommand::Call).await
    }

    /// 选择候诊者，必要时先换出本工作站当前就诊
    pub async fn select(&mut self, id: Uuid) -> Result<SelectOutcome> {
        let ctx = self.context_for(id);
        match self.engine.select(id, &ctx).await {
            Ok(SelectOutcome::Called { called, swapped_out }) => {
                if let Some(swapped) = &swapped_out {
                    self.speculate(ctx.correlation_id, swapped.clone());
                }
                self.speculate(ctx.correlation_id, called.clone());
                Ok(SelectOutcome::Called { called, swapped_out })
            }
            Ok(locked) => Ok(locked),
            Err(err) => {
                self.on_conflict(id, &err).await?;
                // 换出可能已被撤销，本地的当前就诊需要重新拉取
                let active: Vec<Uuid> = self
                    .merged()
                    .into_iter()
                    .filter(|e| e.id != id && e.active_station.as_ref() == Some(&self.descriptor.id))
                    .map(|e| e.id)
                    .collect();
                for active_id in active {
                    if let Err(reload_err) = self.reload_encounter(active_id).await {
                        warn!(
                            "Station {} could not refetch encounter {}: {}",
                            self.descriptor.id, active_id, reload_err
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// 呼叫队列中的下一位，队列为空时返回 None
    pub async fn call_next(&mut self) -> Result<Option<SelectOutcome>> {
        let Some(next) = self.view().next_waiting().map(|e| e.id) else {
            return Ok(None);
        };
        self.select(next).await.map(Some)
    }

    /// 执行清单项；重复执行返回 `AlreadyAdministered` 并刷新本地清单
    pub async fn administer(&mut self, item_id: Uuid, by: &str) -> Result<ChecklistItem> {
        let correlation_id = Uuid::new_v4();
        match self.engine.checklist().administer(item_id, by, Some(correlation_id)).await {
            Ok(item) => {
                if let Some(items) = self.checklist.get_mut(&item.encounter_id) {
                    if let Some(slot) = items.iter_mut().find(|i| i.id == item.id) {
                        *slot = item.clone();
                    }
                }
                Ok(item)
            }
            Err(err) => {
                let encounter_id = self
                    .checklist
                    .iter()
                    .find(|(_, items)| items.iter().any(|i| i.id == item_id))
                    .map(|(id, _)| *id);
                if let Some(encounter_id) = encounter_id {
                    self.reload_items(encounter_id).await?;
                }
                Err(err)
            }
        }
    }

    /// 读取新的叫号并生成横幅，同一就诊的旧横幅被替换
    pub fn poll_pages(&mut self) -> usize {
        let Some(pages) = self.pages.as_mut() else {
            return 0;
        };
        let mut received = 0;
        while let Some(page) = pages.try_recv() {
            self.banners.retain(|b| b.page.encounter_id != page.encounter_id);
            self.banners.push(PageBanner {
                expires_at: page.at + self.banner_ttl,
                page,
            });
            received += 1;
        }
        received
    }

    pub fn active_banners(&self, now: DateTime<Utc>) -> Vec<&PageBanner> {
        self.banners.iter().filter(|b| b.expires_at > now).collect()
    }

    /// 移除过期横幅，只影响本地显示
    pub fn expire_banners(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.banners.len();
        self.banners.retain(|b| b.expires_at > now);
        before - self.banners.len()
    }
}
