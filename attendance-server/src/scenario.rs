//! 场景回放
//!
//! 按顺序执行脚本化的工作站操作，使用内存存储和手动时钟，输出每一步的结果。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use attendance_admin::AttendanceConfig;
use attendance_core::{
    Acuity, ChecklistItemDetails, Clock, EncounterStatus, FlowError, ManualClock, NewEncounter, StationDescriptor,
    StationRole,
};
use attendance_notify::ChangeNotifier;
use attendance_store::MemoryStore;
use attendance_workflow::{CommandContext, CommandOutcome, FlowCommand, FlowEngine, SelectOutcome};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// 场景文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// 手动时钟起点，缺省为当前时间
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// 追加到配置中的工作站
    #[serde(default)]
    pub stations: Vec<StationDescriptor>,
    pub steps: Vec<Step>,
}

/// 场景步骤；`patient` 和 `item` 是场景内的别名
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Arrive {
        patient: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        acuity: Option<Acuity>,
    },
    Advance {
        seconds: i64,
    },
    Command {
        station: String,
        patient: String,
        #[serde(flatten)]
        command: FlowCommand,
        #[serde(default)]
        expect_rejection: bool,
    },
    Select {
        station: String,
        patient: String,
    },
    AddItem {
        patient: String,
        item: String,
        details: ChecklistItemDetails,
    },
    Administer {
        item: String,
        by: String,
        #[serde(default)]
        expect_rejection: bool,
    },
    Sweep,
    Expect {
        patient: String,
        status: EncounterStatus,
        #[serde(default)]
        call_count: Option<u32>,
        #[serde(default)]
        examiner_locked: Option<bool>,
    },
    Queue {
        role: StationRole,
        /// 期望的队列顺序（别名）
        #[serde(default)]
        order: Option<Vec<String>>,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Arrive { .. } => "arrive",
            Self::Advance { .. } => "advance",
            Self::Command { .. } => "command",
            Self::Select { .. } => "select",
            Self::AddItem { .. } => "add_item",
            Self::Administer { .. } => "administer",
            Self::Sweep => "sweep",
            Self::Expect { .. } => "expect",
            Self::Queue { .. } => "queue",
        }
    }
}

/// 单步结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub index: usize,
    pub action: String,
    pub ok: bool,
    pub detail: String,
}

/// 回放报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub steps: Vec<StepReport>,
    pub final_statuses: HashMap<String, EncounterStatus>,
}

impl ReplayReport {
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

impl Scenario {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse scenario")
    }

    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read scenario file: {}", path))?;
        Self::from_json(&content)
    }
}

/// 场景执行器
pub struct Replayer {
    engine: FlowEngine,
    clock: Arc<ManualClock>,
    stations: HashMap<String, StationDescriptor>,
    patients: HashMap<String, Uuid>,
    items: HashMap<String, Uuid>,
}

impl Replayer {
    pub fn new(config: &AttendanceConfig, scenario: &Scenario) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(scenario.start.unwrap_or_else(Utc::now)));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let notifier = Arc::new(ChangeNotifier::new(config.notifier.clone()));
        let engine = FlowEngine::new(store, notifier, config.flow.clone())?;

        let stations = config
            .stations
            .iter()
            .chain(scenario.stations.iter())
            .map(|s| (s.id.as_str().to_string(), s.clone()))
            .collect();

        Ok(Self {
            engine,
            clock,
            stations,
            patients: HashMap::new(),
            items: HashMap::new(),
        })
    }

    fn station(&self, id: &str) -> Result<&StationDescriptor> {
        self.stations
            .get(id)
            .with_context(|| format!("Unknown station: {}", id))
    }

    fn patient(&self, alias: &str) -> Result<Uuid> {
        self.patients
            .get(alias)
            .copied()
            .with_context(|| format!("Unknown patient alias: {}", alias))
    }

    fn alias_of(&self, id: Uuid) -> String {
        self.patients
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub async fn run(mut self, scenario: &Scenario) -> Result<ReplayReport> {
        let mut steps = Vec::with_capacity(scenario.steps.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            let (ok, detail) = self.run_step(step).await?;
            info!("Step {} {}: {}", index, step.name(), detail);
            steps.push(StepReport {
                index,
                action: step.name().to_string(),
                ok,
                detail,
            });
        }

        let mut final_statuses = HashMap::new();
        for (alias, id) in &self.patients {
            let encounter = self.engine.get_encounter(*id).await?;
            final_statuses.insert(alias.clone(), encounter.status);
        }

        Ok(ReplayReport { steps, final_statuses })
    }

    /// 返回 (是否符合预期, 描述)；场景本身的错误（未知别名等）直接返回 Err
    async fn run_step(&mut self, step: &Step) -> Result<(bool, String)> {
        match step {
            Step::Arrive { patient, name, acuity } => {
                if self.patients.contains_key(patient) {
                    bail!("Duplicate patient alias: {}", patient);
                }
                let mut new = NewEncounter::new(name.clone().unwrap_or_else(|| patient.clone()));
                new.acuity = *acuity;
                let encounter = self.engine.register_arrival(new).await?;
                self.patients.insert(patient.clone(), encounter.id);
                Ok((true, format!("{} arrived as {}", patient, encounter.id)))
            }
            Step::Advance { seconds } => {
                self.clock.advance(Duration::seconds(*seconds));
                Ok((true, format!("clock at {}", self.clock.now())))
            }
            Step::Command {
                station,
                patient,
                command,
                expect_rejection,
            } => {
                let ctx = CommandContext::new(self.station(station)?.clone());
                let id = self.patient(patient)?;
                let result = self.engine.execute(id, command.clone(), &ctx).await;
                Ok(match result {
                    Ok(CommandOutcome::Applied(e)) => {
                        (!expect_rejection, format!("{} {} -> {}", command.name(), patient, e.status))
                    }
                    Ok(CommandOutcome::Locked(e)) => (
                        !expect_rejection,
                        format!("{} {} ignored, examiner lock ({})", command.name(), patient, e.status),
                    ),
                    Err(err) => (*expect_rejection, format!("{} {} rejected: {}", command.name(), patient, err)),
                })
            }
            Step::Select { station, patient } => {
                let ctx = CommandContext::new(self.station(station)?.clone());
                let id = self.patient(patient)?;
                Ok(match self.engine.select(id, &ctx).await {
                    Ok(SelectOutcome::Called { called, swapped_out }) => {
                        let swapped = swapped_out
                            .map(|s| format!(", swapped out {}", self.alias_of(s.id)))
                            .unwrap_or_default();
                        (true, format!("{} called at {}{}", patient, station, swapped))
                    }
                    Ok(SelectOutcome::Locked { current }) => (
                        true,
                        format!("selection ignored, {} is locked", self.alias_of(current.id)),
                    ),
                    Err(err) => (false, format!("select {} rejected: {}", patient, err)),
                })
            }
            Step::AddItem { patient, item, details } => {
                let id = self.patient(patient)?;
                Ok(match self.engine.checklist().add_item(id, details.clone(), None).await {
                    Ok(added) => {
                        self.items.insert(item.clone(), added.id);
                        (true, format!("added {} to {}", added.name, patient))
                    }
                    Err(err) => (false, format!("add {} rejected: {}", item, err)),
                })
            }
            Step::Administer {
                item,
                by,
                expect_rejection,
            } => {
                let id = self
                    .items
                    .get(item)
                    .copied()
                    .with_context(|| format!("Unknown item alias: {}", item))?;
                Ok(match self.engine.checklist().administer(id, by, None).await {
                    Ok(_) => (!expect_rejection, format!("{} administered by {}", item, by)),
                    Err(err @ FlowError::AlreadyAdministered(_)) => (*expect_rejection, err.to_string()),
                    Err(err) => (*expect_rejection, format!("administer {} rejected: {}", item, err)),
                })
            }
            Step::Sweep => {
                let cancelled = self.engine.sweep_absences().await?;
                let names: Vec<String> = cancelled.iter().map(|e| self.alias_of(e.id)).collect();
                Ok((true, format!("cancelled [{}]", names.join(", "))))
            }
            Step::Expect {
                patient,
                status,
                call_count,
                examiner_locked,
            } => {
                let encounter = self.engine.get_encounter(self.patient(patient)?).await?;
                let mut mismatches = Vec::new();
                if encounter.status != *status {
                    mismatches.push(format!("status {} != {}", encounter.status, status));
                }
                if let Some(expected) = call_count {
                    if encounter.call_count != *expected {
                        mismatches.push(format!("call_count {} != {}", encounter.call_count, expected));
                    }
                }
                if let Some(expected) = examiner_locked {
                    if encounter.examiner_locked != *expected {
                        mismatches.push(format!("examiner_locked {} != {}", encounter.examiner_locked, expected));
                    }
                }
                Ok(if mismatches.is_empty() {
                    (true, format!("{} is {}", patient, status))
                } else {
                    (false, format!("{}: {}", patient, mismatches.join("; ")))
                })
            }
            Step::Queue { role, order } => {
                let view = self.engine.queue_view(*role).await?;
                let actual: Vec<String> = view.queue.iter().map(|e| self.alias_of(e.id)).collect();
                let ok = order.as_ref().map(|expected| expected == &actual).unwrap_or(true);
                Ok((ok, format!("{} queue [{}]", role.as_str(), actual.join(", "))))
            }
        }
    }
}

/// 回放场景
pub async fn replay(config: &AttendanceConfig, scenario: &Scenario) -> Result<ReplayReport> {
    Replayer::new(config, scenario)?.run(scenario).await
}
