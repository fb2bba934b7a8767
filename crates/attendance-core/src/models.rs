//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{FlowError, Result};

/// 未分级患者的排序等级
pub const UNSET_ACUITY_RANK: u8 = 99;

/// 分诊颜色等级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Acuity {
    Red,    // 立即
    Orange, // 极紧急
    Yellow, // 紧急
    Green,  // 次紧急
    Blue,   // 非紧急
}

impl Acuity {
    /// 排序等级，数值越小越优先
    pub fn rank(&self) -> u8 {
        match self {
            Self::Red => 1,
            Self::Orange => 2,
            Self::Yellow => 3,
            Self::Green => 4,
            Self::Blue => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Orange => "orange",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Blue => "blue",
        }
    }
}

impl TryFrom<&str> for Acuity {
    type Error = FlowError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "red" => Ok(Self::Red),
            "orange" => Ok(Self::Orange),
            "yellow" => Ok(Self::Yellow),
            "green" => Ok(Self::Green),
            "blue" => Ok(Self::Blue),
            _ => Err(FlowError::Validation(format!("Unknown acuity: {}", value))),
        }
    }
}

/// 可选分诊等级的排序值，未分级排在最后
pub fn acuity_rank(acuity: Option<Acuity>) -> u8 {
    acuity.map(|a| a.rank()).unwrap_or(UNSET_ACUITY_RANK)
}

/// 就诊状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EncounterStatus {
    AwaitingTriage,       // 等待分诊
    InTriage,             // 分诊中
    AwaitingTriageAbsent, // 分诊呼叫未到
    AwaitingPhysician,    // 等待医生
    AwaitingReevaluation, // 等待复诊
    InConsultation,       // 诊疗中
    Absent,               // 诊疗呼叫未到
    InObservation,        // 用药/观察中
    AwaitingBed,          // 等待床位
    Finalized,            // 已结束
    Cancelled,            // 已取消
}

impl EncounterStatus {
    pub const ALL: [EncounterStatus; 11] = [
        Self::AwaitingTriage,
        Self::InTriage,
        Self::AwaitingTriageAbsent,
        Self::AwaitingPhysician,
        Self::AwaitingReevaluation,
        Self::InConsultation,
        Self::Absent,
        Self::InObservation,
        Self::AwaitingBed,
        Self::Finalized,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingTriage => "awaiting_triage",
            Self::InTriage => "in_triage",
            Self::AwaitingTriageAbsent => "awaiting_triage_absent",
            Self::AwaitingPhysician => "awaiting_physician",
            Self::AwaitingReevaluation => "awaiting_reevaluation",
            Self::InConsultation => "in_consultation",
            Self::Absent => "absent",
            Self::InObservation => "in_observation",
            Self::AwaitingBed => "awaiting_bed",
            Self::Finalized => "finalized",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled)
    }

    /// 可被呼叫的候诊状态
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::AwaitingTriage | Self::AwaitingPhysician | Self::AwaitingReevaluation
        )
    }

    /// 正在某个工作站接受检查
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InTriage | Self::InConsultation)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::AwaitingTriageAbsent | Self::Absent)
    }

    /// 分诊等级参与排序的状态
    pub fn is_queueable(&self) -> bool {
        self.is_waiting() || self.is_active() || matches!(self, Self::InObservation | Self::AwaitingBed)
    }

    /// 允许录入用药清单的状态
    pub fn is_medication_eligible(&self) -> bool {
        matches!(
            self,
            Self::InConsultation | Self::InObservation | Self::AwaitingReevaluation | Self::AwaitingBed
        )
    }
}

impl fmt::Display for EncounterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for EncounterStatus {
    type Error = FlowError;

    fn try_from(value: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| FlowError::Validation(format!("Unknown encounter status: {}", value)))
    }
}

/// 工作站角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StationRole {
    Triage,    // 分诊台
    Physician, // 诊室
    Nursing,   // 护理站
    BedDesk,   // 床位调度
    Display,   // 公共叫号屏
}

impl StationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Physician => "physician",
            Self::Nursing => "nursing",
            Self::BedDesk => "bed_desk",
            Self::Display => "display",
        }
    }
}

/// 工作站标识
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StationId(pub String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 工作站描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationDescriptor {
    pub id: StationId,
    pub role: StationRole,
    /// 叫号时显示的目的地，例如 "诊室 2"
    pub label: String,
}

impl StationDescriptor {
    pub fn new(id: impl Into<String>, role: StationRole, label: impl Into<String>) -> Self {
        Self {
            id: StationId::new(id),
            role,
            label: label.into(),
        }
    }
}

/// 患者信息快照（仅用于显示）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PatientSnapshot {
    pub display_name: String,
    pub social_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
}

impl PatientSnapshot {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    /// 叫号使用的名字，社会名优先
    pub fn paging_name(&self) -> &str {
        match self.social_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.display_name,
        }
    }
}

/// 临床文书字段（核心不解析其内容）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClinicalNarrative {
    pub chief_complaint: Option<String>,
    pub history: Option<String>,
    pub physical_exam: Option<String>,
    pub diagnosis: Option<String>,
    pub orders: Option<String>,
    pub allergies: Option<String>,
}

impl ClinicalNarrative {
    /// 用更新中给出的字段覆盖当前值
    pub fn merge(&mut self, update: ClinicalNarrative) {
        if update.chief_complaint.is_some() {
            self.chief_complaint = update.chief_complaint;
        }
        if update.history.is_some() {
            self.history = update.history;
        }
        if update.physical_exam.is_some() {
            self.physical_exam = update.physical_exam;
        }
        if update.diagnosis.is_some() {
            self.diagnosis = update.diagnosis;
        }
        if update.orders.is_some() {
            self.orders = update.orders;
        }
        if update.allergies.is_some() {
            self.allergies = update.allergies;
        }
    }
}

/// 生命体征
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VitalSigns {
    pub systolic_bp: Option<u16>,
    pub diastolic_bp: Option<u16>,
    pub heart_rate: Option<u16>,
    pub respiratory_rate: Option<u16>,
    pub temperature_celsius: Option<f32>,
    pub oxygen_saturation: Option<u8>,
    pub glucose_mg_dl: Option<u16>,
    pub pain_score: Option<u8>,
    pub measured_at: DateTime<Utc>,
}

impl VitalSigns {
    /// 校验生理范围
    pub fn validate(&self) -> Result<()> {
        fn check<T: PartialOrd + fmt::Display + Copy>(
            field: &str,
            value: Option<T>,
            min: T,
            max: T,
        ) -> Result<()> {
            match value {
                Some(v) if v < min || v > max => Err(FlowError::Validation(format!(
                    "{} out of range: {} (expected {}..={})",
                    field, v, min, max
                ))),
                _ => Ok(()),
            }
        }

        check("systolic_bp", self.systolic_bp, 30, 300)?;
        check("diastolic_bp", self.diastolic_bp, 10, 200)?;
        check("heart_rate", self.heart_rate, 10, 300)?;
        check("respiratory_rate", self.respiratory_rate, 2, 80)?;
        check("temperature_celsius", self.temperature_celsius, 25.0, 45.0)?;
        check("oxygen_saturation", self.oxygen_saturation, 30, 100)?;
        check("glucose_mg_dl", self.glucose_mg_dl, 10, 1500)?;
        check("pain_score", self.pain_score, 0, 10)?;

        if let (Some(sys), Some(dia)) = (self.systolic_bp, self.diastolic_bp) {
            if dia >= sys {
                return Err(FlowError::Validation(format!(
                    "diastolic_bp {} must be lower than systolic_bp {}",
                    dia, sys
                )));
            }
        }
        Ok(())
    }
}

/// 就诊记录（流转单元）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Encounter {
    pub id: Uuid,
    pub patient_ref: Uuid,
    pub patient: PatientSnapshot,
    pub status: EncounterStatus,
    pub acuity: Option<Acuity>,
    pub arrival_time: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    /// 本轮缺席首次标记时间
    pub absence_anchor: Option<DateTime<Utc>>,
    pub call_count: u32,
    /// 经召回激活后的检查锁
    pub examiner_locked: bool,
    pub active_station: Option<StationId>,
    /// 本次激活前所处的候诊状态
    pub called_from: Option<EncounterStatus>,
    pub bed_request_priority: Option<Acuity>,
    pub bed_request_time: Option<DateTime<Utc>>,
    pub bed_justification: Option<String>,
    pub narrative: ClinicalNarrative,
    pub vitals: Option<VitalSigns>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Encounter {
    /// 登记新到达的就诊
    pub fn register(new: NewEncounter, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_ref: new.patient_ref,
            patient: new.patient,
            status: EncounterStatus::AwaitingTriage,
            acuity: new.acuity,
            arrival_time: now,
            state_changed_at: now,
            absence_anchor: None,
            call_count: 0,
            examiner_locked: false,
            active_station: None,
            called_from: None,
            bed_request_priority: None,
            bed_request_time: None,
            bed_justification: None,
            narrative: ClinicalNarrative {
                chief_complaint: new.chief_complaint,
                ..Default::default()
            },
            vitals: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn acuity_rank(&self) -> u8 {
        acuity_rank(self.acuity)
    }

    /// 床位队列使用的优先级，未单独设置时沿用分诊等级
    pub fn bed_rank(&self) -> u8 {
        acuity_rank(self.bed_request_priority.or(self.acuity))
    }
}

/// 新就诊登记请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEncounter {
    pub patient_ref: Uuid,
    pub patient: PatientSnapshot,
    pub acuity: Option<Acuity>,
    pub chief_complaint: Option<String>,
}

impl NewEncounter {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            patient_ref: Uuid::new_v4(),
            patient: PatientSnapshot::new(display_name),
            acuity: None,
            chief_complaint: None,
        }
    }

    pub fn with_acuity(mut self, acuity: Acuity) -> Self {
        self.acuity = Some(acuity);
        self
    }

    pub fn with_chief_complaint(mut self, complaint: impl Into<String>) -> Self {
        self.chief_complaint = Some(complaint.into());
        self
    }
}

/// 诊疗结束去向
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Disposition {
    Discharge,
    Observation,
    BedRequest {
        justification: String,
        priority: Option<Acuity>,
    },
}

/// 混合药物的组成成分
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompositeComponent {
    pub name: String,
    pub dose: Option<String>,
}

/// 用药/医嘱清单项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItem {
    pub id: Uuid,
    pub encounter_id: Uuid,
    pub name: String,
    pub dose: Option<String>,
    pub route: Option<String>,
    pub instructions: Option<String>,
    pub components: Vec<CompositeComponent>,
    pub administered: bool,
    pub administered_at: Option<DateTime<Utc>>,
    pub administered_by: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl ChecklistItem {
    pub fn new(encounter_id: Uuid, details: ChecklistItemDetails, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            encounter_id,
            name: details.name,
            dose: details.dose,
            route: details.route,
            instructions: details.instructions,
            components: details.components,
            administered: false,
            administered_at: None,
            administered_by: None,
            version: 0,
            created_at: now,
        }
    }

    /// 用新描述替换描述字段
    pub fn apply_details(&mut self, details: ChecklistItemDetails) {
        self.name = details.name;
        self.dose = details.dose;
        self.route = details.route;
        self.instructions = details.instructions;
        self.components = details.components;
    }

    /// 描述字段是否与另一项一致
    pub fn same_details(&self, other: &ChecklistItem) -> bool {
        self.name == other.name
            && self.dose == other.dose
            && self.route == other.route
            && self.instructions == other.instructions
            && self.components == other.components
    }
}

/// 清单项描述字段
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItemDetails {
    pub name: String,
    pub dose: Option<String>,
    pub route: Option<String>,
    pub instructions: Option<String>,
    #[serde(default)]
    pub components: Vec<CompositeComponent>,
}

impl ChecklistItemDetails {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dose: None,
            route: None,
            instructions: None,
            components: Vec::new(),
        }
    }

    pub fn with_dose(mut self, dose: impl Into<String>) -> Self {
        self.dose = Some(dose.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_component(mut self, name: impl Into<String>, dose: Option<String>) -> Self {
        self.components.push(CompositeComponent {
            name: name.into(),
            dose,
        });
        self
    }
}

/// 文书类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Prescription,
    Certificate,
    DischargeSummary,
}

/// 交给外部文书服务的生成请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRequest {
    pub encounter_id: Uuid,
    pub kind: DocumentKind,
    pub patient: PatientSnapshot,
    pub narrative: ClinicalNarrative,
    /// 文书内容对应的已持久化版本
    pub version: u64,
    pub requested_at: DateTime<Utc>,
}
