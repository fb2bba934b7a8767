//! # 就诊流转模块
//!
//! 状态机、优先级队列、用药清单、流转引擎和工作站控制器。

pub mod checklist;
pub mod engine;
pub mod metrics;
pub mod queue;
pub mod state_machine;
pub mod station;

pub use checklist::{ChecklistManager, ChecklistProgress};
pub use engine::{CommandContext, CommandOutcome, FlowEngine, SelectOutcome};
pub use metrics::FlowMetrics;
pub use queue::{build_absentees, build_queue, QueueView};
pub use state_machine::{desk_role, FlowCommand, FlowStateMachine, PageKind, Transition, TransitionOutcome};
pub use station::{PageBanner, StationController};
