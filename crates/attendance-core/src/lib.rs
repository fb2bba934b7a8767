//! # Attendance Core
//!
//! 就诊流转系统的核心模块，提供基础数据结构、错误定义、流程策略和通用工具。

pub mod error;
pub mod models;
pub mod policy;
pub mod utils;

pub use error::{FlowError, Result};
pub use models::*;
pub use policy::{AbsenteeOrder, FlowPolicy};
pub use utils::{Clock, ManualClock, SystemClock};
