//! # 就诊存储模块
//!
//! 就诊记录与用药清单的权威存储。所有写入都是带版本校验的单行条件更新，
//! 时间戳由存储端分配。
//!
//! - `MemoryStore`：进程内实现，默认后端
//! - `PgEncounterStore`：PostgreSQL 实现（启用 `postgres` 特性）

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod validation;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgEncounterStore;
pub use store::EncounterStore;
