//! Common types shared across Switchboard crates.
//!
//! This crate provides the wire envelope, the task and entity data model,
//! the error taxonomy, and the request/response correlation manager used
//! by both the orchestrator and peer SDKs.

pub mod correlation;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod task;

pub use correlation::{CorrelationKey, Correlations, MatchBy};
pub use entity::{Agent, Entity, EntityStatus, Service, ServiceKind};
pub use envelope::{now_millis, Envelope, Payload};
pub use error::{Result, SwitchboardError};
pub use task::{HistoryEntry, ServiceTask, ServiceTaskError, Task, TaskStatus};
