//! In-memory registries.
//!
//! Four independent stores, owned exclusively by the router task, so no
//! locking is involved. All state is rebuilt from reconnects; nothing
//! persists across restarts.

pub mod entities;
pub mod service_tasks;
pub mod tasks;

pub use entities::{AgentRegistry, EntityFilter, EntityRegistry, ServiceRegistry};
pub use service_tasks::ServiceTaskRegistry;
pub use tasks::TaskRegistry;
