//! Dual-tier memory subsystem.
//!
//! Two stores behind one record shape: a volatile, TTL-bounded in-process
//! store scoped to running workflows, and a persistent multi-tenant backend
//! for long-term recall. The [`MemoryManager`] coordinates dual writes,
//! tenant-filtered reads, and end-of-workflow archival between them.

pub mod manager;
pub mod persistent;
pub mod record;
pub mod volatile;

pub use manager::{ContextSnapshot, MemoryManager};
pub use persistent::{InMemoryPersistentBackend, PersistentMemoryBackend};
pub use record::{MemoryError, MemoryQuery, MemoryRecord};
pub use volatile::VolatileMemoryStore;
