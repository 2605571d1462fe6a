//! Session entity and its lockable stores

pub mod file_store;
pub mod keeper;
pub mod memory;
pub mod model;
pub mod repository;

pub use file_store::FileSessionRepository;
pub use keeper::LeaseKeeper;
pub use memory::InMemorySessionRepository;
pub use model::{
    HistoryEntry, MetadataPatch, MetadataUpdate, Session, SessionMetadata, WorkflowMetadata,
    DEFAULT_SESSION_TTL_DAYS,
};
pub use repository::{process_holder, Lease, SessionRepository};
