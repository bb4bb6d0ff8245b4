pub mod backend;
pub mod memory;
pub mod state;
pub mod tracker;
pub mod verify;
pub mod worker;

pub use backend::{DocId, DocOp, Document, IndexBackend, IndexSearcher};
pub use memory::MemoryBackend;
pub use state::StoreState;
pub use tracker::{IndexTracker, RecoveryReport, StoreStatus, TrackerOptions};
pub use verify::{ApplyFailure, DriftReport};
