pub mod backup;
pub mod segment;
pub mod wal;

pub use backup::{BackupCoordinator, BackupOutcome};
pub use segment::{SegmentData, SegmentStore};
pub use wal::{PendingTask, WalStore};
