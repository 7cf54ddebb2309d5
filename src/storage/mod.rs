pub mod snapshot;
pub mod wal;

pub use snapshot::{PersistedIndex, PersistedRow, PreparedSnapshot, SnapshotStore};
pub use wal::{LogRecord, WalReplayResult, WalStore};
