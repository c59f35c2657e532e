//! # Cronvault Store
//!
//! Database-backed persistence for the Cronvault clustered scheduler.
//!
//! N scheduler instances share one relational database and coordinate
//! through it alone: named lock rows serialize the critical sections,
//! conditional state updates make every hand-off race-safe, and a
//! check-in table lets survivors detect and recover a crashed peer's
//! in-flight work. SQLite is the bundled product; other databases plug
//! in through the [`DriverDelegate`] and [`LockHandler`] seams.

mod dberr;
pub mod delegate;
pub mod lock;
pub mod recovery;
pub mod schema;
pub mod store;

pub use delegate::{DriverDelegate, SqliteDelegate, StdSqlDelegate, rtp};
pub use lock::{
    LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS, LockHandler, StdRowLockSemaphore,
    UpdateLockRowSemaphore,
};
pub use recovery::SchedulerStateRecord;
pub use store::{AcquiredFire, FiredDisposition, FiredRecord, JobStore};
