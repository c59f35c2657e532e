//! Error taxonomy shared by the store and the engine.
//!
//! The acquisition/recovery loops never propagate these out; they are
//! classified at the loop boundary into "retry next tick", "skip this
//! tick", or "abort startup".

use thiserror::Error;

/// Errors raised by the persistent store and the lock manager.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection loss, busy database, lock-wait timeout at the database
    /// level. The calling loop retries on its next tick; never surfaced to
    /// job code.
    #[error("transient database error: {0}")]
    Transient(String),

    /// Referential or uniqueness violation (duplicate key, trigger for a
    /// missing job). Surfaced to the caller as a rejected operation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// An optimistic conditional update affected zero rows: the row was
    /// changed or deleted underneath us. The subject is treated as no
    /// longer eligible and dropped from the current batch.
    #[error("serialization conflict: {0}")]
    SerializationConflict(String),

    /// The named cluster lock could not be obtained within the bounded
    /// wait. The acquisition cycle skips this tick.
    #[error("timed out waiting for cluster lock '{0}'")]
    LockTimeout(String),

    /// A trigger carries a misfire instruction the store cannot apply.
    /// The trigger is moved to the ERROR state.
    #[error("misfire policy error on trigger {trigger}: {reason}")]
    MisfirePolicy { trigger: String, reason: String },

    /// Unrecoverable: schema missing or corrupt, poisoned connection.
    /// Aborts instance initialization.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// True when the caller should simply retry on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::LockTimeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
