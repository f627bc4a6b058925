//! Error types for dispersy-engine.
//!
//! Protocol verdicts (delay, drop) are not errors; they travel as
//! [`ProtocolOutcome`] values. The types here cover the engine's own
//! failures: the scheduler, task execution, storage and the process-level
//! operations on [`Dispersy`](crate::Dispersy).

use std::time::Duration;

use dispersy_core::{ConversionError, MemberError, PolicyError, ProtocolOutcome, SignatureError};
use dispersy_types::{Cid, WireError};

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Scheduler lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `start` was called on a scheduler that already ran.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// The worker thread could not be spawned.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// `stop` was called from the worker thread itself.
    #[error("stop called from the scheduler thread")]
    StopFromWorker,

    /// The worker did not finish in time.
    #[error("scheduler did not stop within {0:?}")]
    Timeout(Duration),
}

/// The ways a task can fail.
///
/// Only [`TaskError::Failed`] is recoverable: the scheduler logs it, hands it
/// to the task's completion callback and carries on. Every other variant
/// stops the scheduler and is kept as its exception.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Ordinary failure.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task asked the process to exit.
    #[error("exit requested")]
    Exit,

    /// The task was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// An internal invariant does not hold.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Whether this error stops the scheduler.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TaskError::Failed(_))
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No community with this id.
    #[error("unknown community: {0}")]
    UnknownCommunity(Cid),

    /// No community row with this database id.
    #[error("unknown community id: {0}")]
    UnknownCommunityId(u64),

    /// A community with this id already exists.
    #[error("community already exists: {0}")]
    DuplicateCommunity(Cid),

    /// No private key stored for a member that needs one.
    #[error("no private key for member {0}")]
    MissingKey(String),
}

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum DispersyError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding error.
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Invalid meta-message or message construction.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Key handling error.
    #[error("member error: {0}")]
    Member(#[from] MemberError),

    /// Framing error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Co-signing error.
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    /// A locally created message failed its own checks.
    #[error("message refused: {0}")]
    Refused(#[from] ProtocolOutcome),

    /// The community is not loaded.
    #[error("community not loaded: {0}")]
    UnknownCommunity(Cid),

    /// No meta-message with this name.
    #[error("unknown message: {0}")]
    UnknownMessage(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DispersyError>;
