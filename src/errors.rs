//! Coordination Error Hierarchy
//!
//! Defines the error types of the coordination kernel, categorized by the
//! layer that produced them: store capability, watch stream, session,
//! distributed mutex and task execution.
//!
//! Errors describing "the stated precondition was violated" (lock exists,
//! session expired, already locked) are returned as typed variants so callers
//! can branch on them. Errors describing "cannot make progress right now" are
//! recovered inside the components and only surface through logs and
//! `on_error` callbacks.

use std::time::Duration;

use config::ConfigError;

use crate::store::LeaseId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by user supplied task operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures reported by the consistent store capability
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Watch stream failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Lease-backed session failures
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Distributed mutex failures
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Task node failures
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Encoding or decoding of persisted records
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Collector creation or registration failures
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The owning cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Unrecoverable failures requiring the caller to recreate the component
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// True if the error only reports cancellation of the caller's context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Store(StoreError::Cancelled))
    }
}

/// Errors of the consistent store capability.
///
/// `Compacted` is distinct from transient errors: a watcher anchored before
/// the compacted revision can never catch up and must be restarted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Requested history has been removed by compaction
    #[error("required revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted { requested: i64, compact_revision: i64 },

    /// Store endpoint unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Lease expired or never granted
    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// Request did not complete in time
    #[error("Store request timeout after {0:?}")]
    Timeout(Duration),

    /// Request was cancelled by the caller
    #[error("Store request cancelled")]
    Cancelled,

    /// Malformed request, e.g. an invalid TTL
    #[error("Invalid store request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The first watch attempt failed before the watcher was established
    #[error("watch init error: {0}")]
    Init(#[source] Box<Error>),

    /// Recoverable error reported by an established watcher
    #[error("watch error: {0}")]
    Stream(#[source] StoreError),

    /// The stream ended before the watcher was established
    #[error("watch cancelled before the watcher was created")]
    CancelledBeforeCreated,

    /// The consumer stopped before reaching the steady state
    #[error("watch consumer closed: {0}")]
    ConsumerClosed(String),

    /// The stream gave up re-creating the watcher
    #[error("watch restart retries exhausted: {0}")]
    RetriesExhausted(String),

    /// A consumer was built without the mandatory `for_each` callback
    #[error("watch consumer of \"{0}\" requires a for_each callback")]
    MissingForEach(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// There is no active session, e.g. during a network outage
    #[error("no active session")]
    NoSession,

    /// The lease of the session has expired
    #[error("session expired")]
    Expired,

    /// Lease grant did not finish in time
    #[error("session grant timeout after {0:?}")]
    GrantTimeout(Duration),

    /// An `on_session` callback rejected the new session
    #[error("callback OnSession[{index}] failed: {message}")]
    Callback { index: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Lock is held by another holder, expected outcome of `try_lock`
    #[error("already locked: {reason}")]
    AlreadyLocked { reason: String },

    /// `unlock` called on a mutex which is not locked
    #[error("not locked")]
    NotLocked,

    /// The session backing the lock has expired
    #[error("session expired")]
    SessionExpired,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Task configuration is incomplete
    #[error("invalid task config: {0}")]
    InvalidConfig(String),

    /// The create transaction could not be executed
    #[error("cannot start task \"{key}\": {source}")]
    StartFailed {
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// Orchestrator configuration is incomplete
    #[error("invalid orchestrator config: {0}")]
    InvalidOrchestrator(String),
}
