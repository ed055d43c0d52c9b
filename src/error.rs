//! Error types and error handling strategy.
//!
//! Errors are explicit and typed (no stringly-typed errors). All programmatic
//! errors surface at the API boundary; failures inside user work functions
//! and deadline overruns are internal (reflected in per-task stats and logs,
//! never propagated out of a worker).

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Registry ===
    /// Operation refers to an unregistered task name.
    UnknownTask,
    /// `add_task` with a name that is already registered.
    DuplicateTask,

    // === Triggering ===
    /// `trigger_task` on a task that is not event-driven.
    NotEventDriven,

    // === Mutex protocol ===
    /// `release` by a task that does not own the mutex.
    NotOwner,
    /// `acquire` by the task that already owns the mutex.
    RecursiveAcquire,
    /// The watchdog aborted an `acquire` that was part of a cycle.
    Deadlock,

    // === Messaging ===
    /// `receive_message` timed out.
    Timeout,
    /// `send_message` to a bounded inbox at capacity.
    InboxFull,

    // === Context ===
    /// The operation requires a current task context (called off-worker).
    NotRunning,

    // === Signals ===
    /// `bind_signal` with a signal number the host cannot route.
    InvalidSignal,

    // === Lifecycle ===
    /// The scheduler (or the target task) is shutting down.
    Shutdown,
    /// The scheduler is poisoned by an internal failure.
    Fatal,
}

/// The error type for scheduler operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error is a deadlock abort.
    #[must_use]
    pub const fn is_deadlock(&self) -> bool {
        matches!(self.kind, ErrorKind::Deadlock)
    }

    /// Returns true if this error is a receive timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for scheduler operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::UnknownTask);
        assert_eq!(err.to_string(), "UnknownTask");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::DuplicateTask).with_context("task \"tick\"");
        assert_eq!(err.to_string(), "DuplicateTask: task \"tick\"");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::Fatal)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        let deadlock = Error::new(ErrorKind::Deadlock);
        assert!(deadlock.is_deadlock());
        assert!(!deadlock.is_timeout());

        let timeout = Error::new(ErrorKind::Timeout);
        assert!(timeout.is_timeout());
        assert!(!timeout.is_deadlock());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::Timeout));
        let err = res.context("recv failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "Timeout: recv failed");
    }
}
