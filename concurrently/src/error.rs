use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Result type of every scheduler operation and of the work it runs.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reason carried by [`Error::Cancelled`] when the caller did not give one.
pub const DEFAULT_CANCEL_REASON: &str = "evaluation cancelled";

/// Misuse of the await/resume/conclude protocol. Always reported to the
/// caller that triggered it; the scheduler state is left untouched.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("evaluation is not waiting due to an earlier call of await_resume")]
    NotWaiting,

    #[error("evaluation is already waiting to be resumed")]
    AlreadyWaiting,

    #[error("already concluded")]
    AlreadyConcluded,

    #[error("the root evaluation cannot be concluded or cancelled")]
    RootEvaluation,

    #[error("an evaluation cannot await its own result")]
    AwaitOwnResult,

    #[error("evaluation resumed with a value of unexpected type, expected `{expected}`")]
    UnexpectedValue { expected: &'static str },

    #[error("event loop driven from inside a running evaluation")]
    Reentrant,
}

/// A centralized error type for all scheduler operations and evaluation outcomes.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The evaluation was concluded from the outside rather than by its work.
    #[error("{0}")]
    Cancelled(String),

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("evaluation panicked: {0}")]
    Panicked(String),

    /// Error returned by the unit of work itself.
    #[error("{0}")]
    Work(Arc<anyhow::Error>),

    /// The event loop owning the evaluation has been reinitialized.
    #[error("event loop torn down{}", fmt_cause(.cause))]
    Teardown { cause: Option<Box<Error>> },

    #[error("FATAL: scheduler invariant violated: {0}")]
    Internal(String),

    #[error("event loop stalled: nothing is scheduled but the root future is still pending")]
    Stalled,

    #[error("driver failed to park the event loop: {0}")]
    Driver(Arc<io::Error>),
}

fn fmt_cause(cause: &Option<Box<Error>>) -> String {
    match cause {
        Some(cause) => format!(" ({cause})"),
        None => String::new(),
    }
}

impl Error {
    /// Wraps any error produced by a unit of work.
    pub fn work(err: impl Into<anyhow::Error>) -> Self {
        Error::from(err.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled(reason.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    pub fn is_teardown(&self) -> bool {
        matches!(self, Error::Teardown { .. })
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    pub fn protocol(&self) -> Option<ProtocolError> {
        match self {
            Error::Protocol(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // Our own errors travel through `anyhow` when work uses `?` on a
        // mix of error types; unwrap them instead of nesting.
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::Work(Arc::new(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Driver(Arc::new(err))
    }
}
