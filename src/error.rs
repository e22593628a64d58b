//! Error handling for the thingflow runtime
//!
//! Two families of errors flow through the system:
//!
//! - [`FlowError`] is the *fatal* family. Misuse of ports, scheduling
//!   mistakes and unexpected failures inside dispatch all end up here, and
//!   they always terminate a scheduler run.
//! - [`StreamError`] is an *ordinary* data-stream error. It travels through
//!   the graph as an `on_error` event and only affects the downstream subtree
//!   of the thing that raised it.
//!
//! Consumer callbacks return [`HandlerResult`]. Dispatch tells the two
//! families apart by downcasting: a [`FlowError`] passes through unchanged,
//! anything else is wrapped as [`FlowError::Dispatch`].

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Fatal errors. Any of these terminates the scheduler run.
#[derive(Error, Debug)]
pub enum FlowError {
    /// A connection was requested on a port that cannot accept it
    #[error("Invalid port '{port}' on {thing}: {reason}")]
    InvalidPort {
        thing: String,
        port: String,
        reason: String,
    },

    /// Dispatch to a port that was never defined
    #[error("Unknown port '{port}' on {thing}")]
    UnknownPort { thing: String, port: String },

    /// Dispatch to a port that already saw completed or error
    #[error("Port '{port}' on {thing} already had an on_completed or on_error event")]
    PortAlreadyClosed { thing: String, port: String },

    /// A consumer raised an ordinary error from one of its handlers
    #[error("Unexpected error dispatching {event} from {origin} to {target}: {source}")]
    Dispatch {
        event: String,
        origin: String,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// Scheduling misuse (double schedule, cancel of an inactive entity, ...)
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// A bridged coroutine failed while the scheduler was draining
    #[error("Error in coroutine {id}: {source}")]
    Coroutine {
        id: String,
        #[source]
        source: StreamError,
    },

    /// A worker thread (blocking source, private loop or blocking sink) failed
    #[error("Worker for {thing} exited with error: {source}")]
    Worker {
        thing: String,
        #[source]
        source: anyhow::Error,
    },

    /// Bad argument to a constructor or scheduling call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned by `Scheduler::run_forever` when a fatal error stopped the run
    #[error("Scheduler aborted due to fatal error: {0}")]
    Aborted(#[source] Box<FlowError>),
}

impl FlowError {
    /// Shorthand for [`FlowError::Schedule`]
    pub fn schedule(msg: impl Into<String>) -> Self {
        FlowError::Schedule(msg.into())
    }

    /// Shorthand for [`FlowError::InvalidArgument`]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        FlowError::InvalidArgument(msg.into())
    }

    /// The error that caused an [`FlowError::Aborted`] run, or `self`
    pub fn root(&self) -> &FlowError {
        match self {
            FlowError::Aborted(inner) => inner.root(),
            other => other,
        }
    }
}

/// Result type alias for thingflow operations
pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// Return type of every consumer callback
pub type HandlerResult = anyhow::Result<()>;

/// Split a handler failure into the fatal family or an ordinary error.
pub fn classify(err: anyhow::Error) -> std::result::Result<FlowError, anyhow::Error> {
    err.downcast::<FlowError>()
}

/// True if the handler failure belongs to the fatal family.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.is::<FlowError>()
}

/// An ordinary data-stream error.
///
/// Cheap to clone so the same error can fan out to every connection of a
/// port, and `Send + Sync` so worker threads can relay it to the loop.
#[derive(Clone)]
pub struct StreamError(Arc<anyhow::Error>);

impl StreamError {
    /// Wrap any standard error
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(err)))
    }

    /// Build an error from a plain message
    pub fn msg<M>(msg: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Access the wrapped error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast the wrapped error
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamError({})", self.0)
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = (*self.0).as_ref();
        Some(inner)
    }
}
