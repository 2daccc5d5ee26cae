use crate::persistence::PersistenceError;
use crate::queue::QueueError;

/// Classification the engine branches on. Every error the engine can observe
/// maps to exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying: network blip, dependency overload
    Transient,
    /// A phase exceeded its budget
    Timeout,
    /// Will not succeed on retry: bad input, quota denied, invariant broken
    Permanent,
    /// Shutdown-driven; state must be left intact for another worker
    Cancelled,
    /// Another actor owns the deployment (optimistic guard or spent lease)
    Conflict,
    NotFound,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("state repository error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("unknown adapter set '{0}'")]
    UnknownAdapterSet(String),
    #[error("a worker panicked")]
    WorkerPanic,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Persistence(err) => err.kind(),
            Error::Queue(err) => err.kind(),
            Error::UnknownAdapterSet(_) | Error::WorkerPanic => ErrorKind::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
