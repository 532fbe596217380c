#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The session pool configuration failed validation.
    #[error("invalid session pool configuration: {0}")]
    InvalidConfig(String),

    /// The pool was closed; sessions can no longer be acquired or recycled.
    #[error("session pool is closed")]
    PoolClosed,

    /// The caller's deadline elapsed. `last` carries the most recent error
    /// observed before the deadline fired, if any.
    #[error("deadline elapsed while waiting on a session operation")]
    Timeout {
        #[source]
        last: Option<Box<Error>>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("unexpected gRPC status: {0}")]
    Status(#[from] tonic::Status),
}

impl Error {
    /// Status code of the underlying RPC error, when there is one.
    pub(crate) fn code(&self) -> Option<tonic::Code> {
        match self {
            Error::Status(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Server-supplied message of the underlying RPC error.
    pub(crate) fn message(&self) -> &str {
        match self {
            Error::Status(status) => status.message(),
            _ => "",
        }
    }
}
