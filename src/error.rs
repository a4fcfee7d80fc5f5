use std::error::Error as _;

use thiserror::Error;
use tonic::Code;

/// Classified failure of a dispatched task invocation.
///
/// Transport failures are mapped onto a fixed taxonomy at the dispatch client
/// boundary; everything the agent reports about the command itself arrives as
/// data and becomes [`DispatchError::Application`].
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("cannot connect to remote agent: {0}")]
    ConnectionUnavailable(String),

    #[error("execution timed out, forced termination")]
    ExecutionTimeout,

    #[error("manually stopped")]
    ManuallyStopped,

    #[error("{0}")]
    Application(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),
}

impl DispatchError {
    /// Map a transport status onto the taxonomy.
    ///
    /// A status that carries a source error was raised by the local transport
    /// (the connection broke before the agent answered), whatever code tonic
    /// picked for it. Statuses sent by the agent never carry one.
    pub fn classify(status: tonic::Status) -> Self {
        match status.code() {
            Code::Unavailable => DispatchError::ConnectionUnavailable(status.message().to_string()),
            Code::DeadlineExceeded => DispatchError::ExecutionTimeout,
            _ if status.source().is_some() => {
                DispatchError::ConnectionUnavailable(status.message().to_string())
            }
            Code::Cancelled => DispatchError::ManuallyStopped,
            _ => DispatchError::Transport(status),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, DispatchError::ConnectionUnavailable(_))
    }

    pub fn is_manual_stop(&self) -> bool {
        matches!(self, DispatchError::ManuallyStopped)
    }
}

/// Error side of [`DispatchClient::exec`](crate::rpc::DispatchClient::exec).
///
/// Carries whatever output the agent produced before the failure; `output` is
/// empty when nothing was returned.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct DispatchFailure {
    pub error: DispatchError,
    pub output: String,
}

impl DispatchFailure {
    pub fn new(error: DispatchError) -> Self {
        Self {
            error,
            output: String::new(),
        }
    }

    pub fn with_output(error: DispatchError, output: String) -> Self {
        Self { error, output }
    }
}

impl From<DispatchError> for DispatchFailure {
    fn from(error: DispatchError) -> Self {
        Self::new(error)
    }
}

pub type Result<T> = std::result::Result<T, DispatchFailure>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Status;

    #[test]
    fn unavailable_maps_to_connection_unavailable() {
        let err = DispatchError::classify(Status::unavailable("connection refused"));
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn deadline_exceeded_maps_to_timeout() {
        let err = DispatchError::classify(Status::deadline_exceeded("late"));
        assert!(matches!(err, DispatchError::ExecutionTimeout));
        assert_eq!(err.to_string(), "execution timed out, forced termination");
    }

    #[test]
    fn cancelled_maps_to_manual_stop() {
        let err = DispatchError::classify(Status::cancelled("stop"));
        assert!(err.is_manual_stop());
    }

    #[test]
    fn broken_connection_is_unavailable() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        let err = DispatchError::classify(Status::from_error(Box::new(reset)));
        assert!(err.is_unavailable(), "got {err:?}");
    }

    #[test]
    fn other_codes_pass_through() {
        let err = DispatchError::classify(Status::internal("boom"));
        match err {
            DispatchError::Transport(status) => assert_eq!(status.code(), Code::Internal),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn failure_keeps_partial_output() {
        let failure =
            DispatchFailure::with_output(DispatchError::ExecutionTimeout, "partial".to_string());
        assert_eq!(failure.output, "partial");
        assert_eq!(failure.to_string(), "execution timed out, forced termination");
    }
}
