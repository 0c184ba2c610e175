use thiserror::Error;
use tonic::Status;

/// Errors raised while configuring the proxy or validating method paths.
///
/// Failures of an individual call are reported as [`tonic::Status`] instead,
/// since that is what the caller ultimately observes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// A method path or one of its parts is malformed.
    #[error("invalid method path: {0}")]
    InvalidPath(String),

    /// The same fully qualified method was registered twice.
    #[error("route already registered: '{0}'")]
    DuplicateRoute(String),
}

impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::InvalidPath(_) => Status::unimplemented(err.to_string()),
            ProxyError::DuplicateRoute(_) => Status::internal(err.to_string()),
        }
    }
}
