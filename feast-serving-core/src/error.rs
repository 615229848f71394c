use serde::Serialize;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    Unimplemented,
    ServiceUnavailable,
    DeadlineExceeded,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Error returned by every serving operation. Callers branch on [`ServingError::kind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingError {
    kind: ErrorKind,
    message: String,
}

pub type ServingResult<T> = std::result::Result<T, ServingError>;

impl ServingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl Display for ServingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ServingError {}

/// Infrastructure code reports through `anyhow`; a wrapped `ServingError` keeps its kind,
/// anything else becomes `Internal`.
impl From<anyhow::Error> for ServingError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ServingError>() {
            Ok(serving_error) => serving_error,
            Err(other) => Self::internal(format!("{:#}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn display_contains_kind_and_message() {
        let err = ServingError::not_found("job 'abc' not found");
        assert_eq!(err.to_string(), "NOT_FOUND: job 'abc' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn anyhow_conversion_keeps_serving_kind() {
        let wrapped = anyhow::Error::from(ServingError::deadline_exceeded("too slow"));
        let err = ServingError::from(wrapped);
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(err.message(), "too slow");

        let other = ServingError::from(anyhow!("disk on fire"));
        assert_eq!(other.kind(), ErrorKind::Internal);
    }
}
