use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("query requires a composite index: {0}")]
    IndexRequired(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Unknown(String),
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "invalid-argument",
            DomainError::NotFound(_) => "not-found",
            DomainError::PermissionDenied(_) => "permission-denied",
            DomainError::InvalidStatus(_) => "invalid-status",
            DomainError::Conflict(_) => "already-exists",
            DomainError::IndexRequired(_) => "failed-precondition",
            DomainError::Unavailable(_) => "unavailable",
            DomainError::Unknown(_) => "unknown",
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        DomainError::NotFound(what.into())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Unknown(format!("document codec failed: {err}"))
    }
}

/// Error half of the `{ data, error }` envelope handed to callers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceError {
    pub code: String,
    pub message: String,
}

impl From<&DomainError> for ServiceError {
    fn from(err: &DomainError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceResponse<T> {
    pub data: Option<T>,
    pub error: Option<ServiceError>,
}

impl<T> ServiceResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: ServiceError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }

    /// Translates a domain result, logging the failure against `operation`.
    pub fn from_result(operation: &str, result: Result<T, DomainError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => {
                match &err {
                    DomainError::Unknown(_) | DomainError::Unavailable(_) => {
                        tracing::error!(operation, code = err.code(), error = %err, "operation failed");
                    }
                    _ => {
                        tracing::warn!(operation, code = err.code(), error = %err, "operation rejected");
                    }
                }
                Self::failed(ServiceError::from(&err))
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<T, ServiceError> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Err(ServiceError {
                code: "unknown".to_string(),
                message: "response carried neither data nor error".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_codes_survive_translation() {
        let response: ServiceResponse<()> = ServiceResponse::from_result(
            "confirm_trade_completion",
            Err(DomainError::PermissionDenied("requester cannot confirm".into())),
        );
        let error = response.error.expect("error present");
        assert_eq!(error.code, "permission-denied");
        assert!(response.data.is_none());
    }

    #[test]
    fn codec_failures_become_unknown() {
        let err: DomainError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert_eq!(err.code(), "unknown");
    }

    #[test]
    fn envelope_serializes_data_and_error_fields() {
        let response = ServiceResponse::ok(3_u32);
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["data"], 3);
        assert!(value["error"].is_null());
    }
}
