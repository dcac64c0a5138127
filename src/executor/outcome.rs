use crate::core::{ErrorKind, SheetError};
use serde::Serialize;
use thiserror::Error;

/// A failed operation, annotated for the caller.
///
/// Displays exactly as the underlying error; the annotations travel beside it.
#[derive(Error, Debug, Clone)]
#[error("{source}")]
pub struct OperationFailure {
    pub operation: String,
    pub retryable: bool,
    pub guidance: Option<String>,
    #[source]
    pub source: SheetError,
}

impl OperationFailure {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn into_inner(self) -> SheetError {
        self.source
    }
}

/// Structured result handed to the dispatch layer.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub is_retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_guidance: Option<String>,
}

impl<T> OperationResult<T> {
    pub fn ok(operation: impl Into<String>, value: T) -> Self {
        Self {
            success: true,
            operation: operation.into(),
            value: Some(value),
            error_message: None,
            error_kind: None,
            is_retryable: false,
            retry_guidance: None,
        }
    }

    pub fn failed(failure: OperationFailure) -> Self {
        Self {
            success: false,
            error_message: Some(failure.to_string()),
            error_kind: Some(failure.kind()),
            is_retryable: failure.retryable,
            retry_guidance: failure.guidance,
            operation: failure.operation,
            value: None,
        }
    }

    pub fn from_outcome(
        operation: impl Into<String>,
        outcome: Result<T, OperationFailure>,
    ) -> Self {
        match outcome {
            Ok(value) => Self::ok(operation, value),
            Err(failure) => Self::failed(failure),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            operation: self.operation,
            value: self.value.map(f),
            error_message: self.error_message,
            error_kind: self.error_kind,
            is_retryable: self.is_retryable,
            retry_guidance: self.retry_guidance,
        }
    }
}
