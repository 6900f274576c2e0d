use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every violated field of one request, in the order the fields were checked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid request: {}", summarize(.violations))]
pub struct ConstraintError {
    violations: Vec<Violation>,
}

impl ConstraintError {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn fields(&self) -> Vec<&str> {
        self.violations
            .iter()
            .map(|violation| violation.field.as_str())
            .collect()
    }

    pub fn mentions(&self, field: &str) -> bool {
        self.violations
            .iter()
            .any(|violation| violation.field == field)
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations
            .iter()
            .map(|violation| violation.message.clone())
            .collect()
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| violation.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    RemoteRejected,
    RemoteUnavailable,
    RemoteTimeout,
    Storage,
    Compositor,
    Internal,
}

/// Error payload handed back to the form UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub messages: Vec<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, messages: Vec<String>) -> Self {
        Self { code, messages }
    }

    pub fn single(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            messages: vec![message.into()],
        }
    }
}

impl From<&ConstraintError> for ErrorBody {
    fn from(value: &ConstraintError) -> Self {
        Self::new(ErrorCode::Validation, value.messages())
    }
}
