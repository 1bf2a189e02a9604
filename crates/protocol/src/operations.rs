//! Wire types for one-shot administrative operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ErrorBody, Safety};

/// Body of `POST /operations/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperationRequest {
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub confirm_dangerous: Option<bool>,
}

/// Catalog entry as listed by `GET /operations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub safety: Safety,
}

/// Failure codes an operation can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationErrorCode {
    UnknownOperation,
    InvalidInput,
    ConfirmationRequired,
    NotFound,
    Conflict,
    Unavailable,
    StorageFull,
    Internal,
}

impl OperationErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownOperation => "unknown-operation",
            Self::InvalidInput => "invalid-input",
            Self::ConfirmationRequired => "confirmation-required",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::StorageFull => "storage-full",
            Self::Internal => "internal",
        }
    }
}

/// `{ok: true, result}` or `{ok: false, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl OperationResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: ErrorBody) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}
