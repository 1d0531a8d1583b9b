use thiserror::Error;

use crate::common::error::DwsError::GenericError;
use crate::k8s::api::ApiError;
use crate::server::allocation::PlanError;

#[derive(Debug, Error)]
pub enum DwsError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error(transparent)]
    ApiError(#[from] ApiError),
    #[error(transparent)]
    PlanError(#[from] PlanError),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl DwsError {
    /// Inventory and connectivity problems found at startup should not be retried by
    /// the supervisor, restarting would hit the same problem again.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(self, DwsError::ConfigError(_) | DwsError::ApiError(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DwsError::ApiError(error) if error.is_not_found())
    }
}

impl From<serde_json::error::Error> for DwsError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for DwsError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:#}"))
    }
}

impl From<toml::de::Error> for DwsError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<String> for DwsError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

/// Failure of a job-manager request. User errors are expected outcomes of bad input
/// and are only reported back, internal errors are also logged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    #[error("{0}")]
    User(String),
    #[error("{0}")]
    Internal(String),
}

impl RequestError {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::User(_) => "user",
            RequestError::Internal(_) => "internal",
        }
    }
}

impl From<ApiError> for RequestError {
    fn from(error: ApiError) -> Self {
        RequestError::Internal(error.to_string())
    }
}

impl From<DwsError> for RequestError {
    fn from(error: DwsError) -> Self {
        RequestError::Internal(error.to_string())
    }
}
