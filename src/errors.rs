use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("MISSING_SCHEDULE_FIELD: {0}")]
    MissingScheduleField(String),
    #[error("UNSUPPORTED_FREQUENCY: {0}")]
    UnsupportedFrequency(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONNECTION_CONFIG: {0}")]
    ConnectionConfig(String),
    #[error("TOOL_EXECUTION: {0}")]
    ToolExecution(String),
    #[error("CYCLIC_HIERARCHY: {0}")]
    CyclicHierarchy(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        Self::ToolExecution(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
