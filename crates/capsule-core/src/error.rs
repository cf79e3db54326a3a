use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias for core operations.
pub type CapsuleResult<T> = Result<T, CapsuleError>;

#[derive(Error, Debug)]
pub enum CapsuleError {
    #[error("[CP1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[CP1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[CP1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[CP1100] invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("[CP1200] not found: {0}")]
    NotFound(String),

    #[error("[CP1201] volume already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("[CP1300] authentication failed: {0}")]
    AuthFailure(String),

    #[error("[CP2000] driver error: {0}")]
    Driver(String),

    #[error("[CP2001] container runtime mount cache conflict: {0}")]
    CacheConflict(String),

    #[error("[CP2002] {what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
}

impl CapsuleError {
    pub fn code(&self) -> &'static str {
        match self {
            CapsuleError::Io(_) => "CP1000",
            CapsuleError::Toml(_) => "CP1001",
            CapsuleError::Yaml(_) => "CP1002",
            CapsuleError::InvalidConfig(_) => "CP1100",
            CapsuleError::NotFound(_) => "CP1200",
            CapsuleError::AlreadyExists(_) => "CP1201",
            CapsuleError::AuthFailure(_) => "CP1300",
            CapsuleError::Driver(_) => "CP2000",
            CapsuleError::CacheConflict(_) => "CP2001",
            CapsuleError::Timeout { .. } => "CP2002",
        }
    }

    /// Only the runtime's stale mount cache is worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CapsuleError::CacheConflict(_))
    }
}
