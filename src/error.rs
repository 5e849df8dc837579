use thiserror::Error;

/// Errors that can occur in the node status updater.
#[derive(Error, Debug)]
pub enum NsuError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registration with the controller failed; fatal to startup.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Controller RPC error. `transient` distinguishes a single failed round
    /// (recoverable, keep retrying) from connect exhaustion (fatal liveness loss).
    #[error("Controller RPC error: {message}")]
    Rpc { message: String, transient: bool },

    /// A node label failed local syntax validation.
    #[error("Label validation error: {0}")]
    LabelValidation(String),

    /// The node state store rejected a completion-tombstone write.
    #[error("State store error: {0}")]
    StateStore(String),

    /// Network I/O error.
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl NsuError {
    /// True if retrying the same operation next tick is the correct response.
    pub fn is_transient(&self) -> bool {
        matches!(self, NsuError::Rpc { transient: true, .. })
    }
}

/// Result type alias using NsuError.
pub type Result<T> = std::result::Result<T, NsuError>;

impl From<String> for NsuError {
    fn from(s: String) -> Self {
        NsuError::Other(s)
    }
}

impl From<&str> for NsuError {
    fn from(s: &str) -> Self {
        NsuError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for NsuError {
    fn from(err: serde_json::Error) -> Self {
        NsuError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for NsuError {
    fn from(err: reqwest::Error) -> Self {
        NsuError::Rpc {
            message: err.to_string(),
            transient: !err.is_connect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NsuError::Config("negative retention".to_string());
        assert_eq!(err.to_string(), "Configuration error: negative retention");
    }

    #[test]
    fn test_transient_classification() {
        let transient = NsuError::Rpc {
            message: "timeout".into(),
            transient: true,
        };
        let fatal = NsuError::Rpc {
            message: "connect refused".into(),
            transient: false,
        };
        assert!(transient.is_transient());
        assert!(!fatal.is_transient());
    }

    #[test]
    fn test_error_from_string() {
        let err: NsuError = "boom".into();
        assert!(matches!(err, NsuError::Other(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NsuError = io_err.into();
        assert!(matches!(err, NsuError::Io(_)));
    }
}
