//! Error taxonomy for the forecasting core.
//!
//! Recoverable kinds (`StoreUnavailable`, `InsufficientData`) are surfaced to
//! the caller with context. `LeakageDetected` and `ArtifactInvalid` are fatal
//! for the operation that raised them and never leave partial state behind.
//! Non-fatal training conditions (overfitting, search budget, CV variance) are
//! not errors; they travel on the training report as [`crate::ml::TrainingFlag`].

use thiserror::Error;

/// Errors raised by the forecasting core.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Upstream store or transport outage. Callers may retry with backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Structurally invalid input (negative count, unparsable date, ...).
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Not enough samples for the requested operation.
    #[error("insufficient data for {what}: required {required}, found {found}")]
    InsufficientData {
        what: &'static str,
        required: usize,
        found: usize,
    },

    /// A time-ordering or feature-dependency invariant was breached.
    #[error("leakage detected: {0}")]
    LeakageDetected(String),

    /// Model artifact missing, corrupt, or inconsistent with this build.
    #[error("invalid model artifact: {0}")]
    ArtifactInvalid(String),

    /// A numeric routine could not produce a result (singular system, ...).
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// The operation was cancelled at a component boundary.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A configuration value outside its permitted range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        ForecastError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ForecastError {
    fn from(err: bincode::Error) -> Self {
        ForecastError::Serialization(err.to_string())
    }
}

impl ForecastError {
    /// Whether the caller may retry the operation later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ForecastError::StoreUnavailable(_) | ForecastError::InsufficientData { .. }
        )
    }

    pub(crate) fn insufficient(what: &'static str, required: usize, found: usize) -> Self {
        ForecastError::InsufficientData {
            what,
            required,
            found,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, ForecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_message_names_threshold() {
        let err = ForecastError::insufficient("weather impact samples", 50, 30);
        let msg = err.to_string();
        assert!(msg.contains("required 50"));
        assert!(msg.contains("found 30"));
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ForecastError::StoreUnavailable("timeout".into()).is_recoverable());
        assert!(ForecastError::insufficient("x", 3, 1).is_recoverable());
        assert!(!ForecastError::LeakageDetected("fold".into()).is_recoverable());
        assert!(!ForecastError::ArtifactInvalid("missing".into()).is_recoverable());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: ForecastError = serde_json::from_str::<Vec<String>>("{").unwrap_err().into();
        assert!(matches!(err, ForecastError::Serialization(_)));
    }
}
