use thiserror::Error;

/// Main error type for Sweepline
#[derive(Error, Debug)]
pub enum AmError {
    #[error("Search space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Search-space declaration errors. Raised before any trial runs, except
/// `Exhausted`, which the scheduler treats as a normal stop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Parameter name must not be empty")]
    EmptyName,

    #[error("Duplicate parameter: {name}")]
    DuplicateParameter { name: String },

    #[error("Invalid range for {name}: {message}")]
    InvalidRange { name: String, message: String },

    #[error("Parameter {name} has no values to choose from")]
    EmptyChoice { name: String },

    #[error("Nested parameter {name} declares duplicate option {option}")]
    DuplicateOption { name: String, option: String },

    #[error("Search space exhausted: {attempts} consecutive duplicate samples")]
    Exhausted { attempts: usize },
}

/// Errors raised by a pipeline while building, fitting, predicting or scoring.
///
/// These never cross a worker boundary as values; the executor converts them
/// into a serializable failure detail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    #[error("Invalid parameter value for {name}: {message}")]
    InvalidParameter { name: String, message: String },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    #[error("Fit failed: {message}")]
    FitFailed { message: String },

    #[error("Prediction failed: {message}")]
    PredictFailed { message: String },

    #[error("Estimator used before fit")]
    NotFitted,

    #[error("Metric {metric} produced a non-finite score")]
    NonFiniteScore { metric: String },

    #[error("Invalid evaluation data: {message}")]
    InvalidData { message: String },

    #[error("{0}")]
    Other(String),
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },

    #[error("Feature provider {method} failed: {message}")]
    ProviderFailed { method: String, message: String },
}

/// Result type alias for Sweepline operations
pub type AmResult<T> = Result<T, AmError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::AmError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::AmError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SpaceError::InvalidRange {
            name: "learning_rate".to_string(),
            message: "low 1 > high 0.1".to_string(),
        };

        assert!(error.to_string().contains("Invalid range"));
        assert!(error.to_string().contains("learning_rate"));
    }

    #[test]
    fn test_error_conversion() {
        let trial_error = TrialError::FitFailed {
            message: "singular matrix".to_string(),
        };
        let am_error: AmError = trial_error.into();

        match am_error {
            AmError::Trial(_) => (),
            _ => panic!("Expected Trial error"),
        }
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, AmError::Validation(ref m) if m == "Invalid value: 42"));
        let config_err = config_error!("Missing required field: {}", "datasets");
        assert!(config_err.to_string().contains("datasets"));
    }
}
