//! Error types for image-diffusion-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration (timestep count, beta range, sigma range, kernel).
    #[error("config: {0}")]
    Config(String),

    /// A tensor argument does not line up with the batch it belongs to.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Timestep or noise-level index outside the valid range of the process.
    #[error("timestep {t} outside valid range [{min}, {max}]")]
    TimestepOutOfRange { t: i64, min: usize, max: usize },

    /// Class id outside `[0, nb_classes)`.
    #[error("label {label} outside valid range [0, {nb_classes})")]
    LabelOutOfRange { label: i64, nb_classes: usize },

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        let err = Error::TimestepOutOfRange { t: 0, min: 1, max: 30 };
        assert_eq!(err.to_string(), "timestep 0 outside valid range [1, 30]");

        let err = Error::ShapeMismatch {
            what: "noise",
            expected: vec![2, 1, 28, 28],
            actual: vec![2, 1, 14, 14],
        };
        assert!(err.to_string().starts_with("shape mismatch for noise"));
    }
}
