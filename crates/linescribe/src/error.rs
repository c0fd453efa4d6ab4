//! Error types for linescribe.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`LinescribeError`]. The enum follows a few rules:
//!
//! - `Io` errors (from `std::io::Error`) always bubble up unchanged.
//! - Model loading failures (missing sections, corrupt topology, a recoder that
//!   cannot round-trip the space character) are `Model` errors. Callers decide
//!   whether to try another model; nothing is substituted silently.
//! - Bad configuration values and malformed network descriptions are `Validation`
//!   errors, raised before any forward pass runs.
//! - Broken internal invariants (a depth mismatch discovered inside a forward
//!   pass, for instance) are not represented here: they panic with a diagnostic.
//!
//! # Example
//!
//! ```rust
//! use linescribe::{LinescribeError, Result};
//!
//! fn check_beam_width(width: usize) -> Result<usize> {
//!     if width == 0 {
//!         return Err(LinescribeError::validation("beam_width must be at least 1"));
//!     }
//!     Ok(width)
//! }
//!
//! assert!(check_beam_width(0).is_err());
//! ```
use thiserror::Error;

/// Result type alias using `LinescribeError`.
pub type Result<T> = std::result::Result<T, LinescribeError>;

/// Main error type for all linescribe operations.
#[derive(Debug, Error)]
pub enum LinescribeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {message}")]
    Model {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Image processing error: {message}")]
    ImageProcessing {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Recognition error: {message}")]
    Recognition {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for LinescribeError {
    fn from(err: serde_json::Error) -> Self {
        LinescribeError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<rmp_serde::encode::Error> for LinescribeError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        LinescribeError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<rmp_serde::decode::Error> for LinescribeError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        LinescribeError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<image::ImageError> for LinescribeError {
    fn from(err: image::ImageError) -> Self {
        LinescribeError::ImageProcessing {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

macro_rules! error_constructor {
    ($name:ident, $variant:ident) => {
        pastey::paste! {
            #[doc = "Create a " $variant " error"]
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: None,
                }
            }

            #[doc = "Create a " $variant " error with source"]
            pub fn [<$name _with_source>]<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
                message: S,
                source: E,
            ) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: Some(Box::new(source)),
                }
            }
        }
    };
}

impl LinescribeError {
    error_constructor!(model, Model);
    error_constructor!(validation, Validation);
    error_constructor!(image_processing, ImageProcessing);
    error_constructor!(serialization, Serialization);
    error_constructor!(recognition, Recognition);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LinescribeError = io_err.into();
        assert!(matches!(err, LinescribeError::Io(_)));
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_model_error() {
        let err = LinescribeError::model("space does not round-trip");
        assert_eq!(err.to_string(), "Model error: space does not round-trip");
    }

    #[test]
    fn test_model_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        let err = LinescribeError::model_with_source("failed to read network section", source);
        assert_eq!(err.to_string(), "Model error: failed to read network section");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_validation_error() {
        let err = LinescribeError::validation("beam_width must be at least 1");
        assert_eq!(err.to_string(), "Validation error: beam_width must be at least 1");
    }

    #[test]
    fn test_image_processing_error_with_source() {
        let source = std::io::Error::other("resize failed");
        let err = LinescribeError::image_processing_with_source("cannot scale line", source);
        assert_eq!(err.to_string(), "Image processing error: cannot scale line");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_recognition_error() {
        let err = LinescribeError::recognition("line too wide");
        assert_eq!(err.to_string(), "Recognition error: line too wide");
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: LinescribeError = json_err.into();
        assert!(matches!(err, LinescribeError::Serialization { .. }));
    }

    #[test]
    fn test_rmp_decode_error_conversion() {
        let invalid = vec![0xC1, 0xFF];
        let rmp_err = rmp_serde::from_slice::<String>(&invalid).unwrap_err();
        let err: LinescribeError = rmp_err.into();
        assert!(matches!(err, LinescribeError::Serialization { .. }));
    }

    #[test]
    fn test_io_error_bubbles_unchanged() {
        fn read_model() -> Result<Vec<u8>> {
            Ok(std::fs::read("/nonexistent/model.lstm")?)
        }

        assert!(matches!(read_model().unwrap_err(), LinescribeError::Io(_)));
    }

    #[test]
    fn test_other_error() {
        let err = LinescribeError::Other("unexpected".to_string());
        assert_eq!(err.to_string(), "unexpected");
    }
}
