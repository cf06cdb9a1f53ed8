//! Error types for sessions, transports and drivers.
//!
//! [`BrailleError`] is what library calls return. [`ErrorReport`] is the
//! serializable form printed by hosts, and always carries a suggestion.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::session::SessionState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BrailleError>;

/// Errors raised while connecting to, identifying or driving a display.
#[derive(Debug, Error)]
pub enum BrailleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported device identifier: '{0}'")]
    UnsupportedIdentifier(String),

    #[error("driver '{driver}' cannot use a {kind} connection")]
    NoTransport { driver: String, kind: String },

    #[error("no identify response after {attempts} attempts")]
    IdentifyTimeout { attempts: u32 },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("invalid value '{value}' for parameter '{name}' (expected {expected})")]
    InvalidParameter {
        name: String,
        value: String,
        expected: String,
    },

    #[error("unknown driver code: '{0}'")]
    UnknownDriver(String),

    #[error("expected {expected} cells, got {actual}")]
    CellCount { expected: usize, actual: usize },

    #[error("too many malformed frames in a row ({0})")]
    TooManyFaults(u32),

    #[error("session is {0}, not ready")]
    NotReady(SessionState),

    #[error("transport closed")]
    Closed,
}

impl BrailleError {
    /// Map an error onto its reporting category.
    pub fn code(&self) -> ErrorCode {
        match self {
            BrailleError::Io(_) | BrailleError::Closed | BrailleError::TooManyFaults(_) => {
                ErrorCode::TransportFailed
            }
            BrailleError::UnsupportedIdentifier(_)
            | BrailleError::NoTransport { .. }
            | BrailleError::InvalidParameter { .. }
            | BrailleError::UnknownDriver(_)
            | BrailleError::CellCount { .. } => ErrorCode::InvalidInput,
            BrailleError::IdentifyTimeout { .. } => ErrorCode::IdentifyTimeout,
            BrailleError::UnknownModel(_) => ErrorCode::UnknownModel,
            BrailleError::WriteFailed(_) => ErrorCode::WriteFailed,
            BrailleError::NotReady(_) => ErrorCode::SessionNotReady,
        }
    }

    /// Whether the session that produced this error must be restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::TransportFailed | ErrorCode::WriteFailed
        )
    }
}

/// Error categories for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TransportFailed,
    IdentifyTimeout,
    UnknownModel,
    WriteFailed,
    InvalidInput,
    SessionNotReady,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::TransportFailed => write!(f, "TRANSPORT_FAILED"),
            ErrorCode::IdentifyTimeout => write!(f, "IDENTIFY_TIMEOUT"),
            ErrorCode::UnknownModel => write!(f, "UNKNOWN_MODEL"),
            ErrorCode::WriteFailed => write!(f, "WRITE_FAILED"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::SessionNotReady => write!(f, "SESSION_NOT_READY"),
        }
    }
}

/// Serializable error with a hint for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorReport {}

impl From<&BrailleError> for ErrorReport {
    fn from(error: &BrailleError) -> Self {
        let suggestion = match error {
            BrailleError::Io(_) | BrailleError::Closed => {
                "Check that the display is connected and powered on".to_string()
            }
            BrailleError::UnsupportedIdentifier(_) => {
                "Use serial:/dev/ttyS0, usb:, bluetooth:ADDRESS or host:port".to_string()
            }
            BrailleError::NoTransport { driver, .. } => format!(
                "Run 'brailink drivers' to see which connections '{}' supports",
                driver
            ),
            BrailleError::IdentifyTimeout { .. } => {
                "Make sure the display is switched on, or raise timing.retry_limit".to_string()
            }
            BrailleError::UnknownModel(_) => {
                "The display answered but is not a supported model; try another driver"
                    .to_string()
            }
            BrailleError::WriteFailed(_) | BrailleError::TooManyFaults(_) => {
                "Restart the session; the display state is unknown".to_string()
            }
            BrailleError::InvalidParameter { name, expected, .. } => {
                format!("Set {} to {}", name, expected)
            }
            BrailleError::UnknownDriver(_) => {
                "Run 'brailink drivers' to list driver codes".to_string()
            }
            BrailleError::CellCount { expected, .. } => {
                format!("Send exactly {} cells per write", expected)
            }
            BrailleError::NotReady(_) => "Open or restart the session first".to_string(),
        };

        Self {
            code: error.code(),
            message: error.to_string(),
            suggestion: Some(suggestion),
        }
    }
}

impl From<BrailleError> for ErrorReport {
    fn from(error: BrailleError) -> Self {
        ErrorReport::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_errors() -> Vec<BrailleError> {
        vec![
            BrailleError::Io(std::io::Error::other("unplugged")),
            BrailleError::UnsupportedIdentifier("floppy:".into()),
            BrailleError::NoTransport {
                driver: "np".into(),
                kind: "usb".into(),
            },
            BrailleError::IdentifyTimeout { attempts: 3 },
            BrailleError::UnknownModel("XX9".into()),
            BrailleError::WriteFailed("broken pipe".into()),
            BrailleError::InvalidParameter {
                name: "highbaud".into(),
                value: "maybe".into(),
                expected: "yes or no".into(),
            },
            BrailleError::UnknownDriver("zz".into()),
            BrailleError::CellCount {
                expected: 40,
                actual: 12,
            },
            BrailleError::TooManyFaults(8),
            BrailleError::NotReady(SessionState::Error),
            BrailleError::Closed,
        ]
    }

    #[test]
    fn test_every_report_has_suggestion() {
        for error in all_errors() {
            let report = ErrorReport::from(&error);
            assert!(
                report.suggestion.is_some(),
                "{} should have a suggestion",
                error
            );
        }
    }

    #[test]
    fn test_fatal_errors() {
        assert!(BrailleError::WriteFailed("x".into()).is_fatal());
        assert!(BrailleError::Closed.is_fatal());
        assert!(!BrailleError::UnknownDriver("x".into()).is_fatal());
        assert!(!BrailleError::IdentifyTimeout { attempts: 1 }.is_fatal());
    }

    #[test]
    fn test_display_format_with_suggestion() {
        let report = ErrorReport::from(BrailleError::IdentifyTimeout { attempts: 4 });
        let display = format!("{}", report);
        assert!(display.contains("[IDENTIFY_TIMEOUT]"));
        assert!(display.contains("4 attempts"));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn test_invalid_parameter_suggestion_names_parameter() {
        let report = ErrorReport::from(BrailleError::InvalidParameter {
            name: "protocol".into(),
            value: "morse".into(),
            expected: "auto, esysiris or clio".into(),
        });
        assert_eq!(report.code, ErrorCode::InvalidInput);
        assert!(report.message.contains("morse"));
        assert!(report
            .suggestion
            .as_ref()
            .is_some_and(|s| s.contains("protocol")));
    }

    #[test]
    fn test_json_serialization() {
        let report = ErrorReport::from(BrailleError::UnknownModel("Q1".into()));
        let json = serde_json::to_string(&report).expect("Failed to serialize report");
        assert!(json.contains("\"code\""));
        assert!(json.contains("UNKNOWN_MODEL"));
        assert!(json.contains("\"suggestion\""));
    }

    #[test]
    fn test_json_deserialization() {
        let json = r#"{"code":"WRITE_FAILED","message":"write failed: eof","suggestion":"hint"}"#;
        let report: ErrorReport = serde_json::from_str(json).expect("Failed to parse report");
        assert_eq!(report.code, ErrorCode::WriteFailed);
        assert_eq!(report.suggestion, Some("hint".to_string()));
    }
}
