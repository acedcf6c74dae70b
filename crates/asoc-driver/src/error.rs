//! Error types for ASoC driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ASoC operations
pub type Result<T> = std::result::Result<T, AsocError>;

/// Errors that can occur while controlling or reading out a board
#[derive(Debug, Error)]
pub enum AsocError {
    /// I/O error during board communication or file access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Board did not answer in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Malformed or unexpected packet on the control link
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for failure
        reason: String,
    },

    /// Configuration is missing or inconsistent
    #[error("Configuration error: {reason}")]
    Config {
        /// Reason for failure
        reason: String,
    },

    /// Board or controller in a state that does not allow the operation
    #[error("Board in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Run-state transition not allowed
    #[error("Cannot go from {from} to {to}")]
    InvalidTransition {
        /// Current run state
        from: String,
        /// Requested run state
        to: String,
    },

    /// Hardware-level error reported by the board
    #[error("Hardware error: {reason}")]
    Hardware {
        /// Reason for failure
        reason: String,
    },

    /// Event data could not be decoded
    #[error("Decode error: {reason}")]
    Decode {
        /// Reason for failure
        reason: String,
    },

    /// Event that cannot be written as a frame
    #[error("Invalid event: {reason}")]
    InvalidEvent {
        /// Reason for failure
        reason: String,
    },

    /// Register name not present in the register map
    #[error("Unknown register: {name}")]
    UnknownRegister {
        /// Name that was looked up
        name: String,
    },

    /// Line-oriented input file could not be parsed
    #[error("{}:{line}: {reason}", .path.display())]
    FileFormat {
        /// File being parsed
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// Reason for failure
        reason: String,
    },
}

impl AsocError {
    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a hardware error
    pub fn hardware(reason: impl Into<String>) -> Self {
        Self::Hardware {
            reason: reason.into(),
        }
    }

    /// Create a decode error
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Create an invalid event error
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create an unknown register error
    pub fn unknown_register(name: impl Into<String>) -> Self {
        Self::UnknownRegister { name: name.into() }
    }

    /// Create a file format error
    pub fn file_format(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::FileFormat {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}

impl From<asoc_chip::readout::ReadWindowError> for AsocError {
    fn from(e: asoc_chip::readout::ReadWindowError) -> Self {
        Self::config(e.to_string())
    }
}
