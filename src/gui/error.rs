use std::{error::Error, fmt::Display};

use crate::error::CalibError;

/// Failures of the terminal interface itself, or of the session behind it.
#[derive(Debug)]
pub enum CalibGuiError {
    /// Drawing or reading the terminal failed
    IOError(std::io::Error),
    /// The measuring thread panicked
    JoinError,
    /// The calibration session failed
    Calib(CalibError),
}

impl Display for CalibGuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IOError(e) => write!(f, "terminal: {}", e),
            Self::JoinError => write!(f, "the measurement thread panicked"),
            Self::Calib(e) => write!(f, "{}", e),
        }
    }
}

impl Error for CalibGuiError {}

impl From<std::io::Error> for CalibGuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<CalibError> for CalibGuiError {
    fn from(value: CalibError) -> Self {
        Self::Calib(value)
    }
}
