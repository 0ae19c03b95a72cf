use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug)]
pub enum ModelError {
    UnknownStatus(String),
    UnknownPolicy(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownStatus(s) => write!(f, "unknown session status: {s}"),
            ModelError::UnknownPolicy(s) => write!(f, "unknown auto-archive policy: {s}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
