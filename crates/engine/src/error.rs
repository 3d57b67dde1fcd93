//! Domain errors for the signal engine

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Price series not strictly increasing at index {index}: {current} follows {previous}")]
    UnorderedSeries {
        index: usize,
        previous: i64,
        current: i64,
    },

    #[error("Invalid close {close} at index {index} (must be finite and positive)")]
    InvalidPrice { index: usize, close: f64 },

    #[error("Unsupported interval {0} (expected one of 1, 5, 15, 30, 60, 240, 1440, 10080, 21600)")]
    InvalidInterval(u32),

    #[error("Unknown action: {0:?}")]
    UnknownAction(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
