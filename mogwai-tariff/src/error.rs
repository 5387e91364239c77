//! Error types for the tariff model

use thiserror::Error;

/// Result type for tariff operations
pub type TariffResult<T> = Result<T, TariffError>;

/// Error types for tariff construction and loading
#[derive(Error, Debug)]
pub enum TariffError {
    /// Period invariant violated at construction
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    /// Tariff invariant violated at construction or load
    #[error("Invalid tariff: {0}")]
    InvalidTariff(String),

    /// I/O error while reading a tariff file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
