//! Error types for policy loading.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The trust rules are self-contradictory.
    #[error("invalid policy: {0}")]
    Invalid(String),

    /// The policy file is not valid TOML.
    #[error("failed to parse policy: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
