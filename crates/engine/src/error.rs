use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("capability already registered: {0}")]
    DuplicateCapability(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] mcp::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
