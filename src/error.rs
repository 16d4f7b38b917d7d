use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_bencode::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
