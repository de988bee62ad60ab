use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("car id is empty")]
    EmptyCarId,
    #[error("server port must be between 1 and 65535")]
    ZeroPort,
    #[error("primary server host is empty")]
    EmptyPrimaryHost,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
    #[error("frame is not valid utf-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("frame is not a json object: {0}")]
    Malformed(#[from] serde_json::Error),
}
