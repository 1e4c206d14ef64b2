use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no async runtime: dispatch must be called from inside a tokio runtime")]
    NoRuntime,

    #[error("address: {0}")]
    Address(#[from] url::ParseError),

    #[error("address: '{0}' is not a network address")]
    InvalidAddress(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("header: invalid header '{name}'")]
    InvalidHeader { name: String },

    #[error("method: unsupported method '{0}'")]
    UnsupportedMethod(String),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
