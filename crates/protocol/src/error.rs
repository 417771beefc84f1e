use thiserror::Error;

/// Errors raised while decoding or routing protocol-level data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("payload failed to decode as JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("envelope is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("observation has no receivers")]
    NoReceivers,

    #[error("observation has an undefined receiver index: {0}")]
    UndefinedReceiver(i64),

    #[error("request set \"{0}\" not found in observation")]
    RequestSetNotFound(String),

    #[error("response set \"{0}\" not found in observation")]
    ResponseSetNotFound(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
