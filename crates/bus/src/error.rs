use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to subscribe to topic `{0}`: {1}")]
    Subscribe(String, String),

    #[error("failed to publish to topic `{0}`: {1}")]
    Publish(String, String),
}

pub type Result<T> = std::result::Result<T, BusError>;
