use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] sensorflow_schema::ConfigError),

    #[error(transparent)]
    Schema(#[from] sensorflow_schema::SchemaError),

    #[error("module \"{0}\" has unknown class path \"{1}\"")]
    UnknownClass(String, String),

    #[error("module \"{0}\" config is invalid: {1}")]
    InvalidModuleConfig(String, String),

    #[error("bus operation failed: {0}")]
    Bus(#[from] sensorflow_bus::BusError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
