use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("no schema registered under name `{0}`")]
    NotFound(String),

    #[error("failed to compile schema `{0}`: {1}")]
    Compile(String, String),

    #[error("payload failed validation against schema `{schema}`: {errors}")]
    Validation { schema: String, errors: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config path not found: {0}")]
    PathNotFound(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = SchemaError> = std::result::Result<T, E>;
