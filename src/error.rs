use thiserror::Error;

/// A reading submitted over HTTP was rejected before reaching storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Request body must be a JSON object")]
    MalformedBody,
    #[error("Temperature is required")]
    MissingTemperature,
    #[error("Temperature must be a number")]
    TemperatureNotNumeric,
    #[error("Humidity must be a number")]
    HumidityNotNumeric,
}

/// An MQTT payload that does not hold a single finite number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload {0:?} is not a number")]
    NotNumeric(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open database {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: diesel::ConnectionError,
    },
    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("storage task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}
