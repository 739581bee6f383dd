use thiserror::Error;

#[derive(Error, Debug)]
pub enum SurgeError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search store error: {0}")]
    Sink(String),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("resource saturated: {0}")]
    Saturated(String),

    #[error("shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for SurgeError {
    fn from(err: redis::RedisError) -> Self {
        SurgeError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SurgeError {
    fn from(err: reqwest::Error) -> Self {
        SurgeError::Sink(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SurgeError>;
