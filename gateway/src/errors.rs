use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device already exists: {0}")]
    DuplicateId(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
