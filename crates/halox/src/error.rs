use thiserror::Error;

/// Top-level error for the bridge binary.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Core(#[from] halox_core::CoreError),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}
