use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum ExporterError {
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    #[error("MQTT connection timeout after {0} seconds")]
    ConnectTimeout(u64),

    #[error("MQTT event loop stopped before the connection was established")]
    EventLoopStopped,

    #[error("Subscription to {topic} timed out")]
    SubscribeTimeout { topic: String },

    #[error("Subscription to {topic} rejected by broker")]
    SubscribeRejected { topic: String },

    #[error("Subscription to {topic} dropped before acknowledgement")]
    SubscribeDropped { topic: String },

    #[error("Metric registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP server error: {0}")]
    Server(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExporterError>;
