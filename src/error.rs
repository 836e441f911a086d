use thiserror::Error;
use tokio_tungstenite::tungstenite;
use twilight_model::gateway::OpCode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("transport is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
    #[error("unexpected opcode {0:?}")]
    UnexpectedOpcode(OpCode),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no session registered for shard {0}")]
    ShardNotFound(u32),
    #[error("shard {0} is registered twice")]
    DuplicateShard(u32),
    #[error("shard index {index} is out of range for {count} shards")]
    InvalidShard { index: u32, count: u32 },
}

/// Failure while pushing a payload to the gateway. Never leaves a session.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
