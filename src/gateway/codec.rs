use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use twilight_model::gateway::OpCode;

use super::types::{IdentifyOptions, ResumeContext};
use crate::error::CodecError;

/// Decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Hello { heartbeat_interval: Duration },
    HeartbeatAck,
    /// Server asks for a heartbeat right now.
    HeartbeatRequest,
    Reconnect,
    InvalidSession { resumable: bool },
    Dispatch {
        sequence: Option<u64>,
        name: String,
        data: Value,
    },
}

/// Outbound payloads a session produces.
#[derive(Clone, Copy, Debug)]
pub enum Outbound<'a> {
    Identify(&'a IdentifyOptions),
    Resume {
        token: &'a str,
        context: &'a ResumeContext,
    },
    Heartbeat { last_sequence: Option<u64> },
}

/// Maps raw frames to and from gateway payloads.
pub trait Codec: Send + Sync + 'static {
    fn decode(&self, frame: &str) -> Result<Inbound, CodecError>;

    fn encode(&self, payload: &Outbound<'_>) -> Result<String, CodecError>;
}

#[derive(Deserialize)]
struct RawPayload {
    op: OpCode,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// JSON envelope `{op, d, s, t}`.
#[derive(Clone, Debug)]
pub struct JsonCodec {
    os: String,
    library: String,
    large_threshold: u64,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            library: env!("CARGO_PKG_NAME").to_string(),
            large_threshold: 250,
        }
    }
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn identify(&self, options: &IdentifyOptions) -> Result<Value, CodecError> {
        let presence = options
            .initial_presence()
            .map(serde_json::to_value)
            .transpose()?;

        Ok(json!({
            "op": OpCode::Identify,
            "d": {
                "token": options.token(),
                "properties": {
                    "os": self.os,
                    "browser": self.library,
                    "device": self.library,
                },
                "compress": false,
                "large_threshold": self.large_threshold,
                "shard": options.shard().as_array(),
                "intents": options.intent_bits().bits(),
                "presence": presence,
            }
        }))
    }
}

impl Codec for JsonCodec {
    fn decode(&self, frame: &str) -> Result<Inbound, CodecError> {
        let raw: RawPayload = serde_json::from_str(frame)?;

        match raw.op {
            OpCode::Hello => {
                let interval = raw
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .ok_or(CodecError::MissingField("heartbeat_interval"))?;
                Ok(Inbound::Hello {
                    heartbeat_interval: Duration::from_millis(interval),
                })
            }
            OpCode::HeartbeatAck => Ok(Inbound::HeartbeatAck),
            OpCode::Heartbeat => Ok(Inbound::HeartbeatRequest),
            OpCode::Reconnect => Ok(Inbound::Reconnect),
            OpCode::InvalidSession => Ok(Inbound::InvalidSession {
                resumable: raw.d.as_bool().unwrap_or(false),
            }),
            OpCode::Dispatch => Ok(Inbound::Dispatch {
                sequence: raw.s,
                name: raw.t.ok_or(CodecError::MissingField("t"))?,
                data: raw.d,
            }),
            other => Err(CodecError::UnexpectedOpcode(other)),
        }
    }

    fn encode(&self, payload: &Outbound<'_>) -> Result<String, CodecError> {
        let value = match payload {
            Outbound::Identify(options) => self.identify(options)?,
            Outbound::Resume { token, context } => json!({
                "op": OpCode::Resume,
                "d": {
                    "token": token,
                    "session_id": &*context.session_id,
                    "seq": context.last_sequence,
                }
            }),
            Outbound::Heartbeat { last_sequence } => json!({
                "op": OpCode::Heartbeat,
                "d": last_sequence,
            }),
        };

        Ok(serde_json::to_string(&value)?)
    }
}
