//! Shard sessions and the registry that groups them into one client.

mod aggregator;
mod backoff;
mod codec;
mod connection;
mod shard;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use aggregator::{CloseSignal, SessionRegistry};
pub use backoff::{Backoff, BackoffConfig};
pub use codec::{Codec, Inbound, JsonCodec, Outbound};
pub use connection::ConnectionHandle;
pub use shard::{SessionConfig, SessionContext, ShardSession};
pub use transport::{CloseInfo, Connector, Frame, Transport, TungsteniteConnector};
pub use types::{HeartbeatState, IdentifyOptions, ResumeContext, SessionState, ShardInfo};
