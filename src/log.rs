//! Contextual log tagging and the event log sink.

use std::collections::HashSet;
use std::fmt::Display;

use tracing::Level;

use crate::event::EventKind;
use crate::gateway::ShardInfo;

/// Identifiers describing where a log line originates. Only the keys that are
/// set show up in the prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogContext {
    bucket: Option<String>,
    request: Option<String>,
    gateway: Option<String>,
    shard: Option<String>,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(mut self, id: impl Display) -> Self {
        self.bucket = Some(id.to_string());
        self
    }

    pub fn request(mut self, id: impl Display) -> Self {
        self.request = Some(id.to_string());
        self
    }

    pub fn gateway(mut self, id: impl Display) -> Self {
        self.gateway = Some(id.to_string());
        self
    }

    pub fn shard(mut self, id: impl Display) -> Self {
        self.shard = Some(id.to_string());
        self
    }

    /// `[key=value, ...] message`, keys in the order bucket, request, gateway,
    /// shard. Returns the bare message when no key is set.
    pub fn format(&self, message: &str) -> String {
        let header = [
            ("bucket", &self.bucket),
            ("request", &self.request),
            ("gateway", &self.gateway),
            ("shard", &self.shard),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|value| format!("{key}={value}")))
        .collect::<Vec<_>>()
        .join(", ");

        if header.is_empty() {
            message.to_string()
        } else {
            format!("[{header}] {message}")
        }
    }
}

/// Detail-level sink for delivered events.
pub trait LogSink: Send + Sync {
    fn enabled(&self, kind: EventKind, shard: ShardInfo) -> bool;

    fn log(&self, line: &str);
}

/// Writes to `tracing` at DEBUG under the `shardlink::events` target,
/// optionally narrowed to some kinds and shard indices.
#[derive(Clone, Debug, Default)]
pub struct TracingSink {
    kinds: Option<HashSet<EventKind>>,
    shards: Option<HashSet<u32>>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn only_shards(mut self, shards: impl IntoIterator<Item = u32>) -> Self {
        self.shards = Some(shards.into_iter().collect());
        self
    }

    fn selects(&self, kind: EventKind, shard: ShardInfo) -> bool {
        let kind_ok = self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind));
        let shard_ok = self
            .shards
            .as_ref()
            .map_or(true, |shards| shards.contains(&shard.index()));
        kind_ok && shard_ok
    }
}

impl LogSink for TracingSink {
    fn enabled(&self, kind: EventKind, shard: ShardInfo) -> bool {
        tracing::enabled!(target: "shardlink::events", Level::DEBUG) && self.selects(kind, shard)
    }

    fn log(&self, line: &str) {
        tracing::debug!(target: "shardlink::events", "{line}");
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}
