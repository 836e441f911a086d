use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::Intents;

/// Index and total of a shard, attached to every event it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardInfo {
    index: u32,
    count: u32,
}

impl ShardInfo {
    pub const fn new(index: u32, count: u32) -> Self {
        Self { index, count }
    }

    pub const fn index(&self) -> u32 {
        self.index
    }

    pub const fn count(&self) -> u32 {
        self.count
    }

    /// `[index, count]` as the identify payload expects it.
    pub const fn as_array(&self) -> [u32; 2] {
        [self.index, self.count]
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.index, self.count)
    }
}

/// Everything needed to identify one shard. Fixed once its session exists.
#[derive(Clone)]
pub struct IdentifyOptions {
    shard: ShardInfo,
    token: Arc<str>,
    intents: Intents,
    presence: Option<UpdatePresencePayload>,
}

impl IdentifyOptions {
    pub fn new(shard: ShardInfo, token: impl Into<Arc<str>>) -> Self {
        Self {
            shard,
            token: token.into(),
            intents: Intents::empty(),
            presence: None,
        }
    }

    pub fn intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    pub fn presence(mut self, presence: UpdatePresencePayload) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn shard_index(&self) -> u32 {
        self.shard.index
    }

    pub fn shard_count(&self) -> u32 {
        self.shard.count
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn intent_bits(&self) -> Intents {
        self.intents
    }

    pub fn initial_presence(&self) -> Option<&UpdatePresencePayload> {
        self.presence.as_ref()
    }
}

impl fmt::Debug for IdentifyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifyOptions")
            .field("shard", &self.shard)
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("presence", &self.presence)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Connected,
    Closing,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Identifying => "identifying",
            SessionState::Resuming => "resuming",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Server-issued session identity plus the last sequence seen on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeContext {
    pub session_id: Arc<str>,
    pub last_sequence: u64,
}

/// Heartbeat bookkeeping for the current connection.
#[derive(Clone, Debug, Default)]
pub struct HeartbeatState {
    interval: Option<Duration>,
    last_sent_at: Option<Instant>,
    last_ack_at: Option<Instant>,
    missed_acks: u32,
    awaiting_ack: bool,
    response_time: Option<Duration>,
}

impl HeartbeatState {
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    pub fn missed_acks(&self) -> u32 {
        self.missed_acks
    }

    /// Latency of the most recent completed round trip.
    pub fn response_time(&self) -> Option<Duration> {
        self.response_time
    }

    pub(crate) fn start(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.missed_acks = 0;
        self.awaiting_ack = false;
    }

    /// Called on every scheduled beat before sending. Counts the previous beat
    /// as missed when it never got its ack and returns the running total.
    pub(crate) fn check_missed(&mut self) -> u32 {
        if self.awaiting_ack {
            self.missed_acks += 1;
        }
        self.missed_acks
    }

    pub(crate) fn record_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
        self.awaiting_ack = true;
    }

    pub(crate) fn record_ack(&mut self, now: Instant) {
        self.last_ack_at = Some(now);
        if let Some(sent) = self.last_sent_at.filter(|_| self.awaiting_ack) {
            self.response_time = Some(now.saturating_duration_since(sent));
        }
        self.awaiting_ack = false;
        self.missed_acks = 0;
    }

    /// Drops per-connection state but keeps the last measured latency.
    pub(crate) fn reset(&mut self) {
        self.interval = None;
        self.missed_acks = 0;
        self.awaiting_ack = false;
    }
}
