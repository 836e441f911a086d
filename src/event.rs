//! Domain events handed from shard sessions to the dispatcher.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::gateway::ShardInfo;

/// Closed set of event kinds a subscriber can filter on.
///
/// The first block is produced by the session itself while it moves through
/// its lifecycle; everything else mirrors a gateway dispatch name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventKind {
    Connect,
    Disconnect,
    ReconnectStart,
    Reconnect,
    /// A connect attempt failed. Every failed attempt is reported, the first
    /// one after `start` included, so it can arrive without a preceding
    /// `ReconnectStart`.
    ReconnectFail,

    Ready,
    Resumed,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    ChannelPinsUpdate,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageReactionAdd,
    MessageReactionRemove,
    PresenceUpdate,
    TypingStart,
    UserUpdate,
    VoiceStateUpdate,
    VoiceServerUpdate,
    InteractionCreate,
    /// A dispatch whose name is not in this list. The raw name stays on the event.
    Unknown,
}

/// Coarse grouping used to build filters that span several kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Lifecycle,
    Channel,
    Guild,
    Message,
    Presence,
    Voice,
    Other,
}

impl EventKind {
    pub const ALL: [EventKind; 29] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::ReconnectStart,
        EventKind::Reconnect,
        EventKind::ReconnectFail,
        EventKind::Ready,
        EventKind::Resumed,
        EventKind::ChannelCreate,
        EventKind::ChannelUpdate,
        EventKind::ChannelDelete,
        EventKind::ChannelPinsUpdate,
        EventKind::GuildCreate,
        EventKind::GuildUpdate,
        EventKind::GuildDelete,
        EventKind::GuildMemberAdd,
        EventKind::GuildMemberUpdate,
        EventKind::GuildMemberRemove,
        EventKind::MessageCreate,
        EventKind::MessageUpdate,
        EventKind::MessageDelete,
        EventKind::MessageReactionAdd,
        EventKind::MessageReactionRemove,
        EventKind::PresenceUpdate,
        EventKind::TypingStart,
        EventKind::UserUpdate,
        EventKind::VoiceStateUpdate,
        EventKind::VoiceServerUpdate,
        EventKind::InteractionCreate,
        EventKind::Unknown,
    ];

    /// Maps a gateway dispatch name (`t` field) to its kind.
    pub fn from_dispatch_name(name: &str) -> EventKind {
        match name {
            "READY" => EventKind::Ready,
            "RESUMED" => EventKind::Resumed,
            "CHANNEL_CREATE" => EventKind::ChannelCreate,
            "CHANNEL_UPDATE" => EventKind::ChannelUpdate,
            "CHANNEL_DELETE" => EventKind::ChannelDelete,
            "CHANNEL_PINS_UPDATE" => EventKind::ChannelPinsUpdate,
            "GUILD_CREATE" => EventKind::GuildCreate,
            "GUILD_UPDATE" => EventKind::GuildUpdate,
            "GUILD_DELETE" => EventKind::GuildDelete,
            "GUILD_MEMBER_ADD" => EventKind::GuildMemberAdd,
            "GUILD_MEMBER_UPDATE" => EventKind::GuildMemberUpdate,
            "GUILD_MEMBER_REMOVE" => EventKind::GuildMemberRemove,
            "MESSAGE_CREATE" => EventKind::MessageCreate,
            "MESSAGE_UPDATE" => EventKind::MessageUpdate,
            "MESSAGE_DELETE" => EventKind::MessageDelete,
            "MESSAGE_REACTION_ADD" => EventKind::MessageReactionAdd,
            "MESSAGE_REACTION_REMOVE" => EventKind::MessageReactionRemove,
            "PRESENCE_UPDATE" => EventKind::PresenceUpdate,
            "TYPING_START" => EventKind::TypingStart,
            "USER_UPDATE" => EventKind::UserUpdate,
            "VOICE_STATE_UPDATE" => EventKind::VoiceStateUpdate,
            "VOICE_SERVER_UPDATE" => EventKind::VoiceServerUpdate,
            "INTERACTION_CREATE" => EventKind::InteractionCreate,
            _ => EventKind::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Connect => "CONNECT",
            EventKind::Disconnect => "DISCONNECT",
            EventKind::ReconnectStart => "RECONNECT_START",
            EventKind::Reconnect => "RECONNECT",
            EventKind::ReconnectFail => "RECONNECT_FAIL",
            EventKind::Ready => "READY",
            EventKind::Resumed => "RESUMED",
            EventKind::ChannelCreate => "CHANNEL_CREATE",
            EventKind::ChannelUpdate => "CHANNEL_UPDATE",
            EventKind::ChannelDelete => "CHANNEL_DELETE",
            EventKind::ChannelPinsUpdate => "CHANNEL_PINS_UPDATE",
            EventKind::GuildCreate => "GUILD_CREATE",
            EventKind::GuildUpdate => "GUILD_UPDATE",
            EventKind::GuildDelete => "GUILD_DELETE",
            EventKind::GuildMemberAdd => "GUILD_MEMBER_ADD",
            EventKind::GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
            EventKind::GuildMemberRemove => "GUILD_MEMBER_REMOVE",
            EventKind::MessageCreate => "MESSAGE_CREATE",
            EventKind::MessageUpdate => "MESSAGE_UPDATE",
            EventKind::MessageDelete => "MESSAGE_DELETE",
            EventKind::MessageReactionAdd => "MESSAGE_REACTION_ADD",
            EventKind::MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
            EventKind::PresenceUpdate => "PRESENCE_UPDATE",
            EventKind::TypingStart => "TYPING_START",
            EventKind::UserUpdate => "USER_UPDATE",
            EventKind::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            EventKind::VoiceServerUpdate => "VOICE_SERVER_UPDATE",
            EventKind::InteractionCreate => "INTERACTION_CREATE",
            EventKind::Unknown => "UNKNOWN",
        }
    }

    pub fn category(self) -> Category {
        match self {
            EventKind::Connect
            | EventKind::Disconnect
            | EventKind::ReconnectStart
            | EventKind::Reconnect
            | EventKind::ReconnectFail
            | EventKind::Ready
            | EventKind::Resumed => Category::Lifecycle,
            EventKind::ChannelCreate
            | EventKind::ChannelUpdate
            | EventKind::ChannelDelete
            | EventKind::ChannelPinsUpdate => Category::Channel,
            EventKind::GuildCreate
            | EventKind::GuildUpdate
            | EventKind::GuildDelete
            | EventKind::GuildMemberAdd
            | EventKind::GuildMemberUpdate
            | EventKind::GuildMemberRemove => Category::Guild,
            EventKind::MessageCreate
            | EventKind::MessageUpdate
            | EventKind::MessageDelete
            | EventKind::MessageReactionAdd
            | EventKind::MessageReactionRemove
            | EventKind::TypingStart => Category::Message,
            EventKind::PresenceUpdate | EventKind::UserUpdate => Category::Presence,
            EventKind::VoiceStateUpdate | EventKind::VoiceServerUpdate => Category::Voice,
            EventKind::InteractionCreate | EventKind::Unknown => Category::Other,
        }
    }

    fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Set of kinds a subscriber wants, resolved once at subscribe time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct EventFilter {
    mask: u64,
}

impl EventFilter {
    pub fn none() -> Self {
        Self { mask: 0 }
    }

    pub fn all() -> Self {
        EventKind::ALL.iter().copied().collect()
    }

    pub fn category(category: Category) -> Self {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|kind| kind.category() == category)
            .collect()
    }

    pub fn with(mut self, kind: EventKind) -> Self {
        self.mask |= kind.bit();
        self
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        self.mask & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::none().with(kind)
    }
}

impl<const N: usize> From<[EventKind; N]> for EventFilter {
    fn from(kinds: [EventKind; N]) -> Self {
        kinds.into_iter().collect()
    }
}

impl FromIterator<EventKind> for EventFilter {
    fn from_iter<T: IntoIterator<Item = EventKind>>(iter: T) -> Self {
        iter.into_iter().fold(EventFilter::none(), EventFilter::with)
    }
}

/// Body of an event.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Raw `d` field of a gateway dispatch.
    Dispatch(Value),
    Disconnect {
        close_code: Option<u16>,
        resumable: bool,
    },
    /// `attempt` numbers connect attempts since the last successful handshake, from 1.
    ReconnectFail {
        attempt: u32,
    },
    Reconnect {
        attempt: u32,
    },
    Empty,
}

/// Immutable event as seen by subscribers.
#[derive(Clone, Debug)]
pub struct Event {
    kind: EventKind,
    name: Arc<str>,
    gateway: Arc<str>,
    shard: ShardInfo,
    session_id: Option<Arc<str>>,
    sequence: Option<u64>,
    payload: Payload,
}

impl Event {
    pub fn dispatch(
        name: &str,
        gateway: Arc<str>,
        shard: ShardInfo,
        session_id: Option<Arc<str>>,
        sequence: Option<u64>,
        data: Value,
    ) -> Self {
        Self {
            kind: EventKind::from_dispatch_name(name),
            name: Arc::from(name),
            gateway,
            shard,
            session_id,
            sequence,
            payload: Payload::Dispatch(data),
        }
    }

    pub fn lifecycle(
        kind: EventKind,
        gateway: Arc<str>,
        shard: ShardInfo,
        session_id: Option<Arc<str>>,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            name: Arc::from(kind.name()),
            gateway,
            shard,
            session_id,
            sequence: None,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Dispatch name as received; equals `kind().name()` for known kinds.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Deserializes the dispatch body into a caller-chosen type, e.g. one of
    /// `twilight_model::gateway::payload::incoming`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        match &self.payload {
            Payload::Dispatch(data) => Some(T::deserialize(data)),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{shard={}", self.name, self.shard)?;
        if let Some(sequence) = self.sequence {
            write!(f, ", seq={sequence}")?;
        }
        match &self.payload {
            Payload::Disconnect { close_code, resumable } => {
                write!(f, ", close_code={close_code:?}, resumable={resumable}")?
            }
            Payload::ReconnectFail { attempt } | Payload::Reconnect { attempt } => {
                write!(f, ", attempt={attempt}")?
            }
            Payload::Dispatch(_) | Payload::Empty => (),
        }
        f.write_str("}")
    }
}
