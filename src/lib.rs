//! Client-side session management for a sharded, WebSocket based chat
//! gateway: one state machine per shard, a registry that owns them as a
//! single client, and a dispatcher that fans decoded events out to
//! subscribers.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod gateway;
pub mod listener;
pub mod log;

pub use dispatch::{EventDispatcher, EventStream, Scheduler};
pub use error::{ConfigError, GatewayError};
pub use event::{Category, Event, EventFilter, EventKind, Payload};
pub use gateway::{ConnectionHandle, SessionRegistry, ShardInfo, ShardSession};
pub use listener::{Listener, Subscription};
