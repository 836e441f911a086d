use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::aggregator::{CloseSignal, SessionRegistry};
use super::shard::ShardSession;
use super::types::{IdentifyOptions, ShardInfo};
use crate::error::GatewayError;

/// Caller-facing view of one shard of a registry.
#[derive(Clone)]
pub struct ConnectionHandle {
    registry: Arc<SessionRegistry>,
    session: Arc<ShardSession>,
}

impl ConnectionHandle {
    pub fn new(registry: Arc<SessionRegistry>, index: u32) -> Result<Self, GatewayError> {
        let session = Arc::clone(registry.get(index)?);
        Ok(Self { registry, session })
    }

    pub fn shard(&self) -> ShardInfo {
        self.session.shard()
    }

    pub fn identify_options(&self) -> &IdentifyOptions {
        self.session.identify_options()
    }

    /// Logs this shard out. Resolves once its transport is released.
    pub fn logout(&self) -> impl Future<Output = ()> + Send + 'static {
        self.session.close(false)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn response_time(&self) -> Option<Duration> {
        self.session.response_time()
    }

    /// Close signal of the whole registry, not of this shard alone: it
    /// resolves only after every shard of the client has been logged out.
    pub fn on_disconnect(&self) -> CloseSignal {
        self.registry.close_signal()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
