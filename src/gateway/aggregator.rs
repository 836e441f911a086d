use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::connection::ConnectionHandle;
use super::shard::ShardSession;
use super::types::IdentifyOptions;
use crate::error::GatewayError;

/// Tracks which registered shards have been logged out.
pub(crate) struct CloseTracker {
    total: usize,
    closed: Mutex<HashSet<u32>>,
    fired: watch::Sender<bool>,
}

impl CloseTracker {
    fn new(total: usize) -> Self {
        let (fired, _) = watch::channel(total == 0);
        Self {
            total,
            closed: Mutex::new(HashSet::new()),
            fired,
        }
    }

    /// A started session is live again. No effect once the signal fired.
    pub(crate) fn session_started(&self, index: u32) {
        if !*self.fired.borrow() {
            self.closed.lock().remove(&index);
        }
    }

    pub(crate) fn session_closed(&self, index: u32) {
        let mut closed = self.closed.lock();
        closed.insert(index);
        if closed.len() >= self.total && !*self.fired.borrow() {
            info!(shards = self.total, "all shards logged out");
            self.fired.send_replace(true);
        }
    }

    fn signal(&self) -> CloseSignal {
        CloseSignal {
            fired: self.fired.subscribe(),
        }
    }
}

/// Single-fire marker that resolves once every shard of a registry has been
/// logged out. Resumable closes never count towards it.
#[derive(Clone, Debug)]
pub struct CloseSignal {
    fired: watch::Receiver<bool>,
}

impl CloseSignal {
    pub fn is_closed(&self) -> bool {
        *self.fired.borrow()
    }

    pub async fn closed(mut self) {
        // the tracker lives as long as the registry; losing it counts as closed
        let _ = self.fired.wait_for(|fired| *fired).await;
    }
}

/// The fixed set of shard sessions of one client instance.
pub struct SessionRegistry {
    sessions: BTreeMap<u32, Arc<ShardSession>>,
    tracker: Arc<CloseTracker>,
}

impl SessionRegistry {
    /// Takes ownership of every session before any of them is started.
    pub fn register_all(
        sessions: impl IntoIterator<Item = ShardSession>,
    ) -> Result<Self, GatewayError> {
        let mut registered = BTreeMap::new();
        for session in sessions {
            let shard = session.shard();
            if shard.index() >= shard.count() {
                return Err(GatewayError::InvalidShard {
                    index: shard.index(),
                    count: shard.count(),
                });
            }
            if registered.contains_key(&shard.index()) {
                return Err(GatewayError::DuplicateShard(shard.index()));
            }
            registered.insert(shard.index(), Arc::new(session));
        }

        let tracker = Arc::new(CloseTracker::new(registered.len()));
        for session in registered.values() {
            session.attach_tracker(Arc::clone(&tracker));
        }
        debug!(shards = registered.len(), "sessions registered");

        Ok(Self {
            sessions: registered,
            tracker,
        })
    }

    pub fn get(&self, index: u32) -> Result<&Arc<ShardSession>, GatewayError> {
        self.sessions
            .get(&index)
            .ok_or(GatewayError::ShardNotFound(index))
    }

    pub fn identify_options(&self, index: u32) -> Result<&IdentifyOptions, GatewayError> {
        self.get(index).map(|session| session.identify_options())
    }

    /// Sessions in shard index order.
    pub fn shards(&self) -> impl Iterator<Item = &Arc<ShardSession>> + '_ {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn start_all(&self) {
        for session in self.sessions.values() {
            session.start();
        }
    }

    /// Closes every session concurrently; resolves when all of them are down.
    pub fn close_all(&self, resumable: bool) -> impl Future<Output = ()> + Send + 'static {
        let closing: Vec<_> = self
            .sessions
            .values()
            .map(|session| session.close(resumable))
            .collect();
        async move {
            join_all(closing).await;
        }
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.tracker.signal()
    }

    pub fn connection(self: &Arc<Self>, index: u32) -> Result<ConnectionHandle, GatewayError> {
        ConnectionHandle::new(Arc::clone(self), index)
    }
}
