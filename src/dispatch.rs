//! Fan-out of decoded events to subscribers.
//!
//! Every shard publishes into one bounded broadcast ring. `publish` never
//! waits: when a subscriber falls more than `capacity` events behind, its
//! oldest undelivered events are dropped and it resumes from the oldest one
//! still retained (drop-oldest). Other subscribers and the publishing shard
//! are unaffected.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{ready, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

use crate::event::{Event, EventFilter};
use crate::log::{LogContext, LogSink, TracingSink};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Where subscriber callbacks run.
#[derive(Clone, Debug, Default)]
pub enum Scheduler {
    /// The runtime of whoever registers the callback.
    #[default]
    Ambient,
    /// A dedicated runtime, usually a multi-thread worker pool.
    Runtime(Handle),
}

impl Scheduler {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self {
            Scheduler::Ambient => tokio::spawn(future),
            Scheduler::Runtime(handle) => handle.spawn(future),
        }
    }
}

/// Single ingress for events from every shard of a client.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<Arc<Event>>,
    scheduler: Scheduler,
    sink: Arc<dyn LogSink>,
}

impl EventDispatcher {
    pub fn new(capacity: usize, scheduler: Scheduler, sink: Arc<dyn LogSink>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            scheduler,
            sink,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Enqueues an event for every current subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(Arc::new(event)) {
            trace!(kind = %event.kind(), "no subscribers for event");
        }
    }

    /// Events of the selected kinds published from now on, in the order each
    /// shard published them.
    pub fn subscribe_to(&self, filter: impl Into<EventFilter>) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.sender.subscribe()),
            filter: filter.into(),
            sink: Arc::clone(&self.sink),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Scheduler::Ambient, Arc::new(TracingSink::new()))
    }
}

/// Subscription stream returned by [`EventDispatcher::subscribe_to`].
pub struct EventStream {
    inner: BroadcastStream<Arc<Event>>,
    filter: EventFilter,
    sink: Arc<dyn LogSink>,
}

impl EventStream {
    fn log_delivery(&self, event: &Event) {
        if self.sink.enabled(event.kind(), event.shard()) {
            let context = LogContext::new()
                .gateway(event.gateway())
                .shard(event.shard().index());
            self.sink.log(&context.format(&event.to_string()));
        }
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.inner.poll_next_unpin(cx)) {
                None => return Poll::Ready(None),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(missed, "subscriber fell behind, oldest events dropped");
                }
                Some(Ok(event)) => {
                    if self.filter.matches(event.kind()) {
                        self.log_delivery(&event);
                        return Poll::Ready(Some(event));
                    }
                }
            }
        }
    }
}
