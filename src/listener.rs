//! Callback style access to the dispatcher.
//!
//! Callbacks run on the dispatcher's [`Scheduler`](crate::dispatch::Scheduler),
//! never on a shard's task, so a slow callback only delays its own
//! subscription.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::dispatch::{EventDispatcher, EventStream};
use crate::event::{Event, EventFilter};

#[derive(Clone)]
pub struct Listener {
    dispatcher: EventDispatcher,
}

impl Listener {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Runs `callback` for every matching event until the subscription is
    /// cancelled or dropped.
    pub fn on<F, Fut>(&self, filter: impl Into<EventFilter>, callback: F) -> Subscription
    where
        F: FnMut(Arc<Event>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(filter.into(), callback, false)
    }

    /// Like [`Listener::on`], but unsubscribes after the first event.
    pub fn once<F, Fut>(&self, filter: impl Into<EventFilter>, callback: F) -> Subscription
    where
        F: FnMut(Arc<Event>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(filter.into(), callback, true)
    }

    /// First event of the selected kinds accepted by `predicate`, or `None`
    /// once `cancel` fires. Subscribes immediately, before the returned
    /// future is polled.
    pub fn wait_for<P>(
        &self,
        filter: impl Into<EventFilter>,
        mut predicate: P,
        cancel: CancellationToken,
    ) -> impl Future<Output = Option<Arc<Event>>> + Send + 'static
    where
        P: FnMut(&Event) -> bool + Send + 'static,
    {
        let mut stream = self.dispatcher.subscribe_to(filter);
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    event = stream.next() => match event {
                        Some(event) if predicate(&event) => return Some(event),
                        Some(_) => (),
                        None => return None,
                    },
                }
            }
        }
    }

    fn spawn<F, Fut>(&self, filter: EventFilter, mut callback: F, once: bool) -> Subscription
    where
        F: FnMut(Arc<Event>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stream: EventStream = self.dispatcher.subscribe_to(filter);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = self.dispatcher.scheduler().spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                callback(event).await;
                if once {
                    break;
                }
            }
            trace!("listener finished");
        });

        Subscription { token, handle }
    }
}

/// A running callback registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits until the callback loop has stopped.
    pub async fn finished(mut self) {
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::message;
    use crate::dispatch::Scheduler;
    use crate::event::EventKind;
    use crate::log::TracingSink;
    use tokio::sync::mpsc;

    fn recorder() -> (
        mpsc::UnboundedSender<u64>,
        mpsc::UnboundedReceiver<u64>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn on_sees_every_matching_event() {
        let listener = Listener::new(EventDispatcher::default());
        let (tx, mut rx) = recorder();
        let _subscription = listener.on(EventKind::MessageCreate, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.sequence().unwrap_or_default());
            }
        });

        for sequence in 1..=3 {
            listener.dispatcher().publish(message(0, sequence));
        }

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn cancelled_subscription_stops() {
        let listener = Listener::new(EventDispatcher::default());
        let (tx, mut rx) = recorder();
        let subscription = listener.on(EventKind::MessageCreate, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.sequence().unwrap_or_default());
            }
        });

        subscription.cancel();
        subscription.finished().await;
        listener.dispatcher().publish(message(0, 1));

        // the callback, and with it the only sender, is gone
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let listener = Listener::new(EventDispatcher::default());
        let (tx, mut rx) = recorder();
        let subscription = listener.once(EventKind::MessageCreate, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.sequence().unwrap_or_default());
            }
        });

        listener.dispatcher().publish(message(0, 1));
        listener.dispatcher().publish(message(0, 2));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
        assert!(subscription.is_finished());
    }

    #[tokio::test]
    async fn wait_for_matches_predicate() {
        let listener = Listener::new(EventDispatcher::default());
        let waiting = listener.wait_for(
            EventKind::MessageCreate,
            |event| event.sequence() == Some(2),
            CancellationToken::new(),
        );

        listener.dispatcher().publish(message(0, 1));
        listener.dispatcher().publish(message(1, 2));

        let event = waiting.await.unwrap();
        assert_eq!(event.shard().index(), 1);
        assert_eq!(listener.dispatcher().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_gives_up_on_cancel() {
        let listener = Listener::new(EventDispatcher::default());
        let cancel = CancellationToken::new();
        let waiting = listener.wait_for(EventKind::Ready, |_| true, cancel.clone());

        listener.dispatcher().publish(message(0, 1));
        cancel.cancel();

        assert!(waiting.await.is_none());
    }

    #[test]
    fn callbacks_run_on_the_worker_pool() {
        let pool = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dispatch-pool")
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let dispatcher = EventDispatcher::new(
            16,
            Scheduler::Runtime(pool.handle().clone()),
            Arc::new(TracingSink::new()),
        );
        let listener = Listener::new(dispatcher);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = listener.on(EventKind::MessageCreate, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            }
        });

        listener.dispatcher().publish(message(0, 1));
        let thread = local.block_on(rx.recv()).flatten();
        assert_eq!(thread.as_deref(), Some("dispatch-pool"));
    }
}
