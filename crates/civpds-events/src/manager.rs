use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EventError, EventResult};
use crate::event::{ErrorFrame, StreamEvent};
use crate::frame::EventFrame;
use crate::persist::Persister;

/// Predicate deciding which events a subscriber receives.
pub type EventFilter = Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

/// A filter that accepts every event.
pub fn accept_all() -> EventFilter {
    Arc::new(|_| true)
}

/// A filter that accepts events about one repository.
pub fn repo_filter(did: impl Into<String>) -> EventFilter {
    let did = did.into();
    Arc::new(move |event| event.repo() == Some(did.as_str()))
}

/// Configuration for the [`EventManager`].
#[derive(Clone, Debug)]
pub struct EventManagerConfig {
    /// Capacity of each subscriber's outgoing channel.
    pub subscriber_buffer: usize,
    /// Capacity of the live channel used while a replay catches up.
    pub crossover_buffer: usize,
    /// How long to wait to deliver the error frame to a dropped subscriber.
    pub slow_consumer_timeout: Duration,
    /// Events fetched per persister playback call.
    pub playback_batch: usize,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 16_384,
            crossover_buffer: 512,
            slow_consumer_timeout: Duration::from_secs(5),
            playback_batch: 1_000,
        }
    }
}

struct Subscriber {
    ident: String,
    filter: EventFilter,
    outgoing: mpsc::Sender<Arc<EventFrame>>,
    /// Set once the subscriber is dropped; it then matches nothing.
    dropped: AtomicBool,
    done: CancellationToken,
}

struct Inner {
    persister: Arc<dyn Persister>,
    config: EventManagerConfig,
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    /// Serialises persist + broadcast so live order matches seq order.
    emit_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Inner {
    fn register(
        &self,
        id: u64,
        ident: String,
        filter: EventFilter,
        capacity: usize,
        done: CancellationToken,
    ) -> mpsc::Receiver<Arc<EventFrame>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sub = Arc::new(Subscriber {
            ident,
            filter,
            outgoing: tx,
            dropped: AtomicBool::new(false),
            done,
        });
        self.subscribers
            .write()
            .expect("lock poisoned")
            .insert(id, sub);
        rx
    }

    fn remove(&self, id: u64) {
        let sub = self.subscribers.write().expect("lock poisoned").remove(&id);
        if let Some(sub) = sub {
            sub.done.cancel();
            debug!(subscriber = %sub.ident, "subscriber removed");
        }
    }

    fn broadcast(self: &Arc<Self>, frame: &Arc<EventFrame>) {
        let subs = self.subscribers.read().expect("lock poisoned");
        for (&id, sub) in subs.iter() {
            if sub.dropped.load(Ordering::Acquire) || !(sub.filter)(&frame.event) {
                continue;
            }
            match sub.outgoing.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.drop_slow(id, sub.clone()),
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Stop delivering to `sub`, queue a `ConsumerTooSlow` frame and clean
    /// it up. The broadcaster never waits on the subscriber.
    fn drop_slow(self: &Arc<Self>, id: u64, sub: Arc<Subscriber>) {
        if sub.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(subscriber = %sub.ident, "dropping slow consumer");
        let inner = Arc::downgrade(self);
        let timeout = self.config.slow_consumer_timeout;
        tokio::spawn(async move {
            match EventFrame::new(StreamEvent::Error(ErrorFrame::consumer_too_slow())) {
                Ok(frame) => {
                    let send = sub.outgoing.send(Arc::new(frame));
                    if tokio::time::timeout(timeout, send).await.is_err() {
                        debug!(subscriber = %sub.ident, "error frame not delivered");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode error frame"),
            }
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        });
    }
}

/// Removes a subscription from its manager. Safe to call any number of
/// times.
#[derive(Clone)]
pub struct CleanupHandle {
    id: u64,
    done: CancellationToken,
    inner: Weak<Inner>,
}

impl CleanupHandle {
    pub fn cleanup(&self) {
        self.done.cancel();
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.id);
        }
    }

    /// Cancelled once the subscription is cleaned up.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }
}

/// The receiving side of a subscription.
///
/// Yields frames until the subscription is cleaned up, the subscriber is
/// dropped for being too slow (after a final error frame), or the manager
/// shuts down.
pub struct Subscription {
    ident: String,
    rx: mpsc::Receiver<Arc<EventFrame>>,
    handle: CleanupHandle,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<EventFrame>> {
        self.rx.recv().await
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn cleanup_handle(&self) -> CleanupHandle {
        self.handle.clone()
    }

    pub fn cleanup(&self) {
        self.handle.cleanup();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cleanup();
    }
}

/// Persists events, broadcasts them to live subscribers and serves
/// replay-then-live subscriptions without gaps.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<Inner>,
}

impl EventManager {
    pub fn new(persister: Arc<dyn Persister>, config: EventManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                persister,
                config,
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                emit_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn persister(&self) -> &Arc<dyn Persister> {
        &self.inner.persister
    }

    pub fn config(&self) -> &EventManagerConfig {
        &self.inner.config
    }

    /// Number of registered live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().expect("lock poisoned").len()
    }

    /// Persist `event` (assigning its seq) and broadcast it.
    pub async fn add_event(&self, event: StreamEvent) -> EventResult<Arc<EventFrame>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EventError::Closed);
        }
        let _guard = self.inner.emit_lock.lock().await;
        let frame = self.inner.persister.persist(event).await?;
        self.inner.broadcast(&frame);
        Ok(frame)
    }

    /// Subscribe to events accepted by `filter`.
    ///
    /// With `since`, every stored event with `seq >= since` is replayed
    /// first and the stream then crosses over to live events without gaps
    /// or duplicates.
    pub fn subscribe(
        &self,
        ident: impl Into<String>,
        filter: EventFilter,
        since: Option<i64>,
    ) -> EventResult<Subscription> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EventError::Closed);
        }
        let ident = ident.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let done = self.inner.shutdown.child_token();
        let handle = CleanupHandle {
            id,
            done: done.clone(),
            inner: Arc::downgrade(&self.inner),
        };

        let Some(since) = since else {
            let rx = self.inner.register(
                id,
                ident.clone(),
                filter,
                self.inner.config.subscriber_buffer,
                done,
            );
            debug!(subscriber = %ident, "live subscriber registered");
            return Ok(Subscription { ident, rx, handle });
        };

        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        let inner = self.inner.clone();
        let task_ident = ident.clone();
        tokio::spawn(async move {
            let result =
                crossover(&inner, id, task_ident.clone(), filter, since, tx, done).await;
            match result {
                Ok(()) | Err(EventError::Closed) => {}
                Err(e) => warn!(subscriber = %task_ident, error = %e, "replay failed"),
            }
            inner.remove(id);
        });
        debug!(subscriber = %ident, since, "replay subscriber started");
        Ok(Subscription { ident, rx, handle })
    }

    /// Close every subscription and refuse new events.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<_> = self
            .inner
            .subscribers
            .write()
            .expect("lock poisoned")
            .drain()
            .collect();
        info!(subscribers = drained.len(), "event manager shut down");
    }
}

async fn send(
    out: &mpsc::Sender<Arc<EventFrame>>,
    frame: Arc<EventFrame>,
    done: &CancellationToken,
) -> EventResult<()> {
    tokio::select! {
        _ = done.cancelled() => Err(EventError::Closed),
        r = out.send(frame) => r.map_err(|_| EventError::Closed),
    }
}

/// Replay stored events after `after`, returning the last seq seen.
///
/// With `stop_at`, fails with [`EventError::CaughtUp`] on reaching an event
/// whose seq is at least `stop_at`.
async fn replay(
    inner: &Inner,
    filter: &EventFilter,
    out: &mpsc::Sender<Arc<EventFrame>>,
    done: &CancellationToken,
    after: &mut i64,
    stop_at: Option<i64>,
) -> EventResult<()> {
    let batch = inner.config.playback_batch.max(1);
    loop {
        let frames = inner.persister.playback(*after, batch).await?;
        let n = frames.len();
        for frame in frames {
            let Some(seq) = frame.seq() else { continue };
            if stop_at.is_some_and(|stop| seq >= stop) {
                return Err(EventError::CaughtUp);
            }
            *after = seq;
            if filter(&frame.event) {
                send(out, frame, done).await?;
            }
        }
        if n < batch {
            return Ok(());
        }
    }
}

async fn crossover(
    inner: &Arc<Inner>,
    id: u64,
    ident: String,
    filter: EventFilter,
    since: i64,
    out: mpsc::Sender<Arc<EventFrame>>,
    done: CancellationToken,
) -> EventResult<()> {
    let mut last = since.saturating_sub(1);
    replay(inner, &filter, &out, &done, &mut last, None).await?;

    let mut live = inner.register(
        id,
        ident,
        filter.clone(),
        inner.config.crossover_buffer,
        done.clone(),
    );
    if done.is_cancelled() {
        return Err(EventError::Closed);
    }

    let first = tokio::select! {
        _ = done.cancelled() => return Err(EventError::Closed),
        first = live.recv() => match first {
            Some(first) => first,
            None => return Ok(()),
        },
    };
    if let Some(first_seq) = first.seq() {
        match replay(inner, &filter, &out, &done, &mut last, Some(first_seq)).await {
            Ok(()) | Err(EventError::CaughtUp) => {}
            Err(e) => return Err(e),
        }
    }

    let mut next = Some(first);
    loop {
        let frame = match next.take() {
            Some(frame) => frame,
            None => tokio::select! {
                _ = done.cancelled() => return Err(EventError::Closed),
                frame = live.recv() => match frame {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            },
        };
        match frame.seq() {
            Some(seq) if seq <= last => continue,
            Some(seq) => last = seq,
            None => {}
        }
        send(&out, frame, &done).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{now_rfc3339, TombstoneEvent};
    use crate::persist::MemPersister;

    fn tombstone(did: &str) -> StreamEvent {
        StreamEvent::Tombstone(TombstoneEvent {
            seq: 0,
            did: did.into(),
            time: now_rfc3339(),
        })
    }

    fn manager(config: EventManagerConfig) -> EventManager {
        EventManager::new(Arc::new(MemPersister::new()), config)
    }

    // ----------------------------------------------------------------
    // Live broadcast
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn live_subscriber_receives_in_order() {
        let em = manager(EventManagerConfig::default());
        let mut sub = em.subscribe("a", accept_all(), None).unwrap();
        for i in 0..5 {
            em.add_event(tombstone(&format!("did:plc:{i}"))).await.unwrap();
        }
        for expected in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().seq(), Some(expected));
        }
    }

    #[tokio::test]
    async fn filter_selects_events() {
        let em = manager(EventManagerConfig::default());
        let mut sub = em.subscribe("a", repo_filter("did:plc:b"), None).unwrap();
        em.add_event(tombstone("did:plc:a")).await.unwrap();
        em.add_event(tombstone("did:plc:b")).await.unwrap();
        em.add_event(tombstone("did:plc:c")).await.unwrap();
        let got = sub.recv().await.unwrap();
        assert_eq!(got.event.repo(), Some("did:plc:b"));
        assert_eq!(got.seq(), Some(2));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_closes_stream() {
        let em = manager(EventManagerConfig::default());
        let mut sub = em.subscribe("a", accept_all(), None).unwrap();
        assert_eq!(em.subscriber_count(), 1);
        sub.cleanup();
        sub.cleanup();
        sub.cleanup_handle().cleanup();
        assert_eq!(em.subscriber_count(), 0);
        assert!(sub.handle.done().is_cancelled());
        em.add_event(tombstone("did:plc:a")).await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let em = manager(EventManagerConfig::default());
        let sub = em.subscribe("a", accept_all(), None).unwrap();
        assert_eq!(em.subscriber_count(), 1);
        drop(sub);
        assert_eq!(em.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_subscribers_and_rejects_events() {
        let em = manager(EventManagerConfig::default());
        let mut sub = em.subscribe("a", accept_all(), None).unwrap();
        em.shutdown();
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            em.add_event(tombstone("did:plc:a")).await,
            Err(EventError::Closed)
        ));
        assert!(em.subscribe("b", accept_all(), None).is_err());
    }

    // ----------------------------------------------------------------
    // Replay
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn replay_then_live() {
        let em = manager(EventManagerConfig {
            playback_batch: 2,
            ..EventManagerConfig::default()
        });
        for i in 0..5 {
            em.add_event(tombstone(&format!("did:plc:{i}"))).await.unwrap();
        }
        let mut sub = em.subscribe("r", accept_all(), Some(3)).unwrap();
        for expected in 3..=5 {
            assert_eq!(sub.recv().await.unwrap().seq(), Some(expected));
        }
        em.add_event(tombstone("did:plc:x")).await.unwrap();
        em.add_event(tombstone("did:plc:y")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().seq(), Some(6));
        assert_eq!(sub.recv().await.unwrap().seq(), Some(7));
    }

    #[tokio::test]
    async fn replay_applies_filter() {
        let em = manager(EventManagerConfig::default());
        for did in ["did:plc:a", "did:plc:b", "did:plc:a"] {
            em.add_event(tombstone(did)).await.unwrap();
        }
        let mut sub = em.subscribe("r", repo_filter("did:plc:a"), Some(1)).unwrap();
        assert_eq!(sub.recv().await.unwrap().seq(), Some(1));
        assert_eq!(sub.recv().await.unwrap().seq(), Some(3));
        em.add_event(tombstone("did:plc:b")).await.unwrap();
        em.add_event(tombstone("did:plc:a")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().seq(), Some(5));
    }
}
