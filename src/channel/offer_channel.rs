//! Resubscribable offer subscription with duplicate suppression.
//!
//! The subscription object enforces the cancel-before-resubscribe contract
//! itself: `subscribe()` always tears down the previous poll task before
//! starting a new one, so a caller re-subscribing on every reconnect can
//! never end up with two live listeners delivering the same offer id twice.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::transport::{PushEvent, PushTransport};
use crate::config::DispatchConfig;
use crate::engine::event::EngineEvent;

/// Bounded recent-id window.
///
/// Remembers offer ids already delivered and not yet withdrawn so that
/// redelivery across a reconnect is suppressed. Oldest ids fall off once
/// the window is full.
#[derive(Debug)]
pub(crate) struct SeenWindow {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    cap: usize,
}

impl SeenWindow {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            ids: HashSet::with_capacity(cap),
            cap,
        }
    }

    /// Returns false if the id was already in the window.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    fn remove(&mut self, id: Uuid) {
        if self.ids.remove(&id) {
            self.order.retain(|known| *known != id);
        }
    }
}

struct ChannelInner {
    task: Option<JoinHandle<()>>,
    seen: Arc<Mutex<SeenWindow>>,
}

/// Channel tuning, carried into the poll task.
#[derive(Debug, Clone)]
struct ChannelSettings {
    poll_timeout: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    reconnect_grace: Duration,
}

/// Push subscription for offer lifecycle events scoped to one worker.
#[derive(Clone)]
pub struct OfferChannel {
    transport: Arc<dyn PushTransport>,
    events_tx: mpsc::Sender<EngineEvent>,
    settings: ChannelSettings,
    inner: Arc<Mutex<ChannelInner>>,
}

impl OfferChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        events_tx: mpsc::Sender<EngineEvent>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            transport,
            events_tx,
            settings: ChannelSettings {
                poll_timeout: config.poll_timeout,
                backoff_base: config.reconnect_backoff_base,
                backoff_cap: config.reconnect_backoff_cap,
                reconnect_grace: config.reconnect_grace,
            },
            inner: Arc::new(Mutex::new(ChannelInner {
                task: None,
                seen: Arc::new(Mutex::new(SeenWindow::new(config.dedup_window))),
            })),
        }
    }

    /// Start delivering events for `worker_id` into the event loop.
    ///
    /// Any prior subscription is cancelled first. The recent-id window is
    /// kept, so offers delivered by the previous subscription are not
    /// redelivered by the new one.
    pub fn subscribe(&self, worker_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.task.take() {
            warn!("subscribe() while already subscribed; cancelling prior subscription");
            task.abort();
        }

        let transport = self.transport.clone();
        let events_tx = self.events_tx.clone();
        let settings = self.settings.clone();
        let seen = inner.seen.clone();

        info!(worker_id = %worker_id, "Offer subscription opened");
        inner.task = Some(tokio::spawn(poll_loop(
            transport, events_tx, settings, seen, worker_id,
        )));
    }

    /// Stop delivering events. Idempotent — safe to call repeatedly and
    /// from teardown paths.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.task.take() {
            task.abort();
            info!("Offer subscription cancelled");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// Long-poll loop: deliver deduplicated events, reconnect with capped
/// exponential backoff, and flag outages long enough to need reconciliation.
async fn poll_loop(
    transport: Arc<dyn PushTransport>,
    events_tx: mpsc::Sender<EngineEvent>,
    settings: ChannelSettings,
    seen: Arc<Mutex<SeenWindow>>,
    worker_id: Uuid,
) {
    let mut cursor: u64 = 0;
    let mut backoff = settings.backoff_base;
    let mut down_since: Option<Instant> = None;

    loop {
        match transport
            .poll(worker_id, cursor, settings.poll_timeout)
            .await
        {
            Ok(envelopes) => {
                backoff = settings.backoff_base;

                if let Some(since) = down_since.take() {
                    let outage = since.elapsed();
                    if outage > settings.reconnect_grace {
                        info!(outage_ms = outage.as_millis() as u64, "Transport recovered, requesting reconciliation");
                        if events_tx
                            .send(EngineEvent::Reconnected { outage })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }

                for envelope in envelopes {
                    cursor = cursor.max(envelope.cursor + 1);

                    let deliver = {
                        let mut seen = seen.lock().unwrap();
                        match &envelope.event {
                            PushEvent::OfferCreated { offer } => seen.insert(offer.id),
                            PushEvent::OfferWithdrawn { offer_id } => {
                                seen.remove(*offer_id);
                                true
                            }
                            PushEvent::AssignmentCancelled { .. } => true,
                        }
                    };

                    if !deliver {
                        debug!(cursor = envelope.cursor, "Suppressed duplicate offer delivery");
                        continue;
                    }

                    if events_tx
                        .send(EngineEvent::Push(envelope.event))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "Push transport authentication expired");
                let _ = events_tx.send(EngineEvent::AuthExpired).await;
                return;
            }
            Err(e) => {
                down_since.get_or_insert_with(Instant::now);
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Push transport failed, backing off");
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(settings.backoff_cap);
            }
        }
    }
}

/// Spread retries out so reconnecting workers don't stampede the backend.
fn jittered(backoff: Duration) -> Duration {
    let quarter = (backoff.as_millis() as u64 / 4).max(1);
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..quarter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::PushEnvelope;
    use crate::error::TransportError;
    use crate::model::{Coordinate, Offer};
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_offer(id: Uuid) -> Offer {
        let now = Utc::now();
        Offer {
            id,
            origin: Coordinate { lat: 0.0, lon: 0.0 },
            destination: Coordinate { lat: 1.0, lon: 1.0 },
            price: dec!(10.00),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        }
    }

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            poll_timeout: Duration::from_millis(20),
            reconnect_backoff_base: Duration::from_millis(5),
            reconnect_backoff_cap: Duration::from_millis(20),
            reconnect_grace: Duration::from_millis(30),
            ..DispatchConfig::default()
        }
    }

    /// Serves scripted batches, then idles. Tracks concurrent pollers.
    struct ScriptedTransport {
        batches: Mutex<VecDeque<Result<Vec<PushEnvelope>, ()>>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(batches: Vec<Result<Vec<PushEnvelope>, ()>>) -> Self {
            Self {
                batches: Mutex::new(batches.into_iter().collect()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn max_concurrent(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn poll(
            &self,
            _worker_id: Uuid,
            _cursor: u64,
            timeout: Duration,
        ) -> Result<Vec<PushEnvelope>, TransportError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            let next = self.batches.lock().unwrap().pop_front();
            let result = match next {
                Some(Ok(batch)) => Ok(batch),
                Some(Err(())) => Err(TransportError::Http("scripted outage".into())),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn envelope(cursor: u64, event: PushEvent) -> PushEnvelope {
        PushEnvelope { cursor, event }
    }

    async fn recv_push(rx: &mut mpsc::Receiver<EngineEvent>) -> PushEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed")
            {
                EngineEvent::Push(event) => return event,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn resubscribe_cancels_prior_subscription() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (tx, _rx) = mpsc::channel(16);
        let channel = OfferChannel::new(transport.clone(), tx, &test_config());
        let worker_id = Uuid::new_v4();

        channel.subscribe(worker_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.subscribe(worker_id);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(channel.is_subscribed());
        assert_eq!(
            transport.max_concurrent(),
            1,
            "two subscribe() calls must never leave two pollers alive"
        );
        channel.cancel();
    }

    #[tokio::test]
    async fn duplicate_offer_delivery_is_suppressed() {
        let offer = test_offer(Uuid::new_v4());
        let other = test_offer(Uuid::new_v4());
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(vec![envelope(0, PushEvent::OfferCreated { offer: offer.clone() })]),
            // Same offer id redelivered after a reconnect-style gap.
            Ok(vec![
                envelope(1, PushEvent::OfferCreated { offer: offer.clone() }),
                envelope(2, PushEvent::OfferCreated { offer: other.clone() }),
            ]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let channel = OfferChannel::new(transport, tx, &test_config());
        channel.subscribe(Uuid::new_v4());

        let first = recv_push(&mut rx).await;
        let second = recv_push(&mut rx).await;
        assert_eq!(first, PushEvent::OfferCreated { offer });
        assert_eq!(second, PushEvent::OfferCreated { offer: other });
        channel.cancel();
    }

    #[tokio::test]
    async fn withdrawal_releases_the_dedup_window() {
        let offer_id = Uuid::new_v4();
        let offer = test_offer(offer_id);
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(vec![envelope(0, PushEvent::OfferCreated { offer: offer.clone() })]),
            Ok(vec![envelope(1, PushEvent::OfferWithdrawn { offer_id })]),
            Ok(vec![envelope(2, PushEvent::OfferCreated { offer: offer.clone() })]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let channel = OfferChannel::new(transport, tx, &test_config());
        channel.subscribe(Uuid::new_v4());

        assert!(matches!(recv_push(&mut rx).await, PushEvent::OfferCreated { .. }));
        assert!(matches!(recv_push(&mut rx).await, PushEvent::OfferWithdrawn { .. }));
        assert!(
            matches!(recv_push(&mut rx).await, PushEvent::OfferCreated { .. }),
            "a withdrawn offer id may be delivered again"
        );
        channel.cancel();
    }

    #[tokio::test]
    async fn long_outage_triggers_reconciliation_request() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(()),
            Err(()),
            Err(()),
            Err(()),
            Err(()),
            Err(()),
            Err(()),
            Err(()),
            Ok(vec![]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let channel = OfferChannel::new(transport, tx, &test_config());
        channel.subscribe(Uuid::new_v4());

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for reconnect event")
            .expect("channel closed");
        assert!(matches!(event, EngineEvent::Reconnected { .. }));
        channel.cancel();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (tx, _rx) = mpsc::channel(16);
        let channel = OfferChannel::new(transport, tx, &test_config());

        channel.cancel();
        channel.subscribe(Uuid::new_v4());
        channel.cancel();
        channel.cancel();
        assert!(!channel.is_subscribed());
    }

    #[test]
    fn seen_window_evicts_oldest() {
        let mut window = SeenWindow::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(window.insert(a));
        assert!(window.insert(b));
        assert!(!window.insert(a));
        assert!(window.insert(c)); // evicts a
        assert!(window.insert(a));
    }
}
