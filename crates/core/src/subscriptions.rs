use chrono::{DateTime, Utc};
use lavs_shared::{LavsError, LavsErrorCode, LavsResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sse::SseFrame;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("subscription sink is closed")]
    Closed,
    #[error("subscription sink write failed: {0}")]
    Write(String),
}

/// Push side of one open subscription connection.
///
/// `send` only enqueues; it must not wait on the remote peer.
pub trait SubscriptionSink: Send + Sync {
    fn send(&self, frame: &SseFrame) -> Result<(), SinkError>;
    fn is_closed(&self) -> bool;
    fn close(&self);
}

/// [`SubscriptionSink`] over a bounded `mpsc` channel; the receiver feeds the
/// HTTP stream. A full channel drops the frame (slow consumer) without closing.
///
/// One slot beyond `capacity` is kept for control frames, so `disconnected`
/// always reaches a slow consumer before its stream ends.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<SseFrame>>>,
    closed: AtomicBool,
}

impl ChannelSink {
    #[must_use]
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<SseFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        let sink = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        (sink, rx)
    }
}

impl SubscriptionSink for ChannelSink {
    fn send(&self, frame: &SseFrame) -> Result<(), SinkError> {
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            return Err(SinkError::Closed);
        };
        // sends are serialized by the guard, so the reserved slot cannot be raced away
        if !frame.is_control() && tx.capacity() <= 1 && !tx.is_closed() {
            warn!("Subscription channel full; dropping frame");
            return Ok(());
        }
        match tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Subscription channel full; dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(SinkError::Closed)
            }
        }
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        lock(&self.tx).as_ref().map_or(true, mpsc::Sender::is_closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // dropping the sender ends the receiving stream once it drains
        lock(&self.tx).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub max_subscriptions: usize,
    pub heartbeat_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 1000,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

struct Subscription {
    agent_id: String,
    endpoint_id: String,
    created_at: DateTime<Utc>,
    sink: Arc<dyn SubscriptionSink>,
}

/// Public view of an open subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub agent_id: String,
    pub endpoint_id: String,
    pub created_at: DateTime<Utc>,
}

/// Registry of open subscriptions plus the heartbeat that prunes dead ones.
///
/// A subscription is either open (in the registry) or closed (gone). Sends
/// happen outside the registry lock, so a publish racing an unsubscribe may or
/// may not reach that subscriber.
pub struct SubscriptionManager {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    config: SubscriptionConfig,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(config: SubscriptionConfig) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: Mutex::new(HashMap::new()),
            config,
            heartbeat: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> SubscriptionConfig {
        self.config
    }

    /// Spawn the heartbeat task if it is not already running. The task stops
    /// on its own once the manager is dropped.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = lock(&self.heartbeat);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let removed = manager.heartbeat();
                if removed > 0 {
                    debug!("Heartbeat removed {} dead subscription(s)", removed);
                }
            }
        }));
    }

    /// Register `sink` and send it the `connected` frame.
    pub fn subscribe(
        &self,
        agent_id: &str,
        endpoint_id: &str,
        sink: Arc<dyn SubscriptionSink>,
    ) -> LavsResult<String> {
        let mut subs = lock(&self.subscriptions);
        if subs.len() >= self.config.max_subscriptions {
            warn!(
                agent_id = %agent_id,
                endpoint_id = %endpoint_id,
                max = self.config.max_subscriptions,
                "Subscription limit reached"
            );
            return Err(LavsError::new(
                LavsErrorCode::CapacityExceeded,
                format!(
                    "Subscription limit reached ({})",
                    self.config.max_subscriptions
                ),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        sink.send(&SseFrame::connected(&id, agent_id, endpoint_id))
            .map_err(|e| LavsError::internal(format!("Failed to open subscription: {}", e)))?;

        subs.insert(
            id.clone(),
            Subscription {
                agent_id: agent_id.to_string(),
                endpoint_id: endpoint_id.to_string(),
                created_at: Utc::now(),
                sink,
            },
        );
        drop(subs);

        info!(
            agent_id = %agent_id,
            endpoint_id = %endpoint_id,
            subscription_id = %id,
            "📡 Subscription opened"
        );
        Ok(id)
    }

    /// Server-initiated close: `disconnected` frame, then close the sink.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let Some(sub) = lock(&self.subscriptions).remove(subscription_id) else {
            return false;
        };
        let _ = sub
            .sink
            .send(&SseFrame::disconnected(subscription_id, "unsubscribed"));
        sub.sink.close();
        info!(subscription_id = %subscription_id, "Subscription closed");
        true
    }

    /// Drop a subscription whose connection is already gone. No frame is sent.
    pub fn release(&self, subscription_id: &str) -> bool {
        let removed = lock(&self.subscriptions).remove(subscription_id);
        match removed {
            Some(sub) => {
                sub.sink.close();
                debug!(subscription_id = %subscription_id, "Subscription released");
                true
            }
            None => false,
        }
    }

    /// Fan out to every subscription of `agent_id` (optionally one endpoint).
    /// Sinks that fail are removed; returns the number notified.
    fn broadcast(&self, agent_id: &str, endpoint_id: Option<&str>, event: &str, payload: &Value) -> usize {
        let targets: Vec<(String, Arc<dyn SubscriptionSink>)> = lock(&self.subscriptions)
            .iter()
            .filter(|(_, s)| {
                s.agent_id == agent_id && endpoint_id.map_or(true, |e| s.endpoint_id == e)
            })
            .map(|(id, s)| (id.clone(), s.sink.clone()))
            .collect();

        let mut notified = 0;
        let mut failed = Vec::new();
        for (id, sink) in targets {
            match sink.send(&SseFrame::event(&id, event, payload.clone())) {
                Ok(()) => notified += 1,
                Err(e) => {
                    debug!(subscription_id = %id, "Dropping subscription: {}", e);
                    failed.push(id);
                }
            }
        }
        self.remove_all(&failed);
        notified
    }

    pub fn publish(&self, agent_id: &str, endpoint_id: &str, event: &str, payload: &Value) -> usize {
        self.broadcast(agent_id, Some(endpoint_id), event, payload)
    }

    pub fn publish_to_agent(&self, agent_id: &str, event: &str, payload: &Value) -> usize {
        self.broadcast(agent_id, None, event, payload)
    }

    /// Ping every sink once; closed or failing sinks are removed.
    pub fn heartbeat(&self) -> usize {
        let targets: Vec<(String, Arc<dyn SubscriptionSink>)> = lock(&self.subscriptions)
            .iter()
            .map(|(id, s)| (id.clone(), s.sink.clone()))
            .collect();

        let frame = SseFrame::heartbeat();
        let dead: Vec<String> = targets
            .into_iter()
            .filter(|(_, sink)| sink.is_closed() || sink.send(&frame).is_err())
            .map(|(id, _)| id)
            .collect();
        self.remove_all(&dead);
        dead.len()
    }

    fn remove_all(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let removed: Vec<Subscription> = {
            let mut subs = lock(&self.subscriptions);
            ids.iter().filter_map(|id| subs.remove(id)).collect()
        };
        for sub in removed {
            sub.sink.close();
        }
    }

    /// Stop the heartbeat and force-close every subscription.
    pub fn destroy(&self) {
        if let Some(handle) = lock(&self.heartbeat).take() {
            handle.abort();
        }
        let drained: Vec<(String, Subscription)> = lock(&self.subscriptions).drain().collect();
        let count = drained.len();
        for (id, sub) in drained {
            let _ = sub.sink.send(&SseFrame::disconnected(&id, "shutdown"));
            sub.sink.close();
        }
        if count > 0 {
            info!("Closed {} subscription(s) on shutdown", count);
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    #[must_use]
    pub fn list(&self, agent_id: Option<&str>) -> Vec<SubscriptionInfo> {
        let mut out: Vec<SubscriptionInfo> = lock(&self.subscriptions)
            .iter()
            .filter(|(_, s)| agent_id.map_or(true, |a| s.agent_id == a))
            .map(|(id, s)| SubscriptionInfo {
                id: id.clone(),
                agent_id: s.agent_id.clone(),
                endpoint_id: s.endpoint_id.clone(),
                created_at: s.created_at,
            })
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.heartbeat).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Sink that records frames and can be switched to fail.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<SseFrame>>,
        failing: AtomicBool,
        closed: AtomicBool,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<SseFrame> {
            lock(&self.frames).clone()
        }
    }

    impl SubscriptionSink for RecordingSink {
        fn send(&self, frame: &SseFrame) -> Result<(), SinkError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Write("broken pipe".into()));
            }
            lock(&self.frames).push(frame.clone());
            Ok(())
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn manager(max: usize) -> Arc<SubscriptionManager> {
        SubscriptionManager::new(SubscriptionConfig {
            max_subscriptions: max,
            heartbeat_interval: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_subscribe_sends_connected_frame() {
        let mgr = manager(10);
        let sink = Arc::new(RecordingSink::default());
        let id = mgr.subscribe("notes", "changes", sink.clone()).unwrap();

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_name(), Some("connected"));
        assert_eq!(mgr.count(), 1);
        assert_eq!(mgr.list(Some("notes"))[0].id, id);
    }

    #[test]
    fn test_capacity_cap() {
        let mgr = manager(2);
        mgr.subscribe("a", "e", Arc::new(RecordingSink::default())).unwrap();
        mgr.subscribe("a", "e", Arc::new(RecordingSink::default())).unwrap();

        let err = mgr
            .subscribe("a", "e", Arc::new(RecordingSink::default()))
            .unwrap_err();
        assert_eq!(err.code, LavsErrorCode::CapacityExceeded);
        assert_eq!(err.http_status(), 503);
        assert_eq!(mgr.count(), 2);
    }

    #[test]
    fn test_publish_without_subscribers_returns_zero() {
        let mgr = manager(10);
        assert_eq!(mgr.publish_to_agent("nobody", "x:mutated", &json!({})), 0);
        assert_eq!(mgr.publish("nobody", "x", "tick", &json!(1)), 0);
    }

    #[test]
    fn test_failing_sink_is_removed_without_blocking_others() {
        let mgr = manager(10);
        let good = Arc::new(RecordingSink::default());
        let bad = Arc::new(RecordingSink::default());
        mgr.subscribe("notes", "changes", good.clone()).unwrap();
        mgr.subscribe("notes", "changes", bad.clone()).unwrap();
        bad.failing.store(true, Ordering::SeqCst);

        let notified = mgr.publish("notes", "changes", "update", &json!({"n": 1}));
        assert_eq!(notified, 1);
        assert_eq!(mgr.count(), 1);
        assert!(bad.is_closed());
        assert_eq!(good.frames().last().unwrap().event_name(), Some("update"));
    }

    #[test]
    fn test_publish_filters_by_agent_and_endpoint() {
        let mgr = manager(10);
        let changes = Arc::new(RecordingSink::default());
        let other_ep = Arc::new(RecordingSink::default());
        let other_agent = Arc::new(RecordingSink::default());
        mgr.subscribe("notes", "changes", changes.clone()).unwrap();
        mgr.subscribe("notes", "stats", other_ep.clone()).unwrap();
        mgr.subscribe("todo", "changes", other_agent.clone()).unwrap();

        assert_eq!(mgr.publish("notes", "changes", "e", &json!(null)), 1);
        assert_eq!(mgr.publish_to_agent("notes", "add:mutated", &json!(null)), 2);
        assert_eq!(other_agent.frames().len(), 1);
    }

    #[test]
    fn test_unsubscribe_sends_disconnected_and_closes() {
        let mgr = manager(10);
        let sink = Arc::new(RecordingSink::default());
        let id = mgr.subscribe("notes", "changes", sink.clone()).unwrap();

        assert!(mgr.unsubscribe(&id));
        assert!(!mgr.unsubscribe(&id));
        assert_eq!(sink.frames().last().unwrap().event_name(), Some("disconnected"));
        assert!(sink.is_closed());
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn test_release_sends_nothing() {
        let mgr = manager(10);
        let sink = Arc::new(RecordingSink::default());
        let id = mgr.subscribe("notes", "changes", sink.clone()).unwrap();

        assert!(mgr.release(&id));
        assert_eq!(sink.frames().len(), 1);
    }

    #[test]
    fn test_heartbeat_prunes_closed_and_failing_sinks() {
        let mgr = manager(10);
        let alive = Arc::new(RecordingSink::default());
        let ended = Arc::new(RecordingSink::default());
        let broken = Arc::new(RecordingSink::default());
        mgr.subscribe("a", "e", alive.clone()).unwrap();
        mgr.subscribe("a", "e", ended.clone()).unwrap();
        mgr.subscribe("a", "e", broken.clone()).unwrap();
        ended.closed.store(true, Ordering::SeqCst);
        broken.failing.store(true, Ordering::SeqCst);

        assert_eq!(mgr.heartbeat(), 2);
        assert_eq!(mgr.count(), 1);
        assert!(alive.frames().last().unwrap().is_comment());
    }

    #[tokio::test]
    async fn test_heartbeat_task_detects_dropped_receiver() {
        tokio::time::pause();
        let mgr = manager(10);
        mgr.start_heartbeat();

        let (sink, rx) = ChannelSink::channel(8);
        mgr.subscribe("a", "e", sink).unwrap();
        drop(rx);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(mgr.count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() {
        let mgr = manager(10);
        mgr.start_heartbeat();
        let (sink, mut rx) = ChannelSink::channel(8);
        mgr.subscribe("a", "e", sink).unwrap();

        mgr.destroy();
        assert_eq!(mgr.count(), 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_name(), Some("connected"));
        let last = rx.recv().await.unwrap();
        assert_eq!(last.event_name(), Some("disconnected"));
        assert!(rx.recv().await.is_none(), "stream should end after close");
    }

    #[test]
    fn test_channel_sink_full_drops_frame() {
        let (sink, mut rx) = ChannelSink::channel(1);
        sink.send(&SseFrame::heartbeat()).unwrap();
        sink.send(&SseFrame::heartbeat()).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(!sink.is_closed());
    }

    #[test]
    fn test_slow_consumer_still_gets_disconnected() {
        let mgr = manager(10);
        let (sink, mut rx) = ChannelSink::channel(2);
        let id = mgr.subscribe("notes", "changes", sink).unwrap();

        for n in 0..5 {
            mgr.publish("notes", "changes", "tick", &json!(n));
        }
        assert!(mgr.unsubscribe(&id));

        let mut names = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            names.push(frame.event_name().map(str::to_string));
        }
        assert_eq!(
            names,
            vec![
                Some("connected".to_string()),
                Some("tick".to_string()),
                Some("disconnected".to_string()),
            ]
        );
    }
}
