//! Process-local queue
//!
//! Same delivery rules as the Redis backend: visibility timeouts, receipt
//! handles invalidated by redelivery, per-group FIFO on ordered queues,
//! retention and dead-lettering after `max_receive_count` deliveries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    unknown, QueueAttributes, QueueService, QueueSettings, ReceiptHandle, ReceivedMessage,
    SendOptions,
};
use crate::error::Result;

/// Upper bound on one sleep while long-polling, so expiring visibility
/// timeouts are noticed without a send
const POLL_SLICE: Duration = Duration::from_millis(200);

/// Group used on ordered queues when the sender gives none
const DEFAULT_GROUP: &str = "default";

struct Entry {
    id: String,
    body: String,
    attributes: HashMap<String, String>,
    group: Option<String>,
    sent_at: DateTime<Utc>,
    enqueued_at: Instant,
    receive_count: u32,
    invisible_until: Option<Instant>,
}

impl Entry {
    fn in_flight(&self, now: Instant) -> bool {
        self.invisible_until.map_or(false, |until| until > now)
    }
}

struct QueueState {
    settings: QueueSettings,
    entries: VecDeque<Entry>,
    dead: Vec<Entry>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            entries: VecDeque::new(),
            dead: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let retention = self.settings.retention;
        let before = self.entries.len();
        self.entries
            .retain(|e| now.saturating_duration_since(e.enqueued_at) < retention);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(queue = %self.settings.name, dropped, "Dropped messages past retention");
        }
    }

    fn take(&mut self, max: usize, now: Instant) -> Vec<ReceivedMessage> {
        self.purge_expired(now);

        let ordered = self.settings.ordered;
        let visibility = self.settings.visibility_timeout;
        let max_receive = self.settings.max_receive_count;

        let mut blocked_groups: HashSet<String> = HashSet::new();
        let mut taken = Vec::new();
        let mut i = 0;

        while i < self.entries.len() && taken.len() < max {
            let group = self.entries[i]
                .group
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP.to_string());

            if ordered && blocked_groups.contains(&group) {
                i += 1;
                continue;
            }
            if self.entries[i].in_flight(now) {
                if ordered {
                    blocked_groups.insert(group);
                }
                i += 1;
                continue;
            }

            if self.entries[i].receive_count >= max_receive {
                if let Some(entry) = self.entries.remove(i) {
                    warn!(
                        queue = %self.settings.name,
                        message_id = %entry.id,
                        receive_count = entry.receive_count,
                        "Moving message to dead-letter queue"
                    );
                    self.dead.push(entry);
                }
                continue;
            }

            let entry = &mut self.entries[i];
            entry.receive_count += 1;
            entry.invisible_until = Some(now + visibility);
            taken.push(ReceivedMessage {
                message_id: entry.id.clone(),
                receipt_handle: ReceiptHandle::new(&entry.id, entry.receive_count),
                body: entry.body.clone(),
                attributes: entry.attributes.clone(),
                receive_count: entry.receive_count,
                sent_at: entry.sent_at,
            });
            if ordered {
                blocked_groups.insert(group);
            }
            i += 1;
        }

        taken
    }

    fn position(&self, handle: &ReceiptHandle, now: Instant) -> Option<usize> {
        let (id, count) = handle.parts()?;
        self.entries
            .iter()
            .position(|e| e.id == id && e.receive_count == count && e.in_flight(now))
    }

    fn attributes(&mut self, now: Instant) -> QueueAttributes {
        self.purge_expired(now);
        let in_flight = self.entries.iter().filter(|e| e.in_flight(now)).count();
        QueueAttributes {
            name: self.settings.name.clone(),
            depth: (self.entries.len() - in_flight) as u64,
            in_flight: in_flight as u64,
            oldest_age_seconds: self
                .entries
                .iter()
                .map(|e| now.saturating_duration_since(e.enqueued_at).as_secs())
                .max(),
            dead_lettered: self.dead.len() as u64,
        }
    }
}

/// In-memory [`QueueService`]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryQueue {
    /// Create the given queues
    pub fn new(settings: impl IntoIterator<Item = QueueSettings>) -> Self {
        let queues = settings
            .into_iter()
            .map(|s| (s.name.clone(), QueueState::new(s)))
            .collect();
        Self {
            queues: Mutex::new(queues),
        }
    }

    /// Bodies currently in the dead-letter queue
    pub fn dead_letters(&self, queue: &str) -> Result<Vec<String>> {
        let queues = self.queues.lock();
        let state = queues.get(queue).ok_or_else(|| unknown(queue))?;
        Ok(state.dead.iter().map(|e| e.body.clone()).collect())
    }

    fn notifier(&self, queue: &str) -> Result<Arc<Notify>> {
        let queues = self.queues.lock();
        let state = queues.get(queue).ok_or_else(|| unknown(queue))?;
        Ok(state.notify.clone())
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn send(&self, queue: &str, body: String, options: SendOptions) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let notify = {
            let mut queues = self.queues.lock();
            let state = queues.get_mut(queue).ok_or_else(|| unknown(queue))?;
            state.entries.push_back(Entry {
                id: id.clone(),
                body,
                attributes: options.attributes,
                group: options.group_id,
                sent_at: Utc::now(),
                enqueued_at: Instant::now(),
                receive_count: 0,
                invisible_until: None,
            });
            state.notify.clone()
        };
        notify.notify_waiters();
        Ok(id)
    }

    async fn receive_batch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let notify = self.notifier(queue)?;
        let deadline = Instant::now() + wait;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = {
                let mut queues = self.queues.lock();
                let state = queues.get_mut(queue).ok_or_else(|| unknown(queue))?;
                state.take(max, Instant::now())
            };

            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            let slice = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    async fn delete(&self, queue: &str, handle: &ReceiptHandle) -> Result<bool> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue).ok_or_else(|| unknown(queue))?;
        match state.position(handle, Instant::now()) {
            Some(index) => {
                state.entries.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<bool> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue).ok_or_else(|| unknown(queue))?;
        let now = Instant::now();
        match state.position(handle, now) {
            Some(index) => {
                state.entries[index].invisible_until = Some(now + timeout);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attributes(&self, queue: &str) -> Result<QueueAttributes> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue).ok_or_else(|| unknown(queue))?;
        Ok(state.attributes(Instant::now()))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn queue(settings: QueueSettings) -> MemoryQueue {
        MemoryQueue::new([settings])
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 2,
            ..QueueSettings::new("checks")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_message_is_hidden_until_visibility_expires() {
        let q = queue(settings());
        q.send("checks", "a".into(), SendOptions::default()).await.unwrap();

        let first = q.receive_batch("checks", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(q.receive_batch("checks", 10, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = q.receive_batch("checks", 10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);

        // the first delivery's handle went stale with the redelivery
        assert!(!q.delete("checks", &first[0].receipt_handle).await.unwrap());
        assert!(q.delete("checks", &second[0].receipt_handle).await.unwrap());
        assert_eq!(q.attributes("checks").await.unwrap().depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_is_dead_lettered_after_max_receives() {
        let q = queue(settings());
        q.send("checks", "poison".into(), SendOptions::default()).await.unwrap();

        for _ in 0..2 {
            assert_eq!(q.receive_batch("checks", 1, Duration::ZERO).await.unwrap().len(), 1);
            tokio::time::advance(Duration::from_secs(31)).await;
        }

        assert!(q.receive_batch("checks", 1, Duration::ZERO).await.unwrap().is_empty());
        let attributes = q.attributes("checks").await.unwrap();
        assert_eq!(attributes.depth, 0);
        assert_eq!(attributes.dead_lettered, 1);
        assert_eq!(q.dead_letters("checks").unwrap(), vec!["poison".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_queue_serializes_each_group() {
        let q = queue(QueueSettings {
            ordered: true,
            ..settings()
        });
        for (group, body) in [("m1", "m1-a"), ("m1", "m1-b"), ("m2", "m2-a")] {
            q.send("checks", body.into(), SendOptions::grouped(group)).await.unwrap();
        }

        let batch = q.receive_batch("checks", 10, Duration::ZERO).await.unwrap();
        let bodies: Vec<&str> = batch.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m1-a", "m2-a"]);

        q.delete("checks", &batch[0].receipt_handle).await.unwrap();
        let next = q.receive_batch("checks", 10, Duration::ZERO).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].body, "m1-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let q = Arc::new(queue(settings()));
        let receiver = {
            let q = q.clone();
            tokio::spawn(async move { q.receive_batch("checks", 1, Duration::from_secs(20)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        q.send("checks", "late".into(), SendOptions::default()).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_visibility_keeps_message_hidden() {
        let q = queue(settings());
        q.send("checks", "slow".into(), SendOptions::default()).await.unwrap();
        let batch = q.receive_batch("checks", 1, Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(q
            .extend_visibility("checks", &batch[0].receipt_handle, Duration::from_secs(30))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(q.receive_batch("checks", 1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(q.attributes("checks").await.unwrap().in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_drops_old_messages() {
        let q = queue(QueueSettings {
            retention: Duration::from_secs(60),
            ..settings()
        });
        q.send("checks", "stale".into(), SendOptions::default()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(q.receive_batch("checks", 1, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_queue_is_an_error() {
        let q = queue(settings());
        let err = q.send("nope", "x".into(), SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownQueue(name) if name == "nope"));
    }
}
