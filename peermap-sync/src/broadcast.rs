//! Per-topic fan-out for the relay.
//!
//! Every topic gets one tokio broadcast channel. Each subscription holds an
//! independent receiver that buffers up to `capacity` messages; slow
//! subscribers lag and lose the oldest messages instead of stalling the
//! publisher.
//!
//! Messages are fanned out to every subscriber, the sender included. STOMP
//! brokers do not filter echoes, so clients have to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// One published message, shared by all receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub destination: String,
    pub message_id: String,
    pub body: String,
}

/// Statistics for monitoring topic health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicTopicStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single topic.
pub struct TopicGroup {
    topic: String,
    sender: broadcast::Sender<Arc<TopicMessage>>,
    capacity: usize,
    next_id: AtomicU64,
    stats: AtomicTopicStats,
}

impl TopicGroup {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            topic: topic.into(),
            sender,
            capacity,
            next_id: AtomicU64::new(0),
            stats: AtomicTopicStats::default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// New receiver that sees every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TopicMessage>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish `body` to every current subscriber.
    ///
    /// Returns the number of receivers reached. Lock-free: tokio broadcast
    /// send plus atomic counters.
    pub fn publish(&self, body: impl Into<String>) -> usize {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = Arc::new(TopicMessage {
            destination: self.topic.clone(),
            message_id: format!("{}-{seq}", self.topic.trim_start_matches('/').replace('/', "-")),
            body: body.into(),
        });
        let count = self.sender.send(msg).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps topic names to broadcast groups.
pub struct TopicManager {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    default_capacity: usize,
}

impl TopicManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        if let Some(group) = self.topics.read().await.get(topic) {
            return group.clone();
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicGroup::new(topic, self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Drop the group for `topic` if nobody is subscribed.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        match topics.get(topic) {
            Some(group) if group.subscriber_count() == 0 => {
                topics.remove(topic);
                true
            }
            _ => false,
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let group = TopicGroup::new("/topic/locations", 16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        assert_eq!(group.publish("{}"), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.destination, "/topic/locations");
            assert_eq!(msg.body, "{}");
        }
    }

    #[tokio::test]
    async fn test_message_ids_are_unique() {
        let group = TopicGroup::new("/topic/locations", 16);
        let mut rx = group.subscribe();
        group.publish("a");
        group.publish("b");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.message_id, "topic-locations-0");
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let group = TopicGroup::new("/topic/t", 4);
        assert_eq!(group.publish("x"), 0);
        assert_eq!(group.stats().messages_sent, 1);
        assert_eq!(group.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let group = TopicGroup::new("/topic/t", 2);
        let mut rx = group.subscribe();
        for i in 0..5 {
            group.publish(i.to_string());
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_dropped, 3);
        assert_eq!(rx.recv().await.unwrap().body, "3");
    }

    #[tokio::test]
    async fn test_manager_get_or_create() {
        let manager = TopicManager::new(16);
        let a = manager.get_or_create("/topic/locations").await;
        let b = manager.get_or_create("/topic/locations").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.capacity(), 16);

        manager.get_or_create("/topic/other").await;
        assert_eq!(manager.topic_count().await, 2);
        assert!(manager.active_topics().await.contains(&"/topic/other".to_string()));
    }

    #[tokio::test]
    async fn test_manager_cleanup() {
        let manager = TopicManager::new(16);
        let group = manager.get_or_create("/topic/t").await;
        let rx = group.subscribe();

        assert!(!manager.remove_if_empty("/topic/t").await);
        drop(rx);
        assert!(manager.remove_if_empty("/topic/t").await);
        assert!(manager.get("/topic/t").await.is_none());
    }
}
