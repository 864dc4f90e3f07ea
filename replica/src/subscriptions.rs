use ahash::HashMap;
use futures::Stream;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::msg::ChatMessage;

struct Entry {
    /// Distinguishes a replaced queue from its successor.
    generation: u64,
    tx: mpsc::UnboundedSender<ChatMessage>,
}

#[derive(Default)]
struct Entries {
    next_generation: u64,
    by_user: HashMap<String, Entry>,
}

/// Live per-recipient delivery queues, held by the node that leads.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Entries>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a queue for `username`, replacing any existing one. The replaced
    /// queue's sender is dropped, so the older stream ends instead of waiting
    /// forever on a queue nobody feeds.
    pub fn subscribe(self: &Arc<Self>, username: &str, poll: Duration) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut entries = self.entries();
            entries.next_generation += 1;
            let generation = entries.next_generation;
            if entries
                .by_user
                .insert(username.to_string(), Entry { generation, tx })
                .is_some()
            {
                tracing::info!("Replaced existing subscription for {username}");
            }
            generation
        };
        tracing::info!("User {username} subscribed for instant messages");
        Subscription {
            username: username.to_string(),
            generation,
            rx,
            poll,
            cancel: CancellationToken::new(),
            registry: Arc::clone(self),
        }
    }

    /// Pushes a message onto its recipient's queue. Returns false when the
    /// recipient has no live subscription.
    pub fn deliver(&self, message: &ChatMessage) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.by_user.get(&message.recipient) else {
            return false;
        };
        if entry.tx.send(message.clone()).is_ok() {
            return true;
        }
        // Receiver is gone but its handle has not been dropped yet.
        entries.by_user.remove(&message.recipient);
        false
    }

    pub fn remove(&self, username: &str) -> bool {
        self.entries().by_user.remove(username).is_some()
    }

    /// Drops every queue, ending all open streams.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.by_user.len();
        entries.by_user.clear();
        count
    }

    pub fn is_subscribed(&self, username: &str) -> bool {
        self.entries().by_user.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.entries().by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, username: &str, generation: u64) {
        let mut entries = self.entries();
        if entries
            .by_user
            .get(username)
            .is_some_and(|e| e.generation == generation)
        {
            entries.by_user.remove(username);
            tracing::info!("Subscription for {username} closed");
        }
    }
}

/// Server side of one subscriber stream. Dropping it frees the registry
/// entry unless a newer subscription already took its place.
pub struct Subscription {
    username: String,
    generation: u64,
    rx: mpsc::UnboundedReceiver<ChatMessage>,
    poll: Duration,
    cancel: CancellationToken,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Token the connection layer cancels when the subscriber goes away.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next pushed message. Returns None once the stream is
    /// cancelled, replaced, or dropped by the registry.
    pub async fn next(&mut self) -> Option<ChatMessage> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                message = self.rx.recv() => return message,
                _ = time::sleep(self.poll) => {
                    tracing::trace!("No message for {} within {:?}", self.username, self.poll);
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ChatMessage> {
        futures::stream::unfold(self, |mut subscription| async move {
            let message = subscription.next().await?;
            Some((message, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.release(&self.username, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const POLL: Duration = Duration::from_millis(20);

    fn chat(id: u64, recipient: &str) -> ChatMessage {
        ChatMessage {
            id,
            sender: "alice".to_string(),
            recipient: recipient.to_string(),
            body: format!("message {id}"),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn delivers_to_subscribed_recipient_only() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut bob = registry.subscribe("bob", POLL);
        assert!(registry.deliver(&chat(1, "bob")));
        assert!(!registry.deliver(&chat(2, "carol")));
        assert_eq!(bob.next().await, Some(chat(1, "bob")));
    }

    #[tokio::test]
    async fn waits_across_poll_intervals() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut bob = registry.subscribe("bob", POLL);
        let sender = Arc::clone(&registry);
        tokio::spawn(async move {
            time::sleep(POLL * 4).await;
            sender.deliver(&chat(7, "bob"));
        });
        assert_eq!(bob.next().await.map(|m| m.id), Some(7));
    }

    #[tokio::test]
    async fn cancellation_ends_stream_and_frees_entry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut bob = registry.subscribe("bob", POLL);
        let token = bob.cancellation();
        token.cancel();
        assert_eq!(bob.next().await, None);
        drop(bob);
        assert!(!registry.is_subscribed("bob"));
    }

    #[tokio::test]
    async fn second_subscription_replaces_and_ends_the_first() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut first = registry.subscribe("bob", POLL);
        let mut second = registry.subscribe("bob", POLL);
        assert_eq!(registry.len(), 1);

        assert_eq!(first.next().await, None);
        // Dropping the stale handle must not evict its replacement.
        drop(first);
        assert!(registry.is_subscribed("bob"));

        assert!(registry.deliver(&chat(3, "bob")));
        assert_eq!(second.next().await.map(|m| m.id), Some(3));
    }

    #[tokio::test]
    async fn clear_ends_every_stream() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let bob = registry.subscribe("bob", POLL).into_stream();
        let _carol = registry.subscribe("carol", POLL);
        assert_eq!(registry.clear(), 2);
        let received: Vec<ChatMessage> = bob.collect().await;
        assert!(received.is_empty());
        assert!(registry.is_empty());
    }
}
