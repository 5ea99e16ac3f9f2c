use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque handle identifying one subscriber for later removal.
pub type Token = u64;

/// Token-keyed fan-out registry backing the motion and save-history feeds.
///
/// Each subscriber owns the receiving half of an unbounded channel. A failed
/// send means the receiver is gone; that entry is dropped on the spot and
/// delivery to the remaining subscribers is unaffected.
pub struct SubscriberSet<T> {
    next_token: Token,
    senders: HashMap<Token, mpsc::UnboundedSender<T>>,
}

impl<T: Clone> SubscriberSet<T> {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            senders: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self) -> (Token, mpsc::UnboundedReceiver<T>) {
        let token = self.next_token;
        self.next_token += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(token, tx);
        (token, rx)
    }

    /// Removing an already-gone token is a no-op.
    pub fn unsubscribe(&mut self, token: Token) {
        self.senders.remove(&token);
    }

    /// Delivers `event` to every live subscriber, dropping the ones whose
    /// receiver has gone away.
    pub fn publish(&mut self, event: &T) {
        self.senders.retain(|&token, tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(token, "subscriber gone, removing");
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl<T: Clone> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_across_the_set_lifetime() {
        let mut set: SubscriberSet<u32> = SubscriberSet::new();
        let (t1, _r1) = set.subscribe();
        let (t2, _r2) = set.subscribe();
        set.unsubscribe(t1);
        let (t3, _r3) = set.subscribe();
        assert_ne!(t1, t2);
        assert_ne!(t2, t3);
        assert_ne!(t1, t3);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let mut set: SubscriberSet<u32> = SubscriberSet::new();
        let (_t1, mut r1) = set.subscribe();
        let (_t2, mut r2) = set.subscribe();

        set.publish(&1);
        set.publish(&2);

        assert_eq!(r1.recv().await, Some(1));
        assert_eq!(r1.recv().await, Some(2));
        assert_eq!(r2.recv().await, Some(1));
        assert_eq!(r2.recv().await, Some(2));
    }

    #[tokio::test]
    async fn failed_subscriber_is_removed_without_affecting_siblings() {
        let mut set: SubscriberSet<u32> = SubscriberSet::new();
        let (_t1, r1) = set.subscribe();
        let (_t2, mut r2) = set.subscribe();
        drop(r1);

        set.publish(&7);
        assert_eq!(set.len(), 1);
        assert_eq!(r2.recv().await, Some(7));

        set.publish(&8);
        assert_eq!(r2.recv().await, Some(8));
    }

    #[tokio::test]
    async fn unsubscribed_receiver_stops_getting_events() {
        let mut set: SubscriberSet<u32> = SubscriberSet::new();
        let (t1, mut r1) = set.subscribe();
        set.publish(&1);
        set.unsubscribe(t1);
        set.publish(&2);

        assert_eq!(r1.recv().await, Some(1));
        // Sender side is gone after unsubscribe, so the channel terminates.
        assert_eq!(r1.recv().await, None);
    }
}
