//! Pub/sub hub: fans out accepted events to every live session whose
//! subscriptions match, without touching storage.
//!
//! A shared map of per-client senders walked on every accepted event, kept
//! as its own collaborator rather than inline logic in the event handler, so
//! the session and storage layers don't need to know about each other.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::model::{Event, Subscription};

/// An outbound message destined for one session's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event { sub_id: String, event: Box<Event> },
}

#[derive(Clone)]
struct ClientEntry {
    sender: mpsc::Sender<Outbound>,
    subscriptions: Vec<Subscription>,
}

/// Registry of live sessions and their active subscriptions, keyed by a
/// monotonically unique, connection-scoped client id.
#[derive(Default)]
pub struct Dispatcher {
    clients: DashMap<u64, ClientEntry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { clients: DashMap::new() }
    }

    pub fn add_client(&self, client_id: u64, sender: mpsc::Sender<Outbound>) {
        self.clients.insert(client_id, ClientEntry { sender, subscriptions: Vec::new() });
    }

    pub fn remove_client(&self, client_id: u64) {
        self.clients.remove(&client_id);
    }

    pub fn set_subscription(&self, client_id: u64, subscription: Subscription) {
        if let Some(mut entry) = self.clients.get_mut(&client_id) {
            entry.subscriptions.retain(|s| s.id != subscription.id);
            entry.subscriptions.push(subscription);
        }
    }

    pub fn remove_subscription(&self, client_id: u64, sub_id: &str) {
        if let Some(mut entry) = self.clients.get_mut(&client_id) {
            entry.subscriptions.retain(|s| s.id != sub_id);
        }
    }

    pub fn subscription_count(&self, client_id: u64) -> usize {
        self.clients.get(&client_id).map(|e| e.subscriptions.len()).unwrap_or(0)
    }

    /// Push `event` to every subscription across every client that matches
    /// it. A full send-buffer is treated as backpressure: the caller's
    /// session monitor is responsible for disconnecting slow readers, so
    /// this simply drops the message for that one client rather than
    /// blocking the whole fan-out.
    pub fn broadcast(&self, event: &Event) {
        for entry in self.clients.iter() {
            let client_id = *entry.key();
            for sub in &entry.subscriptions {
                if sub.matches(event) {
                    let outbound = Outbound::Event { sub_id: sub.id.clone(), event: Box::new(event.clone()) };
                    if entry.sender.try_send(outbound).is_err() {
                        trace!(client_id, sub_id = %sub.id, "dropping broadcast: backpressure");
                    }
                }
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(kind: u32) -> Event {
        let mut e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 1000,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        };
        e.id = e.compute_id();
        e
    }

    #[tokio::test]
    async fn matching_subscription_receives_event() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(10);
        dispatcher.add_client(1, tx);

        let mut filter = crate::model::Filter::default();
        filter.kinds = Some([1].into_iter().collect());
        dispatcher.set_subscription(1, Subscription { id: "sub1".into(), filters: vec![filter] });

        dispatcher.broadcast(&sample_event(1));
        let Outbound::Event { sub_id, .. } = rx.recv().await.unwrap();
        assert_eq!(sub_id, "sub1");
    }

    #[tokio::test]
    async fn non_matching_subscription_is_silent() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(10);
        dispatcher.add_client(1, tx);

        let mut filter = crate::model::Filter::default();
        filter.kinds = Some([2].into_iter().collect());
        dispatcher.set_subscription(1, Subscription { id: "sub1".into(), filters: vec![filter] });

        dispatcher.broadcast(&sample_event(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_client_receives_nothing() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(10);
        dispatcher.add_client(1, tx);
        dispatcher.set_subscription(1, Subscription { id: "s".into(), filters: vec![crate::model::Filter::default()] });
        dispatcher.remove_client(1);
        dispatcher.broadcast(&sample_event(1));
        assert!(rx.try_recv().is_err());
    }
}
