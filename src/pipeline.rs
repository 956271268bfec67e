//! Processing pipeline: bounded queue, persistence hand-off, metrics,
//! dispatcher broadcast, and group-engine side effects.
//!
//! Insert-then-broadcast, run as its own worker pool rather than inline on
//! the session's read task, so a slow persistence backend can't stall
//! reading off the socket.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::model::Event;
use crate::relay_context::RelayContext;

const MODERATION_KINDS_LOW: u32 = 9000;
const MODERATION_KINDS_HIGH: u32 = 9031;

fn is_group_side_effect_kind(kind: u32) -> bool {
    (MODERATION_KINDS_LOW..MODERATION_KINDS_HIGH).contains(&kind)
}

pub struct Pipeline {
    sender: mpsc::Sender<Event>,
}

impl Pipeline {
    pub fn spawn(ctx: Arc<RelayContext>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers {
            let ctx = ctx.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(event) => process_one(&ctx, event).await,
                        None => break,
                    }
                }
            });
        }
        Self { sender: tx }
    }

    /// Enqueue an already-validated, accepted event. Returns `Err` only when
    /// the pipeline has been shut down.
    pub async fn submit(&self, event: Event) -> Result<(), ()> {
        self.sender.send(event).await.map_err(|_| ())
    }
}

async fn process_one(ctx: &Arc<RelayContext>, event: Event) {
    let started = Instant::now();

    if !event.is_ephemeral() {
        if let Err(e) = ctx.storage.insert(&event).await {
            warn!(event_id = %event.id, "persistence failed: {e}");
            return;
        }
        if event.is_replaceable() {
            if let Err(e) = ctx.storage.replace(&event.pubkey, event.kind, None).await {
                warn!(event_id = %event.id, "replace cleanup failed: {e}");
            }
        } else if event.is_addressable() {
            let d_tag = event.first_tag_value("d").unwrap_or("");
            if let Err(e) = ctx.storage.replace(&event.pubkey, event.kind, Some(d_tag)).await {
                warn!(event_id = %event.id, "replace cleanup failed: {e}");
            }
        }
        if event.kind == 5 {
            for tag in event.tag_values("e") {
                if let Some(target_id) = tag.get(1) {
                    if let Err(e) = ctx.storage.delete(target_id).await {
                        warn!(event_id = %event.id, target = %target_id, "deletion target cleanup failed: {e}");
                    }
                }
            }
        }
    }

    ctx.metrics.events_accepted.inc();
    ctx.dispatcher.broadcast(&event);

    if is_group_side_effect_kind(event.kind) {
        let companions =
            ctx.groups.apply_and_snapshot(&event, &ctx.identity.secret_hex, &ctx.identity.pubkey_hex);
        for companion in companions {
            Box::pin(process_one(ctx, companion)).await;
        }
    }

    ctx.metrics.event_processing_seconds.observe(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::storage::memory::MemoryStore;

    fn sample_event(kind: u32, pubkey: &str) -> Event {
        let mut e = Event {
            id: String::new(),
            pubkey: pubkey.to_string(),
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
    async fn ephemeral_events_are_not_persisted() {
        let ctx = Arc::new(RelayContext::new(RelayConfig::from_env(), Arc::new(MemoryStore::new())));
        let pipeline = Pipeline::spawn(ctx.clone(), 1, 10);
        let event = sample_event(20001, &"a".repeat(64));
        pipeline.submit(event.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!ctx.storage.exists(&event.id).await.unwrap());
    }

    #[tokio::test]
    async fn ordinary_events_are_persisted_and_broadcast() {
        let ctx = Arc::new(RelayContext::new(RelayConfig::from_env(), Arc::new(MemoryStore::new())));
        let pipeline = Pipeline::spawn(ctx.clone(), 1, 10);
        let event = sample_event(1, &"a".repeat(64));
        pipeline.submit(event.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ctx.storage.exists(&event.id).await.unwrap());
    }
}
