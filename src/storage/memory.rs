//! In-memory `EventStore`, the default test fixture and a viable small-relay
//! backend. Guarded by a single `parking_lot::RwLock` — reads (query/count)
//! take the read lock, writes take the write lock.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RelayResult;
use crate::model::{Event, Filter};

use super::EventStore;

#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn is_expired(event: &Event) -> bool {
        event
            .first_tag_value("expiration")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|exp| exp < Self::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert(&self, event: &Event) -> RelayResult<()> {
        let mut events = self.events.write();
        if events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        events.push(event.clone());
        Ok(())
    }

    async fn exists(&self, id: &str) -> RelayResult<bool> {
        Ok(self.events.read().iter().any(|e| e.id == id))
    }

    async fn get_by_id(&self, id: &str) -> RelayResult<Option<Event>> {
        Ok(self.events.read().iter().find(|e| e.id == id).cloned())
    }

    async fn query(&self, filter: &Filter) -> RelayResult<Vec<Event>> {
        let events = self.events.read();
        let mut matches: Vec<Event> = events
            .iter()
            .filter(|e| !Self::is_expired(e) && filter.matches(e))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = filter.limit.unwrap_or(crate::model::MAX_LIMIT).max(0) as usize;
        matches.truncate(limit);
        Ok(matches)
    }

    async fn count(&self, filter: &Filter) -> RelayResult<u64> {
        let events = self.events.read();
        Ok(events
            .iter()
            .filter(|e| !Self::is_expired(e) && filter.matches(e))
            .count() as u64)
    }

    async fn delete(&self, id: &str) -> RelayResult<()> {
        self.events.write().retain(|e| e.id != id);
        Ok(())
    }

    async fn replace(&self, pubkey: &str, kind: u32, d_tag: Option<&str>) -> RelayResult<()> {
        let mut events = self.events.write();
        let mut same: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.pubkey == pubkey
                    && e.kind == kind
                    && e.first_tag_value("d").unwrap_or("") == d_tag.unwrap_or("")
            })
            .map(|(i, _)| i)
            .collect();
        if same.len() <= 1 {
            return Ok(());
        }
        same.sort_by_key(|&i| std::cmp::Reverse(events[i].created_at));
        let keep = same[0];
        let mut drop_indices: Vec<usize> = same[1..].to_vec();
        drop_indices.sort_unstable_by(|a, b| b.cmp(a));
        for idx in drop_indices {
            if idx != keep {
                events.remove(idx);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn event(id: &str, kind: u32, created_at: i64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[tokio::test]
    async fn insert_and_exists() {
        let store = MemoryStore::new();
        let e = event("e1", 1, 100);
        store.insert(&e).await.unwrap();
        assert!(store.exists("e1").await.unwrap());
        assert!(!store.exists("e2").await.unwrap());
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert(&event(&format!("e{i}"), 1, i)).await.unwrap();
        }
        let mut filter = Filter::default();
        filter.kinds = Some(HashSet::from([1]));
        filter.limit = Some(3);
        let results = store.query(&filter).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "e4");
        assert_eq!(results[2].id, "e2");
    }

    #[tokio::test]
    async fn replace_keeps_newest_only() {
        let store = MemoryStore::new();
        let pk = "a".repeat(64);
        let mut e1 = event("e1", 0, 100);
        e1.pubkey = pk.clone();
        let mut e2 = event("e2", 0, 200);
        e2.pubkey = pk.clone();
        store.insert(&e1).await.unwrap();
        store.insert(&e2).await.unwrap();
        store.replace(&pk, 0, None).await.unwrap();
        assert!(!store.exists("e1").await.unwrap());
        assert!(store.exists("e2").await.unwrap());
    }
}
