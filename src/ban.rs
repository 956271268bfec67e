//! Ban list and rate-limit violation bookkeeping.
//!
//! Kept as its own collaborator, explicit process-wide state rather than a
//! package-level singleton, so `RelayContext` can own one instance and hand
//! a reference to every session.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Default)]
pub struct BanList {
    bans: RwLock<HashMap<String, i64>>,
    violations: RwLock<HashMap<String, u32>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        match self.bans.read().get(ip) {
            Some(expiry) => *expiry > now(),
            None => false,
        }
    }

    pub fn ban(&self, ip: &str, duration: Duration) {
        self.bans.write().insert(ip.to_string(), now() + duration.as_secs() as i64);
        self.violations.write().remove(ip);
    }

    pub fn unban(&self, ip: &str) {
        self.bans.write().remove(ip);
    }

    /// Record a rate-limit refusal; returns the new violation count.
    pub fn record_violation(&self, ip: &str) -> u32 {
        let mut violations = self.violations.write();
        let count = violations.entry(ip.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_violations(&self, ip: &str) {
        self.violations.write().remove(ip);
    }

    pub fn active_count(&self) -> i64 {
        let now = now();
        self.bans.read().values().filter(|expiry| **expiry > now).count() as i64
    }

    /// Periodic sweep dropping expired entries.
    pub fn gc(&self) {
        let now = now();
        self.bans.write().retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_then_unban() {
        let bans = BanList::new();
        assert!(!bans.is_banned("1.2.3.4"));
        bans.ban("1.2.3.4", Duration::from_secs(3600));
        assert!(bans.is_banned("1.2.3.4"));
        bans.unban("1.2.3.4");
        assert!(!bans.is_banned("1.2.3.4"));
    }

    #[test]
    fn violations_reset_on_ban() {
        let bans = BanList::new();
        bans.record_violation("1.2.3.4");
        bans.record_violation("1.2.3.4");
        assert_eq!(bans.record_violation("1.2.3.4"), 3);
        bans.ban("1.2.3.4", Duration::from_secs(60));
        assert_eq!(bans.record_violation("1.2.3.4"), 1);
    }

    #[test]
    fn gc_drops_expired() {
        let bans = BanList::new();
        bans.bans.write().insert("1.2.3.4".to_string(), now() - 10);
        bans.gc();
        assert!(bans.bans.read().is_empty());
    }
}
