//! Explicit relay context: replaces process-wide globals (blacklists, ban
//! list, group store, management state) with one object built at startup
//! and handed to every component by reference.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ban::BanList;
use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::groups::GroupEngine;
use crate::idgen::RelayIdentity;
use crate::metrics::RelayMetrics;
use crate::storage::EventStore;
use crate::validator::Validator;

pub struct RelayContext {
    pub config: RelayConfig,
    pub storage: Arc<dyn EventStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub groups: Arc<GroupEngine>,
    pub bans: Arc<BanList>,
    pub validator: Arc<Validator>,
    pub metrics: Arc<RelayMetrics>,
    pub identity: RelayIdentity,
    connections: AtomicUsize,
}

impl RelayContext {
    pub fn new(config: RelayConfig, storage: Arc<dyn EventStore>) -> Self {
        let identity = RelayIdentity::load_or_generate(config.relay_owner_pubkey.as_deref());
        let groups = Arc::new(GroupEngine::new(identity.pubkey_hex.clone()));
        let validator = Arc::new(Validator::new(config.clone(), groups.clone()));
        Self {
            config,
            storage,
            dispatcher: Arc::new(Dispatcher::new()),
            groups,
            bans: Arc::new(BanList::new()),
            validator,
            metrics: Arc::new(RelayMetrics::new()),
            identity,
            connections: AtomicUsize::new(0),
        }
    }

    /// Admission check: reserve a connection slot if below the configured
    /// ceiling. Returns false (no slot reserved) when full.
    pub fn try_admit_connection(&self) -> bool {
        loop {
            let current = self.connections.load(Ordering::Acquire);
            if current >= self.config.max_connections {
                return false;
            }
            if self
                .connections
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.metrics.connections_current.inc();
                self.metrics.connections_total.inc();
                return true;
            }
        }
    }

    /// Decrement the connection count exactly once per session close.
    pub fn release_connection(&self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
        self.metrics.connections_current.dec();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn ctx() -> RelayContext {
        let mut config = RelayConfig::from_env();
        config.max_connections = 1;
        RelayContext::new(config, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn admission_respects_ceiling() {
        let ctx = ctx();
        assert!(ctx.try_admit_connection());
        assert!(!ctx.try_admit_connection());
        ctx.release_connection();
        assert!(ctx.try_admit_connection());
    }
}
