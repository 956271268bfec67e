//! Range-based set reconciliation (NIP-77), one `negentropy` engine per open
//! subscription ID, scoped to a single session.
//!
//! The `Negentropy::new(32, Some(frame_limit))` / `add_item` / `seal` /
//! `reconcile` call sequence, generalised with record-limit enforcement, a
//! session cap, and idle expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use negentropy::{Bytes, Negentropy};

use crate::config::RelayConfig;
use crate::model::{Event, Filter};

pub enum NegOpenOutcome {
    Reply(String),
    Blocked,
}

pub enum NegMsgOutcome {
    Reply(String),
    Done,
    Expired,
    EngineError,
    NotFound,
}

struct ReconcileSession {
    engine: Negentropy,
    last_used: Instant,
}

/// Owned by a single connection session; never shared across sessions.
pub struct ReconcileSessions {
    sessions: HashMap<String, ReconcileSession>,
    max_sessions: usize,
    timeout: Duration,
    frame_size_limit: usize,
    record_limit: usize,
}

impl ReconcileSessions {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions: config.reconcile_max_sessions_per_conn,
            timeout: config.reconcile_session_timeout,
            frame_size_limit: config.reconcile_frame_size_limit,
            record_limit: config.reconcile_record_limit,
        }
    }

    pub fn open(
        &mut self,
        sub_id: &str,
        filter: &Filter,
        initial_msg_hex: &str,
        matching: &[Event],
    ) -> NegOpenOutcome {
        if self.sessions.len() >= self.max_sessions || matching.len() > self.record_limit {
            return NegOpenOutcome::Blocked;
        }
        let _ = filter;

        let Ok(mut engine) = Negentropy::new(32, Some(self.frame_size_limit as u64)) else {
            return NegOpenOutcome::Blocked;
        };
        for event in matching {
            let Ok(id_bytes) = hex::decode(&event.id) else { continue };
            let _ = engine.add_item(event.created_at as u64, Bytes::from_slice(&id_bytes));
        }
        if engine.seal().is_err() {
            return NegOpenOutcome::Blocked;
        }

        let Ok(query_bytes) = hex::decode(initial_msg_hex) else {
            return NegOpenOutcome::Blocked;
        };
        let query = Bytes::from_slice(&query_bytes);
        match engine.reconcile(&query) {
            Ok(response) => {
                let hex_response = response.to_hex();
                self.sessions
                    .insert(sub_id.to_string(), ReconcileSession { engine, last_used: Instant::now() });
                if hex_response.is_empty() {
                    NegOpenOutcome::Reply(String::new())
                } else {
                    NegOpenOutcome::Reply(hex_response)
                }
            }
            Err(_) => NegOpenOutcome::Blocked,
        }
    }

    pub fn message(&mut self, sub_id: &str, msg_hex: &str) -> NegMsgOutcome {
        let Some(session) = self.sessions.get_mut(sub_id) else {
            return NegMsgOutcome::NotFound;
        };
        if session.last_used.elapsed() > self.timeout {
            self.sessions.remove(sub_id);
            return NegMsgOutcome::Expired;
        }

        let Ok(msg_bytes) = hex::decode(msg_hex) else {
            self.sessions.remove(sub_id);
            return NegMsgOutcome::EngineError;
        };
        let query = Bytes::from_slice(&msg_bytes);
        let result = session.engine.reconcile(&query);
        match result {
            Ok(response) => {
                let hex_response = response.to_hex();
                if hex_response.is_empty() {
                    self.sessions.remove(sub_id);
                    NegMsgOutcome::Done
                } else {
                    session.last_used = Instant::now();
                    NegMsgOutcome::Reply(hex_response)
                }
            }
            Err(_) => {
                self.sessions.remove(sub_id);
                NegMsgOutcome::EngineError
            }
        }
    }

    pub fn close(&mut self, sub_id: &str) {
        self.sessions.remove(sub_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig::from_env()
    }

    #[test]
    fn open_with_malformed_hex_is_blocked() {
        let mut sessions = ReconcileSessions::new(&config());
        let filter = Filter::default();
        let outcome = sessions.open("r", &filter, "not-hex", &[]);
        assert!(matches!(outcome, NegOpenOutcome::Blocked));
    }

    #[test]
    fn message_for_unknown_session_reports_not_found() {
        let mut sessions = ReconcileSessions::new(&config());
        assert!(matches!(sessions.message("nope", "00"), NegMsgOutcome::NotFound));
    }

    #[test]
    fn open_respects_session_cap() {
        let mut config = config();
        config.reconcile_max_sessions_per_conn = 0;
        let mut sessions = ReconcileSessions::new(&config);
        let filter = Filter::default();
        let outcome = sessions.open("r", &filter, "00", &[]);
        assert!(matches!(outcome, NegOpenOutcome::Blocked));
    }
}
