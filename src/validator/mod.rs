//! Event validator: structural checks, signature verification, kind policy,
//! per-kind dispatch, deletion authorisation.

pub mod kinds;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::RelayConfig;
use crate::groups::GroupEngine;
use crate::model::{is_valid_hex, Event};
use crate::storage::EventStore;

use kinds::KindPolicy;
use registry::ValidatorRegistry;

pub struct Validator {
    config: RelayConfig,
    blacklist: RwLock<HashSet<String>>,
    kind_policy: RwLock<KindPolicy>,
    registry: ValidatorRegistry,
    groups: Arc<GroupEngine>,
}

/// Outcome of the cheap, synchronous structural/policy pass.
pub struct CheckOutcome {
    pub accept: bool,
    pub reason: String,
}

impl CheckOutcome {
    fn ok() -> Self {
        Self { accept: true, reason: String::new() }
    }
    fn reject(reason: impl Into<String>) -> Self {
        Self { accept: false, reason: reason.into() }
    }
}

impl Validator {
    pub fn new(config: RelayConfig, groups: Arc<GroupEngine>) -> Self {
        Self {
            config,
            blacklist: RwLock::new(HashSet::new()),
            kind_policy: RwLock::new(KindPolicy::default()),
            registry: ValidatorRegistry::default(),
            groups,
        }
    }

    pub fn blacklist_author(&self, pubkey: &str) {
        self.blacklist.write().insert(pubkey.to_lowercase());
    }

    pub fn unblacklist_author(&self, pubkey: &str) {
        self.blacklist.write().remove(&pubkey.to_lowercase());
    }

    fn is_blacklisted(&self, pubkey: &str) -> bool {
        self.blacklist.read().contains(&pubkey.to_lowercase())
    }

    /// The ordered, synchronous structural/policy checks. Id recomputation
    /// and deletion authorisation against storage are async and live in
    /// `validate_and_process` since they need I/O.
    pub fn validate(&self, event: &Event) -> CheckOutcome {
        // 1. hex shape
        if !is_valid_hex(&event.id, 64) {
            return CheckOutcome::reject("invalid: malformed event id");
        }
        if !is_valid_hex(&event.pubkey, 64) {
            return CheckOutcome::reject("invalid: malformed pubkey");
        }
        if !is_valid_hex(&event.sig, 128) {
            return CheckOutcome::reject("invalid: malformed signature");
        }

        // 2. kind acceptable
        if !self.kind_policy.read().is_acceptable(event.kind) {
            return CheckOutcome::reject("invalid: kind not accepted by this relay");
        }

        // 3. blacklist
        if self.is_blacklisted(&event.pubkey) {
            return CheckOutcome::reject("restricted: pubkey is blacklisted");
        }

        // 4. id recomputation
        if !event.id_matches() {
            return CheckOutcome::reject("invalid: id does not match event contents");
        }

        // 5. timestamp bounds
        let now = chrono::Utc::now().timestamp();
        if event.created_at > now + self.config.future_slack_secs {
            return CheckOutcome::reject("invalid: created_at too far in the future");
        }
        if event.created_at < self.config.epoch_floor {
            return CheckOutcome::reject("invalid: created_at before epoch floor");
        }

        // 6. expiration tag
        if let Some(exp_str) = event.first_tag_value("expiration") {
            match exp_str.parse::<i64>() {
                Ok(exp) if exp < now => return CheckOutcome::reject("event has expired"),
                Err(_) => return CheckOutcome::reject("invalid: malformed expiration tag"),
                _ => {}
            }
        }

        // 7. proof of work
        if self.config.pow_min_bits > 0 {
            let target = event
                .first_tag_value("nonce")
                .and(Some(self.config.pow_min_bits))
                .unwrap_or(self.config.pow_min_bits);
            if event.leading_zero_bits() < target {
                return CheckOutcome::reject("invalid: insufficient proof of work");
            }
        }

        // 8. size bounds
        if event.content.len() > self.config.max_content_len {
            return CheckOutcome::reject("invalid: content too long");
        }
        if event.tags.len() > self.config.max_tags {
            return CheckOutcome::reject("invalid: too many tags");
        }
        let mut total_tag_bytes = 0usize;
        for tag in &event.tags {
            if tag.is_empty() {
                return CheckOutcome::reject("invalid: empty tag");
            }
            if tag.len() > self.config.max_tag_elements {
                return CheckOutcome::reject("invalid: tag has too many elements");
            }
            total_tag_bytes += tag.iter().map(|s| s.len()).sum::<usize>();
        }
        if total_tag_bytes > self.config.max_tag_bytes {
            return CheckOutcome::reject("invalid: total tag bytes too large");
        }

        // 9. kind-specific required tags
        for (name, min_len) in kinds::required_tags(event.kind) {
            let present = event.tag_values(name).any(|t| t.len() >= *min_len);
            if !present {
                return CheckOutcome::reject(format!(
                    "invalid: missing required '{name}' tag for kind {}",
                    event.kind
                ));
            }
        }

        // 11. per-kind content rules
        if let Err(reason) = self.registry.validate(event) {
            return CheckOutcome::reject(format!("invalid: {reason}"));
        }

        // 12. managed-group rules
        let carries_h_tag = event.first_tag_value("h").is_some();
        if carries_h_tag || kinds::in_open_range(event.kind) && (9000..9031).contains(&event.kind) {
            if let Err(reason) = self.groups.validate_group_event(event) {
                return CheckOutcome::reject(reason);
            }
        }

        CheckOutcome::ok()
    }

    /// Deletion authorisation: every referenced event still in storage must
    /// share the deletion event's author.
    pub async fn validate_deletion(&self, event: &Event, store: &dyn EventStore) -> CheckOutcome {
        for tag in event.tag_values("e") {
            let Some(target_id) = tag.get(1) else { continue };
            match store.get_by_id(target_id).await {
                Ok(Some(target)) if target.pubkey != event.pubkey => {
                    return CheckOutcome::reject(
                        "unauthorized: only the event author can delete their events",
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("deletion authorisation lookup failed: {e}");
                }
            }
        }
        CheckOutcome::ok()
    }

    /// The full pipeline entry point: duplicate check with bounded retry,
    /// signature verification, then `validate`. Returns
    /// `(accept, reason, transient)`.
    pub async fn validate_and_process(
        &self,
        event: &Event,
        store: &dyn EventStore,
    ) -> (bool, String, bool) {
        if event.content.len() > self.config.max_content_len {
            return (false, "invalid: content too long".to_string(), false);
        }

        match self.duplicate_check(event, store).await {
            Ok(true) => return (true, "duplicate: event already exists".to_string(), false),
            Ok(false) => {}
            Err(_) => return (false, "error: storage unavailable".to_string(), true),
        }

        if let Err(e) = event.verify_signature() {
            return (false, format!("invalid: bad signature: {e}"), false);
        }

        let outcome = self.validate(event);
        if !outcome.accept {
            return (false, outcome.reason, false);
        }

        if event.kind == 5 {
            let del_outcome = self.validate_deletion(event, store).await;
            if !del_outcome.accept {
                return (false, del_outcome.reason, false);
            }
        }

        (true, String::new(), false)
    }

    async fn duplicate_check(&self, event: &Event, store: &dyn EventStore) -> Result<bool, ()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::time::timeout(
                self.config.duplicate_check_timeout,
                store.exists(&event.id),
            )
            .await;
            match result {
                Ok(Ok(exists)) => return Ok(exists),
                Ok(Err(_)) | Err(_) => {
                    if attempts >= self.config.duplicate_check_retries {
                        return Err(());
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
