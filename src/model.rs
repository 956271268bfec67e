//! Canonical event/filter data model.
//!
//! Deliberately independent of any third-party Nostr crate: the protocol's
//! wire shape is small enough, and central enough to every other module,
//! that owning the types keeps validation and matching auditable.

use std::collections::{HashMap, HashSet};

use secp256k1::hashes::sha256;
use secp256k1::hashes::Hash as HashTrait;
use secp256k1::{schnorr, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Tag = Vec<String>;

/// A signed, content-addressed Nostr event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Recompute the canonical id: sha256 of `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> String {
        let arr = Value::Array(vec![
            Value::from(0),
            Value::String(self.pubkey.clone()),
            Value::from(self.created_at),
            Value::from(self.kind),
            serde_json::to_value(&self.tags).unwrap_or(Value::Null),
            Value::String(self.content.clone()),
        ]);
        let json = arr.to_string();
        let digest = sha256::Hash::hash(json.as_bytes());
        hex::encode(digest.as_byte_array())
    }

    pub fn id_matches(&self) -> bool {
        self.compute_id() == self.id
    }

    /// Verify the BIP-340 Schnorr signature of `sig` over `id`, signed by `pubkey`.
    pub fn verify_signature(&self) -> Result<(), String> {
        let id_bytes = hex::decode(&self.id).map_err(|e| format!("bad id hex: {e}"))?;
        if id_bytes.len() != 32 {
            return Err("id must be 32 bytes".into());
        }
        let pk_bytes = hex::decode(&self.pubkey).map_err(|e| format!("bad pubkey hex: {e}"))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|e| format!("bad sig hex: {e}"))?;

        let xonly = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|e| e.to_string())?;
        let sig = schnorr::Signature::from_slice(&sig_bytes).map_err(|e| e.to_string())?;
        let msg = Message::from_digest_slice(&id_bytes).map_err(|e| e.to_string())?;

        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &msg, &xonly)
            .map_err(|e| e.to_string())
    }

    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(|n| n == name).unwrap_or(false))
    }

    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next().and_then(|t| t.get(1)).map(|s| s.as_str())
    }

    pub fn is_ephemeral(&self) -> bool {
        (20000..30000).contains(&self.kind)
    }

    pub fn is_replaceable(&self) -> bool {
        self.kind == 0 || self.kind == 3 || (10000..20000).contains(&self.kind)
    }

    pub fn is_addressable(&self) -> bool {
        (30000..40000).contains(&self.kind)
    }

    /// Leading zero bits of the binary id, used for NIP-13 proof-of-work.
    pub fn leading_zero_bits(&self) -> u32 {
        let Ok(bytes) = hex::decode(&self.id) else {
            return 0;
        };
        let mut bits = 0u32;
        for byte in bytes {
            if byte == 0 {
                bits += 8;
                continue;
            }
            bits += byte.leading_zeros();
            break;
        }
        bits
    }
}

/// A subscription restriction: the set of constraints a matching event must
/// satisfy on every present field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<HashSet<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Tag-label (single character, e.g. 'e', 'p', 'h') -> allowed values.
    #[serde(skip)]
    pub tags: HashMap<char, HashSet<String>>,
}

pub const MAX_LIMIT: i64 = 500;
pub const MAX_TAG_LABELS: usize = 10;
pub const MAX_VALUES_PER_LABEL: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    Invalid(String),
}

impl Filter {
    /// Parse a raw JSON object into a `Filter`, extracting `#x` tag-query keys and
    /// clamping `limit` to `MAX_LIMIT`.
    pub fn from_json(value: &Value) -> Result<Filter, FilterError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FilterError::Invalid("filter must be an object".into()))?;

        let mut filter = Filter::default();
        for (key, val) in obj {
            if let Some(label) = key.strip_prefix('#') {
                if label.chars().count() != 1 {
                    continue;
                }
                let ch = label.chars().next().unwrap();
                let values: HashSet<String> = val
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                filter.tags.insert(ch, values);
                continue;
            }
            match key.as_str() {
                "ids" => {
                    filter.ids = val.as_array().map(|arr| {
                        arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
                    })
                }
                "authors" => {
                    filter.authors = val.as_array().map(|arr| {
                        arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
                    })
                }
                "kinds" => {
                    filter.kinds = val.as_array().map(|arr| {
                        arr.iter().filter_map(|v| v.as_u64().map(|n| n as u32)).collect()
                    })
                }
                "since" => filter.since = val.as_i64(),
                "until" => filter.until = val.as_i64(),
                "limit" => filter.limit = val.as_i64(),
                "search" => filter.search = val.as_str().map(str::to_string),
                _ => {}
            }
        }

        filter.limit = Some(clamp_limit(filter.limit));

        if filter.tags.len() > MAX_TAG_LABELS {
            return Err(FilterError::Invalid("too many tag labels".into()));
        }
        for values in filter.tags.values() {
            if values.len() > MAX_VALUES_PER_LABEL {
                return Err(FilterError::Invalid("too many values for a tag label".into()));
            }
        }
        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since > until {
                return Err(FilterError::Invalid("since must be <= until".into()));
            }
        }
        if let Some(ids) = &filter.ids {
            if ids.iter().any(|id| !is_valid_hex(id, 64)) {
                return Err(FilterError::Invalid("invalid id in filter".into()));
            }
        }
        if let Some(authors) = &filter.authors {
            if authors.iter().any(|a| !is_valid_hex(a, 64)) {
                return Err(FilterError::Invalid("invalid author in filter".into()));
            }
        }

        Ok(filter)
    }

    /// Evaluate the filter against an event, checking ids, authors, kinds,
    /// since, until, and tags in that order and short-circuiting on the
    /// first mismatch.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.is_empty() && !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (label, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            let label_str = label.to_string();
            let any_match = event.tags.iter().any(|tag| {
                tag.first().map(|n| n == &label_str).unwrap_or(false)
                    && tag.get(1).map(|v| values.contains(v)).unwrap_or(false)
            });
            if !any_match {
                return false;
            }
        }
        true
    }
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(n) if n > 0 && n <= MAX_LIMIT => n,
        _ => MAX_LIMIT,
    }
}

pub fn is_valid_hex(s: &str, expected_len: usize) -> bool {
    s.len() == expected_len
        && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// A client-registered subscription: an OR of its filters.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let mut e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 1000,
            kind: 1,
            tags: vec![vec!["e".into(), "deadbeef".into()]],
            content: "hello".into(),
            sig: "0".repeat(128),
        };
        e.id = e.compute_id();
        e
    }

    #[test]
    fn id_recomputation_is_stable() {
        let e = sample_event();
        assert!(e.id_matches());
    }

    #[test]
    fn filter_clamp_limit() {
        assert_eq!(clamp_limit(None), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(0)), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(-5)), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(5000)), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(10)), 10);
    }

    #[test]
    fn filter_matches_short_circuits_on_kind() {
        let e = sample_event();
        let mut f = Filter::default();
        f.kinds = Some([2].into_iter().collect());
        assert!(!f.matches(&e));
        f.kinds = Some([1].into_iter().collect());
        assert!(f.matches(&e));
    }

    #[test]
    fn filter_matches_tag_constraint() {
        let e = sample_event();
        let mut f = Filter::default();
        f.tags.insert('e', ["deadbeef".to_string()].into_iter().collect());
        assert!(f.matches(&e));
        f.tags.insert('e', ["other".to_string()].into_iter().collect());
        assert!(!f.matches(&e));
    }

    #[test]
    fn filter_since_until_bounds() {
        let e = sample_event();
        let mut f = Filter::default();
        f.since = Some(1001);
        assert!(!f.matches(&e));
        f.since = Some(999);
        f.until = Some(999);
        assert!(!f.matches(&e));
    }
}
