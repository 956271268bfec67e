//! Relay configuration, loaded from `.env` / the process environment via
//! `dotenvy::dotenv()` then `std::env::var`, covering every runtime tunable
//! the relay exposes.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub database_url: Option<String>,
    pub port: u16,

    pub max_content_len: usize,
    pub max_tags: usize,
    pub max_tag_elements: usize,
    pub max_tag_bytes: usize,

    pub future_slack_secs: i64,
    pub epoch_floor: i64,
    pub pow_min_bits: u32,

    pub rate_limit_events_per_sec: u32,
    pub rate_limit_burst: u32,
    pub ban_violation_threshold: u32,
    pub ban_duration: Duration,

    pub max_connections: usize,
    pub max_subscriptions_per_connection: usize,
    pub backpressure_capacity: usize,

    pub idle_timeout: Duration,
    pub max_connection_lifetime: Duration,
    pub ping_interval: Duration,
    pub pong_deadline: Duration,
    pub write_deadline: Duration,
    pub read_deadline: Duration,

    pub storage_query_timeout: Duration,
    pub duplicate_check_timeout: Duration,
    pub duplicate_check_retries: u32,
    pub count_timeout: Duration,

    pub reconcile_max_sessions_per_conn: usize,
    pub reconcile_session_timeout: Duration,
    pub reconcile_frame_size_limit: usize,
    pub reconcile_record_limit: usize,

    pub invite_code_ttl: Duration,
    pub ban_gc_interval: Duration,

    pub relay_owner_pubkey: Option<String>,
    pub relay_name: String,
    pub relay_description: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        RelayConfig {
            database_url: env::var("DATABASE_URL").ok(),
            port: env_or("RELAY_PORT", 3001u16),

            max_content_len: env_or("MAX_CONTENT_LEN", 65536),
            max_tags: env_or("MAX_TAGS", 2000),
            max_tag_elements: env_or("MAX_TAG_ELEMENTS", 100),
            max_tag_bytes: env_or("MAX_TAG_BYTES", 65536),

            future_slack_secs: env_or("FUTURE_SLACK_SECS", 300),
            epoch_floor: env_or("EPOCH_FLOOR", 1_609_459_200),
            pow_min_bits: env_or("POW_MIN_BITS", 0),

            rate_limit_events_per_sec: env_or("RATE_LIMIT_EVENTS_PER_SEC", 10),
            rate_limit_burst: env_or("RATE_LIMIT_BURST", 20),
            ban_violation_threshold: env_or("BAN_VIOLATION_THRESHOLD", 10),
            ban_duration: Duration::from_secs(env_or("BAN_DURATION_SECS", 3600)),

            max_connections: env_or("MAX_CONNECTIONS", 10_000),
            max_subscriptions_per_connection: env_or("MAX_SUBS_PER_CONN", 20),
            backpressure_capacity: env_or("BACKPRESSURE_CAPACITY", 100),

            idle_timeout: Duration::from_secs(env_or("IDLE_TIMEOUT_SECS", 86_400)),
            max_connection_lifetime: Duration::from_secs(env_or("MAX_LIFETIME_SECS", 86_400)),
            ping_interval: Duration::from_secs(env_or("PING_INTERVAL_SECS", 15)),
            pong_deadline: Duration::from_secs(env_or("PONG_DEADLINE_SECS", 90)),
            write_deadline: Duration::from_secs(env_or("WRITE_DEADLINE_SECS", 10)),
            read_deadline: Duration::from_secs(env_or("READ_DEADLINE_SECS", 60)),

            storage_query_timeout: Duration::from_secs(env_or("STORAGE_QUERY_TIMEOUT_SECS", 30)),
            duplicate_check_timeout: Duration::from_secs(env_or("DUP_CHECK_TIMEOUT_SECS", 5)),
            duplicate_check_retries: env_or("DUP_CHECK_RETRIES", 3),
            count_timeout: Duration::from_secs(env_or("COUNT_TIMEOUT_SECS", 30)),

            reconcile_max_sessions_per_conn: env_or("NEG_MAX_SESSIONS", 5),
            reconcile_session_timeout: Duration::from_secs(env_or("NEG_SESSION_TIMEOUT_SECS", 120)),
            reconcile_frame_size_limit: env_or("NEG_FRAME_SIZE_LIMIT", 128 * 1024),
            reconcile_record_limit: env_or("NEG_RECORD_LIMIT", 500_000),

            invite_code_ttl: Duration::from_secs(env_or("INVITE_CODE_TTL_SECS", 86_400)),
            ban_gc_interval: Duration::from_secs(env_or("BAN_GC_INTERVAL_SECS", 600)),

            relay_owner_pubkey: env::var("RELAY_OWNER_PUBKEY").ok(),
            relay_name: env::var("RELAY_NAME").unwrap_or_else(|_| "nostr-relay".to_string()),
            relay_description: env::var("RELAY_DESCRIPTION")
                .unwrap_or_else(|_| "A Rust Nostr relay".to_string()),
        }
    }

    /// Bounded read-buffer size: 2x max content length, clamped to [1MiB, 32MiB].
    pub fn read_buffer_limit(&self) -> usize {
        (self.max_content_len * 2).clamp(1 << 20, 32 << 20)
    }
}
