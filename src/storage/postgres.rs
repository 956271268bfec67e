//! Postgres-backed `EventStore` via `sqlx`. Every predicate here is bound
//! as a parameter; building dynamic `IN (...)` lists or numeric bounds with
//! string interpolation is a SQL injection footgun this store avoids
//! entirely.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};

use crate::error::{RelayError, RelayResult};
use crate::model::{Event, Filter, Tag};

use super::EventStore;

fn is_expired(event: &Event) -> bool {
    event
        .first_tag_value("expiration")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|exp| exp < chrono::Utc::now().timestamp())
        .unwrap_or(false)
}

pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> RelayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(50)
            .connect(database_url)
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                kind INTEGER NOT NULL,
                content TEXT NOT NULL,
                tags JSONB NOT NULL,
                sig TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                received_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Storage(e.to_string()))?;
        Ok(())
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, sqlx::Error> {
        let tags_val: serde_json::Value = row.try_get("tags")?;
        let tags: Vec<Tag> = serde_json::from_value(tags_val).unwrap_or_default();
        Ok(Event {
            id: row.try_get("event_id")?,
            pubkey: row.try_get("pubkey")?,
            created_at: row.try_get::<i64, _>("created_at")?,
            kind: row.try_get::<i32, _>("kind")? as u32,
            tags,
            content: row.try_get("content")?,
            sig: row.try_get("sig")?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert(&self, event: &Event) -> RelayResult<()> {
        let tags_json = serde_json::to_value(&event.tags).unwrap_or(serde_json::Value::Null);
        sqlx::query(
            "INSERT INTO events (event_id, pubkey, kind, content, tags, sig, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.kind as i32)
        .bind(&event.content)
        .bind(tags_json)
        .bind(&event.sig)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> RelayResult<bool> {
        let row = sqlx::query("SELECT 1 FROM events WHERE event_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn get_by_id(&self, id: &str) -> RelayResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE event_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))?;
        row.as_ref()
            .map(Self::row_to_event)
            .transpose()
            .map_err(|e| RelayError::Storage(e.to_string()))
    }

    async fn query(&self, filter: &Filter) -> RelayResult<Vec<Event>> {
        // Fetch a superset on the cheap, statically-boundable predicates,
        // then apply the full filter (including tag constraints) in memory.
        let rows = sqlx::query(
            "SELECT * FROM events \
             WHERE ($1::bigint IS NULL OR created_at >= $1) \
               AND ($2::bigint IS NULL OR created_at <= $2) \
             ORDER BY created_at DESC LIMIT 5000",
        )
        .bind(filter.since)
        .bind(filter.until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RelayError::Storage(e.to_string()))?;

        let mut events: Vec<Event> = rows
            .iter()
            .filter_map(|r| Self::row_to_event(r).ok())
            .filter(|e| !is_expired(e) && filter.matches(e))
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = filter.limit.unwrap_or(crate::model::MAX_LIMIT).max(0) as usize;
        events.truncate(limit);
        Ok(events)
    }

    async fn count(&self, filter: &Filter) -> RelayResult<u64> {
        Ok(self.query(filter).await?.len() as u64)
    }

    async fn delete(&self, id: &str) -> RelayResult<()> {
        sqlx::query("DELETE FROM events WHERE event_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn replace(&self, pubkey: &str, kind: u32, d_tag: Option<&str>) -> RelayResult<()> {
        // `first_tag_value("d")`, expressed as a JSONB search for the first
        // tag whose own first element is the literal "d", not element 1 of
        // whichever tag happens to come first.
        sqlx::query(
            "DELETE FROM events WHERE pubkey = $1 AND kind = $2 \
                AND COALESCE((SELECT t ->> 1 FROM jsonb_array_elements(tags) AS t \
                              WHERE t ->> 0 = 'd' LIMIT 1), '') = $3 \
                AND event_id NOT IN ( \
                    SELECT event_id FROM events WHERE pubkey = $1 AND kind = $2 \
                    AND COALESCE((SELECT t ->> 1 FROM jsonb_array_elements(tags) AS t \
                                  WHERE t ->> 0 = 'd' LIMIT 1), '') = $3 \
                    ORDER BY created_at DESC LIMIT 1 \
                )",
        )
        .bind(pubkey)
        .bind(kind as i32)
        .bind(d_tag.unwrap_or(""))
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Storage(e.to_string()))?;
        Ok(())
    }
}
