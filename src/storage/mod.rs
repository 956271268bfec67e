//! Storage collaborator contract. Persistence engine choice is a deployment
//! concern; this trait is the seam the rest of the relay programs against.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::RelayResult;
use crate::model::{Event, Filter};

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &Event) -> RelayResult<()>;
    async fn exists(&self, id: &str) -> RelayResult<bool>;
    async fn get_by_id(&self, id: &str) -> RelayResult<Option<Event>>;
    async fn query(&self, filter: &Filter) -> RelayResult<Vec<Event>>;
    async fn count(&self, filter: &Filter) -> RelayResult<u64>;
    /// Delete an event by id, used by NIP-09 deletion authorisation.
    async fn delete(&self, id: &str) -> RelayResult<()>;
    /// Delete prior versions of a replaceable/addressable event, keeping the
    /// newest by `created_at`. `d_tag` is `None` for replaceable (kind 0/3/1xxxx)
    /// events and `Some(value)` for addressable (3xxxx) events.
    async fn replace(&self, pubkey: &str, kind: u32, d_tag: Option<&str>) -> RelayResult<()>;
}
