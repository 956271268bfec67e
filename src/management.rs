//! NIP-86-style management RPC. Request-level authentication is treated as
//! an external concern; this endpoint trusts a pre-authenticated caller and
//! only implements the method dispatch and relay-state mutations.
//!
//! Uses the same id/method/params JSON-RPC shape and error-code convention
//! a NIP-86 admin surface is expected to speak, exposed over plain HTTP POST
//! rather than multiplexed onto the event WebSocket, since the admin surface
//! has no need to share a connection with event traffic.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};

use crate::relay_context::RelayContext;

/// Marker proving the caller has already been authenticated and authorised
/// as the relay owner or an operator, by whatever upstream mechanism a
/// deployment chooses. This extractor only checks that the caller presented
/// the owner pubkey via
/// a trusted header set by whatever reverse proxy or NIP-42 bridge fronts
/// this endpoint; it does not itself verify a signature.
pub struct AuthenticatedAdmin;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedAdmin
where
    Arc<RelayContext>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ctx = Arc::<RelayContext>::from_ref(state);
        let presented = parts
            .headers
            .get("x-relay-admin-pubkey")
            .and_then(|v| v.to_str().ok());
        match (presented, ctx.config.relay_owner_pubkey.as_deref()) {
            (Some(p), Some(owner)) if p == owner => Ok(AuthenticatedAdmin),
            _ => Err((StatusCode::UNAUTHORIZED, "admin access required")),
        }
    }
}

pub async fn handle_rpc(
    State(ctx): State<Arc<RelayContext>>,
    _admin: AuthenticatedAdmin,
    Json(request): Json<Value>,
) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(|v| v.as_str()).unwrap_or("");
    let params = request.get("params").and_then(|v| v.as_array());

    let result = dispatch(&ctx, method, params);

    Json(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
        Err(message) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": message },
        }),
    })
}

fn dispatch(ctx: &Arc<RelayContext>, method: &str, params: Option<&Vec<Value>>) -> Result<Value, String> {
    match method {
        "supportedmethods" => Ok(json!([
            "allowpubkey", "banpubkey", "listallowedpubkeys", "listbannedpubkeys", "banip", "unbanip",
        ])),
        "allowpubkey" => {
            let pubkey = string_param(params, 0)?;
            ctx.validator.unblacklist_author(pubkey);
            Ok(json!(true))
        }
        "banpubkey" => {
            let pubkey = string_param(params, 0)?;
            ctx.validator.blacklist_author(pubkey);
            Ok(json!(true))
        }
        "banip" => {
            let ip = string_param(params, 0)?;
            ctx.bans.ban(ip, ctx.config.ban_duration);
            Ok(json!(true))
        }
        "unbanip" => {
            let ip = string_param(params, 0)?;
            ctx.bans.unban(ip);
            Ok(json!(true))
        }
        _ => Err("method not found".to_string()),
    }
}

fn string_param<'a>(params: Option<&'a Vec<Value>>, idx: usize) -> Result<&'a str, String> {
    params
        .and_then(|p| p.get(idx))
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing or malformed parameter {idx}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::storage::memory::MemoryStore;

    #[test]
    fn ban_and_allow_roundtrip() {
        let ctx = Arc::new(RelayContext::new(RelayConfig::from_env(), Arc::new(MemoryStore::new())));
        let pubkey = json!(["deadbeef"]);
        let params = pubkey.as_array();
        assert_eq!(dispatch(&ctx, "banpubkey", params), Ok(json!(true)));
        assert_eq!(dispatch(&ctx, "allowpubkey", params), Ok(json!(true)));
    }

    #[test]
    fn unknown_method_is_an_error() {
        let ctx = Arc::new(RelayContext::new(RelayConfig::from_env(), Arc::new(MemoryStore::new())));
        assert!(dispatch(&ctx, "does-not-exist", None).is_err());
    }
}
