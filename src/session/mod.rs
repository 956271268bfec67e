//! Connection session: WebSocket lifecycle, rate limiting, backpressure,
//! bans, subscriptions.
//!
//! Splits the socket into a dedicated writer task fed by an internal mpsc
//! channel, a `tokio::select!` read loop, and a heartbeat ticker, dispatching
//! the full `EVENT`/`REQ`/`COUNT`/`CLOSE`/`NEG-*` command set.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{self, out, ClientFrame, CodecError};
use crate::dispatcher::Outbound;
use crate::model::{Event, Filter, Subscription, MAX_SUBSCRIPTION_ID_LEN};
use crate::pipeline::Pipeline;
use crate::reconcile::{NegMsgOutcome, NegOpenOutcome, ReconcileSessions};
use crate::relay_context::RelayContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Established,
    Draining,
}

/// Commands that carry backpressure (everything except direct replies to
/// what the client just asked for) go through the token bucket; `COUNT` and
/// `NEG-*` responses bypass it.
fn rate_limited_command(cmd: &ClientFrame) -> bool {
    !matches!(cmd, ClientFrame::Count { .. } | ClientFrame::NegOpen { .. } | ClientFrame::NegMsg { .. })
}

const MONITOR_INTERVAL: Duration = Duration::from_secs(60);
const CONSECUTIVE_REFUSAL_LIMIT: u32 = 5;

pub async fn run(
    socket: WebSocket,
    ctx: Arc<RelayContext>,
    pipeline: Arc<Pipeline>,
    client_id: u64,
    ip: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(ctx.config.backpressure_capacity);
    let (raw_tx, mut raw_rx) = mpsc::channel::<Message>(ctx.config.backpressure_capacity);

    ctx.dispatcher.add_client(client_id, out_tx.clone());

    let closed = Arc::new(AtomicBool::new(false));

    // Writer task: the only place frames are actually sent, serialising all
    // emissions behind one mpsc consumer instead of a write mutex.
    let writer_closed = closed.clone();
    let write_deadline = ctx.config.write_deadline;
    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = raw_rx.recv().await {
            if writer_closed.load(Ordering::Acquire) {
                break;
            }
            if tokio::time::timeout(write_deadline, ws_tx.send(msg)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let ping_tx = raw_tx.clone();
    let ping_interval = ctx.config.ping_interval;
    let mut ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            ticker.tick().await;
            if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    let mut state = SessionState::Established;
    let mut subscriptions: std::collections::HashMap<String, Subscription> = std::collections::HashMap::new();
    let mut reconcile = ReconcileSessions::new(&ctx.config);
    let limiter = RateLimiter::direct(
        Quota::per_second(NonZeroU32::new(ctx.config.rate_limit_events_per_sec.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(ctx.config.rate_limit_burst.max(1)).unwrap()),
    );

    let mut consecutive_refusals = 0u32;
    let started = Instant::now();
    let mut last_activity = Instant::now();
    let mut last_pong = Instant::now();
    let mut monitor = tokio::time::interval(MONITOR_INTERVAL);

    loop {
        if matches!(state, SessionState::Draining) {
            break;
        }

        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        handle_text(
                            &text,
                            client_id,
                            &ip,
                            &ctx,
                            &pipeline,
                            &raw_tx,
                            &limiter,
                            &mut subscriptions,
                            &mut reconcile,
                            &mut consecutive_refusals,
                        )
                        .await;
                        if consecutive_refusals > CONSECUTIVE_REFUSAL_LIMIT {
                            state = SessionState::Draining;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = raw_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        state = SessionState::Draining;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(client_id, "websocket read error: {e}");
                        state = SessionState::Draining;
                    }
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Event { sub_id, event }) => {
                        let delivers = subscriptions
                            .get(&sub_id)
                            .map(|s| deliverable(&event, &s.filters))
                            .unwrap_or(false);
                        if !delivers {
                            continue;
                        }
                        let frame = out::event(&sub_id, &event);
                        if raw_tx.try_send(Message::Text(frame)).is_err() {
                            warn!(client_id, "backpressure overflow");
                            state = SessionState::Draining;
                        }
                    }
                    None => {}
                }
            }
            _ = monitor.tick() => {
                let idle = last_activity.elapsed() > ctx.config.idle_timeout;
                let too_old = started.elapsed() > ctx.config.max_connection_lifetime;
                let no_pong = last_pong.elapsed() > ctx.config.pong_deadline;
                if idle || too_old || no_pong {
                    debug!(client_id, idle, too_old, no_pong, "monitor sweep closing session");
                    state = SessionState::Draining;
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    ctx.dispatcher.remove_client(client_id);
    ctx.metrics.subscriptions_current.sub(subscriptions.len() as i64);
    subscriptions.clear();
    ping_task.abort();
    let _ = raw_tx.send(Message::Close(None)).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), &mut writer_task).await;
    ctx.release_connection();
}

/// Direct-message authorisation overlay: kinds 4/14/15 require at least one
/// of the subscription's filters to explicitly target the author or this
/// client's pubkey; gift wraps (1059) bypass the overlay entirely. Applies
/// equally to live dispatch and historical REQ replay — a stored event is
/// no less a DM than a freshly published one.
fn deliverable(event: &Event, filters: &[Filter]) -> bool {
    if event.kind == 1059 {
        return true;
    }
    if !matches!(event.kind, 4 | 14 | 15) {
        return true;
    }
    filters.iter().any(|f| {
        f.authors.as_ref().map(|a| a.contains(&event.pubkey)).unwrap_or(false)
            || f.tags.get(&'p').map(|values| {
                event.tag_values("p").any(|t| t.get(1).map(|v| values.contains(v)).unwrap_or(false))
            }).unwrap_or(false)
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_text(
    text: &str,
    client_id: u64,
    ip: &str,
    ctx: &Arc<RelayContext>,
    pipeline: &Arc<Pipeline>,
    raw_tx: &mpsc::Sender<Message>,
    limiter: &RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
    subscriptions: &mut std::collections::HashMap<String, Subscription>,
    reconcile: &mut ReconcileSessions,
    consecutive_refusals: &mut u32,
) {
    let frame = match codec::parse_client_frame(text) {
        Ok(f) => f,
        Err(CodecError::UnknownCommand(cmd)) => {
            let _ = raw_tx.send(Message::Text(out::notice(&format!("unknown command: {cmd}")))).await;
            return;
        }
        Err(e) => {
            let _ = raw_tx.send(Message::Text(out::notice(&format!("malformed: {e}")))).await;
            return;
        }
    };

    if rate_limited_command(&frame) && limiter.check().is_err() {
        let violations = ctx.bans.record_violation(ip);
        let _ = raw_tx.send(Message::Text(out::notice("Rate limit exceeded, slow down."))).await;
        *consecutive_refusals += 1;
        if violations >= ctx.config.ban_violation_threshold {
            ctx.bans.ban(ip, ctx.config.ban_duration);
            let _ = raw_tx.send(Message::Text(out::notice("You have been temporarily banned."))).await;
            *consecutive_refusals = CONSECUTIVE_REFUSAL_LIMIT + 1;
        }
        return;
    }
    *consecutive_refusals = 0;

    match frame {
        ClientFrame::Event(event) => {
            ctx.metrics.record_received(event.kind);
            let (accept, reason, _transient) = ctx.validator.validate_and_process(&event, ctx.storage.as_ref()).await;
            let is_duplicate = reason.starts_with("duplicate:");
            if accept && !is_duplicate {
                let _ = pipeline.submit(event.clone()).await;
            }
            if !accept {
                ctx.metrics.record_rejected(reason_class(&reason));
            }
            let _ = raw_tx.send(Message::Text(out::ok(&event.id, accept, &reason))).await;
        }
        ClientFrame::Req { sub_id, filters } => {
            if sub_id.is_empty() || sub_id.len() > MAX_SUBSCRIPTION_ID_LEN {
                let _ = raw_tx
                    .send(Message::Text(out::closed(&sub_id, "invalid: subscription id length")))
                    .await;
                return;
            }
            if subscriptions.len() >= ctx.config.max_subscriptions_per_connection
                && !subscriptions.contains_key(&sub_id)
            {
                let _ = raw_tx
                    .send(Message::Text(out::closed(&sub_id, "restricted: too many subscriptions")))
                    .await;
                return;
            }

            let sub = Subscription { id: sub_id.clone(), filters: filters.clone() };
            for f in &filters {
                let timeout_result = tokio::time::timeout(ctx.config.storage_query_timeout, ctx.storage.query(f))
                    .await;
                match timeout_result {
                    Ok(Ok(events)) => {
                        for e in events {
                            if !deliverable(&e, &filters) {
                                continue;
                            }
                            let _ = raw_tx.send(Message::Text(out::event(&sub_id, &e))).await;
                        }
                    }
                    Ok(Err(e)) => warn!(client_id, "historical query failed: {e}"),
                    Err(_) => warn!(client_id, "historical query timed out"),
                }
            }
            let _ = raw_tx.send(Message::Text(out::eose(&sub_id))).await;

            let is_new = !subscriptions.contains_key(&sub_id);
            subscriptions.insert(sub_id.clone(), sub.clone());
            ctx.dispatcher.set_subscription(client_id, sub);
            if is_new {
                ctx.metrics.subscriptions_current.inc();
            }
        }
        ClientFrame::Count { sub_id, filter } => {
            let result = tokio::time::timeout(ctx.config.count_timeout, ctx.storage.count(&filter)).await;
            match result {
                Ok(Ok(n)) => {
                    let _ = raw_tx.send(Message::Text(out::count(&sub_id, n))).await;
                }
                _ => {
                    let _ = raw_tx.send(Message::Text(out::notice("error: count failed"))).await;
                }
            }
        }
        ClientFrame::Close { sub_id } => {
            let reason = if subscriptions.remove(&sub_id).is_some() {
                ctx.dispatcher.remove_subscription(client_id, &sub_id);
                ctx.metrics.subscriptions_current.dec();
                "subscription closed"
            } else {
                "subscription not found"
            };
            let _ = raw_tx.send(Message::Text(out::closed(&sub_id, reason))).await;
        }
        ClientFrame::NegOpen { sub_id, filter, initial_msg } => {
            let matching = ctx.storage.query(&filter).await.unwrap_or_default();
            match reconcile.open(&sub_id, &filter, &initial_msg, &matching) {
                NegOpenOutcome::Reply(hex) if !hex.is_empty() => {
                    let _ = raw_tx.send(Message::Text(out::neg_msg(&sub_id, &hex))).await;
                }
                NegOpenOutcome::Reply(_) => {}
                NegOpenOutcome::Blocked => {
                    let _ = raw_tx.send(Message::Text(out::neg_err(&sub_id, "blocked"))).await;
                }
            }
        }
        ClientFrame::NegMsg { sub_id, msg } => match reconcile.message(&sub_id, &msg) {
            NegMsgOutcome::Reply(hex) => {
                let _ = raw_tx.send(Message::Text(out::neg_msg(&sub_id, &hex))).await;
            }
            NegMsgOutcome::Done => {}
            NegMsgOutcome::Expired => {
                let _ = raw_tx.send(Message::Text(out::neg_err(&sub_id, "closed: session timed out"))).await;
            }
            NegMsgOutcome::NotFound => {
                let _ = raw_tx
                    .send(Message::Text(out::neg_err(&sub_id, "closed: no active session for this subscription ID")))
                    .await;
            }
            NegMsgOutcome::EngineError => {
                let _ = raw_tx.send(Message::Text(out::neg_err(&sub_id, "error: reconciliation failed"))).await;
            }
        },
        ClientFrame::NegClose { sub_id } => {
            reconcile.close(&sub_id);
        }
    }
}

fn reason_class(reason: &str) -> &'static str {
    if reason.starts_with("invalid:") {
        "invalid"
    } else if reason.starts_with("restricted:") {
        "restricted"
    } else if reason.starts_with("unauthorized:") {
        "restricted"
    } else if reason.starts_with("duplicate:") {
        "duplicate"
    } else if reason.contains("expired") {
        "expired"
    } else {
        "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(kind: u32) -> Event {
        Event {
            id: "e".repeat(64),
            pubkey: "p".repeat(64),
            created_at: 1,
            kind,
            tags: vec![vec!["p".into(), "f".repeat(64)]],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn gift_wrap_bypasses_dm_overlay() {
        assert!(deliverable(&sample_event(1059), &[]));
    }

    #[test]
    fn dm_without_matching_filter_is_not_delivered() {
        assert!(!deliverable(&sample_event(4), &[Filter::default()]));
    }

    #[test]
    fn dm_matching_filter_is_delivered_on_historical_replay_too() {
        let mut filter = Filter::default();
        filter.tags.insert('p', ["f".repeat(64)].into_iter().collect());
        assert!(deliverable(&sample_event(4), &[filter]));
    }

    #[test]
    fn reason_class_buckets_are_stable() {
        assert_eq!(reason_class("invalid: bad"), "invalid");
        assert_eq!(reason_class("duplicate: exists"), "duplicate");
        assert_eq!(reason_class("unauthorized: no"), "restricted");
    }
}
