//! Cross-module integration tests exercising relay behavior end to end,
//! minus the WebSocket transport itself (covered by the `session` module's
//! unit tests).

use std::sync::Arc;
use std::time::Duration;

use nostr_relay::config::RelayConfig;
use nostr_relay::dispatcher::Outbound;
use nostr_relay::idgen::{generate_keypair, sign};
use nostr_relay::model::{Event, Filter, Subscription};
use nostr_relay::pipeline::Pipeline;
use nostr_relay::relay_context::RelayContext;
use nostr_relay::storage::memory::MemoryStore;
use nostr_relay::storage::EventStore;

fn signed_event(kind: u32, created_at: i64, tags: Vec<Vec<String>>) -> Event {
    let (sk, pk) = generate_keypair();
    let mut e = Event {
        id: String::new(),
        pubkey: pk,
        created_at,
        kind,
        tags,
        content: String::new(),
        sig: String::new(),
    };
    e.id = e.compute_id();
    e.sig = sign(&sk, &e.id);
    e
}

fn context() -> Arc<RelayContext> {
    Arc::new(RelayContext::new(RelayConfig::from_env(), Arc::new(MemoryStore::new())))
}

/// a REQ with limit 3 against 5 stored matches returns exactly 3,
/// newest first.
#[tokio::test]
async fn historical_query_respects_limit_and_order() {
    let store = MemoryStore::new();
    for i in 0..5 {
        store.insert(&signed_event(1, 1000 + i, vec![])).await.unwrap();
    }
    let mut filter = Filter::default();
    filter.kinds = Some([1].into_iter().collect());
    filter.limit = Some(3);

    let results = store.query(&filter).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0].created_at > results[1].created_at);
    assert!(results[1].created_at > results[2].created_at);
    assert_eq!(results[0].created_at, 1004);
}

/// deletion by a non-author is rejected with the exact reason prefix.
#[tokio::test]
async fn deletion_by_non_author_rejected() {
    let ctx = context();
    let target = signed_event(1, 1000, vec![]);
    ctx.storage.insert(&target).await.unwrap();

    let mut deletion = signed_event(5, 1001, vec![vec!["e".into(), target.id.clone()]]);
    let (sk, pk) = generate_keypair();
    deletion.pubkey = pk;
    deletion.id = deletion.compute_id();
    deletion.sig = sign(&sk, &deletion.id);

    let (accept, reason, _) = ctx.validator.validate_and_process(&deletion, ctx.storage.as_ref()).await;
    assert!(!accept);
    assert_eq!(reason, "unauthorized: only the event author can delete their events");
}

/// a second session subscribed to an author receives a freshly
/// published event from that author within the dispatcher's normal
/// synchronous broadcast path.
#[tokio::test]
async fn live_dispatch_reaches_matching_subscriber() {
    let ctx = context();
    let pipeline = Pipeline::spawn(ctx.clone(), 1, 10);

    let (tx, mut rx) = tokio::sync::mpsc::channel(10);
    ctx.dispatcher.add_client(42, tx);

    let author = generate_keypair();
    let mut filter = Filter::default();
    filter.authors = Some([author.1.clone()].into_iter().collect());
    ctx.dispatcher.set_subscription(42, Subscription { id: "sub-b".into(), filters: vec![filter] });

    let mut event = Event {
        id: String::new(),
        pubkey: author.1,
        created_at: 2000,
        kind: 1,
        tags: vec![],
        content: "hi".into(),
        sig: String::new(),
    };
    event.id = event.compute_id();
    event.sig = sign(&author.0, &event.id);

    pipeline.submit(event.clone()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.unwrap().unwrap();
    let Outbound::Event { sub_id, event: received_event } = received;
    assert_eq!(sub_id, "sub-b");
    assert_eq!(received_event.id, event.id);
}

/// repeated rate-limit violations cross the ban threshold and the IP
/// becomes banned for the configured duration.
#[tokio::test]
async fn repeated_violations_trigger_ban() {
    let ctx = context();
    let ip = "203.0.113.9";
    for _ in 0..ctx.config.ban_violation_threshold - 1 {
        ctx.bans.record_violation(ip);
    }
    assert!(!ctx.bans.is_banned(ip));
    let last = ctx.bans.record_violation(ip);
    assert!(last >= ctx.config.ban_violation_threshold);
    ctx.bans.ban(ip, ctx.config.ban_duration);
    assert!(ctx.bans.is_banned(ip));
}

/// group creation followed by put-user emits a snapshot whose members
/// list contains the added pubkey.
#[tokio::test]
async fn group_creation_then_put_user_emits_member_snapshot() {
    let ctx = context();
    let owner = ctx.identity.pubkey_hex.clone();

    let create = signed_event(9007, 1000, vec![vec!["h".into(), "g1".into()]]);
    let mut create = create;
    create.pubkey = owner.clone();
    create.id = create.compute_id();
    create.sig = sign(&ctx.identity.secret_hex, &create.id);
    assert!(ctx.groups.validate_group_event(&create).is_ok());
    ctx.groups.apply_and_snapshot(&create, &ctx.identity.secret_hex, &ctx.identity.pubkey_hex);

    let member = generate_keypair();
    let mut put_user = signed_event(
        9000,
        1001,
        vec![vec!["h".into(), "g1".into()], vec!["p".into(), member.1.clone()]],
    );
    put_user.pubkey = owner.clone();
    put_user.id = put_user.compute_id();
    put_user.sig = sign(&ctx.identity.secret_hex, &put_user.id);
    assert!(ctx.groups.validate_group_event(&put_user).is_ok());
    let snapshot = ctx.groups.apply_and_snapshot(&put_user, &ctx.identity.secret_hex, &ctx.identity.pubkey_hex);

    assert!(snapshot.iter().any(|e| e.kind == 39002
        && e.tag_values("p").any(|t| t.get(1).map(|v| v == &member.1).unwrap_or(false))));
    assert!(ctx.groups.is_member("g1", &member.1));
}
