mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Barrier;

use common::{collector, settle, wait_until, HookedStore, ScriptedAi, World};
use kindred_client::backend::message_record;
use kindred_client::ai::DisabledAi;
use kindred_client::{CoreConfig, MatchWithPartner, SendOutcome, SwipeRejection};
use kindred_shared::constants::TABLE_MESSAGES;
use kindred_shared::protocol::table_topic;
use kindred_shared::{backoff_delay, ChangeEvent, DeliveryStatus, MessageKind, SwipeAction, UserId};
use kindred_store::Message;

#[tokio::test]
async fn test_repeated_events_deliver_message_once() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let bo = world.client();

    let (callback, lists) = collector::<Vec<Message>>();
    bo.chat().subscribe(b, a, callback).await;

    let SendOutcome::Sent(message) = ada.chat().send_text(a, b, "hi").await.unwrap() else {
        panic!("expected the send to reach the store");
    };
    for _ in 0..5 {
        world
            .hub
            .emit_change(ChangeEvent::insert(TABLE_MESSAGES, message_record(&message)));
    }
    settle().await;

    let lists = lists.lock().unwrap();
    // Initial history, then one refresh for the first event; replays are dropped.
    assert_eq!(lists.len(), 2);
    for list in lists.iter() {
        assert!(list.iter().filter(|m| m.id == message.id).count() <= 1);
    }
    assert_eq!(lists.last().unwrap().len(), 1);
}

#[tokio::test]
async fn test_resubscribe_keeps_one_listener() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let bo = world.client();

    let (first, first_lists) = collector::<Vec<Message>>();
    let (second, second_lists) = collector::<Vec<Message>>();
    bo.chat().subscribe(b, a, first).await;
    bo.chat().subscribe(b, a, second).await;
    settle().await;

    assert_eq!(bo.registry().keys().len(), 1);
    assert_eq!(world.hub.subscriber_count(&table_topic(TABLE_MESSAGES)), 1);

    ada.chat().send_text(a, b, "ping").await.unwrap();
    settle().await;

    assert_eq!(first_lists.lock().unwrap().len(), 1);
    assert_eq!(second_lists.lock().unwrap().last().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_mutual_likes_converge() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    // Neither swipe reads the reverse row until both rows are written.
    let gate = Arc::new(Barrier::new(2));
    let client = |gate: Arc<Barrier>| {
        let store = HookedStore::new(world.backend()).gate_swipe_inserts(gate);
        world.client_on(CoreConfig::default(), Arc::new(store), Arc::new(DisabledAi))
    };
    let ada = client(gate.clone()).matches().clone();
    let bo = client(gate).matches().clone();

    let left = tokio::spawn(async move { ada.swipe(a, b, SwipeAction::Like).await });
    let right = tokio::spawn(async move { bo.swipe(b, a, SwipeAction::Superlike).await });
    let outcomes = [left.await.unwrap().unwrap(), right.await.unwrap().unwrap()];

    for outcome in &outcomes {
        assert!(outcome.accepted);
        assert!(outcome.matched);
    }
    let ids: Vec<_> = outcomes
        .iter()
        .map(|o| o.match_record.as_ref().unwrap().id)
        .collect();
    assert_eq!(ids[0], ids[1]);

    let db = world.db.lock().unwrap();
    assert_eq!(db.active_matches_for(&a).unwrap().len(), 1);
    assert_eq!(db.active_matches_for(&b).unwrap().len(), 1);
    assert_eq!(db.match_for_pair(&b, &a).unwrap().unwrap().id, ids[0]);
}

#[tokio::test]
async fn test_retried_like_creates_match_after_lookup_failure() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let store = HookedStore::new(world.backend()).fail_match_lookups(1);
    let bo = world.client_on(CoreConfig::default(), Arc::new(store), Arc::new(DisabledAi));

    assert!(ada.matches().swipe(a, b, SwipeAction::Like).await.unwrap().accepted);
    assert!(bo.matches().swipe(b, a, SwipeAction::Like).await.is_err());
    assert!(world.db.lock().unwrap().match_for_pair(&a, &b).unwrap().is_none());

    let retry = bo.matches().swipe(b, a, SwipeAction::Like).await.unwrap();
    assert!(!retry.accepted);
    assert_eq!(retry.reason, Some(SwipeRejection::AlreadySwiped));
    assert!(retry.matched);
    let record = retry.match_record.unwrap();

    let db = world.db.lock().unwrap();
    assert_eq!(db.match_for_pair(&a, &b).unwrap().unwrap().id, record.id);
    assert_eq!(db.count_swipes_by(&b).unwrap(), 1);
}

#[tokio::test]
async fn test_repeated_pass_does_not_match() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();

    ada.matches().swipe(b, a, SwipeAction::Like).await.unwrap();
    ada.matches().swipe(a, b, SwipeAction::Pass).await.unwrap();
    let again = ada.matches().swipe(a, b, SwipeAction::Like).await.unwrap();

    assert_eq!(again.reason, Some(SwipeRejection::AlreadySwiped));
    assert!(!again.matched);
    assert!(world.db.lock().unwrap().match_for_pair(&a, &b).unwrap().is_none());
}

#[tokio::test]
async fn test_second_swipe_is_already_swiped() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();

    assert!(ada.matches().swipe(a, b, SwipeAction::Like).await.unwrap().accepted);
    let again = ada.matches().swipe(a, b, SwipeAction::Pass).await.unwrap();

    assert!(!again.accepted);
    assert_eq!(again.reason, Some(SwipeRejection::AlreadySwiped));
    assert_eq!(world.db.lock().unwrap().count_swipes_by(&a).unwrap(), 1);
}

#[tokio::test]
async fn test_retry_gaps_follow_backoff() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let queue = ada.chat().queue();

    let message = Message::new(a, b, "retry me", MessageKind::Text, serde_json::Value::Null);
    let t0 = Utc::now();
    queue.enqueue_at(&message, t0).unwrap();

    for failures in 1..=4u32 {
        queue.mark_failed(message.id, t0).unwrap();
        let gap = chrono::Duration::from_std(backoff_delay(failures)).unwrap();
        assert_eq!(gap.num_milliseconds(), 1000 * 2i64.pow(failures));

        let early = queue.list_retryable(t0 + gap - chrono::Duration::milliseconds(1)).unwrap();
        assert!(early.is_empty(), "due too early after {failures} failures");
        assert_eq!(queue.list_retryable(t0 + gap).unwrap().len(), 1);
    }
    assert_eq!(backoff_delay(5), Duration::from_millis(30_000));
}

#[tokio::test]
async fn test_evicted_entries_are_never_sent() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let queue = ada.chat().queue();

    let stale = Message::new(a, b, "old", MessageKind::Text, serde_json::Value::Null);
    queue
        .enqueue_at(&stale, Utc::now() - chrono::Duration::hours(25))
        .unwrap();

    let exhausted = Message::new(a, b, "tired", MessageKind::Text, serde_json::Value::Null);
    queue.enqueue(&exhausted).unwrap();
    for _ in 0..5 {
        queue
            .mark_failed(exhausted.id, Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
    }

    let report = ada.chat().retry_pending().await;
    assert_eq!(report.attempted, 0);
    assert!(queue.is_empty().unwrap());

    let db = world.db.lock().unwrap();
    assert!(db.get_message_by_id(stale.id).is_err());
    assert!(db.get_message_by_id(exhausted.id).is_err());
}

#[tokio::test]
async fn test_send_while_disconnected_is_delivered_once() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    ada.start(a).await;

    let (callback, lists) = collector::<Vec<Message>>();
    ada.chat().subscribe(a, b, callback).await;

    world.hub.set_connected(false);
    let outcome = ada.chat().send_text(a, b, "offline hello").await.unwrap();
    let SendOutcome::Queued(message) = outcome else {
        panic!("expected the send to be queued");
    };
    settle().await;
    {
        let lists = lists.lock().unwrap();
        let pending = lists.last().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, message.id);
        assert_eq!(pending[0].delivery_status, DeliveryStatus::Pending);
    }

    world.hub.set_connected(true);
    let queue = ada.chat().queue().clone();
    assert!(wait_until(|| queue.is_empty().unwrap()).await);
    settle().await;

    let conversation = world.db.lock().unwrap().conversation(&a, &b).unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].id, message.id);

    let lists = lists.lock().unwrap();
    let last = lists.last().unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].delivery_status, DeliveryStatus::Sent);

    drop(lists);
    ada.shutdown().await;
}

#[tokio::test]
async fn test_swipe_burst_hits_rate_limit_without_store_write() {
    let world = World::new();
    let a = world.user("Ada");
    let config = CoreConfig {
        daily_swipe_limit: 500,
        ..CoreConfig::default()
    };
    let ada = world.client_with(config, Arc::new(DisabledAi));

    for i in 0..100 {
        let outcome = ada
            .matches()
            .swipe(a, UserId::new(), SwipeAction::Pass)
            .await
            .unwrap();
        assert!(outcome.accepted, "swipe {i} rejected: {:?}", outcome.reason);
    }

    let last = ada
        .matches()
        .swipe(a, UserId::new(), SwipeAction::Pass)
        .await
        .unwrap();
    assert_eq!(last.reason, Some(SwipeRejection::RateLimited));
    assert_eq!(world.db.lock().unwrap().count_swipes_by(&a).unwrap(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_typing_clears_itself() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let bo = world.client();
    ada.presence().initialize(a).await;
    bo.presence().initialize(b).await;

    let (callback, seen) = collector::<bool>();
    bo.presence().subscribe_typing(a, callback).await.unwrap();

    ada.presence().send_typing(b, true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock().unwrap(), vec![true]);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_typing_refresh_extends_indicator() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let bo = world.client();
    ada.presence().initialize(a).await;
    bo.presence().initialize(b).await;

    let (callback, seen) = collector::<bool>();
    bo.presence().subscribe_typing(a, callback).await.unwrap();

    ada.presence().send_typing(b, true).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    ada.presence().send_typing(b, true).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(*seen.lock().unwrap(), vec![true]);

    ada.presence().send_typing(b, false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn test_match_carries_ai_insight() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ai = Arc::new(ScriptedAi(
        r#"{"score": 91, "reason": "Both train at dawn", "key_factors": ["schedule"]}"#.into(),
    ));
    let ada = world.client_with(CoreConfig::default(), ai.clone());
    let bo = world.client_with(CoreConfig::default(), ai);

    let (callback, lists) = collector::<Vec<MatchWithPartner>>();
    ada.matches().subscribe(a, callback).await;

    ada.matches().swipe(a, b, SwipeAction::Like).await.unwrap();
    let outcome = bo.matches().swipe(b, a, SwipeAction::Like).await.unwrap();
    let record = outcome.match_record.unwrap();
    assert_eq!(record.compatibility_score, 91);
    assert_eq!(record.key_factors, vec!["schedule"]);
    settle().await;

    {
        let lists = lists.lock().unwrap();
        let current = lists.last().unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].partner.id, b);
    }

    bo.matches().unmatch(record.id).await.unwrap();
    bo.matches().unmatch(record.id).await.unwrap();
    settle().await;
    assert!(lists.lock().unwrap().last().unwrap().is_empty());
}

#[tokio::test]
async fn test_two_tabs_see_each_message_once() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let bo = world.client();
    ada.start(a).await;
    bo.start(b).await;

    let (echo_callback, echoed) = collector::<Message>();
    bo.echo().on_message(echo_callback);
    let (ada_callback, ada_lists) = collector::<Vec<Message>>();
    let (bo_callback, bo_lists) = collector::<Vec<Message>>();
    ada.chat().subscribe(a, b, ada_callback).await;
    bo.chat().subscribe(b, a, bo_callback).await;
    settle().await;

    let SendOutcome::Sent(message) = ada.chat().send_text(a, b, "hi").await.unwrap() else {
        panic!("expected the send to reach the store");
    };
    settle().await;

    assert_eq!(echoed.lock().unwrap().len(), 1);
    for lists in [&ada_lists, &bo_lists] {
        let lists = lists.lock().unwrap();
        for list in lists.iter() {
            assert!(list.iter().filter(|m| m.id == message.id).count() <= 1);
        }
        let last = lists.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, message.id);
    }

    ada.shutdown().await;
    bo.shutdown().await;
}

#[tokio::test]
async fn test_echo_reaches_other_tab_while_offline() {
    let world = World::new();
    let (a, b) = (world.user("Ada"), world.user("Bo"));
    let ada = world.client();
    let bo = world.client();
    ada.start(a).await;
    bo.start(b).await;

    let (callback, lists) = collector::<Vec<Message>>();
    bo.chat().subscribe(b, a, callback).await;
    settle().await;

    world.hub.set_connected(false);
    let SendOutcome::Queued(message) = ada.chat().send_text(a, b, "over the bus").await.unwrap() else {
        panic!("expected the send to be queued");
    };
    settle().await;
    {
        let lists = lists.lock().unwrap();
        let last = lists.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, message.id);
        assert_eq!(last[0].delivery_status, DeliveryStatus::Sent);
    }

    world.hub.set_connected(true);
    let queue = ada.chat().queue().clone();
    assert!(wait_until(|| queue.is_empty().unwrap()).await);
    settle().await;

    let lists = lists.lock().unwrap();
    for list in lists.iter() {
        assert!(list.iter().filter(|m| m.id == message.id).count() <= 1);
    }
    assert_eq!(lists.last().unwrap().len(), 1);

    drop(lists);
    ada.shutdown().await;
    bo.shutdown().await;
}
