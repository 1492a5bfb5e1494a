use super::*;

use chrono::TimeZone;
use serde_json::json;
use shared::{domain::MessageId, protocol::SendMessageRequest};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

fn store() -> MessageStore {
    MessageStore::new(UserId::from("me"), Duration::from_secs(8))
}

fn server_message(id: &str, thread: &str, sender: &str, content: &str, seconds: i64) -> Message {
    Message {
        id: Some(MessageId::from(id)),
        local_id: None,
        thread_id: ThreadId::from(thread),
        sender_id: UserId::from(sender),
        content: content.into(),
        attachments: Vec::new(),
        created_at: at(seconds),
        status: MessageStatus::Sent,
        reply_to_id: None,
    }
}

fn optimistic(local_id: &str, thread: &str, content: &str, seconds: i64) -> Message {
    Message {
        id: None,
        local_id: Some(LocalId::from(local_id)),
        thread_id: ThreadId::from(thread),
        sender_id: UserId::from("me"),
        content: content.into(),
        attachments: Vec::new(),
        created_at: at(seconds),
        status: MessageStatus::Pending,
        reply_to_id: None,
    }
}

fn assert_invariants(store: &MessageStore, thread: &ThreadId) {
    let messages = store.messages(thread);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));
    let mut ids: Vec<_> = messages.iter().filter_map(|m| m.id.clone()).collect();
    let id_count = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), id_count, "duplicate server ids");
    let mut local_ids: Vec<_> = messages.iter().filter_map(|m| m.local_id.clone()).collect();
    let local_count = local_ids.len();
    local_ids.sort();
    local_ids.dedup();
    assert_eq!(local_ids.len(), local_count, "duplicate local ids");
}

#[test]
fn out_of_order_arrivals_are_kept_sorted() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    for (id, seconds) in [("M3", 30), ("M1", 10), ("M4", 40), ("M2", 20)] {
        let outcome = store.insert(
            server_message(id, "T1", "peer", id, seconds),
            InsertSource::Live,
        );
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
    }
    let order: Vec<_> = store
        .messages(&thread)
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(order, ["M1", "M2", "M3", "M4"]);
    assert_eq!(
        store
            .thread(&thread)
            .and_then(|t| t.last_message)
            .map(|m| m.content),
        Some("M4".to_string())
    );
    assert_invariants(&store, &thread);
}

#[test]
fn equal_timestamps_keep_arrival_order() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.insert(server_message("M1", "T1", "a", "first", 5), InsertSource::Live);
    store.insert(server_message("M2", "T1", "b", "second", 5), InsertSource::Live);
    store.insert(server_message("M3", "T1", "c", "third", 5), InsertSource::Live);
    let order: Vec<_> = store
        .messages(&thread)
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(order, ["first", "second", "third"]);
}

#[test]
fn same_server_id_from_two_paths_is_stored_once() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    let pushed = server_message("M9", "T1", "peer", "hey", 1);
    assert!(matches!(
        store.insert(pushed.clone(), InsertSource::Live),
        InsertOutcome::Inserted(_)
    ));
    assert_eq!(
        store.insert(pushed, InsertSource::History),
        InsertOutcome::Duplicate(DuplicateReason::SameId)
    );
    assert_eq!(store.messages(&thread).len(), 1);
}

#[test]
fn repeated_local_id_is_rejected() {
    let mut store = store();
    store.create_optimistic(optimistic("L1", "T1", "hello", 1));
    assert_eq!(
        store.create_optimistic(optimistic("L1", "T1", "hello again", 2)),
        InsertOutcome::Duplicate(DuplicateReason::SameLocalId)
    );
}

#[test]
fn confirmation_replaces_placeholder_in_place() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.create_optimistic(optimistic("L1", "T1", "hello", 1));

    let mut echo = server_message("M1", "T1", "me", "hello", 2);
    echo.local_id = Some(LocalId::from("L1"));
    let outcome = store.insert(echo, InsertSource::Live);
    let confirmed = match outcome {
        InsertOutcome::Confirmed(message) => message,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(confirmed.id, Some(MessageId::from("M1")));
    assert_eq!(confirmed.status, MessageStatus::Sent);

    let stored = store.messages(&thread);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].local_id, Some(LocalId::from("L1")));
    assert_invariants(&store, &thread);
}

#[test]
fn cross_matched_ids_count_as_confirmation() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.create_optimistic(optimistic("tmp-7", "T1", "draft", 1));

    // Some peers echo the client token back as the message id.
    let echo = server_message("tmp-7", "T1", "me", "draft", 1);
    assert!(matches!(
        store.insert(echo, InsertSource::Live),
        InsertOutcome::Confirmed(_)
    ));
    assert_eq!(store.messages(&thread).len(), 1);
}

#[test]
fn content_window_rejects_uncorrelated_echo() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.create_optimistic(optimistic("L1", "T1", "on my way", 10));

    let echo = server_message("M5", "T1", "me", "on my way", 13);
    assert_eq!(
        store.insert(echo, InsertSource::Live),
        InsertOutcome::Duplicate(DuplicateReason::ContentWindow)
    );

    let later = server_message("M6", "T1", "me", "on my way", 30);
    assert!(matches!(
        store.insert(later, InsertSource::Live),
        InsertOutcome::Inserted(_)
    ));
    assert_eq!(store.messages(&thread).len(), 2);
}

#[test]
fn user_may_send_the_same_text_twice() {
    let mut store = store();
    store.create_optimistic(optimistic("L1", "T1", "ok", 1));
    assert!(matches!(
        store.create_optimistic(optimistic("L2", "T1", "ok", 2)),
        InsertOutcome::Inserted(_)
    ));
    assert_eq!(store.messages(&ThreadId::from("T1")).len(), 2);
}

#[test]
fn reconcile_success_yields_single_sent_message() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    let local_id = LocalId::from("L1");
    store.create_optimistic(optimistic("L1", "T1", "hello", 1));

    let ack = server_message("M1", "T1", "me", "hello", 2);
    let outcome = store.reconcile(&thread, &local_id, Ok(ack));
    let confirmed = match outcome {
        ReconcileOutcome::Confirmed(message) => message,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(confirmed.id, Some(MessageId::from("M1")));
    assert_eq!(confirmed.local_id, Some(local_id));

    let stored = store.messages(&thread);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "hello");
    assert_eq!(stored[0].status, MessageStatus::Sent);
}

#[test]
fn reconcile_after_push_copy_keeps_one_entry() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.create_optimistic(optimistic("L1", "T1", "hello", 1));

    // Push copy without the local id arrives outside the content window.
    store.insert(server_message("M1", "T1", "me", "hello", 20), InsertSource::Live);
    assert_eq!(store.messages(&thread).len(), 2);

    let outcome = store.reconcile(
        &thread,
        &LocalId::from("L1"),
        Ok(server_message("M1", "T1", "me", "hello", 20)),
    );
    assert!(matches!(outcome, ReconcileOutcome::Confirmed(_)));
    let stored = store.messages(&thread);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].local_id, Some(LocalId::from("L1")));
    assert_invariants(&store, &thread);
}

#[test]
fn reconcile_failure_removes_placeholder() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.create_optimistic(optimistic("L1", "T1", "hello", 1));

    let outcome = store.reconcile(&thread, &LocalId::from("L1"), Err("refused".into()));
    match outcome {
        ReconcileOutcome::Failed(message) => assert_eq!(message.status, MessageStatus::Failed),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(store.messages(&thread).is_empty());
    assert_eq!(store.thread(&thread).and_then(|t| t.last_message), None);
    assert_eq!(
        store.reconcile(&thread, &LocalId::from("L1"), Err("again".into())),
        ReconcileOutcome::Unknown
    );
}

#[test]
fn late_failure_keeps_message_confirmed_by_push() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.create_optimistic(optimistic("L1", "T1", "hello", 1));
    let mut echo = server_message("M1", "T1", "me", "hello", 1);
    echo.local_id = Some(LocalId::from("L1"));
    assert!(matches!(
        store.insert(echo, InsertSource::Live),
        InsertOutcome::Confirmed(_)
    ));

    assert_eq!(
        store.reconcile(&thread, &LocalId::from("L1"), Err("ack timed out".into())),
        ReconcileOutcome::Unknown
    );
    let stored = store.messages(&thread);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::Sent);
}

#[test]
fn live_messages_from_peers_bump_unread() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    store.insert(server_message("M1", "T1", "peer", "one", 1), InsertSource::Live);
    store.insert(server_message("M2", "T1", "peer", "two", 2), InsertSource::Live);
    store.insert(server_message("M3", "T1", "peer", "three", 3), InsertSource::History);
    store.create_optimistic(optimistic("L1", "T1", "reply", 4));

    let snapshot = store.thread(&thread).expect("thread");
    assert_eq!(snapshot.unread_for(&UserId::from("me")), 2);
    assert_eq!(snapshot.unread_for(&UserId::from("peer")), 0);
    assert!(snapshot.participants.contains(&UserId::from("peer")));

    store.mark_read(&thread, &UserId::from("me"));
    assert_eq!(
        store.thread(&thread).expect("thread").unread_for(&UserId::from("me")),
        0
    );
}

#[test]
fn merge_batch_skips_known_and_foreign_messages() {
    let mut store = store();
    let thread = ThreadId::from("T2");
    for (id, seconds) in [("M1", 1), ("M2", 2), ("M3", 3)] {
        store.insert(server_message(id, "T2", "peer", id, seconds), InsertSource::Live);
    }

    let batch = vec![
        server_message("M2", "T2", "peer", "M2", 2),
        server_message("M3", "T2", "peer", "M3", 3),
        server_message("M4", "T2", "peer", "during outage", 50),
        server_message("X1", "T9", "peer", "elsewhere", 51),
    ];
    let accepted = store.merge_batch(&thread, batch);
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].content, "during outage");
    assert_eq!(store.messages(&thread).len(), 4);
    assert!(store.messages(&ThreadId::from("T9")).is_empty());
    assert_invariants(&store, &thread);
}

#[test]
fn ingest_reports_malformed_payloads() {
    let mut store = store();
    let err = store
        .ingest(&json!({ "content": "orphan" }), at(0))
        .expect_err("missing thread");
    assert_eq!(err, MalformedPayloadError::MissingThread);
    assert!(store.thread_ids().is_empty());

    let outcome = store
        .ingest(
            &json!({ "id": "M1", "threadId": "T1", "sender": { "_id": "peer" }, "content": "hi" }),
            at(0),
        )
        .expect("valid payload");
    assert!(matches!(outcome, InsertOutcome::Inserted(_)));
}

#[test]
fn restore_pending_rebuilds_queued_placeholders() {
    let mut store = store();
    let entry = OutboundQueueEntry::new(SendMessageRequest {
        thread_id: ThreadId::from("T1"),
        local_id: LocalId::generate(),
        content: "queued".into(),
        attachments: Vec::new(),
        reply_to_id: None,
    });
    assert_eq!(store.restore_pending(&[entry.clone()]), 1);
    assert_eq!(store.restore_pending(&[entry.clone()]), 0);
    let stored = store.messages(&ThreadId::from("T1"));
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_pending());
    assert_eq!(stored[0].local_id.as_ref(), Some(entry.local_id()));
    assert_eq!(stored[0].created_at, entry.enqueued_at);
}

#[test]
fn arbitrary_insert_and_reconcile_sequences_hold_invariants() {
    let mut store = store();
    let thread = ThreadId::from("T1");
    let mut seed: u64 = 0x5eed;
    for step in 0..200 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let pick = (seed >> 33) % 40;
        let seconds = ((seed >> 17) % 120) as i64;
        if step % 5 == 4 {
            let local_id = LocalId::new(format!("L{pick}"));
            let result = if (seed >> 7) % 3 == 0 {
                Err("refused".to_string())
            } else {
                Ok(server_message(
                    &format!("M{pick}"),
                    "T1",
                    "me",
                    &format!("text {pick}"),
                    seconds,
                ))
            };
            store.reconcile(&thread, &local_id, result);
            assert_invariants(&store, &thread);
            continue;
        }
        let message = if step % 3 == 0 {
            optimistic(&format!("L{pick}"), "T1", &format!("text {pick}"), seconds)
        } else {
            let mut message = server_message(
                &format!("M{pick}"),
                "T1",
                if pick % 2 == 0 { "me" } else { "peer" },
                &format!("text {pick}"),
                seconds,
            );
            if pick % 4 == 0 {
                message.local_id = Some(LocalId::new(format!("L{pick}")));
            }
            message
        };
        let source = if message.id.is_none() {
            InsertSource::Optimistic
        } else {
            InsertSource::Live
        };
        store.insert(message, source);
        assert_invariants(&store, &thread);
    }
}
