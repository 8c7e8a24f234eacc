//! Integration tests for the chat engine against the dev server.
//!
//! Drives two or three logged-in clients through roster load, direct
//! messages, read receipts, broadcasts, and background refresh across an
//! access-credential expiry.
//!
//! Verification command: `cargo test --test chat_sync`

use std::sync::Arc;
use std::time::Duration;

use casedesk::chat::{ChatError, ChatSync, Sender, SyncConfig};
use casedesk::session::SessionTransport;
use casedesk::session::credentials::MemoryCredentialStore;
use casedesk::transport::http::ReqwestBackend;
use casedesk_devserver::routes::start_server_with_state;
use casedesk_devserver::state::DevState;
use casedesk_proto::ids::UserId;
use casedesk_proto::message::{BroadcastScope, MessageStatus};
use casedesk_proto::user::Role;

// =============================================================================
// Test helpers
// =============================================================================

type Engine = ChatSync<ReqwestBackend, MemoryCredentialStore>;

const ADMIN: UserId = UserId::new(1);
const INVESTIGATOR: UserId = UserId::new(2);
const VICTIM: UserId = UserId::new(3);

async fn start_server() -> (Arc<DevState>, String) {
    let state = Arc::new(DevState::default());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (state, format!("http://{addr}/api"))
}

/// Log in as the given demo account and return a chat engine with its
/// roster loaded.
async fn client(base: &str, account: &str) -> Engine {
    let backend = ReqwestBackend::new(base, Duration::from_secs(5)).unwrap();
    let (session, _events) =
        SessionTransport::new(backend, MemoryCredentialStore::new(), 16).unwrap();
    session
        .login(&format!("{account}@casedesk.test"), &format!("{account}-pass"))
        .await
        .unwrap();
    let (engine, _events) = ChatSync::for_session(Arc::new(session), SyncConfig::default()).unwrap();
    engine.load_roster().await.unwrap();
    engine
}

fn ids(engine: &Engine, peer: UserId) -> Vec<u64> {
    engine
        .conversation(peer)
        .map(|c| c.messages().iter().map(|m| m.id.get()).collect())
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn message_round_trip_with_read_receipt() {
    let (state, base) = start_server().await;
    let victim = client(&base, "victim").await;
    let investigator = client(&base, "investigator").await;

    let sent = victim
        .send_message(INVESTIGATOR, "my bike was stolen")
        .await
        .unwrap();
    assert_eq!(sent.sender, Sender::Me);
    assert_eq!(sent.status, MessageStatus::Sent);
    assert!(sent.is_pending());

    let report = investigator.sync_conversation(VICTIM).await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.receipts_dispatched, 1);
    investigator.flush_read_receipts().await;
    assert_eq!(state.mark_read_calls(), 1);
    assert!(state.message(sent.id).unwrap().read);

    let conv = investigator.conversation(VICTIM).unwrap();
    assert_eq!(conv.messages()[0].sender, Sender::Them);
    assert_eq!(conv.messages()[0].status, MessageStatus::Read);

    // Server now reports read; no second receipt.
    let report = investigator.sync_conversation(VICTIM).await.unwrap();
    assert_eq!(report.receipts_dispatched, 0);
    investigator.flush_read_receipts().await;
    assert_eq!(state.mark_read_calls(), 1);

    // The sender sees the read status once it syncs.
    victim.sync_conversation(INVESTIGATOR).await.unwrap();
    let conv = victim.conversation(INVESTIGATOR).unwrap();
    assert_eq!(conv.messages()[0].status, MessageStatus::Read);
    assert!(!conv.messages()[0].is_pending());
}

#[tokio::test]
async fn sent_messages_interleave_in_order() {
    let (state, base) = start_server().await;
    let admin = client(&base, "admin").await;

    let first = state.inject_message(VICTIM, ADMIN, "first");
    admin.sync_conversation(VICTIM).await.unwrap();
    let mine = admin.send_message(VICTIM, "second").await.unwrap();
    let third = state.inject_message(VICTIM, ADMIN, "third");

    assert_eq!(ids(&admin, VICTIM), vec![first.id.get(), mine.id.get()]);
    admin.sync_conversation(VICTIM).await.unwrap();
    assert_eq!(
        ids(&admin, VICTIM),
        vec![first.id.get(), mine.id.get(), third.id.get()]
    );
    admin.flush_read_receipts().await;
}

#[tokio::test]
async fn broadcast_reaches_scope_and_stays_out_of_sender_cache() {
    let (_state, base) = start_server().await;
    let admin = client(&base, "admin").await;
    let victim = client(&base, "victim").await;
    let investigator = client(&base, "investigator").await;

    let raw = admin
        .send_broadcast("station closed tomorrow", BroadcastScope::Victims)
        .await
        .unwrap();
    assert!(raw.is_broadcast);
    assert!(admin.summaries().iter().all(|s| s.last_message.is_none()));

    victim.sync_conversation(ADMIN).await.unwrap();
    let conv = victim.conversation(ADMIN).unwrap();
    assert_eq!(conv.messages().len(), 1);
    assert!(conv.messages()[0].is_broadcast);
    victim.flush_read_receipts().await;

    investigator.sync_conversation(ADMIN).await.unwrap();
    assert!(ids(&investigator, ADMIN).is_empty());
}

#[tokio::test]
async fn broadcast_is_refused_for_non_admin() {
    let (_state, base) = start_server().await;
    let investigator = client(&base, "investigator").await;

    let err = investigator
        .send_broadcast("hello", BroadcastScope::All)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::BroadcastNotPermitted(Role::Investigator)));
}

#[tokio::test]
async fn background_refresh_survives_access_expiry_with_one_refresh() {
    let (state, base) = start_server().await;
    let admin = client(&base, "admin").await;
    state.inject_message(INVESTIGATOR, ADMIN, "update on case 12");
    state.inject_message(VICTIM, ADMIN, "any news?");
    state.expire_access_tokens();

    let summary = admin.load_all_conversations().await;
    assert!(summary.failed.is_empty());
    assert_eq!(summary.synced.len(), 2);
    assert_eq!(state.refresh_calls(), 1);

    let unread: usize = admin.summaries().iter().map(|s| s.unread).sum();
    assert_eq!(unread, 2);
}

#[tokio::test]
async fn inbox_builds_conversations_per_counterpart() {
    let (state, base) = start_server().await;
    let investigator = client(&base, "investigator").await;
    state.inject_message(VICTIM, INVESTIGATOR, "hello");
    state.inject_message(INVESTIGATOR, ADMIN, "report filed");

    let touched = investigator.load_inbox().await.unwrap();
    assert_eq!(touched, vec![ADMIN, VICTIM]);
    assert_eq!(ids(&investigator, VICTIM).len(), 1);
    let conv = investigator.conversation(ADMIN).unwrap();
    assert_eq!(conv.messages()[0].sender, Sender::Me);
}
