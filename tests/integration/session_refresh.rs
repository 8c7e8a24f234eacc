//! Integration tests for the session transport against the dev server.
//!
//! Covers login, single-flight refresh under concurrent 401s, terminal
//! refresh failure, and persistence of refreshed credentials.
//!
//! Verification command: `cargo test --test session_refresh`

use std::sync::Arc;
use std::time::Duration;

use casedesk::session::credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use casedesk::session::refresh::RefreshFailure;
use casedesk::session::{SessionError, SessionEvent, SessionTransport};
use casedesk::transport::http::ReqwestBackend;
use casedesk::transport::{ApiRequest, Method};
use casedesk_devserver::routes::start_server_with_state;
use casedesk_devserver::state::DevState;
use casedesk_proto::ids::UserId;
use casedesk_proto::message::{BroadcastScope, RawMessage, SendMessageRequest};
use casedesk_proto::user::Peer;
use tokio::sync::mpsc;

// =============================================================================
// Test helpers
// =============================================================================

const ROSTER: &str = "/chat/available-users/";

/// Starts a dev server on an OS-assigned port and returns its state and
/// API base URL.
async fn start_server() -> (Arc<DevState>, String) {
    let state = Arc::new(DevState::default());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (state, format!("http://{addr}/api"))
}

fn backend(base: &str) -> ReqwestBackend {
    ReqwestBackend::new(base, Duration::from_secs(5)).unwrap()
}

async fn logged_in<S: CredentialStore>(
    base: &str,
    store: S,
    email: &str,
    password: &str,
) -> (
    Arc<SessionTransport<ReqwestBackend, S>>,
    mpsc::Receiver<SessionEvent>,
) {
    let (session, events) = SessionTransport::new(backend(base), store, 16).unwrap();
    session.login(email, password).await.unwrap();
    (Arc::new(session), events)
}

async fn investigator(
    base: &str,
) -> (
    Arc<SessionTransport<ReqwestBackend, MemoryCredentialStore>>,
    mpsc::Receiver<SessionEvent>,
) {
    logged_in(
        base,
        MemoryCredentialStore::new(),
        "investigator@casedesk.test",
        "investigator-pass",
    )
    .await
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn login_yields_authenticated_requests() {
    let (_state, base) = start_server().await;
    let (session, mut events) = investigator(&base).await;

    assert_eq!(
        events.recv().await,
        Some(SessionEvent::LoggedIn {
            user: Some(UserId::new(2))
        })
    );
    let claims = session.claims().unwrap();
    assert_eq!(claims.user_id, UserId::new(2));

    let peers: Vec<Peer> = session.get_json(ApiRequest::get(ROSTER)).await.unwrap();
    let ids: Vec<u64> = peers.iter().map(|p| p.id.get()).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn wrong_password_is_rejected_without_refresh() {
    let (state, base) = start_server().await;
    let (session, _events) =
        SessionTransport::new(backend(&base), MemoryCredentialStore::new(), 4).unwrap();

    let err = session
        .login("investigator@casedesk.test", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Unauthorized));
    assert!(!session.is_logged_in());
    assert_eq!(state.refresh_calls(), 0);
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let (state, base) = start_server().await;
    let (session, _events) = investigator(&base).await;
    let before = session.access_token().unwrap();
    state.expire_access_tokens();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session
                .get_json::<Vec<Peer>>(ApiRequest::get(ROSTER))
                .await
        }));
    }
    for task in tasks {
        let peers = task.await.unwrap().unwrap();
        assert_eq!(peers.len(), 2);
    }

    assert_eq!(state.refresh_calls(), 1);
    assert_ne!(session.access_token().unwrap(), before);
    assert!(!session.is_refreshing());
    assert_eq!(session.queued_requests(), 0);
}

#[tokio::test]
async fn revoked_refresh_terminates_session() {
    let (state, base) = start_server().await;
    let (session, mut events) = investigator(&base).await;
    let _ = events.recv().await;
    state.expire_access_tokens();
    state.revoke_refresh_tokens();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session.request(ApiRequest::get(ROSTER)).await
        }));
    }
    // Requests whose 401 lands after the failed refresh settled find no
    // credential left; either way none of them reaches the server again.
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::RefreshFailed(
                RefreshFailure::Rejected { status: 401 } | RefreshFailure::NoRefreshCredential
            )
        ));
    }

    assert_eq!(state.refresh_calls(), 1);
    assert!(session.credentials().is_none());
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Terminated { .. })
    ));

    // Once terminated there is nothing left to refresh with.
    let err = session.request(ApiRequest::get(ROSTER)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::RefreshFailed(RefreshFailure::NoRefreshCredential)
    ));
    assert_eq!(state.refresh_calls(), 1);
}

#[tokio::test]
async fn forbidden_is_surfaced_without_refresh() {
    let (state, base) = start_server().await;
    let (session, _events) = logged_in(
        &base,
        MemoryCredentialStore::new(),
        "victim@casedesk.test",
        "victim-pass",
    )
    .await;

    let err = session
        .send_json::<_, RawMessage>(
            Method::Post,
            "/chat/messages/",
            &SendMessageRequest::broadcast(BroadcastScope::All, "not allowed"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Forbidden(_)));
    assert_eq!(state.refresh_calls(), 0);
}

#[tokio::test]
async fn not_found_is_surfaced_without_refresh() {
    let (state, base) = start_server().await;
    let (session, _events) = investigator(&base).await;

    let err = session
        .request(
            ApiRequest::patch("/chat/messages/999/")
                .json(&serde_json::json!({ "read": true }))
                .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    assert_eq!(state.refresh_calls(), 0);
}

#[tokio::test]
async fn refreshed_credential_is_persisted() {
    let (state, base) = start_server().await;
    let path = std::env::temp_dir()
        .join(format!("casedesk-integ-{}", uuid::Uuid::now_v7()))
        .join("session.json");
    let (session, _events) = logged_in(
        &base,
        FileCredentialStore::new(&path),
        "investigator@casedesk.test",
        "investigator-pass",
    )
    .await;
    state.expire_access_tokens();

    session.request(ApiRequest::get(ROSTER)).await.unwrap();

    let stored = FileCredentialStore::new(&path).load().unwrap().unwrap();
    assert_eq!(Some(stored.access), session.access_token());

    // A fresh process resumes the session from disk.
    let (resumed, _events) =
        SessionTransport::new(backend(&base), FileCredentialStore::new(&path), 4).unwrap();
    resumed.request(ApiRequest::get(ROSTER)).await.unwrap();
    assert_eq!(state.refresh_calls(), 1);

    resumed.logout().unwrap();
    assert!(FileCredentialStore::new(&path).load().unwrap().is_none());
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
