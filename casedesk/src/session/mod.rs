//! Authenticated session transport.
//!
//! [`SessionTransport`] wraps every API call: it attaches the current
//! access credential, and when the server answers 401 it obtains a fresh
//! credential through a single-flight refresh and replays the call once.
//! Callers see either the final response or a terminal error, never an
//! intermediate 401.
//!
//! # Refresh protocol
//!
//! 1. While a refresh is in flight, every other caller that hits a 401
//!    queues behind it (FIFO) and replays with whatever it produced.
//! 2. Otherwise the caller becomes the leader: it checks the stored
//!    refresh credential (missing or expired fails immediately), calls
//!    `POST /auth/refresh/`, stores the new access credential and releases
//!    the queue.
//! 3. On failure the queue is rejected, the credentials are cleared, and a
//!    [`SessionEvent::Terminated`] is emitted.
//! 4. If the session was logged out while the refresh was in flight, its
//!    result is discarded and the queue is rejected with
//!    [`RefreshFailure::LoggedOut`]; nothing is written back to storage.
//!
//! Only 401 triggers this. 403 and 404 are surfaced unchanged, and a
//! replayed request that is still unauthorized is an error, not another
//! refresh cycle.

pub mod credentials;
pub mod refresh;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use casedesk_proto::auth::{
    Claims, ClaimsError, LoginRequest, RefreshRequest, RefreshResponse, TokenPair, decode_claims,
};
use casedesk_proto::ids::UserId;

use crate::transport::{ApiRequest, ApiResponse, HttpBackend, Method, TransportError};

use credentials::{CredentialPair, CredentialStore, CredentialStoreError};
use refresh::{Admission, LeaderGuard, RefreshFailure, RefreshOutcome, SessionState};

/// Path of the credential refresh endpoint.
pub const REFRESH_PATH: &str = "/auth/refresh/";

/// Path of the login endpoint.
pub const LOGIN_PATH: &str = "/auth/login/";

/// Errors surfaced to callers of [`SessionTransport::request`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The request was still unauthorized after one refresh-and-replay.
    #[error("unauthorized")]
    Unauthorized,

    /// The server refused the request (403). Never retried.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource does not exist (404). Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The session could not be refreshed; credentials have been cleared.
    #[error("session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Reading or writing stored credentials failed.
    #[error("credential storage: {0}")]
    Storage(#[from] CredentialStoreError),

    /// No credentials are stored.
    #[error("not logged in")]
    NotLoggedIn,

    /// The access credential's payload could not be decoded.
    #[error("invalid session token: {0}")]
    Claims(#[from] ClaimsError),
}

/// Session lifecycle notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Credentials were stored by a successful login.
    LoggedIn {
        /// The authenticated user.
        user: Option<UserId>,
    },
    /// Credentials were cleared on request.
    LoggedOut,
    /// A refresh failed; credentials were cleared and every queued request
    /// rejected. The UI should send the user back to the login view.
    Terminated {
        /// Why the refresh failed.
        reason: RefreshFailure,
    },
}

/// Wraps an [`HttpBackend`] with bearer authentication and single-flight
/// credential refresh.
///
/// One instance owns the process's credential pair; share it (usually via
/// `Arc`) with every component that talks to the API.
pub struct SessionTransport<B: HttpBackend, S: CredentialStore> {
    /// Performs the raw HTTP exchanges.
    backend: B,
    /// Durable copy of the credential pair.
    store: S,
    /// In-memory credentials and refresh bookkeeping.
    state: Mutex<SessionState>,
    /// Channel for session lifecycle events.
    event_tx: mpsc::Sender<SessionEvent>,
}

impl<B: HttpBackend, S: CredentialStore> SessionTransport<B, S> {
    /// Creates a session over `backend`, restoring credentials from `store`.
    ///
    /// Returns the session and a receiver for [`SessionEvent`]s.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError`] if the stored credentials cannot be
    /// read.
    pub fn new(
        backend: B,
        store: S,
        event_buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), CredentialStoreError> {
        let restored = store.load()?;
        let (event_tx, event_rx) = mpsc::channel(event_buffer);
        let session = Self {
            backend,
            store,
            state: Mutex::new(SessionState::new(restored)),
            event_tx,
        };
        Ok((session, event_rx))
    }

    /// Returns a reference to the underlying backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether credentials are currently held.
    pub fn is_logged_in(&self) -> bool {
        self.state.lock().credentials().is_some()
    }

    /// The current access credential, if any.
    pub fn access_token(&self) -> Option<String> {
        self.state.lock().access()
    }

    /// The current credential pair, if any.
    pub fn credentials(&self) -> Option<CredentialPair> {
        self.state.lock().credentials().cloned()
    }

    /// Whether a refresh is in flight right now.
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().is_refreshing()
    }

    /// Number of callers queued behind the in-flight refresh.
    pub fn queued_requests(&self) -> usize {
        self.state.lock().queued()
    }

    /// Decode the claims of the current access credential.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotLoggedIn`] without credentials, or
    /// [`SessionError::Claims`] if the token payload is unreadable.
    pub fn claims(&self) -> Result<Claims, SessionError> {
        let token = self.access_token().ok_or(SessionError::NotLoggedIn)?;
        Ok(decode_claims(&token)?)
    }

    /// Authenticate with email and password and store the issued pair.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the server rejects the credentials or
    /// the pair cannot be stored.
    pub async fn login(&self, email: &str, password: &str) -> Result<Claims, SessionError> {
        let request = ApiRequest::post(LOGIN_PATH).json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;
        let response = self.backend.execute(request).await?;
        if response.status == 401 {
            return Err(SessionError::Unauthorized);
        }
        let pair: TokenPair = classify(LOGIN_PATH, response)?.json()?;
        let claims = decode_claims(&pair.access)?;

        let pair = CredentialPair::new(pair.access, pair.refresh);
        self.store.save(&pair)?;
        self.state.lock().set_credentials(Some(pair));

        tracing::info!(user = %claims.user_id, "logged in");
        let _ = self.event_tx.try_send(SessionEvent::LoggedIn {
            user: Some(claims.user_id),
        });
        Ok(claims)
    }

    /// Destroy the stored credentials.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if the durable copy cannot be
    /// removed. The in-memory copy is cleared regardless.
    pub fn logout(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            state.set_credentials(None);
            self.store.clear()?;
        }
        tracing::info!("logged out");
        let _ = self.event_tx.try_send(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Perform an authenticated request.
    ///
    /// Attaches the current access credential. On 401, obtains a fresh
    /// credential (sharing any refresh already in flight) and replays the
    /// request exactly once.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Forbidden`] / [`SessionError::NotFound`] /
    ///   [`SessionError::Status`] for non-success statuses (never retried)
    /// - [`SessionError::RefreshFailed`] if the credential could not be
    ///   refreshed (the session is over)
    /// - [`SessionError::Unauthorized`] if the replay is still rejected
    /// - [`SessionError::Transport`] if no response was received
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let token = self.access_token();
        let response = self.send_with(request.clone(), token.clone()).await?;
        if response.status != 401 {
            return classify(&request.path, response);
        }

        tracing::debug!(
            request_id = %request.request_id,
            path = %request.path,
            "unauthorized, obtaining fresh credential"
        );
        let fresh = self.fresh_access(token.as_deref()).await?;

        let replay = self.send_with(request.clone(), Some(fresh)).await?;
        if replay.status == 401 {
            tracing::warn!(
                request_id = %request.request_id,
                path = %request.path,
                "still unauthorized after refresh, giving up"
            );
            return Err(SessionError::Unauthorized);
        }
        classify(&request.path, replay)
    }

    /// `GET` a path and decode the JSON response.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); also [`SessionError::Decode`].
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, SessionError> {
        Ok(self.request(request).await?.json()?)
    }

    /// Send `body` with `method` to `path` and decode the JSON response.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); also [`SessionError::Decode`].
    pub async fn send_json<Q: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Q,
    ) -> Result<T, SessionError> {
        let request = ApiRequest::new(method, path).json(body)?;
        Ok(self.request(request).await?.json()?)
    }

    async fn send_with(
        &self,
        mut request: ApiRequest,
        bearer: Option<String>,
    ) -> Result<ApiResponse, TransportError> {
        request.bearer = bearer;
        self.backend.execute(request).await
    }

    /// Obtain an access credential newer than `stale`, refreshing at most
    /// once process-wide.
    async fn fresh_access(&self, stale: Option<&str>) -> Result<String, SessionError> {
        let admission = self.state.lock().admit(stale);
        match admission {
            Admission::Current(access) => {
                tracing::debug!("credential already refreshed, replaying");
                Ok(access)
            }
            Admission::Wait(rx) => {
                tracing::debug!("refresh in flight, queued");
                let outcome = rx.await.unwrap_or(Err(RefreshFailure::Aborted));
                Ok(outcome?)
            }
            Admission::Lead(refresh) => {
                let guard = LeaderGuard::new(&self.state);
                let (outcome, rotated) = self.perform_refresh(refresh.as_deref()).await;
                let (outcome, released) =
                    guard.settle(outcome, rotated, refresh.as_deref(), &self.store);
                tracing::debug!(released, ok = outcome.is_ok(), "refresh settled");
                if let Err(failure) = &outcome {
                    self.terminate(failure);
                }
                Ok(outcome?)
            }
        }
    }

    /// Call the refresh endpoint. Returns the outcome and any rotated
    /// refresh credential.
    async fn perform_refresh(&self, refresh: Option<&str>) -> (RefreshOutcome, Option<String>) {
        let Some(refresh) = refresh else {
            return (Err(RefreshFailure::NoRefreshCredential), None);
        };
        if let Ok(claims) = decode_claims(refresh)
            && claims.is_expired()
        {
            return (Err(RefreshFailure::Expired), None);
        }

        tracing::info!("refreshing access credential");
        let request = match ApiRequest::post(REFRESH_PATH).json(&RefreshRequest {
            refresh: refresh.to_string(),
        }) {
            Ok(r) => r,
            Err(e) => return (Err(RefreshFailure::InvalidResponse(e.to_string())), None),
        };
        let response = match self.backend.execute(request).await {
            Ok(r) => r,
            Err(e) => return (Err(RefreshFailure::Transport(e)), None),
        };
        if !response.is_success() {
            return (
                Err(RefreshFailure::Rejected {
                    status: response.status,
                }),
                None,
            );
        }
        let body: RefreshResponse = match response.json() {
            Ok(b) => b,
            Err(e) => return (Err(RefreshFailure::InvalidResponse(e.to_string())), None),
        };

        (Ok(body.access), body.refresh)
    }

    /// Notify the UI after a refresh failure ended the session.
    fn terminate(&self, failure: &RefreshFailure) {
        if !failure.is_terminal() {
            return;
        }
        tracing::warn!(reason = %failure, "session terminated");
        let _ = self.event_tx.try_send(SessionEvent::Terminated {
            reason: failure.clone(),
        });
    }
}

/// Map a non-401 response to success or the matching error.
fn classify(path: &str, response: ApiResponse) -> Result<ApiResponse, SessionError> {
    match response.status {
        _ if response.is_success() => Ok(response),
        401 => Err(SessionError::Unauthorized),
        403 => Err(SessionError::Forbidden(response.text())),
        404 => Err(SessionError::NotFound(path.to_string())),
        status => Err(SessionError::Status {
            status,
            body: response.text(),
        }),
    }
}
