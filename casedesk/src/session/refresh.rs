//! Single-flight refresh bookkeeping.
//!
//! [`SessionState`] is the one mutable object behind the session: the
//! credential pair, the in-flight marker and the FIFO queue of waiters.
//! It is only ever touched under its mutex, and never across an `.await`.
//!
//! A caller that saw a 401 asks for [`admission`](SessionState::admit):
//! - `Current`: the credential it used is already stale; retry with the
//!   current one, no refresh needed
//! - `Wait`: a refresh is in flight; await its outcome
//! - `Lead`: it must perform the refresh and settle every waiter

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::transport::TransportError;

use super::credentials::{CredentialPair, CredentialStore};

/// Why a refresh could not produce a new access credential.
///
/// Cloneable so one outcome can be handed to every queued waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    /// No refresh credential is stored (never logged in, or logged out).
    #[error("no refresh credential stored")]
    NoRefreshCredential,

    /// The stored refresh credential's encoded expiry has passed.
    #[error("refresh credential expired")]
    Expired,

    /// The refresh endpoint answered with a non-success status.
    #[error("refresh rejected with status {status}")]
    Rejected {
        /// HTTP status returned by the refresh endpoint.
        status: u16,
    },

    /// The refresh endpoint could not be reached.
    #[error("refresh transport failure: {0}")]
    Transport(TransportError),

    /// The refresh endpoint answered 2xx with an unexpected body.
    #[error("refresh response invalid: {0}")]
    InvalidResponse(String),

    /// The task performing the refresh was cancelled before it settled.
    #[error("refresh aborted before completion")]
    Aborted,

    /// The credentials were cleared or replaced while the refresh was in
    /// flight; its result is discarded.
    #[error("session logged out during refresh")]
    LoggedOut,
}

impl RefreshFailure {
    /// Whether this failure ends the session (credentials are cleared).
    ///
    /// A cancelled refresh carries no verdict from the server, and a
    /// logged-out one has nothing left to clear.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Aborted | Self::LoggedOut)
    }
}

/// Result delivered to the refresh leader and every queued waiter.
pub type RefreshOutcome = Result<String, RefreshFailure>;

/// Outcome of asking to refresh after a 401.
pub(crate) enum Admission {
    /// Retry with this (already refreshed) access credential.
    Current(String),
    /// A refresh is in flight; its outcome arrives here.
    Wait(oneshot::Receiver<RefreshOutcome>),
    /// Perform the refresh with this refresh credential (if any).
    Lead(Option<String>),
}

/// Credentials plus single-flight refresh state.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    credentials: Option<CredentialPair>,
    refreshing: bool,
    waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

impl SessionState {
    pub(crate) fn new(credentials: Option<CredentialPair>) -> Self {
        Self {
            credentials,
            refreshing: false,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn access(&self) -> Option<String> {
        self.credentials.as_ref().map(|pair| pair.access.clone())
    }

    pub(crate) const fn credentials(&self) -> Option<&CredentialPair> {
        self.credentials.as_ref()
    }

    pub(crate) fn set_credentials(&mut self, pair: Option<CredentialPair>) {
        self.credentials = pair;
    }

    pub(crate) const fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    pub(crate) fn queued(&self) -> usize {
        self.waiters.len()
    }

    /// Decide how a caller whose request (sent with `stale`) got a 401
    /// obtains a usable credential.
    pub(crate) fn admit(&mut self, stale: Option<&str>) -> Admission {
        if self.refreshing {
            let (tx, rx) = oneshot::channel();
            self.waiters.push_back(tx);
            return Admission::Wait(rx);
        }
        if let Some(pair) = &self.credentials
            && stale != Some(pair.access.as_str())
        {
            return Admission::Current(pair.access.clone());
        }
        self.refreshing = true;
        Admission::Lead(self.credentials.as_ref().map(|pair| pair.refresh.clone()))
    }

    /// Clear the in-flight marker and hand `outcome` to every waiter in
    /// arrival order. Returns how many waiters were released.
    fn settle(&mut self, outcome: &RefreshOutcome) -> usize {
        self.refreshing = false;
        let waiters = std::mem::take(&mut self.waiters);
        let released = waiters.len();
        for waiter in waiters {
            // A waiter whose request was cancelled has dropped its receiver.
            let _ = waiter.send(outcome.clone());
        }
        released
    }
}

/// Held by the refresh leader for the duration of the refresh.
///
/// Dropping it without calling [`settle`](Self::settle) (the leader's
/// future was cancelled) releases every waiter with
/// [`RefreshFailure::Aborted`] so nobody waits forever.
pub(crate) struct LeaderGuard<'a> {
    state: &'a Mutex<SessionState>,
    settled: bool,
}

impl<'a> LeaderGuard<'a> {
    pub(crate) const fn new(state: &'a Mutex<SessionState>) -> Self {
        Self {
            state,
            settled: false,
        }
    }

    /// Apply the refresh outcome to the session and release all waiters.
    ///
    /// `used` is the refresh credential the leader presented. The outcome
    /// only touches the session if that credential is still the stored one;
    /// otherwise the session was logged out (or replaced by a new login)
    /// mid-refresh and every waiter gets [`RefreshFailure::LoggedOut`].
    ///
    /// On success the new access credential (and rotated refresh
    /// credential, if any) replaces the stored one and is persisted before
    /// any waiter runs. On a terminal failure both copies are dropped.
    /// Persistence happens under the state lock so a concurrent logout
    /// cannot interleave with it.
    ///
    /// Returns the outcome actually delivered and how many waiters got it.
    pub(crate) fn settle<S: CredentialStore>(
        mut self,
        outcome: RefreshOutcome,
        rotated: Option<String>,
        used: Option<&str>,
        store: &S,
    ) -> (RefreshOutcome, usize) {
        self.settled = true;
        let mut state = self.state.lock();
        let current = state.credentials.as_ref().map(|pair| pair.refresh.as_str());
        let outcome = if current == used {
            match outcome {
                Ok(access) => {
                    if let Some(pair) = state.credentials.as_mut() {
                        pair.access.clone_from(&access);
                        if let Some(refresh) = rotated {
                            pair.refresh = refresh;
                        }
                        if let Err(e) = store.save(pair) {
                            tracing::warn!(error = %e, "refreshed credential not persisted");
                        }
                    }
                    Ok(access)
                }
                Err(failure) => {
                    if failure.is_terminal() {
                        state.credentials = None;
                        if let Err(e) = store.clear() {
                            tracing::error!(error = %e, "failed to clear stored credentials");
                        }
                    }
                    Err(failure)
                }
            }
        } else {
            tracing::info!("credentials changed during refresh, discarding result");
            Err(RefreshFailure::LoggedOut)
        };
        let released = state.settle(&outcome);
        (outcome, released)
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let released = self.state.lock().settle(&Err(RefreshFailure::Aborted));
            tracing::warn!(released, "refresh cancelled before completion");
        }
    }
}
