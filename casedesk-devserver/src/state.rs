//! Shared server state: accounts, issued credentials, and messages.
//!
//! Everything lives in memory behind [`parking_lot::Mutex`]es; handlers never
//! hold a lock across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{Duration, Utc};
use parking_lot::Mutex;

use casedesk_proto::auth::{Claims, TokenPair, TokenType, decode_claims, encode_unsigned};
use casedesk_proto::ids::{MessageId, UserId};
use casedesk_proto::message::{BroadcastScope, RawMessage, SendMessageRequest};
use casedesk_proto::user::{Peer, Role};

/// Default lifetime of an access credential, in seconds.
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 300;
/// Default lifetime of a refresh credential, in seconds.
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 86_400;

/// Errors returned by state operations; each maps to one HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DevError {
    /// Missing, unknown or expired credential (401).
    #[error("authentication credentials were not provided or are invalid")]
    Unauthorized,
    /// Authenticated but not allowed (403).
    #[error("{0}")]
    Forbidden(String),
    /// No such resource (404).
    #[error("{0}")]
    NotFound(String),
    /// Malformed request (400).
    #[error("{0}")]
    BadRequest(String),
    /// Token minting failed (500).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A seeded account.
#[derive(Debug, Clone)]
pub struct DevUser {
    /// User id.
    pub id: UserId,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Login email.
    pub email: String,
    /// Login password, in clear; this server is for development only.
    pub password: String,
    /// Account role.
    pub role: Role,
}

impl DevUser {
    fn new(id: u64, first: &str, last: &str, email: &str, password: &str, role: Role) -> Self {
        Self {
            id: UserId::new(id),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role,
        }
    }

    fn peer(&self) -> Peer {
        Peer {
            id: self.id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            role: self.role,
            status: Some("active".to_string()),
            avatar: None,
        }
    }

    fn in_scope(&self, scope: BroadcastScope) -> bool {
        match scope {
            BroadcastScope::All => true,
            BroadcastScope::Investigators => self.role == Role::Investigator,
            BroadcastScope::Victims => self.role == Role::Victim,
        }
    }
}

/// The demo accounts every fresh state starts with.
#[must_use]
pub fn demo_users() -> Vec<DevUser> {
    vec![
        DevUser::new(1, "Ada", "Admin", "admin@casedesk.test", "admin-pass", Role::Admin),
        DevUser::new(
            2,
            "Ivan",
            "Investigator",
            "investigator@casedesk.test",
            "investigator-pass",
            Role::Investigator,
        ),
        DevUser::new(3, "Vera", "Victim", "victim@casedesk.test", "victim-pass", Role::Victim),
    ]
}

#[derive(Default)]
struct Tokens {
    access: HashMap<String, UserId>,
    refresh: HashMap<String, UserId>,
}

/// Shared server state.
pub struct DevState {
    users: Vec<DevUser>,
    messages: Mutex<Vec<RawMessage>>,
    tokens: Mutex<Tokens>,
    next_message_id: AtomicU64,
    access_ttl: Duration,
    refresh_ttl: Duration,
    refresh_calls: AtomicUsize,
    mark_read_calls: AtomicUsize,
}

impl Default for DevState {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS)
    }
}

impl DevState {
    /// Creates a state with the demo accounts and the given credential
    /// lifetimes, in seconds.
    #[must_use]
    pub fn new(access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self::with_users(demo_users(), access_ttl_secs, refresh_ttl_secs)
    }

    /// Creates a state with custom accounts.
    #[must_use]
    pub fn with_users(users: Vec<DevUser>, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            users,
            messages: Mutex::new(Vec::new()),
            tokens: Mutex::new(Tokens::default()),
            next_message_id: AtomicU64::new(1),
            access_ttl: Duration::seconds(access_ttl_secs),
            refresh_ttl: Duration::seconds(refresh_ttl_secs),
            refresh_calls: AtomicUsize::new(0),
            mark_read_calls: AtomicUsize::new(0),
        }
    }

    /// Look up an account.
    #[must_use]
    pub fn user(&self, id: UserId) -> Option<&DevUser> {
        self.users.iter().find(|u| u.id == id)
    }

    // -- auth ---------------------------------------------------------------

    /// Check email and password and issue a credential pair.
    ///
    /// # Errors
    ///
    /// [`DevError::Unauthorized`] for unknown accounts or wrong passwords.
    pub fn login(&self, email: &str, password: &str) -> Result<TokenPair, DevError> {
        let user = self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email) && u.password == password)
            .ok_or(DevError::Unauthorized)?;
        let access = self.issue(user, TokenType::Access)?;
        let refresh = self.issue(user, TokenType::Refresh)?;
        tracing::info!(user = %user.id, "login");
        Ok(TokenPair { access, refresh })
    }

    /// Exchange a refresh credential for a new access credential.
    ///
    /// # Errors
    ///
    /// [`DevError::Unauthorized`] for unknown, revoked or expired refresh
    /// credentials.
    pub fn refresh(&self, refresh: &str) -> Result<String, DevError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let user_id = self
            .tokens
            .lock()
            .refresh
            .get(refresh)
            .copied()
            .ok_or(DevError::Unauthorized)?;
        if !is_live(refresh) {
            return Err(DevError::Unauthorized);
        }
        let user = self.user(user_id).ok_or(DevError::Unauthorized)?;
        let access = self.issue(user, TokenType::Access)?;
        tracing::info!(user = %user_id, "access credential refreshed");
        Ok(access)
    }

    /// Resolve a bearer credential to its account.
    ///
    /// # Errors
    ///
    /// [`DevError::Unauthorized`] for unknown or expired credentials.
    pub fn authenticate(&self, access: &str) -> Result<&DevUser, DevError> {
        let user_id = self
            .tokens
            .lock()
            .access
            .get(access)
            .copied()
            .ok_or(DevError::Unauthorized)?;
        if !is_live(access) {
            return Err(DevError::Unauthorized);
        }
        self.user(user_id).ok_or(DevError::Unauthorized)
    }

    fn issue(&self, user: &DevUser, kind: TokenType) -> Result<String, DevError> {
        let ttl = match kind {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            user_id: user.id,
            role: Some(user.role),
            exp: (Utc::now() + ttl).timestamp(),
            token_type: Some(kind),
            jti: Some(uuid::Uuid::now_v7().to_string()),
        };
        let token = encode_unsigned(&claims).map_err(|e| DevError::Internal(e.to_string()))?;
        let mut tokens = self.tokens.lock();
        match kind {
            TokenType::Access => tokens.access.insert(token.clone(), user.id),
            TokenType::Refresh => tokens.refresh.insert(token.clone(), user.id),
        };
        Ok(token)
    }

    // -- chat ---------------------------------------------------------------

    /// Accounts `me` may message: everyone else, except that victims do not
    /// see other victims.
    #[must_use]
    pub fn available_users(&self, me: &DevUser) -> Vec<Peer> {
        self.users
            .iter()
            .filter(|u| u.id != me.id)
            .filter(|u| !(me.role == Role::Victim && u.role == Role::Victim))
            .map(DevUser::peer)
            .collect()
    }

    /// Messages between `me` and `peer`, oldest first, including `peer`'s
    /// broadcasts that reach `me`.
    ///
    /// Fetching marks messages addressed to `me` as delivered.
    pub fn conversation(&self, me: &DevUser, peer: UserId) -> Vec<RawMessage> {
        let mut messages = self.messages.lock();
        let mut listed = Vec::new();
        for message in messages.iter_mut() {
            let direct = (message.sender == me.id && message.receiver == Some(peer))
                || (message.sender == peer && message.receiver == Some(me.id));
            let broadcast = message.sender == peer && self.reaches(message, me);
            if direct || broadcast {
                if message.sender == peer {
                    message.delivered = true;
                }
                listed.push(message.clone());
            }
        }
        listed
    }

    /// Every message sent or addressed to `me`, oldest first.
    #[must_use]
    pub fn inbox(&self, me: &DevUser) -> Vec<RawMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.sender == me.id || m.receiver == Some(me.id) || self.reaches(m, me))
            .cloned()
            .collect()
    }

    fn reaches(&self, message: &RawMessage, user: &DevUser) -> bool {
        message.is_broadcast
            && message.sender != user.id
            && message
                .broadcast_type
                .is_some_and(|scope| user.in_scope(scope))
    }

    /// Store a message from `me`.
    ///
    /// # Errors
    ///
    /// - [`DevError::BadRequest`] for empty content or a direct message
    ///   without a receiver
    /// - [`DevError::Forbidden`] for broadcasts by non-administrators
    /// - [`DevError::NotFound`] for an unknown receiver
    pub fn send(&self, me: &DevUser, request: SendMessageRequest) -> Result<RawMessage, DevError> {
        if request.content.trim().is_empty() {
            return Err(DevError::BadRequest("content may not be blank".into()));
        }
        if request.is_broadcast {
            if me.role != Role::Admin {
                return Err(DevError::Forbidden(
                    "only administrators can broadcast".into(),
                ));
            }
            let scope = request.broadcast_type.unwrap_or(BroadcastScope::All);
            return Ok(self.store(me.id, None, request.content, Some(scope)));
        }
        let receiver = request
            .receiver
            .ok_or_else(|| DevError::BadRequest("receiver is required".into()))?;
        if self.user(receiver).is_none() {
            return Err(DevError::NotFound(format!("user {receiver} not found")));
        }
        Ok(self.store(me.id, Some(receiver), request.content, None))
    }

    /// Mark a message addressed to `me` as read.
    ///
    /// # Errors
    ///
    /// [`DevError::NotFound`] if the message does not exist or is not
    /// addressed to `me`.
    pub fn mark_read(&self, me: &DevUser, id: MessageId) -> Result<RawMessage, DevError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        let mut messages = self.messages.lock();
        let message = messages
            .iter_mut()
            .find(|m| m.id == id && (m.receiver == Some(me.id) || self.reaches(m, me)))
            .ok_or_else(|| DevError::NotFound(format!("message {id} not found")))?;
        message.read = true;
        message.delivered = true;
        Ok(message.clone())
    }

    fn store(
        &self,
        sender: UserId,
        receiver: Option<UserId>,
        content: String,
        scope: Option<BroadcastScope>,
    ) -> RawMessage {
        let message = RawMessage {
            id: MessageId::new(self.next_message_id.fetch_add(1, Ordering::SeqCst)),
            sender,
            receiver,
            content,
            timestamp: Utc::now(),
            read: false,
            delivered: false,
            is_broadcast: scope.is_some(),
            broadcast_type: scope,
        };
        self.messages.lock().push(message.clone());
        message
    }

    // -- test hooks ---------------------------------------------------------

    /// Store a direct message without going through HTTP.
    pub fn inject_message(&self, sender: UserId, receiver: UserId, content: &str) -> RawMessage {
        self.store(sender, Some(receiver), content.to_string(), None)
    }

    /// A stored message by id.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<RawMessage> {
        self.messages.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Invalidate every issued access credential.
    pub fn expire_access_tokens(&self) {
        self.tokens.lock().access.clear();
        tracing::info!("access credentials expired");
    }

    /// Invalidate every issued refresh credential.
    pub fn revoke_refresh_tokens(&self) {
        self.tokens.lock().refresh.clear();
        tracing::info!("refresh credentials revoked");
    }

    /// Number of calls to the refresh endpoint so far.
    #[must_use]
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of calls to the mark-as-read endpoint so far.
    #[must_use]
    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }
}

fn is_live(token: &str) -> bool {
    decode_claims(token).is_ok_and(|claims| !claims.is_expired())
}
