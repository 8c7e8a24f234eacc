//! Polling chat synchronization engine.
//!
//! [`ChatSync`] keeps a per-peer cache of conversations consistent with the
//! server. Two timers drive it: a fast poll of the open conversation and a
//! slower background poll of every peer. Both replace a peer's cache
//! wholesale from a server snapshot, so they may overlap freely.
//!
//! Messages sent from this client are shown immediately and survive syncs
//! until the server lists them. Unread messages from the peer get exactly
//! one mark-as-read call each, dispatched without blocking the sync.

pub mod conversation;
pub mod poll;

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use casedesk_proto::ids::{MessageId, UserId};
use casedesk_proto::message::{BroadcastScope, MarkReadRequest, RawMessage, SendMessageRequest};
use casedesk_proto::user::{Peer, Role};

use crate::session::credentials::CredentialStore;
use crate::session::{SessionError, SessionTransport};
use crate::transport::{ApiRequest, HttpBackend, Method};

pub use conversation::{Conversation, Message, Sender};
pub use poll::PollHandle;

/// Roster endpoint.
pub const ROSTER_PATH: &str = "/chat/available-users/";
/// Message listing and send endpoint.
pub const MESSAGES_PATH: &str = "/chat/messages/";

/// Path of the mark-as-read endpoint for `id`.
#[must_use]
pub fn message_path(id: MessageId) -> String {
    format!("{MESSAGES_PATH}{id}/")
}

/// Errors surfaced by the chat engine.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The roster could not be loaded; no conversations are available.
    #[error("roster unavailable: {0}")]
    RosterUnavailable(#[source] SessionError),

    /// Fetching one peer's messages failed. The peer's cache is unchanged.
    #[error("sync with peer {peer} failed: {source}")]
    PeerSyncFailed {
        /// The peer whose fetch failed.
        peer: UserId,
        /// Underlying failure.
        #[source]
        source: SessionError,
    },

    /// The inbox listing could not be fetched.
    #[error("inbox unavailable: {0}")]
    InboxUnavailable(#[source] SessionError),

    /// The send call failed; nothing was added to the cache.
    #[error("send failed: {0}")]
    SendFailed(#[source] SessionError),

    /// The message text is empty after trimming.
    #[error("message is empty")]
    EmptyMessage,

    /// The message text exceeds the configured limit.
    #[error("message too long: {len} characters (max {max})")]
    MessageTooLong {
        /// Length of the rejected text, in characters.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Broadcasts are reserved for administrators.
    #[error("broadcast not permitted for role {0}")]
    BroadcastNotPermitted(Role),

    /// The peer is neither in the roster nor has a cached conversation.
    #[error("unknown peer {0}")]
    UnknownPeer(UserId),

    /// The session could not identify the authenticated user.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The roster was loaded.
    RosterLoaded {
        /// Number of peers.
        peers: usize,
    },
    /// The roster could not be loaded.
    RosterUnavailable,
    /// A conversation's cache changed.
    ConversationUpdated {
        /// The peer whose conversation changed.
        peer: UserId,
    },
    /// A message from this client was accepted by the server.
    MessageSent {
        /// Addressee.
        peer: UserId,
        /// Server-assigned id.
        id: MessageId,
    },
    /// A background fetch for one peer failed.
    PeerSyncFailed {
        /// The peer whose fetch failed.
        peer: UserId,
    },
}

/// Timer and limit settings for the engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval of the open-conversation poll.
    pub foreground_poll: Duration,
    /// Interval of the all-conversations poll.
    pub background_poll: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    /// Longest accepted message, in characters.
    pub max_message_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            foreground_poll: Duration::from_secs(5),
            background_poll: Duration::from_secs(10),
            event_buffer: 64,
            max_message_len: 4000,
        }
    }
}

/// Outcome of one pass over every peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Peers whose cache was replaced.
    pub synced: Vec<UserId>,
    /// Peers whose fetch failed; their caches are unchanged.
    pub failed: Vec<UserId>,
}

/// Outcome of syncing one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Messages in the conversation after the sync.
    pub messages: usize,
    /// Mark-as-read calls dispatched by this sync.
    pub receipts_dispatched: usize,
}

/// A conversation as listed in an overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The peer.
    pub peer: UserId,
    /// Newest message, if any.
    pub last_message: Option<Message>,
    /// Messages from the peer not yet read.
    pub unread: usize,
}

struct Inner<B: HttpBackend, S: CredentialStore> {
    session: Arc<SessionTransport<B, S>>,
    me: UserId,
    role: Option<Role>,
    config: SyncConfig,
    roster: Mutex<Vec<Peer>>,
    conversations: Mutex<HashMap<UserId, Conversation>>,
    active: Mutex<Option<(UserId, PollHandle)>>,
    receipts: Mutex<JoinSet<()>>,
    event_tx: mpsc::Sender<ChatEvent>,
}

/// Handle to the chat engine. Clones share the same caches and timers.
pub struct ChatSync<B: HttpBackend, S: CredentialStore> {
    inner: Arc<Inner<B, S>>,
}

impl<B: HttpBackend, S: CredentialStore> Clone for ChatSync<B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: HttpBackend, S: CredentialStore> ChatSync<B, S> {
    /// Creates an engine for user `me` over an authenticated session.
    ///
    /// `role` gates broadcasting; `None` leaves the decision to the server.
    pub fn new(
        session: Arc<SessionTransport<B, S>>,
        me: UserId,
        role: Option<Role>,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let inner = Inner {
            session,
            me,
            role,
            config,
            roster: Mutex::new(Vec::new()),
            conversations: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            receipts: Mutex::new(JoinSet::new()),
            event_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        )
    }

    /// Creates an engine for the user named in the session's access
    /// credential.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Session`] if nobody is logged in or the
    /// credential cannot be decoded.
    pub fn for_session(
        session: Arc<SessionTransport<B, S>>,
        config: SyncConfig,
    ) -> Result<(Self, mpsc::Receiver<ChatEvent>), ChatError> {
        let claims = session.claims()?;
        Ok(Self::new(session, claims.user_id, claims.role, config))
    }

    /// The authenticated user.
    #[must_use]
    pub fn me(&self) -> UserId {
        self.inner.me
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionTransport<B, S>> {
        &self.inner.session
    }

    /// Fetch the list of peers and seed an empty conversation for each.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RosterUnavailable`]; the previous roster is kept.
    pub async fn load_roster(&self) -> Result<Vec<Peer>, ChatError> {
        let peers: Vec<Peer> = match self
            .inner
            .session
            .get_json(ApiRequest::get(ROSTER_PATH))
            .await
        {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, "roster unavailable");
                self.emit(ChatEvent::RosterUnavailable);
                return Err(ChatError::RosterUnavailable(e));
            }
        };
        let peers: Vec<Peer> = peers.into_iter().filter(|p| p.id != self.inner.me).collect();

        {
            let mut conversations = self.inner.conversations.lock();
            for peer in &peers {
                conversations
                    .entry(peer.id)
                    .or_insert_with(|| Conversation::new(peer.id));
            }
        }
        *self.inner.roster.lock() = peers.clone();

        tracing::info!(peers = peers.len(), "roster loaded");
        self.emit(ChatEvent::RosterLoaded { peers: peers.len() });
        Ok(peers)
    }

    /// The most recently loaded roster.
    #[must_use]
    pub fn roster(&self) -> Vec<Peer> {
        self.inner.roster.lock().clone()
    }

    /// Fetch every roster peer's messages in parallel and replace each cache.
    ///
    /// A failed peer is logged and skipped; its cache is left as it was.
    pub async fn load_all_conversations(&self) -> RefreshSummary {
        let peers: Vec<UserId> = self.inner.roster.lock().iter().map(|p| p.id).collect();
        let fetches = peers.into_iter().map(|peer| {
            let engine = self.clone();
            async move {
                let result = engine.fetch_peer(peer).await;
                (peer, result)
            }
        });

        let mut summary = RefreshSummary::default();
        for (peer, result) in join_all(fetches).await {
            match result {
                Ok(snapshot) => {
                    self.apply_snapshot(peer, snapshot);
                    summary.synced.push(peer);
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "peer sync failed, skipping");
                    self.emit(ChatEvent::PeerSyncFailed { peer });
                    summary.failed.push(peer);
                }
            }
        }
        tracing::debug!(
            synced = summary.synced.len(),
            failed = summary.failed.len(),
            "background refresh done"
        );
        summary
    }

    /// Fetch the full inbox and replace each counterpart's cache from it.
    ///
    /// Counterparts missing from the roster get a conversation anyway.
    /// Returns the peers touched.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InboxUnavailable`]; no cache is changed.
    pub async fn load_inbox(&self) -> Result<Vec<UserId>, ChatError> {
        let inbox: Vec<RawMessage> = self
            .inner
            .session
            .get_json(ApiRequest::get(MESSAGES_PATH))
            .await
            .map_err(ChatError::InboxUnavailable)?;

        let mut by_peer: BTreeMap<UserId, Vec<RawMessage>> = BTreeMap::new();
        for raw in inbox {
            let counterpart = if raw.sender == self.inner.me {
                raw.receiver
            } else {
                Some(raw.sender)
            };
            // Broadcasts sent by me have no single counterpart.
            if let Some(peer) = counterpart {
                by_peer.entry(peer).or_default().push(raw);
            }
        }

        let touched: Vec<UserId> = by_peer.keys().copied().collect();
        for (peer, snapshot) in by_peer {
            self.apply_snapshot(peer, snapshot);
        }
        Ok(touched)
    }

    /// Select `peer` as the open conversation.
    ///
    /// Syncs it immediately, then every foreground interval until another
    /// peer is opened or the conversation is closed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownPeer`] for a peer with no conversation.
    pub fn open_conversation(&self, peer: UserId) -> Result<(), ChatError> {
        self.ensure_known(peer)?;
        let weak = Arc::downgrade(&self.inner);
        let handle = PollHandle::spawn(self.inner.config.foreground_poll, true, move || {
            let weak = Weak::clone(&weak);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                let engine = Self { inner };
                if let Err(e) = engine.sync_conversation(peer).await {
                    tracing::debug!(peer = %peer, error = %e, "foreground sync failed");
                }
                ControlFlow::Continue(())
            }
        });

        // Replacing the previous handle stops its timer.
        let previous = self.inner.active.lock().replace((peer, handle));
        if let Some((old, _)) = previous {
            tracing::debug!(from = %old, to = %peer, "switched conversation");
        }
        Ok(())
    }

    /// Stop the foreground poll.
    pub fn close_conversation(&self) {
        if let Some((peer, _handle)) = self.inner.active.lock().take() {
            tracing::debug!(peer = %peer, "conversation closed");
        }
    }

    /// The open conversation's peer, if any.
    #[must_use]
    pub fn active_peer(&self) -> Option<UserId> {
        self.inner.active.lock().as_ref().map(|(peer, _)| *peer)
    }

    /// Start the background poll of every peer.
    ///
    /// The first pass runs one interval from now; callers load conversations
    /// themselves at startup. The poll runs until the handle is dropped.
    #[must_use = "dropping the handle stops the background refresh"]
    pub fn start_background_refresh(&self) -> PollHandle {
        let weak = Arc::downgrade(&self.inner);
        PollHandle::spawn(self.inner.config.background_poll, false, move || {
            let weak = Weak::clone(&weak);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                Self { inner }.load_all_conversations().await;
                ControlFlow::Continue(())
            }
        })
    }

    /// Fetch one peer's messages, replace the cache, and dispatch
    /// mark-as-read calls for newly seen unread messages.
    ///
    /// Receipt calls run in the background; see
    /// [`flush_read_receipts`](Self::flush_read_receipts).
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::PeerSyncFailed`]; the cache is unchanged.
    pub async fn sync_conversation(&self, peer: UserId) -> Result<SyncReport, ChatError> {
        let snapshot = self
            .fetch_peer(peer)
            .await
            .map_err(|source| ChatError::PeerSyncFailed { peer, source })?;
        let messages = self.apply_snapshot(peer, snapshot);

        let due = self
            .inner
            .conversations
            .lock()
            .get_mut(&peer)
            .map(Conversation::begin_receipts)
            .unwrap_or_default();
        let receipts_dispatched = due.len();
        {
            let mut receipts = self.inner.receipts.lock();
            while let Some(done) = receipts.try_join_next() {
                if let Err(e) = done {
                    tracing::warn!(peer = %peer, error = %e, "read receipt task failed");
                }
            }
            for id in due {
                let engine = self.clone();
                receipts.spawn(async move { engine.mark_read(peer, id).await });
            }
        }
        if receipts_dispatched > 0 {
            tracing::debug!(peer = %peer, count = receipts_dispatched, "marking messages read");
        }

        Ok(SyncReport {
            messages,
            receipts_dispatched,
        })
    }

    /// Send `text` to `peer` and show it at once.
    ///
    /// # Errors
    ///
    /// - [`ChatError::EmptyMessage`] / [`ChatError::MessageTooLong`] before
    ///   any network call
    /// - [`ChatError::UnknownPeer`] for a peer with no conversation
    /// - [`ChatError::SendFailed`] if the server call fails; nothing is cached
    pub async fn send_message(&self, peer: UserId, text: &str) -> Result<Message, ChatError> {
        self.validate(text)?;
        self.ensure_known(peer)?;

        let raw: RawMessage = self
            .inner
            .session
            .send_json(
                Method::Post,
                MESSAGES_PATH,
                &SendMessageRequest::direct(peer, text),
            )
            .await
            .map_err(ChatError::SendFailed)?;

        let message = Message::sent(raw, self.inner.me);
        self.inner
            .conversations
            .lock()
            .entry(peer)
            .or_insert_with(|| Conversation::new(peer))
            .insert_sent(message.clone());

        tracing::info!(peer = %peer, id = %message.id, "message sent");
        self.emit(ChatEvent::MessageSent {
            peer,
            id: message.id,
        });
        self.emit(ChatEvent::ConversationUpdated { peer });
        Ok(message)
    }

    /// Send `text` to every user in `scope`. Administrators only.
    ///
    /// The broadcast is not added to any conversation.
    ///
    /// # Errors
    ///
    /// - [`ChatError::BroadcastNotPermitted`] when the session role is known
    ///   and not administrator
    /// - [`ChatError::EmptyMessage`] / [`ChatError::MessageTooLong`]
    /// - [`ChatError::SendFailed`] if the server call fails
    pub async fn send_broadcast(
        &self,
        text: &str,
        scope: BroadcastScope,
    ) -> Result<RawMessage, ChatError> {
        if let Some(role) = self.inner.role
            && role != Role::Admin
        {
            return Err(ChatError::BroadcastNotPermitted(role));
        }
        self.validate(text)?;

        let raw: RawMessage = self
            .inner
            .session
            .send_json(
                Method::Post,
                MESSAGES_PATH,
                &SendMessageRequest::broadcast(scope, text),
            )
            .await
            .map_err(ChatError::SendFailed)?;
        tracing::info!(scope = %scope, id = %raw.id, "broadcast sent");
        Ok(raw)
    }

    /// Copy of the cached conversation with `peer`.
    #[must_use]
    pub fn conversation(&self, peer: UserId) -> Option<Conversation> {
        self.inner.conversations.lock().get(&peer).cloned()
    }

    /// Every cached conversation, most recent activity first.
    #[must_use]
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> = self
            .inner
            .conversations
            .lock()
            .values()
            .map(|c| ConversationSummary {
                peer: c.peer(),
                last_message: c.last_message().cloned(),
                unread: c.unread(),
            })
            .collect();
        list.sort_by(|a, b| {
            let at = |s: &ConversationSummary| s.last_message.as_ref().map(|m| m.timestamp);
            at(b).cmp(&at(a)).then(a.peer.cmp(&b.peer))
        });
        list
    }

    /// Wait for every dispatched mark-as-read call to finish.
    pub async fn flush_read_receipts(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inner.receipts.lock());
            if pending.is_empty() {
                return;
            }
            while pending.join_next().await.is_some() {}
        }
    }

    /// Stop the foreground poll and wait for outstanding receipts.
    pub async fn shutdown(&self) {
        self.close_conversation();
        self.flush_read_receipts().await;
    }

    async fn fetch_peer(&self, peer: UserId) -> Result<Vec<RawMessage>, SessionError> {
        self.inner
            .session
            .get_json(ApiRequest::get(MESSAGES_PATH).query("chat_with", peer))
            .await
    }

    /// Replace `peer`'s cache. Returns the resulting message count.
    fn apply_snapshot(&self, peer: UserId, snapshot: Vec<RawMessage>) -> usize {
        let me = self.inner.me;
        let messages = snapshot
            .into_iter()
            .map(|raw| Message::from_raw(raw, me))
            .collect();
        let count = {
            let mut conversations = self.inner.conversations.lock();
            let conversation = conversations
                .entry(peer)
                .or_insert_with(|| Conversation::new(peer));
            conversation.reconcile(messages, now());
            conversation.messages().len()
        };
        self.emit(ChatEvent::ConversationUpdated { peer });
        count
    }

    async fn mark_read(&self, peer: UserId, id: MessageId) {
        let request = match ApiRequest::patch(message_path(id)).json(&MarkReadRequest::default()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "could not encode read receipt");
                self.with_conversation(peer, |c| c.receipt_failed(id));
                return;
            }
        };
        match self.inner.session.request(request).await {
            Ok(_) => {
                self.with_conversation(peer, |c| c.acknowledge_read(id));
                self.emit(ChatEvent::ConversationUpdated { peer });
            }
            Err(e) => {
                tracing::warn!(peer = %peer, id = %id, error = %e, "mark-as-read failed, will retry");
                self.with_conversation(peer, |c| c.receipt_failed(id));
            }
        }
    }

    fn with_conversation(&self, peer: UserId, f: impl FnOnce(&mut Conversation)) {
        if let Some(conversation) = self.inner.conversations.lock().get_mut(&peer) {
            f(conversation);
        }
    }

    fn ensure_known(&self, peer: UserId) -> Result<(), ChatError> {
        let known = self.inner.conversations.lock().contains_key(&peer)
            || self.inner.roster.lock().iter().any(|p| p.id == peer);
        if known {
            Ok(())
        } else {
            Err(ChatError::UnknownPeer(peer))
        }
    }

    fn validate(&self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let len = text.chars().count();
        let max = self.inner.config.max_message_len;
        if len > max {
            return Err(ChatError::MessageTooLong { len, max });
        }
        Ok(())
    }

    fn emit(&self, event: ChatEvent) {
        if let Err(e) = self.inner.event_tx.try_send(event) {
            tracing::trace!(error = %e, "chat event dropped");
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}
