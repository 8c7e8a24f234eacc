//! Chat message payloads exchanged with `/chat/messages/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

/// Delivery state of a message as shown to the user.
///
/// Variants are ordered: a message only ever moves forward
/// (`Sent` → `Delivered` → `Read`), which [`MessageStatus::advance`]
/// enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the server, not yet seen by the recipient's client.
    Sent,
    /// Fetched by the recipient's client.
    Delivered,
    /// Acknowledged as read by the recipient.
    Read,
}

impl MessageStatus {
    /// Map the server's `read` / `delivered` flags to a single status.
    #[must_use]
    pub const fn from_flags(read: bool, delivered: bool) -> Self {
        if read {
            Self::Read
        } else if delivered {
            Self::Delivered
        } else {
            Self::Sent
        }
    }

    /// Combine a previously known status with a newly reported one without
    /// ever moving backwards.
    #[must_use]
    pub fn advance(self, reported: Self) -> Self {
        self.max(reported)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Audience of an administrator broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastScope {
    /// Every user of the system.
    All,
    /// Every investigator.
    Investigators,
    /// Every victim.
    Victims,
}

impl std::str::FromStr for BroadcastScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "investigators" => Ok(Self::Investigators),
            "victims" => Ok(Self::Victims),
            other => Err(format!(
                "unknown broadcast scope {other:?} (expected all, investigators or victims)"
            )),
        }
    }
}

impl std::fmt::Display for BroadcastScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Investigators => write!(f, "investigators"),
            Self::Victims => write!(f, "victims"),
        }
    }
}

/// A message exactly as the server reports it.
///
/// `sender` is a raw user id; whether it is "me" is decided by the client
/// against the authenticated user, never by a server flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Author of the message.
    pub sender: UserId,
    /// Addressee; absent for broadcasts and in the per-peer listing.
    #[serde(default)]
    pub receiver: Option<UserId>,
    /// Text body.
    pub content: String,
    /// Creation time on the server.
    pub timestamp: DateTime<Utc>,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub read: bool,
    /// Whether the recipient's client has fetched the message.
    #[serde(default)]
    pub delivered: bool,
    /// Whether the message was sent as a broadcast.
    #[serde(default)]
    pub is_broadcast: bool,
    /// Audience, for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_type: Option<BroadcastScope>,
}

impl RawMessage {
    /// Status derived from the server flags.
    #[must_use]
    pub const fn status(&self) -> MessageStatus {
        MessageStatus::from_flags(self.read, self.delivered)
    }
}

/// Body of `POST /chat/messages/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Addressee; `None` for broadcasts.
    pub receiver: Option<UserId>,
    /// Text body.
    pub content: String,
    /// Whether this is a broadcast.
    pub is_broadcast: bool,
    /// Audience, for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_type: Option<BroadcastScope>,
}

impl SendMessageRequest {
    /// A direct message to one peer.
    #[must_use]
    pub fn direct(receiver: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver),
            content: content.into(),
            is_broadcast: false,
            broadcast_type: None,
        }
    }

    /// A broadcast to every user in `scope`.
    #[must_use]
    pub fn broadcast(scope: BroadcastScope, content: impl Into<String>) -> Self {
        Self {
            receiver: None,
            content: content.into(),
            is_broadcast: true,
            broadcast_type: Some(scope),
        }
    }
}

/// Body of `PATCH /chat/messages/{id}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadRequest {
    /// Always `true`; a message cannot be marked unread.
    pub read: bool,
}

impl Default for MarkReadRequest {
    fn default() -> Self {
        Self { read: true }
    }
}
