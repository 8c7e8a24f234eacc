//! Chat peers as listed by `/chat/available-users/`.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Account role. Unknown roles from newer servers deserialize to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System administrator; may broadcast.
    Admin,
    /// Case investigator.
    Investigator,
    /// Incident victim / reporter.
    Victim,
    /// Any role this client does not know about.
    #[serde(other)]
    Other,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Investigator => write!(f, "investigator"),
            Self::Victim => write!(f, "victim"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A user this account may chat with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// User id; also the conversation key.
    pub id: UserId,
    /// Given name.
    #[serde(default)]
    pub first_name: String,
    /// Family name.
    #[serde(default)]
    pub last_name: String,
    /// Contact address.
    #[serde(default)]
    pub email: String,
    /// Account role.
    pub role: Role,
    /// Free-form presence/account status reported by the server.
    #[serde(default)]
    pub status: Option<String>,
    /// Avatar URL, if any.
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Peer {
    /// Human-readable name, falling back to the email address.
    #[must_use]
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}
