use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-side user id of another member (the "peer" of a match).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: u64,
    /// Base64 JPEG payload as served by the API.
    pub blob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub user: PeerId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

/// One match as listed by `GET match/`. A record that exists is live;
/// unmatching removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub profile: PeerProfile,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn peer_id(&self) -> PeerId {
        self.profile.user
    }
}

/// Canonical account state returned by `GET user/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub has_profile: bool,
    #[serde(default)]
    pub is_email_verified: bool,
    #[serde(default)]
    pub accepted_tos: bool,
}

impl UserSnapshot {
    /// Profile filled in, email verified and terms accepted.
    pub fn is_complete(&self) -> bool {
        self.has_profile && self.is_email_verified && self.accepted_tos
    }
}
