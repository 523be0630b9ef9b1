use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Media type the room was provisioned for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtcType {
    #[default]
    Audio,
    Video,
}

impl RtcType {
    /// Wire code used by the provisioning API (0 = audio, 1 = video).
    pub fn code(self) -> i64 {
        match self {
            RtcType::Audio => 0,
            RtcType::Video => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 1 { RtcType::Video } else { RtcType::Audio }
    }
}

/// Describes the session being joined.
///
/// `identities` is the ordered list of participants expected in the room;
/// the directory keeps it in sync with invites, unexpected joins, leaves and
/// timeout evictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExpectation {
    pub room_name: String,
    pub url: String,
    pub token: String,
    pub max_participants: usize,
    pub rtc_type: RtcType,
    pub is_p2p: bool,
    pub identities: Vec<String>,
    pub creator: String,
    pub login_identity: String,
    pub timeout_secs: u64,
}

impl Default for SessionExpectation {
    fn default() -> Self {
        Self {
            room_name: String::new(),
            url: String::new(),
            token: String::new(),
            max_participants: 2,
            rtc_type: RtcType::Audio,
            is_p2p: true,
            identities: Vec::new(),
            creator: String::new(),
            login_identity: String::new(),
            timeout_secs: 30,
        }
    }
}

impl SessionExpectation {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_creator(&self) -> bool {
        self.creator == self.login_identity
    }

    /// The other side of a one-to-one call: the first expected identity that
    /// is not the login identity, or the creator when there is none.
    pub fn p2p_peer(&self) -> &str {
        self.identities
            .iter()
            .find(|id| **id != self.login_identity)
            .map(String::as_str)
            .unwrap_or(&self.creator)
    }

    pub fn expects(&self, identity: &str) -> bool {
        self.identities.iter().any(|id| id == identity)
    }

    pub(crate) fn add_identity(&mut self, identity: &str) {
        if !self.expects(identity) {
            self.identities.push(identity.to_string());
        }
    }

    pub(crate) fn remove_identity(&mut self, identity: &str) {
        self.identities.retain(|id| id != identity);
    }
}
