use std::fmt;

use serde::{Deserialize, Serialize};

/// Sub-room every participant lands in when joining a room.
pub const DEFAULT_SUB_ROOM: &str = "general";

/// Joins the two sorted peer ids of a call document.
pub const CALL_ID_SEPARATOR: char = '_';

/// Opaque participant identifier.
///
/// The total order on ids decides connection ownership: for every pair the
/// smaller id is the caller and the larger id is the callee.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of the call document shared by an unordered peer pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Same value no matter which side of the pair computes it.
    pub fn for_pair(a: &PeerId, b: &PeerId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}{CALL_ID_SEPARATOR}{high}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of a connection the local participant owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    pub fn for_pair(local: &PeerId, remote: &PeerId) -> Self {
        if local < remote {
            Role::Caller
        } else {
            Role::Callee
        }
    }

    /// Candidate list this side appends to.
    pub fn local_side(self) -> CandidateSide {
        match self {
            Role::Caller => CandidateSide::Offer,
            Role::Callee => CandidateSide::Answer,
        }
    }

    /// Candidate list this side listens to.
    pub fn remote_side(self) -> CandidateSide {
        match self {
            Role::Caller => CandidateSide::Answer,
            Role::Callee => CandidateSide::Offer,
        }
    }
}

/// The two append-only candidate sub-collections of a call document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSide {
    Offer,
    Answer,
}

impl CandidateSide {
    pub fn collection(self) -> &'static str {
        match self {
            CandidateSide::Offer => "offerCandidates",
            CandidateSide::Answer => "answerCandidates",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as stored in a call document (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate entry in a candidate sub-collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Call document: `{offer?, answer?, callerId, calleeId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    pub caller_id: PeerId,
    pub callee_id: PeerId,
}

impl CallRecord {
    pub fn new(caller_id: PeerId, callee_id: PeerId) -> Self {
        Self {
            offer: None,
            answer: None,
            caller_id,
            callee_id,
        }
    }

    /// Merge a patch into the document. Fields the patch leaves unset are kept.
    pub fn apply(&mut self, patch: &CallPatch) {
        if let Some(offer) = &patch.offer {
            self.offer = Some(offer.clone());
            if patch.answer.is_none() {
                self.answer = None;
            }
        }
        if let Some(answer) = &patch.answer {
            self.answer = Some(answer.clone());
        }
        if let Some(caller) = &patch.caller_id {
            self.caller_id = caller.clone();
        }
        if let Some(callee) = &patch.callee_id {
            self.callee_id = callee.clone();
        }
    }

    /// Build a fresh document from a patch; `None` when the patch lacks the pair ids.
    pub fn from_patch(patch: &CallPatch) -> Option<Self> {
        let mut record = Self::new(patch.caller_id.clone()?, patch.callee_id.clone()?);
        record.apply(patch);
        Some(record)
    }

    /// The participant on the other end of the call from `local`.
    pub fn other_party(&self, local: &PeerId) -> &PeerId {
        if &self.caller_id == local {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}

/// Merge write against a call document.
///
/// Writing an offer supersedes the previous exchange, so an offer patch drops
/// any stale answer unless the same patch carries a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallPatch {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub caller_id: Option<PeerId>,
    pub callee_id: Option<PeerId>,
}

impl CallPatch {
    /// Offer written by `from` toward `to`. Caller/callee follow the id order,
    /// not the direction of this particular offer.
    pub fn offer(from: &PeerId, to: &PeerId, sdp: impl Into<String>) -> Self {
        let (caller, callee) = if Role::for_pair(from, to) == Role::Caller {
            (from.clone(), to.clone())
        } else {
            (to.clone(), from.clone())
        };
        Self {
            offer: Some(SessionDescription::offer(sdp)),
            answer: None,
            caller_id: Some(caller),
            callee_id: Some(callee),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            answer: Some(SessionDescription::answer(sdp)),
            ..Default::default()
        }
    }
}

/// Membership document, one per participant in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: PeerId,
    #[serde(rename = "subSessionId", default = "default_sub_room")]
    pub sub_room: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_deafened: bool,
    #[serde(default)]
    pub is_screen_sharing: bool,
    #[serde(default)]
    pub joined_at: u64,
}

impl Participant {
    pub fn new(id: PeerId, sub_room: impl Into<String>) -> Self {
        Self {
            id,
            sub_room: sub_room.into(),
            name: None,
            is_muted: false,
            is_deafened: false,
            is_screen_sharing: false,
            joined_at: 0,
        }
    }

    pub fn apply(&mut self, patch: &ParticipantPatch) {
        if let Some(sub_room) = &patch.sub_room {
            self.sub_room = sub_room.clone();
        }
        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }
        if let Some(muted) = patch.is_muted {
            self.is_muted = muted;
        }
        if let Some(deafened) = patch.is_deafened {
            self.is_deafened = deafened;
        }
        if let Some(sharing) = patch.is_screen_sharing {
            self.is_screen_sharing = sharing;
        }
    }
}

/// Partial update of a participant document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantPatch {
    pub sub_room: Option<String>,
    pub name: Option<String>,
    pub is_muted: Option<bool>,
    pub is_deafened: Option<bool>,
    pub is_screen_sharing: Option<bool>,
}

fn default_sub_room() -> String {
    DEFAULT_SUB_ROOM.to_string()
}

/// `sessions/{room}`
pub fn room_path(room: &str) -> String {
    format!("sessions/{room}")
}

/// `sessions/{room}/participants/{peer}`
pub fn participant_path(room: &str, peer: &PeerId) -> String {
    format!("sessions/{room}/participants/{peer}")
}

/// `sessions/{room}/calls/{call}`
pub fn call_path(room: &str, call: &CallId) -> String {
    format!("sessions/{room}/calls/{call}")
}

/// `sessions/{room}/calls/{call}/offerCandidates` or `.../answerCandidates`
pub fn candidates_path(room: &str, call: &CallId, side: CandidateSide) -> String {
    format!("sessions/{room}/calls/{call}/{}", side.collection())
}
