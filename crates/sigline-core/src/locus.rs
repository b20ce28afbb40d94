//! Call-signaling payloads as routed by the transport.
//!
//! The backend calls a call resource a "locus". Every routed event carries
//! the complete current locus, so each one decodes into a full
//! [`CallInfo`] snapshot rather than a delta.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::SignalError;

/// Prefix of every call-signaling event type.
pub const EVENT_PREFIX: &str = "locus";

/// Opaque call identifier: the locus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `fullState.state` of the locus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocusState {
    Initializing,
    Active,
    /// The call is over for everyone.
    Inactive,
    Terminating,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantState {
    #[default]
    Idle,
    /// Alerted of the call; their device is ringing.
    Notified,
    Joined,
    Leaving,
    Left,
    Declined,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaDirection {
    #[serde(rename = "SENDRECV")]
    SendRecv,
    #[serde(rename = "SENDONLY")]
    SendOnly,
    #[serde(rename = "RECVONLY")]
    RecvOnly,
    #[default]
    Inactive,
    /// A direction this client does not know; treated as not sending.
    #[serde(other)]
    Unknown,
}

impl MediaDirection {
    pub fn is_sending(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub id: String,
    pub state: ParticipantState,
    pub audio: MediaDirection,
    pub video: MediaDirection,
}

/// Everything known about a call at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: CallId,
    pub state: LocusState,
    pub self_state: ParticipantState,
    pub dtmf_enabled: bool,
    /// Every participant except the local device.
    pub remotes: Vec<RemoteParticipant>,
}

impl CallInfo {
    /// Decode the `data` object of a routed call event.
    pub fn from_event(event: &Value) -> Result<Self, SignalError> {
        let event = LocusEvent::deserialize(event)
            .map_err(|e| SignalError::MalformedEvent(format!("locus event: {e}")))?;
        Ok(event.locus.into())
    }

    pub fn remote_joined(&self) -> bool {
        self.remotes.iter().any(|p| p.state == ParticipantState::Joined)
    }

    pub fn remote_notified(&self) -> bool {
        self.remotes.iter().any(|p| p.state == ParticipantState::Notified)
    }

    pub fn remote_declined(&self) -> bool {
        self.remotes.iter().any(|p| p.state == ParticipantState::Declined)
    }

    /// True when there is at least one remote and every one of them has left.
    pub fn all_remotes_left(&self) -> bool {
        !self.remotes.is_empty() && self.remotes.iter().all(|p| p.state == ParticipantState::Left)
    }

    /// Whether this snapshot describes a call that is already over.
    pub fn has_ended(&self) -> bool {
        matches!(
            self.self_state,
            ParticipantState::Left | ParticipantState::Declined
        ) || self.remote_declined()
            || self.state == LocusState::Inactive
            || self.all_remotes_left()
    }

    /// Whether any joined remote is sending audio.
    pub fn remote_sending_audio(&self) -> bool {
        self.joined_remotes().any(|p| p.audio.is_sending())
    }

    pub fn remote_sending_video(&self) -> bool {
        self.joined_remotes().any(|p| p.video.is_sending())
    }

    fn joined_remotes(&self) -> impl Iterator<Item = &RemoteParticipant> {
        self.remotes.iter().filter(|p| p.state == ParticipantState::Joined)
    }
}

#[derive(Deserialize)]
struct LocusEvent {
    locus: Locus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Locus {
    url: CallId,
    #[serde(default)]
    full_state: FullState,
    #[serde(rename = "self", default)]
    myself: SelfEntry,
    #[serde(default)]
    participants: Vec<ParticipantEntry>,
}

#[derive(Deserialize, Default)]
struct FullState {
    #[serde(default)]
    state: LocusState,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SelfEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    state: ParticipantState,
    #[serde(default, rename = "enableDTMF")]
    enable_dtmf: bool,
}

#[derive(Deserialize)]
struct ParticipantEntry {
    id: String,
    #[serde(default)]
    state: ParticipantState,
    #[serde(default)]
    status: MediaStatus,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MediaStatus {
    #[serde(default)]
    audio_status: MediaDirection,
    #[serde(default)]
    video_status: MediaDirection,
}

impl From<Locus> for CallInfo {
    fn from(locus: Locus) -> Self {
        let self_id = locus.myself.id;
        let remotes = locus
            .participants
            .into_iter()
            .filter(|p| self_id.as_deref() != Some(p.id.as_str()))
            .map(|p| RemoteParticipant {
                id: p.id,
                state: p.state,
                audio: p.status.audio_status,
                video: p.status.video_status,
            })
            .collect();
        Self {
            id: locus.url,
            state: locus.full_state.state,
            self_state: locus.myself.state,
            dtmf_enabled: locus.myself.enable_dtmf,
            remotes,
        }
    }
}
