// src/signaling.rs
//
// Signaling messages exchanged with the rest of the room, the channel seam
// the mesh sends them through, and an in-process relay.
//
// ─ Addressing ───────────────────────────────────────────────────────────────
//
//   Outbound targeted messages (offer / answer / ice-candidate) carry the
//   *recipient's* session id in `remoteId`.  The relay rewrites it to the
//   *sender's* session id before delivery, so every inbound `remoteId` names
//   the peer the message came from.
//
// ────────────────────────────────────────────────────────────────────────────

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::SignalError;
use crate::peer::SessionDescription;

// ─── Shared payload types ───────────────────────────────────────────────────

/// Whether a participant currently sends audio / video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl MediaState {
    pub fn new(audio_enabled: bool, video_enabled: bool) -> Self {
        Self {
            audio_enabled,
            video_enabled,
        }
    }
}

/// Identity of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Who sent an offer/answer and what they are sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: String,
    pub media_state: MediaState,
}

// ─── SignalMessage ──────────────────────────────────────────────────────────

/// Every event the mesh consumes from or produces onto the signaling channel.
///
/// ```json
/// { "event": "offer",
///   "data": { "offer": { "type": "offer", "sdp": "v=0..." },
///             "remoteId": "s1",
///             "credentials": { "userId": "u1",
///                              "mediaState": { "audioEnabled": true,
///                                              "videoEnabled": false } } } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    #[serde(rename = "user:joined")]
    UserJoined { user: UserIdentity, remote_id: String },

    #[serde(rename = "user:leave")]
    UserLeave { remote_id: String },

    #[serde(rename = "offer")]
    Offer {
        offer: SessionDescription,
        remote_id: String,
        credentials: Credentials,
    },

    #[serde(rename = "answer")]
    Answer {
        answer: SessionDescription,
        remote_id: String,
        credentials: Credentials,
    },

    #[serde(rename = "ice-candidate")]
    IceCandidate {
        candidate: RTCIceCandidateInit,
        remote_id: String,
        user_id: String,
    },

    #[serde(rename = "participant:media-update")]
    MediaUpdate {
        user_id: String,
        media_state: MediaState,
    },

    #[serde(rename = "participant:emoji:reaction")]
    Reaction { user_id: String, emoji: String },

    #[serde(rename = "participant:hand:raised")]
    HandRaised { user_id: String, raised: bool },

    #[serde(rename = "participant:join:notify")]
    JoinNotify { room_id: String, user: UserIdentity },

    #[serde(rename = "leave-room")]
    LeaveRoom { room_id: String, user_id: String },

    #[serde(rename = "user:kicked")]
    Kicked,
}

impl SignalMessage {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user:joined",
            Self::UserLeave { .. } => "user:leave",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::MediaUpdate { .. } => "participant:media-update",
            Self::Reaction { .. } => "participant:emoji:reaction",
            Self::HandRaised { .. } => "participant:hand:raised",
            Self::JoinNotify { .. } => "participant:join:notify",
            Self::LeaveRoom { .. } => "leave-room",
            Self::Kicked => "user:kicked",
        }
    }

    /// The remote session a message is scoped to, for messages that belong to
    /// one pairwise negotiation.
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::UserJoined { remote_id, .. }
            | Self::UserLeave { remote_id }
            | Self::Offer { remote_id, .. }
            | Self::Answer { remote_id, .. }
            | Self::IceCandidate { remote_id, .. } => Some(remote_id),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, SignalError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn with_remote_id(mut self, sender: &str) -> Self {
        match &mut self {
            Self::Offer { remote_id, .. }
            | Self::Answer { remote_id, .. }
            | Self::IceCandidate { remote_id, .. } => *remote_id = sender.to_string(),
            _ => {}
        }
        self
    }
}

// ─── SignalingChannel ───────────────────────────────────────────────────────

/// Outbound half of the realtime channel the mesh negotiates over.
///
/// `send` is synchronous so the leave notification can be emitted from
/// teardown paths that cannot await.
pub trait SignalingChannel: Send + Sync {
    /// Stable id of the local session on this channel.
    fn session_id(&self) -> &str;

    fn send(&self, message: SignalMessage) -> Result<(), SignalError>;
}

// ─── LoopbackHub ────────────────────────────────────────────────────────────

struct HubMember {
    room_id: Option<String>,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

/// In-process signaling relay.
///
/// Routes targeted messages to their recipient, turns join notifications into
/// `user:joined` and `leave-room` into `user:leave` for the other members of
/// the same room, and rebroadcasts media/overlay updates.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    members: Arc<Mutex<HashMap<String, HubMember>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and obtain its channel plus inbound receiver.
    pub fn connect(
        &self,
        session_id: impl Into<String>,
    ) -> (HubChannel, mpsc::UnboundedReceiver<SignalMessage>) {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.members
            .lock()
            .insert(session_id.clone(), HubMember { room_id: None, tx });
        (
            HubChannel {
                session_id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Drop a session from the relay entirely.
    pub fn disconnect(&self, session_id: &str) {
        self.members.lock().remove(session_id);
    }

    /// Deliver `user:kicked` to a session.
    pub fn kick(&self, session_id: &str) -> Result<(), SignalError> {
        self.deliver(session_id, SignalMessage::Kicked)
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    fn deliver(&self, to: &str, message: SignalMessage) -> Result<(), SignalError> {
        let members = self.members.lock();
        let member = members
            .get(to)
            .ok_or_else(|| SignalError::UnknownSession(to.to_string()))?;
        member.tx.send(message).map_err(|_| SignalError::Closed)
    }

    fn broadcast(&self, from: &str, room_id: &str, message: &SignalMessage) {
        let members = self.members.lock();
        for (id, member) in members.iter() {
            if id != from && member.room_id.as_deref() == Some(room_id) {
                let _ = member.tx.send(message.clone());
            }
        }
    }

    fn room_of(&self, session_id: &str) -> Option<String> {
        self.members
            .lock()
            .get(session_id)
            .and_then(|m| m.room_id.clone())
    }

    fn route(&self, from: &str, message: SignalMessage) -> Result<(), SignalError> {
        debug!(from, event = message.name(), "relaying signal");
        match message {
            SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. } => {
                let to = message.remote_id().unwrap_or_default().to_string();
                self.deliver(&to, message.with_remote_id(from))
            }
            SignalMessage::JoinNotify { room_id, user } => {
                if let Some(member) = self.members.lock().get_mut(from) {
                    member.room_id = Some(room_id.clone());
                }
                let joined = SignalMessage::UserJoined {
                    user,
                    remote_id: from.to_string(),
                };
                self.broadcast(from, &room_id, &joined);
                Ok(())
            }
            SignalMessage::LeaveRoom { room_id, .. } => {
                let left = SignalMessage::UserLeave {
                    remote_id: from.to_string(),
                };
                self.broadcast(from, &room_id, &left);
                if let Some(member) = self.members.lock().get_mut(from) {
                    member.room_id = None;
                }
                Ok(())
            }
            SignalMessage::MediaUpdate { .. }
            | SignalMessage::Reaction { .. }
            | SignalMessage::HandRaised { .. } => {
                if let Some(room_id) = self.room_of(from) {
                    self.broadcast(from, &room_id, &message);
                }
                Ok(())
            }
            SignalMessage::UserJoined { .. }
            | SignalMessage::UserLeave { .. }
            | SignalMessage::Kicked => {
                warn!(from, event = message.name(), "client sent a relay-only event; dropped");
                Ok(())
            }
        }
    }
}

/// One session's handle onto a [`LoopbackHub`].
#[derive(Clone)]
pub struct HubChannel {
    session_id: String,
    hub: LoopbackHub,
}

impl SignalingChannel for HubChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        self.hub.route(&self.session_id, message)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
