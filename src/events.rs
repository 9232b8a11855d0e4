// src/events.rs
//
// Event bus for a mesh session.
//
// Every externally observable change of the roster projection or of the
// local session (participant lifecycle, stream arrival, media toggles,
// overlays, connection teardown, screen sharing, user-visible notices) is a
// `MeshEvent`.  A single `EventBus` backed by a `tokio::sync::broadcast`
// channel fans out each event to every consumer: the UI layer, tests, and
// the demo binary's logger.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::roster::Overlays;
use crate::signaling::MediaState;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "participant.joined")]
    ParticipantJoined,
    #[serde(rename = "participant.left")]
    ParticipantLeft,
    #[serde(rename = "stream.attached")]
    StreamAttached,
    #[serde(rename = "media.updated")]
    MediaUpdated,
    #[serde(rename = "overlay.changed")]
    OverlayChanged,
    #[serde(rename = "peer.closed")]
    PeerClosed,
    #[serde(rename = "screen_share.started")]
    ScreenShareStarted,
    #[serde(rename = "screen_share.stopped")]
    ScreenShareStopped,
    #[serde(rename = "notice")]
    Notice,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParticipantJoined => "participant.joined",
            Self::ParticipantLeft => "participant.left",
            Self::StreamAttached => "stream.attached",
            Self::MediaUpdated => "media.updated",
            Self::OverlayChanged => "overlay.changed",
            Self::PeerClosed => "peer.closed",
            Self::ScreenShareStarted => "screen_share.started",
            Self::ScreenShareStopped => "screen_share.stopped",
            Self::Notice => "notice",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantPayload {
    pub user_id: String,
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamPayload {
    pub user_id: String,
    pub remote_id: String,
    pub stream_id: String,
    pub kind: String, // "audio" | "video"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaPayload {
    pub user_id: String,
    pub media_state: MediaState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayPayload {
    pub user_id: String,
    pub overlays: Overlays,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerPayload {
    pub remote_id: String,
    pub reason: String, // "left" | "ice_failed" | "ice_disconnected" | "negotiation_failed"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScreenSharePayload {
    pub track_id: String,
}

/// A message meant for the user (refusals, media failures).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoticePayload {
    pub code: String,
    pub message: String,
}

/// Type-safe union of all possible payloads.  Payload fields are
/// disjoint enough that, with unknown fields denied, the untagged form
/// reads back as the variant it was written from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Participant(ParticipantPayload),
    Stream(StreamPayload),
    Media(MediaPayload),
    Overlay(OverlayPayload),
    Peer(PeerPayload),
    ScreenShare(ScreenSharePayload),
    Notice(NoticePayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event, ready for serialisation.
///
/// ```json
/// {
///   "id":         "evt_a1b2c3d4",
///   "type":       "stream.attached",
///   "room_id":    "room-1",
///   "created_at": "2025-06-15T14:22:33.123Z",
///   "data": {
///     "user_id":   "u1",
///     "remote_id": "s1",
///     "stream_id": "...",
///     "kind":      "video"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub room_id: String,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    pub data: EventPayload,
}

impl MeshEvent {
    // ── Constructors ────────────────────────────────────────────────────

    pub fn participant_joined(room_id: &str, user_id: &str, remote_id: Option<&str>) -> Self {
        Self::new(
            room_id,
            EventType::ParticipantJoined,
            EventPayload::Participant(ParticipantPayload {
                user_id: user_id.to_string(),
                remote_id: remote_id.map(str::to_string),
            }),
        )
    }

    pub fn participant_left(room_id: &str, user_id: &str, remote_id: Option<&str>) -> Self {
        Self::new(
            room_id,
            EventType::ParticipantLeft,
            EventPayload::Participant(ParticipantPayload {
                user_id: user_id.to_string(),
                remote_id: remote_id.map(str::to_string),
            }),
        )
    }

    pub fn stream_attached(
        room_id: &str,
        user_id: &str,
        remote_id: &str,
        stream_id: &str,
        kind: &str,
    ) -> Self {
        Self::new(
            room_id,
            EventType::StreamAttached,
            EventPayload::Stream(StreamPayload {
                user_id: user_id.to_string(),
                remote_id: remote_id.to_string(),
                stream_id: stream_id.to_string(),
                kind: kind.to_string(),
            }),
        )
    }

    pub fn media_updated(room_id: &str, user_id: &str, media_state: MediaState) -> Self {
        Self::new(
            room_id,
            EventType::MediaUpdated,
            EventPayload::Media(MediaPayload {
                user_id: user_id.to_string(),
                media_state,
            }),
        )
    }

    pub fn overlay_changed(room_id: &str, user_id: &str, overlays: Overlays) -> Self {
        Self::new(
            room_id,
            EventType::OverlayChanged,
            EventPayload::Overlay(OverlayPayload {
                user_id: user_id.to_string(),
                overlays,
            }),
        )
    }

    pub fn peer_closed(room_id: &str, remote_id: &str, reason: &str) -> Self {
        Self::new(
            room_id,
            EventType::PeerClosed,
            EventPayload::Peer(PeerPayload {
                remote_id: remote_id.to_string(),
                reason: reason.to_string(),
            }),
        )
    }

    pub fn screen_share_started(room_id: &str, track_id: &str) -> Self {
        Self::new(
            room_id,
            EventType::ScreenShareStarted,
            EventPayload::ScreenShare(ScreenSharePayload {
                track_id: track_id.to_string(),
            }),
        )
    }

    pub fn screen_share_stopped(room_id: &str, track_id: &str) -> Self {
        Self::new(
            room_id,
            EventType::ScreenShareStopped,
            EventPayload::ScreenShare(ScreenSharePayload {
                track_id: track_id.to_string(),
            }),
        )
    }

    pub fn notice(room_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            room_id,
            EventType::Notice,
            EventPayload::Notice(NoticePayload {
                code: code.to_string(),
                message: message.into(),
            }),
        )
    }

    // ── Private ─────────────────────────────────────────────────────────

    fn new(room_id: &str, event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            room_id: room_id.to_string(),
            created_at: Utc::now(),
            data,
        }
    }

    /// The user an event is about, when it is about one.
    pub fn user_id(&self) -> Option<&str> {
        match &self.data {
            EventPayload::Participant(p) => Some(&p.user_id),
            EventPayload::Stream(p) => Some(&p.user_id),
            EventPayload::Media(p) => Some(&p.user_id),
            EventPayload::Overlay(p) => Some(&p.user_id),
            EventPayload::Peer(_) | EventPayload::ScreenShare(_) | EventPayload::Notice(_) => None,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `MeshEvent`.
///
/// Subscribers that lag more than the capacity skip events (same semantic as
/// `broadcast::RecvError::Lagged`).  Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap.max(1));
        Self { tx }
    }

    /// Publish an event.  Returns the number of active subscribers that will
    /// receive it.  Silently succeeds even if there are no subscribers.
    pub fn emit(&self, event: MeshEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Each receiver gets every event published *after* this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serialization() {
        let json = serde_json::to_string(&EventType::StreamAttached).unwrap();
        assert_eq!(json, "\"stream.attached\"");

        let parsed: EventType = serde_json::from_str("\"screen_share.stopped\"").unwrap();
        assert_eq!(parsed, EventType::ScreenShareStopped);
    }

    #[test]
    fn event_envelope_json() {
        let evt = MeshEvent::peer_closed("room-1", "s1", "ice_failed");
        let json = serde_json::to_string_pretty(&evt).unwrap();
        assert!(json.contains("\"type\": \"peer.closed\""));
        assert!(json.contains("\"remote_id\": \"s1\""));
        assert!(evt.id.starts_with("evt_"));
    }

    #[test]
    fn payloads_read_back_as_written() {
        let events = [
            MeshEvent::participant_joined("r1", "u1", Some("s1")),
            MeshEvent::stream_attached("r1", "u1", "s1", "m1", "audio"),
            MeshEvent::media_updated("r1", "u1", MediaState::new(true, false)),
            MeshEvent::overlay_changed("r1", "u1", Overlays::default()),
            MeshEvent::peer_closed("r1", "s1", "left"),
            MeshEvent::screen_share_started("r1", "t1"),
            MeshEvent::notice("r1", "no_audience", "nobody to share with"),
        ];
        for evt in events {
            let json = serde_json::to_string(&evt).unwrap();
            let back: MeshEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back.data, evt.data, "{json}");
        }
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let n = bus.emit(MeshEvent::notice("r1", "test", "hello"));
        assert_eq!(n, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::with_capacity(4);
        assert_eq!(bus.emit(MeshEvent::screen_share_started("r1", "t1")), 0);
    }

    #[test]
    fn user_id_extraction() {
        let e = MeshEvent::participant_joined("room-42", "u7", Some("s7"));
        assert_eq!(e.user_id(), Some("u7"));

        let e = MeshEvent::notice("room-42", "x", "y");
        assert_eq!(e.user_id(), None);
    }
}
