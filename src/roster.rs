// src/roster.rs
//
// Participant Roster Projection: who is in the room joined with what each
// peer is currently sending.  Every change is published on the event bus.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::events::{EventBus, MeshEvent};
use crate::peer::{RemoteStream, RemoteTrack};
use crate::signaling::{MediaState, UserIdentity};

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Presentation flags layered on a participant.  Each one resets on its own
/// after the configured delay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlays {
    pub hand_raised: bool,
    pub reaction: Option<String>,
    pub pinned: bool,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub user: UserIdentity,
    /// Session id of this participant's connection, once known.
    pub remote_id: Option<String>,
    pub media_state: MediaState,
    pub stream: Option<RemoteStream>,
    pub overlays: Overlays,
}

impl Participant {
    pub fn new(user: UserIdentity) -> Self {
        Self {
            user,
            remote_id: None,
            media_state: MediaState::default(),
            stream: None,
            overlays: Overlays::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }
}

/// How a `user:joined` notification changed the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Added,
    /// Already listed (e.g. from the fetched roster) and now reachable
    /// under a new session id.
    Rebound { previous: Option<String> },
    /// Same user, same session: nothing to do.
    Duplicate,
}

impl JoinOutcome {
    pub fn needs_offer(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OverlayKind {
    Hand,
    Reaction,
    Pin,
}

#[derive(Default)]
struct RosterState {
    participants: Vec<Participant>,
    /// Bumped on every overlay set so a pending reset can tell it is stale.
    overlay_epochs: HashMap<(String, OverlayKind), u64>,
}

impl RosterState {
    fn find_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user.id == user_id)
    }

    fn find_by_remote_mut(&mut self, remote_id: &str) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.remote_id.as_deref() == Some(remote_id))
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// The remote participants of one room, excluding the local user.
pub struct Roster {
    room_id: String,
    bus: EventBus,
    overlay_reset: Duration,
    state: RwLock<RosterState>,
    preview: watch::Sender<Option<RemoteStream>>,
}

impl Roster {
    pub fn new(room_id: impl Into<String>, bus: EventBus, overlay_reset: Duration) -> Arc<Self> {
        let (preview, _) = watch::channel(None);
        Arc::new(Self {
            room_id: room_id.into(),
            bus,
            overlay_reset,
            state: RwLock::new(RosterState::default()),
            preview,
        })
    }

    /// Replace the whole roster with a freshly fetched participant list.
    pub fn replace_all(&self, users: Vec<UserIdentity>) {
        let mut state = self.state.write();
        state.participants = users.into_iter().map(Participant::new).collect();
        state.overlay_epochs.clear();
        debug!(room_id = %self.room_id, count = state.participants.len(), "roster replaced");
    }

    /// Add a participant announced by `user:joined`.
    pub fn on_user_joined(&self, user: UserIdentity, remote_id: &str) -> JoinOutcome {
        let mut state = self.state.write();
        if let Some(existing) = state.find_mut(&user.id) {
            if existing.remote_id.as_deref() == Some(remote_id) {
                return JoinOutcome::Duplicate;
            }
            let previous = existing.remote_id.replace(remote_id.to_string());
            existing.stream = None;
            return JoinOutcome::Rebound { previous };
        }
        let user_id = user.id.clone();
        let mut participant = Participant::new(user);
        participant.remote_id = Some(remote_id.to_string());
        state.participants.push(participant);
        drop(state);

        self.bus
            .emit(MeshEvent::participant_joined(&self.room_id, &user_id, Some(remote_id)));
        JoinOutcome::Added
    }

    /// Remove the participant bound to `remote_id`.
    pub fn remove_by_remote(&self, remote_id: &str) -> Option<Participant> {
        let removed = {
            let mut state = self.state.write();
            let idx = state
                .participants
                .iter()
                .position(|p| p.remote_id.as_deref() == Some(remote_id))?;
            let removed = state.participants.remove(idx);
            state.overlay_epochs.retain(|(user_id, _), _| *user_id != removed.user.id);
            removed
        };
        self.bus.emit(MeshEvent::participant_left(
            &self.room_id,
            removed.id(),
            Some(remote_id),
        ));
        Some(removed)
    }

    /// Record which session a user negotiates from (learned from offer or
    /// answer credentials).  Users missing from the roster are added.
    pub fn bind_remote(&self, user_id: &str, remote_id: &str) {
        let mut state = self.state.write();
        if let Some(p) = state.find_mut(user_id) {
            p.remote_id = Some(remote_id.to_string());
            return;
        }
        let mut participant = Participant::new(UserIdentity::new(user_id, ""));
        participant.remote_id = Some(remote_id.to_string());
        state.participants.push(participant);
        drop(state);

        self.bus
            .emit(MeshEvent::participant_joined(&self.room_id, user_id, Some(remote_id)));
    }

    /// Attach a remote track to the participant bound to `remote_id`.
    ///
    /// A track under the participant's current stream id joins that stream;
    /// a track under a new stream id replaces the stream.
    pub fn on_remote_track(&self, remote_id: &str, track: RemoteTrack) -> bool {
        let (user_id, stream) = {
            let mut state = self.state.write();
            let Some(p) = state.find_by_remote_mut(remote_id) else {
                debug!(remote_id, "remote track for unknown participant");
                return false;
            };
            if p.stream.as_ref().map_or(true, |s| s.stream_id != track.stream_id) {
                p.stream = Some(RemoteStream::new(track.stream_id.clone()));
            }
            let stream = p
                .stream
                .get_or_insert_with(|| RemoteStream::new(track.stream_id.clone()));
            stream.insert(track.clone());
            (p.user.id.clone(), stream.clone())
        };

        self.bus.emit(MeshEvent::stream_attached(
            &self.room_id,
            &user_id,
            remote_id,
            &stream.stream_id,
            track.kind.as_str(),
        ));
        self.preview.send_replace(Some(stream));
        true
    }

    pub fn on_media_state_update(&self, user_id: &str, media_state: MediaState) -> bool {
        {
            let mut state = self.state.write();
            let Some(p) = state.find_mut(user_id) else {
                return false;
            };
            p.media_state = media_state;
        }
        self.bus
            .emit(MeshEvent::media_updated(&self.room_id, user_id, media_state));
        true
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<Participant> {
        self.state.read().participants.clone()
    }

    pub fn get(&self, user_id: &str) -> Option<Participant> {
        self.state
            .read()
            .participants
            .iter()
            .find(|p| p.user.id == user_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest remote stream, for a local preview tile.
    pub fn preview(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.preview.subscribe()
    }

    // ── Overlays ────────────────────────────────────────────────────────

    pub fn raise_hand(self: &Arc<Self>, user_id: &str, raised: bool) -> bool {
        self.set_overlay(user_id, OverlayKind::Hand, |o| o.hand_raised = raised, raised)
    }

    pub fn react(self: &Arc<Self>, user_id: &str, emoji: &str) -> bool {
        let emoji = emoji.to_string();
        self.set_overlay(user_id, OverlayKind::Reaction, |o| o.reaction = Some(emoji), true)
    }

    pub fn pin(self: &Arc<Self>, user_id: &str, pinned: bool) -> bool {
        self.set_overlay(user_id, OverlayKind::Pin, |o| o.pinned = pinned, pinned)
    }

    fn set_overlay(
        self: &Arc<Self>,
        user_id: &str,
        kind: OverlayKind,
        apply: impl FnOnce(&mut Overlays),
        schedule_reset: bool,
    ) -> bool {
        let (overlays, epoch) = {
            let mut state = self.state.write();
            let Some(p) = state.find_mut(user_id) else {
                return false;
            };
            apply(&mut p.overlays);
            let overlays = p.overlays.clone();
            let epoch = state
                .overlay_epochs
                .entry((user_id.to_string(), kind))
                .and_modify(|e| *e += 1)
                .or_insert(1);
            (overlays, *epoch)
        };
        self.bus
            .emit(MeshEvent::overlay_changed(&self.room_id, user_id, overlays));

        if schedule_reset {
            let roster = Arc::downgrade(self);
            let user_id = user_id.to_string();
            let delay = self.overlay_reset;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(roster) = roster.upgrade() {
                    roster.reset_overlay(&user_id, kind, epoch);
                }
            });
        }
        true
    }

    fn reset_overlay(&self, user_id: &str, kind: OverlayKind, epoch: u64) {
        let overlays = {
            let mut state = self.state.write();
            let current = state.overlay_epochs.get(&(user_id.to_string(), kind)).copied();
            if current != Some(epoch) {
                return;
            }
            let Some(p) = state.find_mut(user_id) else {
                return;
            };
            match kind {
                OverlayKind::Hand => p.overlays.hand_raised = false,
                OverlayKind::Reaction => p.overlays.reaction = None,
                OverlayKind::Pin => p.overlays.pinned = false,
            }
            p.overlays.clone()
        };
        self.bus
            .emit(MeshEvent::overlay_changed(&self.room_id, user_id, overlays));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
