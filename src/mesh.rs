// src/mesh.rs
//
// Mesh session: everything one participant needs while inside a room.
//
// Constructed on room entry, torn down on exit; there is no process-wide
// state.  Two background pumps run per session:
//
//   * the peer-event pump turns connection callbacks (local candidates,
//     remote tracks, ICE state) into signaling and roster updates;
//   * the signal pump dispatches inbound signals, giving every remote id its
//     own sequential lane so a slow negotiation never holds up another peer.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::events::{EventBus, MeshEvent};
use crate::media::{LocalMedia, MediaSource};
use crate::negotiation::Negotiator;
use crate::peer::{PeerEvent, PeerFactory, PeerSignal};
use crate::registry::{close_detached, PeerEntry, PeerRegistry};
use crate::roster::{JoinOutcome, Roster};
use crate::signaling::{MediaState, SignalMessage, SignalingChannel, UserIdentity};

/// Collaborators a session is built from.
pub struct SessionParts {
    pub room_id: String,
    pub local_user: UserIdentity,
    pub signaling: Arc<dyn SignalingChannel>,
    pub peers: Arc<dyn PeerFactory>,
    pub media_source: Arc<dyn MediaSource>,
}

pub struct MeshSession {
    negotiator: Arc<Negotiator>,
    bus: EventBus,
    shutdown: CancellationToken,
    left: AtomicBool,
}

impl MeshSession {
    /// Build the session and start its peer-event pump.  Must be called
    /// from within a tokio runtime.
    pub fn start(parts: SessionParts, cfg: &MeshConfig) -> Arc<Self> {
        let bus = EventBus::with_capacity(cfg.event_capacity);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let negotiator = Arc::new(Negotiator {
            registry: Arc::new(PeerRegistry::new(
                parts.peers,
                peer_tx,
                cfg.candidate_buffer_limit,
            )),
            roster: Roster::new(parts.room_id.clone(), bus.clone(), cfg.overlay_reset),
            media: Arc::new(LocalMedia::new()),
            room_id: parts.room_id,
            local_user: parts.local_user,
            signaling: parts.signaling,
            media_source: parts.media_source,
            bus: bus.clone(),
            shutdown: shutdown.clone(),
            screen: tokio::sync::Mutex::new(()),
        });

        let session = Arc::new(Self {
            negotiator,
            bus,
            shutdown,
            left: AtomicBool::new(false),
        });
        session.spawn_peer_pump(peer_rx);

        info!(
            room_id = %session.room_id(),
            user_id = %session.local_user().id,
            session_id = %session.session_id(),
            "mesh session started"
        );
        session
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn room_id(&self) -> &str {
        &self.negotiator.room_id
    }

    pub fn local_user(&self) -> &UserIdentity {
        &self.negotiator.local_user
    }

    pub fn session_id(&self) -> &str {
        self.negotiator.signaling.session_id()
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.negotiator.roster
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.negotiator.registry
    }

    pub fn media(&self) -> &Arc<LocalMedia> {
        &self.negotiator.media
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.bus.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::SessionClosed);
        }
        Ok(())
    }

    // ── Room entry ──────────────────────────────────────────────────────

    /// Acquire the initial microphone + camera set.
    pub async fn init_media(&self) -> Result<MediaState, MeshError> {
        self.ensure_active()?;
        match self.negotiator.media_source.acquire_user_media().await {
            Ok(stream) => {
                let state = self.media().install(stream);
                info!(audio = state.audio_enabled, video = state.video_enabled, "local media ready");
                Ok(state)
            }
            Err(e) => Err(self.negotiator.notify(e.into())),
        }
    }

    /// Install the fetched participant list and announce ourselves.  Members
    /// already in the room open the connections towards us.
    pub fn enter(&self, participants: Vec<UserIdentity>) -> Result<(), MeshError> {
        self.ensure_active()?;
        let me = self.local_user().clone();
        let others: Vec<UserIdentity> = participants
            .into_iter()
            .filter(|u| u.id != me.id)
            .collect();
        self.roster().replace_all(others);

        self.negotiator.signaling.send(SignalMessage::JoinNotify {
            room_id: self.room_id().to_string(),
            user: me,
        })?;
        info!(room_id = %self.room_id(), participants = self.roster().len(), "entered room");
        Ok(())
    }

    // ── Roster deltas ───────────────────────────────────────────────────

    /// A newcomer joined: list them and send them an offer.  The member
    /// already in the room always initiates.
    pub async fn on_user_joined(&self, user: UserIdentity, remote_id: &str) -> Result<(), MeshError> {
        self.ensure_active()?;
        if user.id == self.local_user().id {
            return Ok(());
        }
        let user_id = user.id.clone();
        let outcome = self.roster().on_user_joined(user, remote_id);
        if !outcome.needs_offer() {
            debug!(remote_id, user_id = %user_id, "duplicate join ignored");
            return Ok(());
        }
        if let JoinOutcome::Rebound {
            previous: Some(previous),
        } = &outcome
        {
            if self.registry().close(previous).await {
                self.bus
                    .emit(MeshEvent::peer_closed(self.room_id(), previous, "rejoined"));
            }
        }

        info!(remote_id, user_id = %user_id, "participant joined");
        self.negotiator.initiate_offer(remote_id).await
    }

    /// A participant left: drop them from the roster and close their
    /// connection.
    pub async fn on_user_left(&self, remote_id: &str) {
        let removed = self.roster().remove_by_remote(remote_id);
        let closed = self.registry().close(remote_id).await;
        if closed {
            self.bus
                .emit(MeshEvent::peer_closed(self.room_id(), remote_id, "left"));
        }
        info!(
            remote_id,
            user_id = removed.as_ref().map(|p| p.id()).unwrap_or("-"),
            closed,
            "participant left"
        );
    }

    // ── Inbound signals ─────────────────────────────────────────────────

    /// Dispatch one inbound signal.  Signals arriving after leave are
    /// ignored.
    pub async fn handle_signal(&self, message: SignalMessage) -> Result<(), MeshError> {
        if self.is_closed() {
            debug!(event = message.name(), "signal after leave ignored");
            return Ok(());
        }

        match message {
            SignalMessage::UserJoined { user, remote_id } => {
                self.on_user_joined(user, &remote_id).await
            }
            SignalMessage::UserLeave { remote_id } => {
                self.on_user_left(&remote_id).await;
                Ok(())
            }
            SignalMessage::Offer {
                offer,
                remote_id,
                credentials,
            } => {
                self.negotiator
                    .handle_incoming_offer(offer, &remote_id, credentials)
                    .await
            }
            SignalMessage::Answer {
                answer,
                remote_id,
                credentials,
            } => {
                self.negotiator
                    .handle_incoming_answer(answer, &remote_id, credentials)
                    .await
            }
            SignalMessage::IceCandidate {
                candidate,
                remote_id,
                ..
            } => {
                match self.registry().add_candidate(&remote_id, candidate).await {
                    Ok(disposition) => debug!(%remote_id, ?disposition, "remote candidate"),
                    Err(e) => warn!(%remote_id, error = %e, "remote candidate rejected"),
                }
                Ok(())
            }
            SignalMessage::MediaUpdate {
                user_id,
                media_state,
            } => {
                self.roster().on_media_state_update(&user_id, media_state);
                Ok(())
            }
            SignalMessage::Reaction { user_id, emoji } => {
                self.roster().react(&user_id, &emoji);
                Ok(())
            }
            SignalMessage::HandRaised { user_id, raised } => {
                self.roster().raise_hand(&user_id, raised);
                Ok(())
            }
            SignalMessage::Kicked => {
                warn!(room_id = %self.room_id(), "removed from the room");
                self.bus.emit(MeshEvent::notice(
                    self.room_id(),
                    "kicked",
                    "You have been removed from the room.",
                ));
                self.leave().await;
                Ok(())
            }
            SignalMessage::JoinNotify { .. } | SignalMessage::LeaveRoom { .. } => {
                debug!(event = message.name(), "outbound-only signal ignored");
                Ok(())
            }
        }
    }

    /// Consume inbound signals until the session leaves or `rx` closes.
    pub fn spawn_signal_pump(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SignalMessage>,
    ) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut lanes: HashMap<String, mpsc::UnboundedSender<SignalMessage>> = HashMap::new();
            loop {
                let message = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(session) = session.upgrade() else { break };

                let Some(remote_id) = message.remote_id().map(str::to_string) else {
                    if let Err(e) = session.handle_signal(message).await {
                        warn!(code = e.code(), error = %e, "signal handling failed");
                    }
                    continue;
                };

                let leaving = matches!(message, SignalMessage::UserLeave { .. });
                let lane = lanes
                    .entry(remote_id.clone())
                    .or_insert_with(|| session.spawn_lane(remote_id.clone()));
                if lane.send(message).is_err() {
                    debug!(%remote_id, "signal lane already stopped");
                }
                // the lane finishes what it has queued, then exits
                if leaving {
                    lanes.remove(&remote_id);
                }
            }
            debug!("signal pump stopped");
        })
    }

    fn spawn_lane(self: &Arc<Self>, remote_id: String) -> mpsc::UnboundedSender<SignalMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(session) = session.upgrade() else { break };
                if let Err(e) = session.handle_signal(message).await {
                    warn!(%remote_id, code = e.code(), error = %e, "signal handling failed");
                }
            }
        });
        tx
    }

    // ── Peer events ─────────────────────────────────────────────────────

    fn spawn_peer_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<PeerSignal>) {
        let session = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    signal = rx.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                let Some(session) = session.upgrade() else { break };
                session.handle_peer_signal(signal).await;
            }
            debug!("peer event pump stopped");
        });
    }

    /// React to a connection callback.  Events from a connection that has
    /// since been closed or replaced are dropped.
    pub async fn handle_peer_signal(&self, signal: PeerSignal) {
        let PeerSignal {
            remote_id,
            generation,
            event,
        } = signal;
        if !self.registry().holds(&remote_id, generation) {
            debug!(%remote_id, generation, "event from a stale connection dropped");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::IceCandidate {
                    candidate,
                    remote_id: remote_id.clone(),
                    user_id: self.local_user().id.clone(),
                };
                if let Err(e) = self.negotiator.signaling.send(message) {
                    warn!(%remote_id, error = %e, "could not send local candidate");
                }
            }
            PeerEvent::RemoteTrack(track) => {
                info!(%remote_id, stream_id = %track.stream_id, kind = track.kind.as_str(), "remote track attached");
                self.roster().on_remote_track(&remote_id, track);
            }
            PeerEvent::IceConnectionState(state) => {
                let reason = match state {
                    RTCIceConnectionState::Failed => "ice_failed",
                    RTCIceConnectionState::Disconnected => "ice_disconnected",
                    _ => {
                        debug!(%remote_id, %state, "ice state");
                        return;
                    }
                };
                // No reconnection: the participant stays listed until their
                // leave arrives.
                if self.registry().close_if_current(&remote_id, generation).await {
                    warn!(%remote_id, %state, "connection lost; closed");
                    self.bus
                        .emit(MeshEvent::peer_closed(self.room_id(), &remote_id, reason));
                }
            }
        }
    }

    // ── Local controls ──────────────────────────────────────────────────

    pub fn toggle_audio(&self) -> Option<MediaState> {
        let state = self.media().toggle_audio()?;
        self.broadcast_media_state(state);
        Some(state)
    }

    /// Toggle the camera.  While sharing the screen this ends the share
    /// instead, bringing the camera back as it was.
    pub async fn toggle_video(&self) -> Result<Option<MediaState>, MeshError> {
        self.ensure_active()?;
        if self.media().is_screen_sharing() {
            self.negotiator.stop_screen_share().await?;
            return Ok(Some(self.media().media_state()));
        }
        let Some(state) = self.media().toggle_video() else {
            return Ok(None);
        };
        self.broadcast_media_state(state);
        Ok(Some(state))
    }

    fn broadcast_media_state(&self, media_state: MediaState) {
        let user_id = self.local_user().id.clone();
        if let Err(e) = self.negotiator.signaling.send(SignalMessage::MediaUpdate {
            user_id: user_id.clone(),
            media_state,
        }) {
            warn!(error = %e, "could not broadcast media state");
        }
        self.bus
            .emit(MeshEvent::media_updated(self.room_id(), &user_id, media_state));
    }

    pub async fn start_screen_share(&self) -> Result<(), MeshError> {
        self.ensure_active()?;
        self.negotiator.start_screen_share().await
    }

    pub async fn stop_screen_share(&self) -> Result<(), MeshError> {
        self.ensure_active()?;
        self.negotiator.stop_screen_share().await
    }

    pub fn send_reaction(&self, emoji: &str) -> Result<(), MeshError> {
        self.ensure_active()?;
        self.negotiator.signaling.send(SignalMessage::Reaction {
            user_id: self.local_user().id.clone(),
            emoji: emoji.to_string(),
        })?;
        Ok(())
    }

    pub fn raise_hand(&self, raised: bool) -> Result<(), MeshError> {
        self.ensure_active()?;
        self.negotiator.signaling.send(SignalMessage::HandRaised {
            user_id: self.local_user().id.clone(),
            raised,
        })?;
        Ok(())
    }

    /// Pin a participant's tile locally.
    pub fn pin(&self, user_id: &str, pinned: bool) -> bool {
        self.roster().pin(user_id, pinned)
    }

    // ── Leaving ─────────────────────────────────────────────────────────

    /// Leave the room and wait for every connection to close.
    pub async fn leave(&self) {
        if let Some(detached) = self.begin_leave() {
            close_detached(detached).await;
            info!(room_id = %self.room_id(), "left room");
        }
    }

    /// Leave the room without waiting.  Connections close in the background
    /// when a runtime is available.
    pub fn abort(&self) {
        let Some(detached) = self.begin_leave() else {
            return;
        };
        if detached.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_detached(detached));
            }
            Err(_) => warn!(count = detached.len(), "no runtime; peer connections dropped unclosed"),
        }
    }

    /// The synchronous part of leaving: after this returns the registry is
    /// empty, the leave notification is sent and local tracks are stopped.
    fn begin_leave(&self) -> Option<Vec<Arc<PeerEntry>>> {
        if self.left.swap(true, Ordering::AcqRel) {
            return None;
        }
        // before stopping tracks, so no screen-end watcher reacts to it
        self.shutdown.cancel();

        let detached = self.registry().detach_all();
        if let Err(e) = self.negotiator.signaling.send(SignalMessage::LeaveRoom {
            room_id: self.room_id().to_string(),
            user_id: self.local_user().id.clone(),
        }) {
            warn!(error = %e, "could not send leave notification");
        }
        self.media().stop_all();
        info!(room_id = %self.room_id(), peers = detached.len(), "leaving room");
        Some(detached)
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        self.abort();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
