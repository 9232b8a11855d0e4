// src/negotiation.rs
//
// Negotiation Engine: offer/answer exchange per remote id and in-place
// video track replacement across every connection.
//
// ─ Failure containment ──────────────────────────────────────────────────────
//
//   A failed step closes that one connection (only if it is still the
//   registered generation) and returns an error scoped to its remote id.
//   A step that fails because the connection was closed underneath it,
//   e.g. the participant left mid-offer, is abandoned quietly.
//
// ────────────────────────────────────────────────────────────────────────────

use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::{MeshError, PeerError};
use crate::events::{EventBus, MeshEvent};
use crate::media::{LocalMedia, LocalTrack, MediaSource};
use crate::peer::SessionDescription;
use crate::registry::{PeerEntry, PeerRegistry};
use crate::roster::Roster;
use crate::signaling::{Credentials, SignalMessage, SignalingChannel, UserIdentity};

pub struct Negotiator {
    pub(crate) room_id: String,
    pub(crate) local_user: UserIdentity,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) signaling: Arc<dyn SignalingChannel>,
    pub(crate) media: Arc<LocalMedia>,
    pub(crate) media_source: Arc<dyn MediaSource>,
    pub(crate) roster: Arc<Roster>,
    pub(crate) bus: EventBus,
    pub(crate) shutdown: CancellationToken,
    /// Serialises screen-share start/stop.
    pub(crate) screen: tokio::sync::Mutex<()>,
}

impl Negotiator {
    /// What we tell a peer about ourselves alongside an offer or answer.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user_id: self.local_user.id.clone(),
            media_state: self.media.media_state(),
        }
    }

    // ── Offer / answer ──────────────────────────────────────────────────

    /// Open a connection to `remote_id`, attach local media and send it an
    /// offer.
    pub async fn initiate_offer(&self, remote_id: &str) -> Result<(), MeshError> {
        let entry = self
            .registry
            .ensure(remote_id)
            .await
            .map_err(|e| MeshError::peer(remote_id, e))?;

        let result = async {
            let negotiation = entry.begin().await;
            // tracks go on before the offer so the SDP advertises them
            negotiation.attach_tracks(&self.media).await?;
            let offer = negotiation.link().create_offer().await?;
            negotiation.link().set_local_description(offer.clone()).await?;
            Ok::<_, PeerError>(offer)
        }
        .await;

        let Some(offer) = self.settle(&entry, result).await? else {
            return Ok(());
        };
        if !self.registry.is_current(&entry) {
            debug!(remote_id, "connection closed before offer was sent");
            return Ok(());
        }

        self.signaling.send(SignalMessage::Offer {
            offer,
            remote_id: remote_id.to_string(),
            credentials: self.credentials(),
        })?;
        info!(remote_id, generation = entry.generation(), "offer sent");
        Ok(())
    }

    /// Answer an offer from `from_id`.
    ///
    /// The sender's media state is recorded before anything is awaited, so
    /// it is known before their stream arrives.
    pub async fn handle_incoming_offer(
        &self,
        offer: SessionDescription,
        from_id: &str,
        credentials: Credentials,
    ) -> Result<(), MeshError> {
        self.roster.bind_remote(&credentials.user_id, from_id);
        self.roster
            .on_media_state_update(&credentials.user_id, credentials.media_state);

        // Both sides offered at once: the lower session id keeps its offer,
        // the higher one drops its own and answers.
        if let Some(existing) = self.registry.get(from_id) {
            if existing.link().signaling_state() == RTCSignalingState::HaveLocalOffer {
                if self.signaling.session_id() < from_id {
                    warn!(remote_id = from_id, "offer collision; keeping local offer");
                    return Ok(());
                }
                info!(remote_id = from_id, "offer collision; answering remote offer");
                self.registry.close_keeping_candidates(from_id).await;
            }
        }

        let entry = self
            .registry
            .ensure(from_id)
            .await
            .map_err(|e| MeshError::peer(from_id, e))?;

        let result = async {
            let negotiation = entry.begin().await;
            negotiation.attach_tracks(&self.media).await?;
            self.registry
                .apply_remote_description(&negotiation, offer)
                .await?;
            let answer = negotiation.link().create_answer().await?;
            negotiation.link().set_local_description(answer.clone()).await?;
            Ok::<_, PeerError>(answer)
        }
        .await;

        let Some(answer) = self.settle(&entry, result).await? else {
            return Ok(());
        };
        if !self.registry.is_current(&entry) {
            return Ok(());
        }

        self.signaling.send(SignalMessage::Answer {
            answer,
            remote_id: from_id.to_string(),
            credentials: self.credentials(),
        })?;
        info!(remote_id = from_id, user_id = %credentials.user_id, "answer sent");
        Ok(())
    }

    /// Apply an answer to the offer we sent `from_id`.
    ///
    /// An answer with no connection to land on (the peer left, or the
    /// connection was already torn down) is ignored.
    pub async fn handle_incoming_answer(
        &self,
        answer: SessionDescription,
        from_id: &str,
        credentials: Credentials,
    ) -> Result<(), MeshError> {
        let Some(entry) = self.registry.get(from_id) else {
            debug!(remote_id = from_id, "answer for unknown peer ignored");
            return Ok(());
        };

        let result = async {
            let negotiation = entry.begin().await;
            let state = negotiation.link().signaling_state();
            if state != RTCSignalingState::HaveLocalOffer {
                warn!(remote_id = from_id, %state, "answer without a pending offer ignored");
                return Ok::<_, PeerError>(false);
            }
            self.registry
                .apply_remote_description(&negotiation, answer)
                .await?;
            Ok::<_, PeerError>(true)
        }
        .await;

        let Some(applied) = self.settle(&entry, result).await? else {
            return Ok(());
        };
        // the sender's media state is current even when the SDP was stale
        self.roster.bind_remote(&credentials.user_id, from_id);
        self.roster
            .on_media_state_update(&credentials.user_id, credentials.media_state);
        if applied {
            info!(remote_id = from_id, user_id = %credentials.user_id, "answer applied");
        }
        Ok(())
    }

    /// Turn a negotiation step's outcome into the session-level result.
    ///
    /// `Ok(None)` means the step failed only because its connection had
    /// already been closed or replaced.
    async fn settle<T>(
        &self,
        entry: &PeerEntry,
        result: Result<T, PeerError>,
    ) -> Result<Option<T>, MeshError> {
        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };
        let remote_id = entry.remote_id();

        if entry.link().is_closed() || !self.registry.is_current(entry) {
            debug!(remote_id, error = %err, "negotiation abandoned; connection already closed");
            return Ok(None);
        }

        warn!(remote_id, generation = entry.generation(), error = %err, "negotiation failed; closing connection");
        if self
            .registry
            .close_if_current(remote_id, entry.generation())
            .await
        {
            self.bus.emit(MeshEvent::peer_closed(
                &self.room_id,
                remote_id,
                "negotiation_failed",
            ));
        }
        Err(MeshError::peer(remote_id, err))
    }

    // ── Track replacement ───────────────────────────────────────────────

    /// Put `track` on the video sender of every connection without
    /// renegotiating, and make it the shared video track for connections
    /// created from now on.  Returns the track it replaced.
    pub async fn replace_local_video_track(
        &self,
        track: LocalTrack,
        screen_sharing: bool,
    ) -> Option<LocalTrack> {
        // Shared state first: a connection attaching from here on reads the
        // new track; those already attached are covered by the fan-out.
        let previous = self.media.swap_video(track.clone(), screen_sharing);

        let entries = self.registry.entries();
        let total = entries.len();
        let results = join_all(entries.iter().map(|entry| {
            let track = &track;
            async move {
                let negotiation = entry.begin().await;
                let res = negotiation.link().replace_video_track(track).await;
                (entry.remote_id().to_string(), res)
            }
        }))
        .await;

        let mut replaced = 0;
        for (remote_id, res) in results {
            match res {
                Ok(true) => replaced += 1,
                Ok(false) => debug!(%remote_id, "no video sender to replace yet"),
                Err(e) => warn!(%remote_id, error = %e, "video track replacement failed"),
            }
        }
        info!(track_id = track.id(), replaced, total, "local video track replaced");
        previous
    }

    // ── Screen sharing ──────────────────────────────────────────────────

    /// Swap the camera for a screen capture on every connection.
    ///
    /// Refused with a user-visible notice when nobody else is in the room;
    /// nothing changes in that case or when the capture cannot be acquired.
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<(), MeshError> {
        let _guard = self.screen.lock().await;
        if self.media.is_screen_sharing() {
            return Ok(());
        }
        if self.roster.is_empty() {
            return Err(self.notify(MeshError::NoAudience));
        }

        let screen = match self.media_source.acquire_screen_share().await {
            Ok(track) => track,
            Err(e) => return Err(self.notify(e.into())),
        };

        if let Some(camera) = self.replace_local_video_track(screen.clone(), true).await {
            camera.stop();
        }
        self.bus
            .emit(MeshEvent::screen_share_started(&self.room_id, screen.id()));
        self.watch_screen_end(&screen);
        Ok(())
    }

    /// Re-acquire the camera and swap it back in on every connection.
    pub async fn stop_screen_share(&self) -> Result<(), MeshError> {
        let _guard = self.screen.lock().await;
        if !self.media.is_screen_sharing() || self.shutdown.is_cancelled() {
            return Ok(());
        }

        let camera = match self.media_source.acquire_camera().await {
            Ok(track) => track,
            Err(e) => return Err(self.notify(e.into())),
        };

        if let Some(screen) = self.replace_local_video_track(camera, false).await {
            screen.stop();
            self.bus
                .emit(MeshEvent::screen_share_stopped(&self.room_id, screen.id()));
        }
        Ok(())
    }

    /// Revert to the camera when the capture ends on its own (the user
    /// stopped sharing from outside the app).
    fn watch_screen_end(self: &Arc<Self>, screen: &LocalTrack) {
        let this = Arc::downgrade(self);
        let ended = screen.ended();
        let screen_id = screen.id().to_string();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ended => {}
            }
            let Some(this) = this.upgrade() else { return };
            let still_sharing = this
                .media
                .video_track()
                .map_or(false, |t| t.id() == screen_id);
            if !still_sharing {
                return;
            }
            info!(track_id = %screen_id, "screen capture ended; reverting to camera");
            if let Err(e) = this.stop_screen_share().await {
                warn!(error = %e, "could not revert to camera");
            }
        });
    }

    /// Surface an error to the user and hand it back.
    pub(crate) fn notify(&self, err: MeshError) -> MeshError {
        warn!(code = err.code(), error = %err, "user-visible failure");
        self.bus
            .emit(MeshEvent::notice(&self.room_id, err.code(), err.to_string()));
        err
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::events::EventType;
    use crate::media::TrackKind;
    use crate::peer::{PeerLink, SdpKind};
    use crate::signaling::MediaState;
    use crate::testing::{
        candidate, MockFailure, MockMediaSource, MockPeerFactory, RecordingSignaling,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        negotiator: Arc<Negotiator>,
        factory: Arc<MockPeerFactory>,
        signaling: Arc<RecordingSignaling>,
        source: Arc<MockMediaSource>,
        bus: EventBus,
    }

    async fn fixture() -> Fixture {
        let factory = MockPeerFactory::new();
        let signaling = RecordingSignaling::new("me-session");
        let source = MockMediaSource::new();
        let bus = EventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = Arc::new(LocalMedia::new());
        media.install(source.acquire_user_media().await.unwrap());

        let negotiator = Arc::new(Negotiator {
            room_id: "room-1".into(),
            local_user: UserIdentity::new("me", "me"),
            registry: Arc::new(PeerRegistry::new(factory.clone(), tx, 16)),
            signaling: signaling.clone(),
            media,
            media_source: source.clone(),
            roster: Roster::new("room-1", bus.clone(), Duration::from_secs(10)),
            bus: bus.clone(),
            shutdown: CancellationToken::new(),
            screen: tokio::sync::Mutex::new(()),
        });
        Fixture {
            negotiator,
            factory,
            signaling,
            source,
            bus,
        }
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription::new(SdpKind::Offer, "remote-offer")
    }

    fn creds(user_id: &str, audio: bool, video: bool) -> Credentials {
        Credentials {
            user_id: user_id.into(),
            media_state: MediaState::new(audio, video),
        }
    }

    #[tokio::test]
    async fn offer_attaches_tracks_before_creating_offer() {
        let fx = fixture().await;
        fx.negotiator.initiate_offer("s1").await.unwrap();

        let link = fx.factory.link("s1").unwrap();
        assert_eq!(
            link.ops(),
            vec!["add_track:audio", "add_track:video", "create_offer", "set_local:offer"]
        );
        assert_eq!(link.signaling_state(), RTCSignalingState::HaveLocalOffer);

        let sent = fx.signaling.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SignalMessage::Offer {
                remote_id,
                credentials,
                ..
            } => {
                assert_eq!(remote_id, "s1");
                assert_eq!(credentials.user_id, "me");
                assert_eq!(credentials.media_state, MediaState::new(true, true));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn incoming_offer_records_media_state_and_answers() {
        let fx = fixture().await;
        fx.negotiator
            .handle_incoming_offer(remote_offer(), "s2", creds("u2", true, false))
            .await
            .unwrap();

        let p = fx.negotiator.roster.get("u2").unwrap();
        assert_eq!(p.media_state, MediaState::new(true, false));
        assert_eq!(p.remote_id.as_deref(), Some("s2"));

        let link = fx.factory.link("s2").unwrap();
        assert_eq!(link.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(fx.negotiator.registry.pending_candidates("s2"), 0);
        assert_eq!(fx.signaling.sent_named("answer").len(), 1);
        assert_eq!(fx.signaling.sent()[0].remote_id(), Some("s2"));
    }

    #[tokio::test]
    async fn answer_for_unknown_peer_is_a_no_op() {
        let fx = fixture().await;
        let answer = SessionDescription::new(SdpKind::Answer, "late");
        fx.negotiator
            .handle_incoming_answer(answer, "gone", creds("u9", true, true))
            .await
            .unwrap();
        assert!(fx.negotiator.roster.get("u9").is_none());
        assert_eq!(fx.factory.created(), 0);
    }

    #[tokio::test]
    async fn answer_completes_offer_and_drains_queue() {
        let fx = fixture().await;
        fx.negotiator.initiate_offer("s1").await.unwrap();
        fx.negotiator
            .registry
            .add_candidate("s1", candidate(1))
            .await
            .unwrap();

        let answer = SessionDescription::new(SdpKind::Answer, "answer");
        fx.negotiator
            .handle_incoming_answer(answer, "s1", creds("u1", false, true))
            .await
            .unwrap();

        let link = fx.factory.link("s1").unwrap();
        assert_eq!(link.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(link.applied_candidates(), vec![candidate(1)]);
        assert_eq!(
            fx.negotiator.roster.get("u1").unwrap().media_state,
            MediaState::new(false, true)
        );
    }

    #[tokio::test]
    async fn duplicate_answer_still_updates_media_state() {
        let fx = fixture().await;
        fx.negotiator.initiate_offer("s1").await.unwrap();
        let answer = SessionDescription::new(SdpKind::Answer, "answer");
        fx.negotiator
            .handle_incoming_answer(answer.clone(), "s1", creds("u1", true, true))
            .await
            .unwrap();

        fx.negotiator
            .handle_incoming_answer(answer, "s1", creds("u1", false, false))
            .await
            .unwrap();

        let link = fx.factory.link("s1").unwrap();
        assert_eq!(link.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(
            link.ops().iter().filter(|op| op.starts_with("set_remote")).count(),
            1
        );
        assert_eq!(
            fx.negotiator.roster.get("u1").unwrap().media_state,
            MediaState::new(false, false)
        );
    }

    #[tokio::test]
    async fn failure_closes_only_that_peer() {
        let fx = fixture().await;
        let mut events = fx.bus.subscribe();
        fx.factory.fail_on("s1", MockFailure::SetRemote);

        fx.negotiator.initiate_offer("s2").await.unwrap();
        let err = fx
            .negotiator
            .handle_incoming_offer(remote_offer(), "s1", creds("u1", true, true))
            .await
            .unwrap_err();

        assert!(matches!(err, MeshError::Peer { ref remote_id, .. } if remote_id == "s1"));
        assert!(fx.factory.link("s1").unwrap().is_closed());
        assert!(!fx.negotiator.registry.contains("s1"));
        assert!(fx.negotiator.registry.contains("s2"));

        let mut saw_closed = false;
        while let Ok(evt) = events.try_recv() {
            if evt.event_type == EventType::PeerClosed {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn offer_collision_resolved_by_session_id() {
        let fx = fixture().await;
        // "me-session" < "zz": keep our offer
        fx.negotiator.initiate_offer("zz").await.unwrap();
        fx.negotiator
            .handle_incoming_offer(remote_offer(), "zz", creds("uz", true, true))
            .await
            .unwrap();
        assert_eq!(fx.factory.created(), 1);
        assert!(fx.signaling.sent_named("answer").is_empty());

        // "me-session" > "aa": drop ours and answer
        fx.negotiator.initiate_offer("aa").await.unwrap();
        fx.negotiator
            .handle_incoming_offer(remote_offer(), "aa", creds("ua", true, true))
            .await
            .unwrap();
        assert_eq!(fx.factory.links_for("aa").len(), 2);
        assert!(fx.factory.links_for("aa")[0].is_closed());
        assert_eq!(fx.signaling.sent_named("answer").len(), 1);
    }

    #[tokio::test]
    async fn answering_a_collision_keeps_early_candidates() {
        let fx = fixture().await;
        fx.negotiator.initiate_offer("aa").await.unwrap();
        // the remote's candidates for its own offer arrive before the offer
        fx.negotiator
            .registry
            .add_candidate("aa", candidate(1))
            .await
            .unwrap();

        fx.negotiator
            .handle_incoming_offer(remote_offer(), "aa", creds("ua", true, true))
            .await
            .unwrap();

        let links = fx.factory.links_for("aa");
        assert_eq!(links.len(), 2);
        assert!(links[0].applied_candidates().is_empty());
        let applied: Vec<String> = links[1]
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, [candidate(1).candidate]);
        assert_eq!(fx.negotiator.registry.pending_candidates("aa"), 0);
    }

    #[tokio::test]
    async fn replace_fans_out_and_reaches_later_connections() {
        let fx = fixture().await;
        fx.negotiator.initiate_offer("s1").await.unwrap();
        fx.negotiator.initiate_offer("s2").await.unwrap();

        let screen = fx.source.acquire_screen_share().await.unwrap();
        fx.negotiator
            .replace_local_video_track(screen.clone(), true)
            .await;

        for id in ["s1", "s2"] {
            assert_eq!(
                fx.factory.link(id).unwrap().video_sender().as_deref(),
                Some(screen.id())
            );
        }
        // no renegotiation
        assert_eq!(fx.signaling.sent_named("offer").len(), 2);

        fx.negotiator.initiate_offer("s3").await.unwrap();
        assert_eq!(
            fx.factory.link("s3").unwrap().video_sender().as_deref(),
            Some(screen.id())
        );
    }

    #[tokio::test]
    async fn replace_failure_does_not_close_connection() {
        let fx = fixture().await;
        fx.factory.fail_on("s1", MockFailure::ReplaceTrack);
        fx.negotiator.initiate_offer("s1").await.unwrap();
        fx.negotiator.initiate_offer("s2").await.unwrap();

        let camera = fx.source.acquire_camera().await.unwrap();
        fx.negotiator.replace_local_video_track(camera.clone(), false).await;

        assert!(fx.negotiator.registry.contains("s1"));
        assert_eq!(
            fx.factory.link("s2").unwrap().video_sender().as_deref(),
            Some(camera.id())
        );
    }

    #[tokio::test]
    async fn screen_share_refused_without_audience() {
        let fx = fixture().await;
        let mut events = fx.bus.subscribe();
        let before = fx.negotiator.media.video_track().unwrap();

        let err = fx.negotiator.start_screen_share().await.unwrap_err();

        assert!(matches!(err, MeshError::NoAudience));
        assert!(err.is_user_visible());
        assert!(!fx.negotiator.media.is_screen_sharing());
        assert_eq!(fx.negotiator.media.video_track().unwrap().id(), before.id());
        assert!(!before.is_ended());
        assert_eq!(fx.source.screens_acquired(), 0);

        let notice = events.recv().await.unwrap();
        assert_eq!(notice.event_type, EventType::Notice);
    }

    #[tokio::test]
    async fn screen_share_acquire_failure_keeps_camera() {
        let fx = fixture().await;
        fx.negotiator
            .roster
            .on_user_joined(UserIdentity::new("u1", "ana"), "s1");
        fx.negotiator.initiate_offer("s1").await.unwrap();
        let camera = fx.negotiator.media.video_track().unwrap();
        fx.source.fail_screen(MediaError::PermissionDenied);

        let err = fx.negotiator.start_screen_share().await.unwrap_err();

        assert_eq!(err.code(), "media_permission_denied");
        assert!(!fx.negotiator.media.is_screen_sharing());
        assert_eq!(
            fx.factory.link("s1").unwrap().video_sender().as_deref(),
            Some(camera.id())
        );
    }

    #[tokio::test]
    async fn explicit_stop_restores_camera() {
        let fx = fixture().await;
        fx.negotiator
            .roster
            .on_user_joined(UserIdentity::new("u1", "ana"), "s1");
        fx.negotiator.initiate_offer("s1").await.unwrap();

        fx.negotiator.start_screen_share().await.unwrap();
        let screen = fx.negotiator.media.video_track().unwrap();
        assert_eq!(screen.kind(), TrackKind::Video);
        assert!(fx.negotiator.media.is_screen_sharing());

        fx.negotiator.stop_screen_share().await.unwrap();
        let camera = fx.negotiator.media.video_track().unwrap();
        assert!(!fx.negotiator.media.is_screen_sharing());
        assert!(screen.is_ended());
        assert_ne!(camera.id(), screen.id());
        assert_eq!(
            fx.factory.link("s1").unwrap().video_sender().as_deref(),
            Some(camera.id())
        );
    }
}
