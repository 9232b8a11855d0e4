// src/testing.rs
//
// Deterministic stand-ins for the connection, signaling and capture seams.
// Compiled for tests only.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::{MediaError, PeerError, SignalError};
use crate::media::{LocalStream, LocalTrack, MediaSource, TrackKind, TrackSource};
use crate::peer::{
    PeerEvent, PeerEventSink, PeerFactory, PeerLink, RemoteTrack, SdpKind, SessionDescription,
};
use crate::signaling::{SignalMessage, SignalingChannel};

pub(crate) fn candidate(n: u32) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        ..Default::default()
    }
}

// ─── Peer connections ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockFailure {
    Create,
    CreateOffer,
    SetRemote,
    ReplaceTrack,
}

struct LinkState {
    signaling: RTCSignalingState,
    ice: RTCIceConnectionState,
    remote: Option<SessionDescription>,
    senders: Vec<(TrackKind, String)>,
    candidates: Vec<RTCIceCandidateInit>,
    ops: Vec<String>,
}

/// Offer/answer state machine with no transport behind it.
pub(crate) struct MockPeerLink {
    sink: PeerEventSink,
    failure: Option<MockFailure>,
    offer_gate: Option<Arc<Semaphore>>,
    closed: AtomicBool,
    state: Mutex<LinkState>,
}

impl MockPeerLink {
    fn check_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::Closed(self.sink.remote_id().to_string()));
        }
        Ok(())
    }

    fn record(&self, op: impl Into<String>) {
        self.state.lock().ops.push(op.into());
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn applied_candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.state.lock().candidates.clone()
    }

    /// Id of the track on the video sender.
    pub fn video_sender(&self) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|(kind, _)| *kind == TrackKind::Video)
            .map(|(_, id)| id.clone())
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    // Simulated callbacks.

    pub fn fire_local_candidate(&self, candidate: RTCIceCandidateInit) {
        self.sink.emit(PeerEvent::LocalCandidate(candidate));
    }

    pub fn fire_remote_track(&self, stream_id: &str, kind: TrackKind) {
        self.sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
            stream_id: stream_id.to_string(),
            track_id: format!("{stream_id}-{}", kind.as_str()),
            kind,
            track: None,
        }));
    }

    pub fn fire_ice_state(&self, state: RTCIceConnectionState) {
        self.state.lock().ice = state;
        self.sink.emit(PeerEvent::IceConnectionState(state));
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.senders.push((track.kind(), track.id().to_string()));
        state.ops.push(format!("add_track:{}", track.kind().as_str()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        if let Some(gate) = &self.offer_gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| PeerError::Transport("offer gate closed".into()))?;
        }
        self.check_open()?;
        if self.failure == Some(MockFailure::CreateOffer) {
            return Err(PeerError::Transport("mock create_offer failure".into()));
        }
        self.record("create_offer");
        Ok(SessionDescription::new(
            SdpKind::Offer,
            format!("offer-to-{}", self.sink.remote_id()),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.signaling != RTCSignalingState::HaveRemoteOffer {
            return Err(PeerError::Transport(format!(
                "create_answer in {}",
                state.signaling
            )));
        }
        state.ops.push("create_answer".into());
        Ok(SessionDescription::new(
            SdpKind::Answer,
            format!("answer-to-{}", self.sink.remote_id()),
        ))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.signaling = match (state.signaling, desc.kind) {
            (RTCSignalingState::Stable, SdpKind::Offer) => RTCSignalingState::HaveLocalOffer,
            (RTCSignalingState::HaveRemoteOffer, SdpKind::Answer) => RTCSignalingState::Stable,
            (current, kind) => {
                return Err(PeerError::Transport(format!(
                    "set_local {kind:?} in {current}"
                )))
            }
        };
        state.ops.push(format!("set_local:{}", sdp_name(desc.kind)));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.check_open()?;
        if self.failure == Some(MockFailure::SetRemote) {
            return Err(PeerError::Transport("mock set_remote failure".into()));
        }
        let mut state = self.state.lock();
        state.signaling = match (state.signaling, desc.kind) {
            (RTCSignalingState::Stable, SdpKind::Offer) => RTCSignalingState::HaveRemoteOffer,
            (RTCSignalingState::HaveLocalOffer, SdpKind::Answer) => RTCSignalingState::Stable,
            (current, kind) => {
                return Err(PeerError::Transport(format!(
                    "set_remote {kind:?} in {current}"
                )))
            }
        };
        state.ops.push(format!("set_remote:{}", sdp_name(desc.kind)));
        state.remote = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerError::Transport("candidate before remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<bool, PeerError> {
        self.check_open()?;
        if self.failure == Some(MockFailure::ReplaceTrack) {
            return Err(PeerError::Transport("mock replace_track failure".into()));
        }
        let mut state = self.state.lock();
        match state.senders.iter_mut().find(|(kind, _)| *kind == TrackKind::Video) {
            Some(sender) => {
                sender.1 = track.id().to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn video_track_id(&self) -> Option<String> {
        self.video_sender()
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.state.lock().ice
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), PeerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = self.state.lock();
            state.signaling = RTCSignalingState::Closed;
            state.ice = RTCIceConnectionState::Closed;
            state.ops.push("close".into());
        }
        Ok(())
    }
}

fn sdp_name(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    }
}

/// Hands out [`MockPeerLink`]s and keeps every one it built.
#[derive(Default)]
pub(crate) struct MockPeerFactory {
    links: Mutex<Vec<(String, Arc<MockPeerLink>)>>,
    failures: Mutex<HashMap<String, MockFailure>>,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.links.lock().len()
    }

    /// Most recent link built for `remote_id`.
    pub fn link(&self, remote_id: &str) -> Option<Arc<MockPeerLink>> {
        self.links_for(remote_id).pop()
    }

    pub fn links_for(&self, remote_id: &str) -> Vec<Arc<MockPeerLink>> {
        self.links
            .lock()
            .iter()
            .filter(|(id, _)| id == remote_id)
            .map(|(_, link)| link.clone())
            .collect()
    }

    pub fn fail_on(&self, remote_id: &str, failure: MockFailure) {
        self.failures.lock().insert(remote_id.to_string(), failure);
    }

    /// Make `create_offer` on links built from now on wait for a permit.
    pub fn gate_offers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>, PeerError> {
        // let concurrent callers interleave here, as a real build would
        tokio::task::yield_now().await;

        let remote_id = sink.remote_id().to_string();
        let failure = self.failures.lock().get(&remote_id).copied();
        if failure == Some(MockFailure::Create) {
            return Err(PeerError::Transport("mock create failure".into()));
        }

        let link = Arc::new(MockPeerLink {
            sink,
            failure,
            offer_gate: self.offer_gate.lock().clone(),
            closed: AtomicBool::new(false),
            state: Mutex::new(LinkState {
                signaling: RTCSignalingState::Stable,
                ice: RTCIceConnectionState::New,
                remote: None,
                senders: Vec::new(),
                candidates: Vec::new(),
                ops: Vec::new(),
            }),
        });
        self.links.lock().push((remote_id, link.clone()));
        Ok(link)
    }
}

// ─── Signaling ──────────────────────────────────────────────────────────────

/// Records every outbound message instead of delivering it.
pub(crate) struct RecordingSignaling {
    session_id: String,
    sent: Mutex<Vec<SignalMessage>>,
    closed: AtomicBool,
}

impl RecordingSignaling {
    pub fn new(session_id: &str) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.name() == name)
            .cloned()
            .collect()
    }

    /// Fail every send from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl SignalingChannel for RecordingSignaling {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

// ─── Media ──────────────────────────────────────────────────────────────────

/// Media source with injectable failures and a record of screen captures.
#[derive(Default)]
pub(crate) struct MockMediaSource {
    counter: AtomicU32,
    user_media_failure: Mutex<Option<MediaError>>,
    camera_failure: Mutex<Option<MediaError>>,
    screen_failure: Mutex<Option<MediaError>>,
    screens: Mutex<Vec<LocalTrack>>,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn track(&self, kind: TrackKind, source: TrackSource) -> LocalTrack {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        LocalTrack::new(kind, source, format!("{source:?}-{n}").to_lowercase(), "local")
    }

    pub fn fail_user_media(&self, err: MediaError) {
        *self.user_media_failure.lock() = Some(err);
    }

    pub fn fail_camera(&self, err: MediaError) {
        *self.camera_failure.lock() = Some(err);
    }

    pub fn fail_screen(&self, err: MediaError) {
        *self.screen_failure.lock() = Some(err);
    }

    pub fn screens_acquired(&self) -> usize {
        self.screens.lock().len()
    }

    pub fn last_screen(&self) -> Option<LocalTrack> {
        self.screens.lock().last().cloned()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire_user_media(&self) -> Result<LocalStream, MediaError> {
        if let Some(err) = self.user_media_failure.lock().clone() {
            return Err(err);
        }
        Ok(LocalStream {
            audio: Some(self.track(TrackKind::Audio, TrackSource::Microphone)),
            video: Some(self.track(TrackKind::Video, TrackSource::Camera)),
        })
    }

    async fn acquire_camera(&self) -> Result<LocalTrack, MediaError> {
        if let Some(err) = self.camera_failure.lock().clone() {
            return Err(err);
        }
        Ok(self.track(TrackKind::Video, TrackSource::Camera))
    }

    async fn acquire_screen_share(&self) -> Result<LocalTrack, MediaError> {
        if let Some(err) = self.screen_failure.lock().clone() {
            return Err(err);
        }
        let track = self.track(TrackKind::Video, TrackSource::Screen);
        self.screens.lock().push(track.clone());
        Ok(track)
    }
}
