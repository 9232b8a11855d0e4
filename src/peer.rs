// src/peer.rs
//
// One pairwise media connection and the factory that builds it.
//
// ─ Seams ────────────────────────────────────────────────────────────────────
//
//   `PeerLink`     the operations negotiation needs from a connection
//   `PeerFactory`  builds a link and wires its callbacks into a sink
//   `PeerEvent`    what a connection reports back (local candidate, remote
//                  track, ICE state); callbacks never touch mesh state
//                  directly, they only push onto the session's event channel
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};

// ─── Session descriptions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer as carried over signaling: `{ "type", "sdp" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    fn into_rtc(self) -> Result<RTCSessionDescription, PeerError> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp)?,
        };
        Ok(desc)
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = PeerError;

    fn try_from(desc: RTCSessionDescription) -> Result<Self, Self::Error> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => return Err(PeerError::UnsupportedSdp(other.to_string())),
        };
        Ok(Self::new(kind, desc.sdp))
    }
}

// ─── Peer events ────────────────────────────────────────────────────────────

/// A remote media track announced by a connection.
#[derive(Clone)]
pub struct RemoteTrack {
    pub stream_id: String,
    pub track_id: String,
    pub kind: TrackKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id && self.track_id == other.track_id
    }
}

/// A remote media stream: the tracks a peer sends under one stream id, at
/// most one per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: None,
            video: None,
        }
    }

    /// Put `track` in its kind's place, replacing any track of that kind.
    pub fn insert(&mut self, track: RemoteTrack) {
        match track.kind {
            TrackKind::Audio => self.audio = Some(track),
            TrackKind::Video => self.video = Some(track),
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Tracks in audio, video order.
    pub fn tracks(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.audio.iter().chain(self.video.iter())
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(RTCIceCandidateInit),
    RemoteTrack(RemoteTrack),
    IceConnectionState(RTCIceConnectionState),
}

/// A [`PeerEvent`] tagged with the connection that produced it.
///
/// `generation` distinguishes a connection from a later replacement for the
/// same remote id, so events from a closed predecessor can be ignored.
#[derive(Debug, Clone)]
pub struct PeerSignal {
    pub remote_id: String,
    pub generation: u64,
    pub event: PeerEvent,
}

/// Where a connection's callbacks deliver their events.
#[derive(Clone)]
pub struct PeerEventSink {
    remote_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl PeerEventSink {
    pub fn new(
        remote_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerSignal>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            generation,
            tx,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session stopped listening.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerSignal {
                remote_id: self.remote_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

// ─── PeerLink / PeerFactory ─────────────────────────────────────────────────

/// The connection operations the negotiation engine drives.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError>;

    /// Swap the track on the video sender in place, without renegotiating.
    /// Returns `false` when the connection has no video sender.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<bool, PeerError>;

    /// Id of the track currently on the video sender.
    async fn video_track_id(&self) -> Option<String>;

    fn signaling_state(&self) -> RTCSignalingState;

    fn ice_connection_state(&self) -> RTCIceConnectionState;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Build a connection whose callbacks report into `sink`.
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>, PeerError>;
}

// ─── webrtc-rs implementation ───────────────────────────────────────────────

/// Builds `RTCPeerConnection`s with the configured ICE servers and UDP range.
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    pub fn new(cfg: &MeshConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((min, max)) = cfg.udp_port_range() {
            let ephemeral = webrtc::ice::udp_network::EphemeralUDP::new(min, max)
                .map_err(|e| PeerError::Transport(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(webrtc::ice::udp_network::UDPNetwork::Ephemeral(ephemeral));
            info!("WebRTC UDP port range: {min}-{max}");
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = cfg
            .ice_servers()
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        // Local candidates trickle out as they are gathered; `None` marks the
        // end of gathering and carries nothing to send.
        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(init));
                    }
                    Err(e) => {
                        warn!(remote_id = %sink.remote_id(), error = %e, "could not serialise local candidate");
                    }
                }
            })
        }));

        let track_sink = sink.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let sink = track_sink.clone();
            Box::pin(async move {
                let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                    return;
                };
                debug!(
                    remote_id = %sink.remote_id(),
                    kind = kind.as_str(),
                    ssrc = track.ssrc(),
                    "remote track received"
                );
                sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind,
                    track: Some(track),
                }));
            })
        }));

        let state_sink = sink;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                debug!(remote_id = %sink.remote_id(), %state, "ice connection state");
                sink.emit(PeerEvent::IceConnectionState(state));
            })
        }));

        Ok(Arc::new(RtcPeerLink {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

/// [`PeerLink`] over a webrtc-rs `RTCPeerConnection`.
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self.pc.add_track(track.as_track_local()).await?;

        // Incoming RTCP must be read for the interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.pc.create_offer(None).await?.try_into()
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.pc.create_answer(None).await?.try_into()
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        Ok(self.pc.set_local_description(desc.into_rtc()?).await?)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        Ok(self.pc.set_remote_description(desc.into_rtc()?).await?)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<bool, PeerError> {
        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() == RTPCodecType::Video {
                sender.replace_track(Some(track.as_track_local())).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn video_track_id(&self) -> Option<String> {
        for sender in self.pc.get_senders().await {
            if let Some(current) = sender.track().await {
                if current.kind() == RTPCodecType::Video {
                    return Some(current.id().to_string());
                }
            }
        }
        None
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.pc.ice_connection_state()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        Ok(self.pc.close().await?)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
