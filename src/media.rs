// src/media.rs
//
// Local media: the tracks this participant sends, the shared state every
// peer connection reads them from, and the capture seam that produces them.
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;
use crate::signaling::MediaState;

// ---------------------------------------------------------------------------
// TrackKind / TrackSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

/// Where a local track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

// ---------------------------------------------------------------------------
// LocalTrack
// ---------------------------------------------------------------------------

/// A local media track shared by every peer connection.
///
/// Cloning is cheap: clones refer to the same underlying webrtc track, the
/// same enabled flag and the same `ended` signal.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    source: TrackSource,
    inner: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: CancellationToken,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Self {
            kind,
            source,
            inner: Arc::new(TrackLocalStaticSample::new(codec, id.into(), stream_id.into())),
            enabled: Arc::new(AtomicBool::new(true)),
            ended: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn stream_id(&self) -> &str {
        self.inner.stream_id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Muted tracks stay attached; the capture side skips writing samples.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Stop the track.  Anyone awaiting [`LocalTrack::ended`] wakes up.
    pub fn stop(&self) {
        self.ended.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once the track is stopped, locally or by the capture side
    /// (e.g. the user revoking a screen capture).
    pub fn ended(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let token = self.ended.clone();
        async move { token.cancelled().await }
    }

    /// The sample writer the capture side feeds.
    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.inner
    }

    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// The audio+video set produced by one capture request.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

// ---------------------------------------------------------------------------
// LocalMedia: the shared local media state of a session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MediaInner {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    audio_enabled: bool,
    video_enabled: bool,
    screen_sharing: bool,
}

/// Shared, mutable record of what this participant sends.
///
/// Peer connections never keep their own copy of the track set: they read
/// [`LocalMedia::tracks`] at the moment they attach, so a track swapped in by
/// a concurrent fan-out is the one a new connection picks up.
#[derive(Default)]
pub struct LocalMedia {
    inner: RwLock<MediaInner>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly captured stream; both kinds start enabled when
    /// present.  Previously installed tracks are stopped.
    pub fn install(&self, stream: LocalStream) -> MediaState {
        let mut inner = self.inner.write();
        for old in inner.audio.iter().chain(inner.video.iter()) {
            old.stop();
        }
        inner.audio_enabled = stream.audio.is_some();
        inner.video_enabled = stream.video.is_some();
        inner.audio = stream.audio;
        inner.video = stream.video;
        inner.screen_sharing = false;
        MediaState::new(inner.audio_enabled, inner.video_enabled)
    }

    /// Current track set, audio first.
    pub fn tracks(&self) -> Vec<LocalTrack> {
        let inner = self.inner.read();
        inner.audio.iter().chain(inner.video.iter()).cloned().collect()
    }

    pub fn audio_track(&self) -> Option<LocalTrack> {
        self.inner.read().audio.clone()
    }

    pub fn video_track(&self) -> Option<LocalTrack> {
        self.inner.read().video.clone()
    }

    pub fn media_state(&self) -> MediaState {
        let inner = self.inner.read();
        MediaState::new(inner.audio_enabled, inner.video_enabled)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.inner.read().screen_sharing
    }

    /// Flip the audio track's enabled flag.  `None` when there is no audio
    /// track to toggle.
    pub fn toggle_audio(&self) -> Option<MediaState> {
        let mut inner = self.inner.write();
        let track = inner.audio.as_ref()?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        inner.audio_enabled = enabled;
        Some(MediaState::new(inner.audio_enabled, inner.video_enabled))
    }

    /// Flip the video track's enabled flag.  `None` when there is no video
    /// track to toggle.
    pub fn toggle_video(&self) -> Option<MediaState> {
        let mut inner = self.inner.write();
        let track = inner.video.as_ref()?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        inner.video_enabled = enabled;
        Some(MediaState::new(inner.audio_enabled, inner.video_enabled))
    }

    /// Swap the video track and return the previous one.
    ///
    /// A screen track is always live; a camera track coming back keeps the
    /// user's last video toggle.
    pub(crate) fn swap_video(&self, track: LocalTrack, screen_sharing: bool) -> Option<LocalTrack> {
        let mut inner = self.inner.write();
        track.set_enabled(screen_sharing || inner.video_enabled);
        inner.screen_sharing = screen_sharing;
        inner.video.replace(track)
    }

    /// Stop every local track (room exit).
    pub fn stop_all(&self) {
        let inner = self.inner.read();
        for track in inner.audio.iter().chain(inner.video.iter()) {
            track.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// MediaSource: capture seam
// ---------------------------------------------------------------------------

/// Produces fresh local tracks.  Device selection and capture live behind
/// this trait.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Microphone + camera, used once on room entry.
    async fn acquire_user_media(&self) -> Result<LocalStream, MediaError>;

    async fn acquire_camera(&self) -> Result<LocalTrack, MediaError>;

    async fn acquire_screen_share(&self) -> Result<LocalTrack, MediaError>;
}

/// Media source producing tracks fed with blank frames.
///
/// Negotiation sees real Opus/VP8 tracks and remote ends receive RTP; the
/// demo binary uses it to run a mesh without devices.
pub struct SyntheticMediaSource {
    stream_id: String,
}

const BLANK_FRAME: &[u8] = &[0u8; 160];

impl SyntheticMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }

    fn track(&self, kind: TrackKind, source: TrackSource) -> LocalTrack {
        let id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let track = LocalTrack::new(kind, source, id, self.stream_id.clone());
        spawn_feeder(track.clone());
        track
    }
}

/// Write a blank frame per tick until the track ends.  Disabled tracks stay
/// silent.
fn spawn_feeder(track: LocalTrack) {
    let frame = match track.kind() {
        TrackKind::Audio => Duration::from_millis(20),
        TrackKind::Video => Duration::from_millis(33),
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame);
        let ended = track.ended();
        tokio::pin!(ended);
        loop {
            tokio::select! {
                _ = &mut ended => break,
                _ = ticker.tick() => {}
            }
            if !track.is_enabled() {
                continue;
            }
            let sample = Sample {
                data: Bytes::from_static(BLANK_FRAME),
                duration: frame,
                ..Default::default()
            };
            if let Err(e) = track.sample_track().write_sample(&sample).await {
                debug!(track_id = track.id(), error = %e, "sample write failed");
            }
        }
    });
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire_user_media(&self) -> Result<LocalStream, MediaError> {
        Ok(LocalStream {
            audio: Some(self.track(TrackKind::Audio, TrackSource::Microphone)),
            video: Some(self.track(TrackKind::Video, TrackSource::Camera)),
        })
    }

    async fn acquire_camera(&self) -> Result<LocalTrack, MediaError> {
        Ok(self.track(TrackKind::Video, TrackSource::Camera))
    }

    async fn acquire_screen_share(&self) -> Result<LocalTrack, MediaError> {
        Ok(self.track(TrackKind::Video, TrackSource::Screen))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
