use thiserror::Error;

// ─── PeerError ──────────────────────────────────────────────────────────────

/// Failure of a single peer connection operation.
///
/// Always scoped to one remote id: the caller closes that connection and
/// carries on with the rest of the mesh.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("no peer connection for '{0}'")]
    NotFound(String),

    #[error("peer connection for '{0}' is closed")]
    Closed(String),

    #[error("unsupported session description type '{0}'")]
    UnsupportedSdp(String),

    #[error("{0}")]
    Transport(String),
}

impl PeerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::WebRtc(_) => "webrtc_error",
            Self::NotFound(_) => "peer_not_found",
            Self::Closed(_) => "peer_closed",
            Self::UnsupportedSdp(_) => "unsupported_sdp",
            Self::Transport(_) => "transport_error",
        }
    }
}

// ─── MediaError ─────────────────────────────────────────────────────────────

/// Local media acquisition failure.
///
/// The `Display` text is meant to be shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Permission to access camera/microphone was denied.")]
    PermissionDenied,

    #[error("No media devices found.")]
    NotFound,

    #[error("Camera or microphone is already being used by another service")]
    InUse,

    #[error("Your device or browser does not support media access.")]
    Unsupported,

    #[error("{0}")]
    Other(String),
}

impl MediaError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "media_permission_denied",
            Self::NotFound => "media_not_found",
            Self::InUse => "media_in_use",
            Self::Unsupported => "media_unsupported",
            Self::Other(_) => "media_error",
        }
    }
}

// ─── SignalError ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling channel is closed")]
    Closed,

    #[error("no session '{0}' on the signaling channel")]
    UnknownSession(String),

    #[error("malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl SignalError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed => "signal_closed",
            Self::UnknownSession(_) => "signal_unknown_session",
            Self::Malformed(_) => "signal_malformed",
        }
    }
}

// ─── MeshError ──────────────────────────────────────────────────────────────

/// Session-level error returned by mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("negotiation with '{remote_id}' failed: {source}")]
    Peer {
        remote_id: String,
        #[source]
        source: PeerError,
    },

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("Cannot share screen when no other users are connected.")]
    NoAudience,

    #[error("the mesh session has already left the room")]
    SessionClosed,
}

impl MeshError {
    pub fn peer(remote_id: impl Into<String>, source: PeerError) -> Self {
        Self::Peer {
            remote_id: remote_id.into(),
            source,
        }
    }

    /// Stable machine-readable code, mirrored in `notice` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Peer { source, .. } => source.code(),
            Self::Media(e) => e.code(),
            Self::Signal(e) => e.code(),
            Self::NoAudience => "screen_share_no_audience",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Whether the message should be surfaced to the user rather than only
    /// logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Media(_) | Self::NoAudience)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
