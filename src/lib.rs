//! Full-mesh WebRTC negotiation core for multi-party calls.
//!
//! A [`MeshSession`] keeps one peer connection per remote participant,
//! drives the offer/answer exchange over a [`SignalingChannel`], buffers ICE
//! candidates that arrive early, swaps the local video track in place for
//! screen sharing, and projects all of it onto a participant [`Roster`].

pub mod candidates;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod mesh;
pub mod negotiation;
pub mod peer;
pub mod registry;
pub mod roster;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::MeshConfig;
pub use error::{MediaError, MeshError, PeerError, SignalError};
pub use events::{EventBus, EventType, MeshEvent};
pub use media::{LocalMedia, LocalTrack, MediaSource, SyntheticMediaSource};
pub use mesh::{MeshSession, SessionParts};
pub use peer::{PeerFactory, PeerLink, RtcPeerFactory};
pub use registry::PeerRegistry;
pub use roster::{Participant, Roster};
pub use signaling::{LoopbackHub, MediaState, SignalMessage, SignalingChannel, UserIdentity};
