// src/main.rs
//
// meshcall-demo: three participants in one process, negotiating a full mesh
// over an in-process relay with real webrtc-rs peer connections.

use meshcall::events::EventPayload;
use meshcall::{
    LoopbackHub, MeshConfig, MeshSession, PeerFactory, RtcPeerFactory, SessionParts,
    SyntheticMediaSource, UserIdentity,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PARTICIPANTS: &[&str] = &["ana", "ben", "cho"];

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // ── Install rustls CryptoProvider (DTLS) ────────────────────────────
    let _ = rustls::crypto::ring::default_provider().install_default();

    // ── Load configuration ──────────────────────────────────────────────
    // Load .env before anything else so MESHCALL_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("MESHCALL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = MeshConfig::from_env();
    if cfg.turn_urls.is_empty() {
        warn!("No TURN server configured; peers behind symmetric NAT will fail to connect");
    }

    let demo_secs = std::env::var("MESHCALL_DEMO_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);

    if let Err(e) = run(&cfg, Duration::from_secs(demo_secs)).await {
        error!("demo failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: &MeshConfig, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let peers: Arc<dyn PeerFactory> = Arc::new(RtcPeerFactory::new(cfg)?);
    let hub = LoopbackHub::new();
    let room_id = format!("room-{}", uuid::Uuid::new_v4().simple());

    // ── Join one by one, like browsers arriving ─────────────────────────

    let mut sessions: Vec<Arc<MeshSession>> = Vec::new();
    for name in PARTICIPANTS {
        let (channel, inbound) = hub.connect(format!("sess-{name}"));
        let session = MeshSession::start(
            SessionParts {
                room_id: room_id.clone(),
                local_user: UserIdentity::new(format!("user-{name}"), *name),
                signaling: Arc::new(channel),
                peers: peers.clone(),
                media_source: Arc::new(SyntheticMediaSource::new(format!("stream-{name}"))),
            },
            cfg,
        );
        spawn_event_logger(&session);

        session.init_media().await?;
        session.spawn_signal_pump(inbound);

        let present = sessions.iter().map(|s| s.local_user().clone()).collect();
        session.enter(present)?;
        sessions.push(session);
    }

    info!(room_id = %room_id, secs = duration.as_secs(), "negotiating");
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }

    // ── Exercise the controls on the first participant ──────────────────

    let host = &sessions[0];
    host.send_reaction("👋")?;
    host.raise_hand(true)?;
    match host.start_screen_share().await {
        Ok(()) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            host.stop_screen_share().await?;
        }
        Err(e) => warn!(code = e.code(), "screen share refused: {e}"),
    }
    host.toggle_audio();

    // ── Report ──────────────────────────────────────────────────────────

    for session in &sessions {
        let participants = session.roster().snapshot();
        info!(
            user = %session.local_user().username,
            connections = session.registry().len(),
            participants = participants.len(),
            "mesh state"
        );
        for p in participants {
            info!(
                "  {:<10} remote={:<10} audio={:<5} video={:<5} stream={}",
                p.user.id,
                p.remote_id.as_deref().unwrap_or("-"),
                p.media_state.audio_enabled,
                p.media_state.video_enabled,
                p.stream.as_ref().map_or("-", |s| s.stream_id.as_str()),
            );
        }
    }

    for session in &sessions {
        session.leave().await;
        hub.disconnect(session.session_id());
    }
    info!(relay_members = hub.member_count(), "all participants left");
    Ok(())
}

/// Log every event one participant's UI would see.
fn spawn_event_logger(session: &Arc<MeshSession>) {
    let mut events = session.subscribe();
    let user = session.local_user().username.clone();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let EventPayload::Notice(notice) = &event.data {
                        warn!(%user, code = %notice.code, "{}", notice.message);
                    } else {
                        info!(
                            %user,
                            event = %event.event_type,
                            about = event.user_id().unwrap_or("-"),
                            "event"
                        );
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(%user, skipped = n, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
