use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Mesh configuration, loaded from environment variables
// ---------------------------------------------------------------------------

/// Configuration shared by every mesh session in the process.
///
/// Every field can be set via an environment variable prefixed with
/// `MESHCALL_`.  Defaults match what the browser client shipped with: two
/// public STUN servers and no TURN relay.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    // ── ICE ─────────────────────────────────────────────────────────────
    /// STUN server URLs handed to every peer connection.
    pub stun_urls: Vec<String>,
    /// TURN server URLs (optional; needed behind symmetric NAT).
    pub turn_urls: Vec<String>,
    /// TURN username (long-term credentials).
    pub turn_username: String,
    /// TURN password.
    pub turn_password: String,

    // ── WebRTC UDP port range ───────────────────────────────────────────
    /// Minimum UDP port for ICE candidates (0 = OS picks).
    pub udp_port_min: u16,
    /// Maximum UDP port for ICE candidates (0 = OS picks).
    pub udp_port_max: u16,

    // ── Session behaviour ───────────────────────────────────────────────
    /// Delay after which hand-raise / reaction / pin overlays reset.
    pub overlay_reset: Duration,
    /// Maximum number of early ICE candidates buffered per remote peer.
    pub candidate_buffer_limit: usize,
    /// Capacity of the per-session event bus.
    pub event_capacity: usize,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            turn_urls: Vec::new(),
            turn_username: String::new(),
            turn_password: String::new(),
            udp_port_min: 0,
            udp_port_max: 0,
            overlay_reset: Duration::from_secs(10),
            candidate_buffer_limit: 64,
            event_capacity: 1024,
            log_level: "info".to_string(),
        }
    }
}

const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

impl MeshConfig {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading, errors ignored.
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let stun_urls = env_csv("MESHCALL_STUN_URLS", DEFAULT_STUN_URLS);
        let turn_urls = env_csv("MESHCALL_TURN_URLS", &[]);
        let turn_username = env_or("MESHCALL_TURN_USERNAME", "");
        let turn_password = env_or("MESHCALL_TURN_PASSWORD", "");

        let udp_port_min = env_parse("MESHCALL_UDP_PORT_MIN", defaults.udp_port_min);
        let udp_port_max = env_parse("MESHCALL_UDP_PORT_MAX", defaults.udp_port_max);

        let overlay_reset = Duration::from_secs(env_parse(
            "MESHCALL_OVERLAY_RESET_SECS",
            defaults.overlay_reset.as_secs(),
        ));
        let candidate_buffer_limit =
            env_parse("MESHCALL_CANDIDATE_BUFFER_LIMIT", defaults.candidate_buffer_limit);
        let event_capacity = env_parse("MESHCALL_EVENT_CAPACITY", defaults.event_capacity).max(1);

        let log_level = env_or("MESHCALL_LOG_LEVEL", &defaults.log_level);

        let config = MeshConfig {
            stun_urls,
            turn_urls,
            turn_username,
            turn_password,
            udp_port_min,
            udp_port_max,
            overlay_reset,
            candidate_buffer_limit,
            event_capacity,
            log_level,
        };

        config.log_summary();
        config
    }

    /// Build the ICE server list handed to every peer connection at
    /// construction time.
    ///
    /// STUN entries carry no credentials; TURN entries share the configured
    /// long-term username/password.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers: Vec<IceServerConfig> = self
            .stun_urls
            .iter()
            .map(|url| IceServerConfig {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        for url in &self.turn_urls {
            servers.push(IceServerConfig {
                urls: vec![url.clone()],
                username: Some(self.turn_username.clone()),
                credential: Some(self.turn_password.clone()),
            });
        }

        servers
    }

    /// Returns the UDP port range when both bounds are set.
    pub fn udp_port_range(&self) -> Option<(u16, u16)> {
        (self.udp_port_min > 0 && self.udp_port_max > 0)
            .then_some((self.udp_port_min, self.udp_port_max))
    }

    fn log_summary(&self) {
        info!("──── meshcall configuration ────");
        info!("  stun_urls          : {:?}", self.stun_urls);
        info!("  turn_urls          : {:?}", self.turn_urls);
        match self.udp_port_range() {
            Some((min, max)) => info!("  udp_ports          : {min}-{max}"),
            None => info!("  udp_ports          : (os assigned)"),
        }
        info!("  overlay_reset      : {:?}", self.overlay_reset);
        info!("  candidate_buffer   : {}", self.candidate_buffer_limit);
        info!("  event_capacity     : {}", self.event_capacity);
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// ICE server configuration types
// ---------------------------------------------------------------------------

/// ICE server entry, shaped like the W3C `RTCIceServer` dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
