//! Configuration management for meshcall

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Negotiation tuning
    #[serde(default)]
    pub call: CallConfig,

    /// Signaling relay connection
    #[serde(default)]
    pub relay: RelayConfig,

    /// Local participant identity
    #[serde(default)]
    pub identity: IdentityConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Delay before offering to a new joiner
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Seconds to wait for an answer before abandoning an offer
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,

    /// Maximum number of remote participants in the mesh
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Candidates kept per participant that has not offered yet
    #[serde(default = "default_early_candidate_limit")]
    pub early_candidate_limit: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            max_participants: default_max_participants(),
            early_candidate_limit: default_early_candidate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay WebSocket URL (ws:// or wss://)
    pub url: String,

    /// Channel (call) identifier
    pub channel: String,

    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/signal".to_string(),
            channel: "lobby".to_string(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// Stable user id; generated at startup when empty
    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub display_name: String,
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// Explicit ICE servers, used when no STUN/TURN host is configured
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    #[serde(default)]
    pub stun_host: String,

    #[serde(default)]
    pub stun_port: u16,

    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// "udp" or "tcp"
    #[serde(default)]
    pub turn_protocol: String,

    #[serde(default)]
    pub turn_tls: bool,

    #[serde(default)]
    pub turn_username: String,

    #[serde(default)]
    pub turn_password: String,

    /// Shared secret for time-limited TURN REST credentials
    #[serde(default)]
    pub turn_shared_secret: String,

    /// Publish an audio track
    #[serde(default = "default_true")]
    pub send_audio: bool,

    /// Publish a video track
    #[serde(default = "default_true")]
    pub send_video: bool,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            stun_host: String::new(),
            stun_port: 0,
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: String::new(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_shared_secret: String::new(),
            send_audio: true,
            send_video: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env_logger filter string
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !(1..=120).contains(&self.call.negotiation_timeout_secs) {
            return Err("Negotiation timeout must be between 1 and 120 seconds".into());
        }

        if self.call.max_participants == 0 {
            return Err("Max participants must be non-zero".into());
        }

        if !self.relay.url.starts_with("ws://") && !self.relay.url.starts_with("wss://") {
            return Err("Relay url must start with ws:// or wss://".into());
        }

        if self.relay.channel.is_empty() {
            return Err("Relay channel must not be empty".into());
        }

        if self.identity.user_id.chars().any(char::is_whitespace) {
            return Err("User id must not contain whitespace".into());
        }

        if !self.webrtc.turn_host.is_empty() {
            if self.webrtc.turn_port == 0 {
                return Err("TURN port must be non-zero".into());
            }
            let protocol = self.webrtc.turn_protocol.as_str();
            if !protocol.is_empty() && protocol != "udp" && protocol != "tcp" {
                return Err("TURN protocol must be \"udp\" or \"tcp\"".into());
            }
        }

        if !self.webrtc.stun_host.is_empty() && self.webrtc.stun_port == 0 {
            return Err("STUN port must be non-zero".into());
        }

        Ok(())
    }
}

fn default_settle_delay_ms() -> u64 { 250 }
fn default_negotiation_timeout_secs() -> u64 { 12 }
fn default_max_participants() -> usize { 16 }
fn default_early_candidate_limit() -> usize { 64 }
fn default_reconnect_delay_ms() -> u64 { 1000 }
fn default_turn_port() -> u16 { 3478 }

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}
