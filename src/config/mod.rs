//! Configuration management for pairlink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Rendezvous server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Endpoint (sender/receiver) configuration
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Chunked transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address
    pub host: String,

    /// HTTP port for signaling and health checks
    pub port: u16,

    /// CORS origin for the health endpoint
    #[serde(default)]
    pub cors_origin: Option<String>,

    /// Pairing code lifetime in seconds
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,

    /// Interval between expired-code sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl ServerConfig {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origin: None,
            code_ttl_secs: default_code_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Rendezvous WebSocket URL
    pub signaling_url: String,

    /// How long to wait for the control connection to come up
    #[serde(default = "default_control_connect_timeout_ms")]
    pub control_connect_timeout_ms: u64,

    /// How long to wait for an acknowledgement from the server
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Watchdog for reaching the connected state after the offer
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,

    /// Fresh codes tried by the receiver CLI before giving up on collisions
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,
}

impl EndpointConfig {
    pub fn control_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.control_connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080/signaling".to_string(),
            control_connect_timeout_ms: default_control_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            register_attempts: default_register_attempts(),
        }
    }
}

/// ICE server entry (STUN or TURN)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC peer link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN servers handed to the ICE agent
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Public IPs advertised as host candidates (1:1 NAT)
    #[serde(default)]
    pub nat1to1_ips: Vec<String>,

    /// Restrict local UDP candidates to this port range
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,

    /// Retransmit limit for the text telemetry channel
    #[serde(default = "default_text_max_retransmits")]
    pub text_max_retransmits: u16,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            nat1to1_ips: Vec::new(),
            ephemeral_udp_port_range: None,
            text_max_retransmits: default_text_max_retransmits(),
        }
    }
}

/// Chunked data-channel transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Payloads longer than this many bytes are chunked
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,

    /// Upper bound on a single chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Largest frame a data channel accepts (SCTP message size)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Pause sending while the channel buffers more than this
    #[serde(default = "default_buffered_high_watermark")]
    pub buffered_high_watermark: usize,

    /// Poll interval while waiting for the buffer to drain
    #[serde(default = "default_backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,

    /// Largest chunk count accepted for one message
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
            chunk_size: default_chunk_size(),
            max_message_size: default_max_message_size(),
            buffered_high_watermark: default_buffered_high_watermark(),
            backpressure_poll_ms: default_backpressure_poll_ms(),
            max_chunks: default_max_chunks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level / env_logger filter string
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
        if self.server.port == 0 {
            return Err("Server port must be non-zero".into());
        }

        if self.server.code_ttl_secs == 0 {
            return Err("Pairing code TTL must be non-zero".into());
        }

        if self.server.sweep_interval_secs == 0 {
            return Err("Sweep interval must be non-zero".into());
        }

        let url = self.endpoint.signaling_url.trim();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err("Endpoint signaling_url must use ws:// or wss://".into());
        }

        if self.endpoint.control_connect_timeout_ms == 0 {
            return Err("Control connect timeout must be non-zero".into());
        }

        if self.endpoint.negotiation_timeout_secs == 0 {
            return Err("Negotiation timeout must be non-zero".into());
        }

        if let Some([low, high]) = self.webrtc.ephemeral_udp_port_range {
            if low == 0 || low > high {
                return Err("WebRTC ephemeral_udp_port_range must be [low, high] with 0 < low <= high".into());
            }
        }

        for ip in &self.webrtc.nat1to1_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(format!("WebRTC nat1to1_ips entry is not an IP address: {}", ip).into());
            }
        }

        if self.transport.chunk_size == 0 {
            return Err("Transport chunk_size must be non-zero".into());
        }

        if self.transport.chunk_size > self.transport.chunk_threshold {
            return Err("Transport chunk_size cannot exceed chunk_threshold".into());
        }

        if self.transport.max_message_size < 1024 {
            return Err("Transport max_message_size must be at least 1024 bytes".into());
        }

        if self.transport.max_chunks == 0 {
            return Err("Transport max_chunks must be non-zero".into());
        }

        Ok(())
    }
}


fn default_code_ttl_secs() -> u64 { 300 }
fn default_sweep_interval_secs() -> u64 { 300 }
fn default_control_connect_timeout_ms() -> u64 { 5000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_negotiation_timeout_secs() -> u64 { 30 }
fn default_register_attempts() -> u32 { 5 }
fn default_text_max_retransmits() -> u16 { 3 }
fn default_chunk_threshold() -> usize { 200_000 }
fn default_chunk_size() -> usize { 100_000 }
fn default_max_message_size() -> usize { 64 * 1024 }
fn default_buffered_high_watermark() -> usize { 64 * 1024 }
fn default_backpressure_poll_ms() -> u64 { 10 }
fn default_max_chunks() -> usize { 4096 }

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}
