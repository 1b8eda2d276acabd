//! Server-wide configuration surface.
//!
//! This is a plain, serializable struct covering every knob the control
//! state machine, net primitives and timers read at runtime. Parsing it out
//! of command-line arguments or a config file is left to an embedding
//! caller; this crate only consumes the struct.

use serde::{Deserialize, Serialize};

/// Which address family to announce the control listener on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    /// Let the OS/resolver decide; prefer dual-stack IPv6 when no bind
    /// address was given, falling back to IPv4 on `EAFNOSUPPORT`.
    Any,
    V4,
    V6,
}

impl Default for AddressFamily {
    fn default() -> Self {
        AddressFamily::Any
    }
}

/// Configuration for the iperf3 server core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iperf3Config {
    /// Whether the server accepts connections at all.
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the control listener to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Control port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address family hint for the control listener.
    #[serde(default)]
    pub address_family: AddressFamily,

    /// Network device to bind to (`SO_BINDTODEVICE`), if the platform
    /// supports it. A value here that the platform can't apply is logged,
    /// not fatal.
    #[serde(default)]
    pub bind_device: Option<String>,

    /// How long the event loop waits for a first connection while idle,
    /// before cycling back to check for shutdown.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Cap on how long a single `select`/`tokio::select!` wait may block
    /// while a test is actively receiving, so stats/timers still tick.
    #[serde(default = "default_rcv_timeout_ms")]
    pub rcv_timeout_ms: u64,

    /// Deadline for a single control-byte or cookie read on the control
    /// connection (e.g. the initial cookie, and the final `IPERF_DONE`
    /// acknowledgement) — a connected-but-silent peer can't park a task past
    /// this. Does not apply to the `TEST_RUNNING`-phase wait for `TEST_END`,
    /// which is legitimately bounded by the test's own duration instead.
    #[serde(default = "default_ctrl_wait_ms")]
    pub ctrl_wait_ms: u64,

    /// How long the server waits for every data stream to connect during
    /// `CREATE_STREAMS` before aborting the session.
    #[serde(default = "default_create_streams_timeout_secs")]
    pub create_streams_timeout_secs: u64,

    /// Hard cap on test duration, regardless of what the client requests
    /// (0 = no cap beyond the client's own request).
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    /// Aggregate bitrate limit across all streams and directions
    /// (0 = unlimited). Checked as `parallel * rate * (bidi ? 2 : 1)`.
    #[serde(default)]
    pub max_bandwidth: u64,

    /// Default periodic stats/reporter interval when the client doesn't
    /// request one, seconds.
    #[serde(default = "default_report_interval_secs")]
    pub default_interval_secs: f64,

    /// Socket buffer size to request when the client doesn't specify a
    /// window size (0 = leave at OS default).
    #[serde(default)]
    pub default_socket_buffer_size: u32,

    /// CPU affinity to log at startup. Not applied — pinning is a platform
    /// concern left to the process supervisor.
    #[serde(default)]
    pub affinity: Option<String>,

    /// Exit after serving a single test rather than looping back to IDLE.
    #[serde(default)]
    pub one_off: bool,

    /// Default TCP congestion control algorithm to request, if the client
    /// doesn't name one. `None` leaves the OS default in place.
    #[serde(default)]
    pub congestion: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5201
}

fn default_idle_timeout_secs() -> u64 {
    0
}

fn default_rcv_timeout_ms() -> u64 {
    1000
}

fn default_ctrl_wait_ms() -> u64 {
    5000
}

fn default_create_streams_timeout_secs() -> u64 {
    5
}

fn default_max_duration() -> u64 {
    3600
}

fn default_report_interval_secs() -> f64 {
    1.0
}

impl Default for Iperf3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            address_family: AddressFamily::default(),
            bind_device: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            rcv_timeout_ms: default_rcv_timeout_ms(),
            ctrl_wait_ms: default_ctrl_wait_ms(),
            create_streams_timeout_secs: default_create_streams_timeout_secs(),
            max_duration_secs: default_max_duration(),
            max_bandwidth: 0,
            default_interval_secs: default_report_interval_secs(),
            default_socket_buffer_size: 0,
            affinity: None,
            one_off: false,
            congestion: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_iperf3_server_defaults() {
        let config = Iperf3Config::default();
        assert!(!config.enabled);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5201);
        assert_eq!(config.address_family, AddressFamily::Any);
        assert_eq!(config.max_duration_secs, 3600);
        assert_eq!(config.max_bandwidth, 0);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Iperf3Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Iperf3Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, config.port);
        assert_eq!(back.address_family, config.address_family);
    }
}
