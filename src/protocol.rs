//! Wire protocol definitions: control-channel phase bytes, parameter/result
//! JSON payloads, cookie and UDP framing constants.
//!
//! The control connection carries single-byte phase announcements and
//! length-prefixed JSON blobs. Data connections (TCP or UDP) carry raw
//! payload, with UDP additionally framing a small timestamp+sequence header
//! on every datagram.

use serde::{Deserialize, Serialize};

/// Cookie length for stream identification.
pub const COOKIE_SIZE: usize = 37;

/// UDP header size when sequence numbers are 32-bit: sec + usec + seq.
pub const UDP_HEADER_SIZE_32: usize = 4 + 4 + 4;

/// UDP header size when sequence numbers are 64-bit counters.
pub const UDP_HEADER_SIZE_64: usize = 4 + 4 + 8;

/// First datagram a client sends to "connect" a UDP stream: ASCII '9876'.
pub const UDP_CONNECT_MSG: u32 = 0x39_38_37_36;

/// Server's reply confirming the UDP "connection": ASCII '6789'.
pub const UDP_CONNECT_REPLY: u32 = 0x36_37_38_39;

/// Extra headroom added to a UDP socket buffer when the default turns out
/// to be smaller than the block size.
pub const UDP_BUFFER_EXTRA: usize = 4096;

/// Mint a fresh [`COOKIE_SIZE`]-byte cookie. The wire protocol treats the
/// cookie as an opaque token the *client* chooses, but an embedding caller
/// that wants the server side to hand its own client a cookie up front
/// (rather than relying on whatever the client generated) can use this
/// instead of rolling its own padding scheme.
pub fn generate_cookie() -> Vec<u8> {
    let id = uuid::Uuid::new_v4();
    let mut cookie = id.simple().to_string().into_bytes();
    cookie.resize(COOKIE_SIZE, 0);
    cookie
}

/// Control-channel phases, in the numbering the wire protocol actually uses.
///
/// Values are the signed byte sent on the control socket; unknown values
/// decode to `None` and the caller should treat that as `IEMESSAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Phase {
    /// `iperf3 -s` is up and listening, no client attached yet.
    IperfStart = 15,
    /// Reading/merging the client's requested test parameters.
    ParamExchange = 9,
    /// Waiting for the client to open its data connections.
    CreateStreams = 10,
    /// All data streams present; about to start the hot path.
    TestStart = 1,
    /// The hot path is running.
    TestRunning = 2,
    /// Client announced it is done sending/receiving.
    TestEnd = 4,
    /// Exchanging final per-stream results as JSON.
    ExchangeResults = 13,
    /// Final results are available to report.
    DisplayResults = 14,
    /// Client acknowledged results; session about to close.
    IperfDone = 16,
    /// The client asked to tear the session down early.
    ClientTerminate = 12,
    /// A second control connection arrived while this one is live.
    AccessDenied = -1,
}

impl Phase {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b as i8 {
            15 => Some(Phase::IperfStart),
            9 => Some(Phase::ParamExchange),
            10 => Some(Phase::CreateStreams),
            1 => Some(Phase::TestStart),
            2 => Some(Phase::TestRunning),
            4 => Some(Phase::TestEnd),
            13 => Some(Phase::ExchangeResults),
            14 => Some(Phase::DisplayResults),
            16 => Some(Phase::IperfDone),
            12 => Some(Phase::ClientTerminate),
            -1 => Some(Phase::AccessDenied),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self as i8) as u8
    }

    /// Whether `next` is a permitted successor of `self` per the server-side
    /// transition table. `ClientTerminate` and `AccessDenied` are reachable
    /// from (almost) anywhere and are checked separately by the caller.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (IperfStart, ParamExchange)
                | (ParamExchange, CreateStreams)
                | (CreateStreams, TestStart)
                | (TestStart, TestRunning)
                | (TestRunning, TestEnd)
                | (TestEnd, ExchangeResults)
                | (ExchangeResults, DisplayResults)
                | (DisplayResults, IperfDone)
                | (IperfDone, IperfStart)
        )
    }
}

/// Test parameters negotiated by the client at `PARAM_EXCHANGE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestParameters {
    /// Test protocol: "TCP" or "UDP".
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Test duration in seconds (0 = byte/block-bounded).
    #[serde(default = "default_duration")]
    pub time: u64,

    /// Number of parallel streams.
    #[serde(default = "default_streams")]
    pub parallel: u32,

    /// Reverse mode: server sends to client.
    #[serde(default)]
    pub reverse: bool,

    /// Bidirectional mode: both directions run concurrently.
    #[serde(default)]
    pub bidirectional: bool,

    /// Target bandwidth for sender direction, bits/second (0 = unlimited).
    #[serde(default)]
    pub bandwidth: u64,

    /// Block size for each send/recv call.
    #[serde(default = "default_blksize")]
    pub blksize: u32,

    /// Requested socket buffer size (0 = leave at OS default).
    #[serde(default)]
    pub window: u32,

    /// TCP_MAXSEG value (0 = don't set).
    #[serde(default)]
    pub mss: u32,

    /// TCP_NODELAY.
    #[serde(default)]
    pub nodelay: bool,

    /// Byte-bounded test: stop after this many bytes (0 = use time/blocks).
    #[serde(default)]
    pub bytes: u64,

    /// Block-bounded test: stop after this many blocks (0 = use time/bytes).
    #[serde(default)]
    pub blockcount: u64,

    /// Warm-up interval whose counters are discarded, seconds.
    #[serde(default)]
    pub omit: u32,

    /// Client version string, informational only.
    #[serde(default)]
    pub client_version: String,

    /// Use UDP for the data streams.
    #[serde(default)]
    pub udp: bool,

    /// Periodic report interval, seconds (0 disables periodic reports).
    #[serde(default = "default_interval")]
    pub interval: f64,

    /// Use 64-bit UDP sequence counters instead of 32-bit.
    #[serde(default)]
    pub udp_counters_64bit: bool,

    /// Whether the receive hot path should use the truncated/MSG_TRUNC
    /// optimization rather than copying the whole block.
    #[serde(default)]
    pub skip_rx_copy: bool,

    /// Zero-copy send path (sendfile-equivalent from a backing fd).
    #[serde(default)]
    pub zerocopy: bool,

    /// TCP congestion control algorithm name requested by the client.
    #[serde(default)]
    pub congestion: Option<String>,

    /// Fair-queue pacing rate, bits/second (0 = don't set).
    #[serde(default)]
    pub fqrate: u64,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

fn default_duration() -> u64 {
    10
}

fn default_streams() -> u32 {
    1
}

fn default_blksize() -> u32 {
    128 * 1024
}

fn default_interval() -> f64 {
    1.0
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            time: default_duration(),
            parallel: default_streams(),
            reverse: false,
            bidirectional: false,
            bandwidth: 0,
            blksize: default_blksize(),
            window: 0,
            mss: 0,
            nodelay: false,
            bytes: 0,
            blockcount: 0,
            omit: 0,
            client_version: String::new(),
            udp: false,
            interval: default_interval(),
            udp_counters_64bit: false,
            skip_rx_copy: false,
            zerocopy: false,
            congestion: None,
            fqrate: 0,
        }
    }
}

/// The test's overall direction as seen from the server, derived from
/// `reverse`/`bidirectional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Client sends, server receives.
    Receiver,
    /// Server sends, client receives.
    Sender,
    /// Both directions run concurrently.
    Bidirectional,
}

impl TestMode {
    pub fn from_params(params: &TestParameters) -> Self {
        if params.bidirectional {
            TestMode::Bidirectional
        } else if params.reverse {
            TestMode::Sender
        } else {
            TestMode::Receiver
        }
    }
}

/// Per-stream result, in the shape the client-facing JSON uses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamResult {
    pub id: u32,
    pub bytes: u64,
    pub seconds: f64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,
}

/// One periodic report: per-stream results plus their sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalResult {
    pub streams: Vec<StreamResult>,
    pub sum: StreamResult,
}

/// Final results exchanged at `EXCHANGE_RESULTS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResults {
    pub start: StartInfo,
    pub intervals: Vec<IntervalResult>,
    pub end: EndInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInfo {
    pub connected: Vec<ConnectedInfo>,
    pub version: String,
    pub system_info: String,
    /// Human-readable wall-clock time the test started, RFC 2822 (the
    /// format the original tool's own JSON output uses for this field).
    pub timestamp: String,
    pub test_start: TestStartInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedInfo {
    pub socket: i32,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStartInfo {
    pub protocol: String,
    pub num_streams: u32,
    pub blksize: u32,
    pub omit: u32,
    pub duration: u64,
    pub bytes: u64,
    pub blocks: u64,
    pub reverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndInfo {
    pub streams: Vec<StreamEndResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_sent: Option<StreamResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_received: Option<StreamResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_utilization_percent: Option<CpuUtilization>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEndResult {
    pub sender: StreamResult,
    pub receiver: StreamResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuUtilization {
    pub host_total: f64,
    pub host_user: f64,
    pub host_system: f64,
    pub remote_total: f64,
    pub remote_user: f64,
    pub remote_system: f64,
}

/// Encode a UDP datagram header (sec/usec/sequence) into `buf`, returning the
/// number of bytes written. `buf` must be at least
/// [`UDP_HEADER_SIZE_64`] long regardless of mode; the caller trims unused
/// trailing header bytes when running in 32-bit mode.
pub fn encode_udp_header(buf: &mut [u8], sec: u32, usec: u32, sequence: u64, counters_64bit: bool) -> usize {
    buf[0..4].copy_from_slice(&sec.to_be_bytes());
    buf[4..8].copy_from_slice(&usec.to_be_bytes());
    if counters_64bit {
        buf[8..16].copy_from_slice(&sequence.to_be_bytes());
        UDP_HEADER_SIZE_64
    } else {
        buf[8..12].copy_from_slice(&(sequence as u32).to_be_bytes());
        UDP_HEADER_SIZE_32
    }
}

/// Decode a UDP datagram header. Returns `(sec, usec, sequence)`.
pub fn decode_udp_header(buf: &[u8], counters_64bit: bool) -> (u32, u32, u64) {
    let sec = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let usec = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let sequence = if counters_64bit {
        u64::from_be_bytes(buf[8..16].try_into().unwrap())
    } else {
        u32::from_be_bytes(buf[8..12].try_into().unwrap()) as u64
    };
    (sec, usec, sequence)
}

/// Header size in bytes for the given counter mode.
pub fn udp_header_size(counters_64bit: bool) -> usize {
    if counters_64bit {
        UDP_HEADER_SIZE_64
    } else {
        UDP_HEADER_SIZE_32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_its_byte() {
        let phases = [
            Phase::IperfStart,
            Phase::ParamExchange,
            Phase::CreateStreams,
            Phase::TestStart,
            Phase::TestRunning,
            Phase::TestEnd,
            Phase::ExchangeResults,
            Phase::DisplayResults,
            Phase::IperfDone,
            Phase::ClientTerminate,
            Phase::AccessDenied,
        ];
        for phase in phases {
            assert_eq!(Phase::from_byte(phase.to_byte()), Some(phase));
        }
    }

    #[test]
    fn unknown_byte_has_no_phase() {
        assert_eq!(Phase::from_byte(99), None);
    }

    #[test]
    fn udp_header_round_trips_in_both_counter_modes() {
        for counters_64bit in [false, true] {
            let mut buf = [0u8; UDP_HEADER_SIZE_64];
            let written = encode_udp_header(&mut buf, 1_700_000_000, 123_456, 42, counters_64bit);
            assert_eq!(written, udp_header_size(counters_64bit));
            let (sec, usec, seq) = decode_udp_header(&buf, counters_64bit);
            assert_eq!((sec, usec, seq), (1_700_000_000, 123_456, 42));
        }
    }

    #[test]
    fn udp_header_round_trips_at_64bit_sequence_boundary() {
        let mut buf = [0u8; UDP_HEADER_SIZE_64];
        let big = u64::MAX - 1;
        encode_udp_header(&mut buf, 0, 0, big, true);
        let (_, _, seq) = decode_udp_header(&buf, true);
        assert_eq!(seq, big);
    }

    #[test]
    fn test_parameters_defaults_match_iperf3() {
        let params = TestParameters::default();
        assert_eq!(params.protocol, "TCP");
        assert_eq!(params.time, 10);
        assert_eq!(params.parallel, 1);
        assert!(!params.reverse);
        assert!(!params.bidirectional);
        assert_eq!(params.blksize, 128 * 1024);
    }

    #[test]
    fn generated_cookies_are_cookie_sized_and_unique() {
        let a = generate_cookie();
        let b = generate_cookie();
        assert_eq!(a.len(), COOKIE_SIZE);
        assert_eq!(b.len(), COOKIE_SIZE);
        assert_ne!(a, b);
    }

    #[test]
    fn test_mode_follows_reverse_and_bidirectional_flags() {
        let mut params = TestParameters::default();
        assert_eq!(TestMode::from_params(&params), TestMode::Receiver);
        params.reverse = true;
        assert_eq!(TestMode::from_params(&params), TestMode::Sender);
        params.bidirectional = true;
        assert_eq!(TestMode::from_params(&params), TestMode::Bidirectional);
    }
}
