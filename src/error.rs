//! Error taxonomy for the iperf3 server core.
//!
//! Every fallible operation returns a `Result<_, Iperf3Error>` — there is no
//! global "last error" slot. Variants are named after the operation that
//! failed, mirroring the granularity iperf3 itself uses for its `IEx` error
//! codes, so a caller logging `Iperf3Error` gets roughly the same signal a
//! caller of the original tool would get from its error strings.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur while running an iperf3 server session.
#[derive(Error, Debug)]
pub enum Iperf3Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to bind or listen on the control address
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection
    #[error("failed to accept a connection: {0}")]
    Accept(#[source] std::io::Error),

    /// Failed to set TCP_NODELAY
    #[error("failed to set TCP_NODELAY: {0}")]
    SetNoDelay(#[source] std::io::Error),

    /// Failed to set a socket send/receive buffer size
    #[error("failed to set socket buffer size: {0}")]
    SetBuf(#[source] std::io::Error),

    /// The kernel did not honor the requested socket buffer size
    #[error("requested socket buffer size {requested} was not honored, actual is {actual}")]
    SetBuf2 { requested: usize, actual: usize },

    /// Failed to set TCP_MAXSEG
    #[error("failed to set TCP_MAXSEG: {0}")]
    SetMss(#[source] std::io::Error),

    /// Failed to set TCP_CONGESTION to the requested algorithm
    #[error("failed to set TCP_CONGESTION to {name:?}: {source}")]
    SetCongestion {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to set a socket user timeout
    #[error("failed to set a socket user timeout: {0}")]
    SetUserTimeout(#[source] std::io::Error),

    /// Failed to set a flow label or pacing rate
    #[error("failed to set a flow label or pacing rate: {0}")]
    SetFlow(#[source] std::io::Error),

    /// Failed to set SO_REUSEADDR
    #[error("failed to set SO_REUSEADDR: {0}")]
    SetReuseAddr(#[source] std::io::Error),

    /// Failed to set IPV6_V6ONLY
    #[error("failed to set IPV6_V6ONLY: {0}")]
    SetV6Only(#[source] std::io::Error),

    /// Failed to bind or listen on a data stream socket
    #[error("failed to listen on a data stream socket: {0}")]
    StreamListen(#[source] std::io::Error),

    /// Failed to connect a data stream
    #[error("failed to connect a data stream: {0}")]
    StreamConnect(#[source] std::io::Error),

    /// Failed to accept a data stream
    #[error("failed to accept a data stream: {0}")]
    StreamAccept(#[source] std::io::Error),

    /// Failed to read from a data stream
    #[error("failed to read from a data stream: {0}")]
    StreamRead(#[source] std::io::Error),

    /// Failed to write to a data stream
    #[error("failed to write to a data stream: {0}")]
    StreamWrite(#[source] std::io::Error),

    /// Failed to read the client cookie
    #[error("failed to read the client cookie: {0}")]
    RecvCookie(#[source] std::io::Error),

    /// Failed to send the server cookie
    #[error("failed to send the server cookie: {0}")]
    SendCookie(#[source] std::io::Error),

    /// Failed to receive a length-prefixed control message
    #[error("failed to receive a control message: {0}")]
    RecvMessage(#[source] std::io::Error),

    /// Failed to send a length-prefixed control message
    #[error("failed to send a control message: {0}")]
    SendMessage(#[source] std::io::Error),

    /// The control connection closed unexpectedly
    #[error("control connection closed")]
    CtrlClose,

    /// A control message was malformed or out of sequence
    #[error("malformed control message: {0}")]
    Message(String),

    /// The client sent CLIENT_TERMINATE before the test finished normally
    #[error("client terminated the test early")]
    ClientTerm,

    /// No control message arrived before the deadline
    #[error("no message received before the deadline")]
    NoMsg,

    /// The requested aggregate rate exceeds the server's configured limit
    #[error(
        "aggregate requested rate ({parallel} streams x {rate} bps{bidi}) exceeds the configured limit of {limit} bps"
    )]
    TotalRate {
        parallel: u32,
        rate: u64,
        bidi: &'static str,
        limit: u64,
    },

    /// Failed to initialize the test (e.g. streams never connected in time)
    #[error("failed to initialize the test: {0}")]
    InitTest(String),

    /// The event loop's readiness wait itself failed
    #[error("event loop readiness wait failed: {0}")]
    Select(#[source] std::io::Error),

    /// Generic protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A negotiated parameter was invalid
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The test timed out waiting for the client
    #[error("test timeout after {0} seconds")]
    Timeout(u64),

    /// The server is shutting down
    #[error("server is shutting down")]
    Shutdown,
}

/// Result type for iperf3 server operations.
pub type Result<T> = std::result::Result<T, Iperf3Error>;
