//! UDP data-stream handshake, framing, and the loss/out-of-order/jitter
//! accounting state machine.
//!
//! UDP has no `listen()`/`accept()`, so a stream is "accepted" by binding a
//! fresh socket, waiting for the client's first datagram (the
//! [`crate::protocol::UDP_CONNECT_MSG`] sentinel), `connect()`-ing the
//! socket back to whichever address it arrived from, and replying with
//! [`crate::protocol::UDP_CONNECT_REPLY`]. The jitter estimator is the
//! exponentially-weighted one from RFC 1889 §6.3.1; the loss/out-of-order
//! bookkeeping treats the header's sequence number as the single source of
//! truth for what the receiver has or hasn't seen yet.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Iperf3Error, Result};
use crate::protocol::{decode_udp_header, encode_udp_header, udp_header_size, UDP_BUFFER_EXTRA, UDP_CONNECT_MSG, UDP_CONNECT_REPLY};
use crate::stream::StreamCounters;

/// How many one-second retries the server gives a UDP stream to connect,
/// mirroring the original tool's 30-retry accept loop.
pub const UDP_ACCEPT_RETRIES: u32 = 30;

/// Bind a fresh UDP socket to `port`, on the unspecified address of
/// whichever family `local_family_hint` indicates. `port` must be the
/// server's configured control port: the client sends its
/// [`crate::protocol::UDP_CONNECT_MSG`] datagram there, not to an ephemeral
/// port the server never communicates back, matching the original tool's
/// "bind the UDP listener to the server port" approach (which also notes
/// that more than one parallel UDP stream isn't correctly supported this
/// way, since a second bind to the same port while the first stream's
/// socket is still open will fail).
pub async fn bind_for_stream(port: u16, local_family_hint: SocketAddr) -> Result<UdpSocket> {
    let bind_addr = if local_family_hint.is_ipv6() {
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port)
    } else {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port)
    };
    UdpSocket::bind(bind_addr).await.map_err(Iperf3Error::StreamListen)
}

/// Wait for the client's connect datagram on an already-bound socket, then
/// "connect" the socket to the peer it arrived from and reply.
pub async fn wait_for_connect(socket: &UdpSocket) -> Result<()> {
    let mut buf = [0u8; 4];
    for attempt in 0..UDP_ACCEPT_RETRIES {
        match timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, peer))) => {
                if n == 4 && u32::from_be_bytes(buf) == UDP_CONNECT_MSG {
                    socket.connect(peer).await.map_err(Iperf3Error::StreamConnect)?;
                    socket
                        .send(&UDP_CONNECT_REPLY.to_be_bytes())
                        .await
                        .map_err(Iperf3Error::StreamWrite)?;
                    return Ok(());
                }
                tracing::warn!(attempt, "unrecognized UDP connect datagram, retrying");
            }
            Ok(Err(e)) => return Err(Iperf3Error::StreamAccept(e)),
            Err(_elapsed) => continue,
        }
    }
    Err(Iperf3Error::StreamAccept(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "no UDP connect datagram within the accept retry budget",
    )))
}

/// Bind a fresh socket on `port` and wait for the client's connect
/// handshake on it, in one call.
pub async fn accept_stream(port: u16, local_family_hint: SocketAddr) -> Result<UdpSocket> {
    let socket = bind_for_stream(port, local_family_hint).await?;
    wait_for_connect(&socket).await?;
    Ok(socket)
}

/// Outcome of [`buffer_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCheckOutcome {
    /// The requested size (or the OS default, if none was requested) is at
    /// least as large as `blksize`.
    Ok,
    /// No size was requested and the OS default was smaller than
    /// `blksize`; the socket's buffer was bumped by [`UDP_BUFFER_EXTRA`].
    Bumped { new_size: usize },
}

/// Verify (and if necessary bump) a UDP socket's receive buffer against the
/// block size it will carry. A buffer smaller than `blksize` truncates
/// datagrams, so this is checked once at stream setup.
pub fn buffer_check(socket: &UdpSocket, requested: u32, blksize: u32) -> Result<BufferCheckOutcome> {
    let sock_ref = socket2::SockRef::from(socket);
    if requested > 0 {
        sock_ref
            .set_recv_buffer_size(requested as usize)
            .map_err(Iperf3Error::SetBuf)?;
        let actual = sock_ref.recv_buffer_size().map_err(Iperf3Error::SetBuf)?;
        if actual < requested as usize {
            return Err(Iperf3Error::SetBuf2 {
                requested: requested as usize,
                actual,
            });
        }
        return Ok(BufferCheckOutcome::Ok);
    }

    let actual = sock_ref.recv_buffer_size().map_err(Iperf3Error::SetBuf)?;
    if actual >= blksize as usize {
        return Ok(BufferCheckOutcome::Ok);
    }
    let bumped = blksize as usize + UDP_BUFFER_EXTRA;
    sock_ref.set_recv_buffer_size(bumped).map_err(Iperf3Error::SetBuf)?;
    let new_size = sock_ref.recv_buffer_size().map_err(Iperf3Error::SetBuf)?;
    tracing::warn!(blksize, new_size, "default UDP buffer was smaller than blksize, bumped it");
    Ok(BufferCheckOutcome::Bumped { new_size })
}

/// Stamps and sends successive UDP datagrams, tracking the sequence number.
pub struct UdpSender {
    sequence: u64,
    counters_64bit: bool,
}

impl UdpSender {
    pub fn new(counters_64bit: bool) -> Self {
        Self {
            sequence: 0,
            counters_64bit,
        }
    }

    /// Stamp `payload`'s leading header bytes with the current time and
    /// sequence number, then send it. `payload` must be at least
    /// `udp_header_size(counters_64bit)` bytes long.
    pub async fn send(
        &mut self,
        socket: &UdpSocket,
        payload: &mut [u8],
        counters: &StreamCounters,
        counting_enabled: bool,
    ) -> Result<usize> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let header_len = encode_udp_header(payload, now.as_secs() as u32, now.subsec_micros(), self.sequence, self.counters_64bit);
        debug_assert_eq!(header_len, udp_header_size(self.counters_64bit));
        self.sequence += 1;

        match socket.send(payload).await {
            Ok(n) => {
                if counting_enabled {
                    counters.add_bytes(n as u64);
                    counters.add_packet();
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // A transient send-side error: give the caller its sequence
                // number back so the next attempt resends the same packet
                // rather than silently skipping it.
                self.sequence -= 1;
                Err(Iperf3Error::StreamWrite(e))
            }
            Err(e) => Err(Iperf3Error::StreamWrite(e)),
        }
    }
}

/// Tracks expected sequence numbers and transit-time jitter for one
/// receiving UDP stream. Not `Send`-shared; owned by the worker task and
/// published to [`StreamCounters`] after each packet.
pub struct UdpLossTracker {
    expected_sequence: u64,
    last_transit_secs: Option<f64>,
    jitter_secs: f64,
    seen_any: bool,
}

impl UdpLossTracker {
    pub fn new() -> Self {
        Self {
            expected_sequence: 0,
            last_transit_secs: None,
            jitter_secs: 0.0,
            seen_any: false,
        }
    }

    /// Decode a received datagram's header and update loss/out-of-order/
    /// jitter counters. `arrival_secs` is the receiver's own clock reading
    /// at arrival time, in seconds since the epoch.
    pub fn on_datagram(&mut self, buf: &[u8], counters_64bit: bool, arrival_secs: f64, counters: &StreamCounters) {
        let (sec, usec, sequence) = decode_udp_header(buf, counters_64bit);
        let send_secs = sec as f64 + usec as f64 / 1_000_000.0;
        let transit = arrival_secs - send_secs;

        if let Some(last) = self.last_transit_secs {
            let mut delta = transit - last;
            if delta < 0.0 {
                delta = -delta;
            }
            self.jitter_secs += (delta - self.jitter_secs) / 16.0;
            counters.set_jitter_millis(self.jitter_secs * 1000.0);
        }
        self.last_transit_secs = Some(transit);

        if !self.seen_any {
            self.seen_any = true;
            self.expected_sequence = sequence + 1;
            return;
        }

        if sequence < self.expected_sequence {
            counters.out_of_order_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            counters.undo_one_lost();
        } else {
            if sequence != self.expected_sequence {
                counters.add_lost(sequence - self.expected_sequence);
            }
            self.expected_sequence = sequence + 1;
        }
    }
}

impl Default for UdpLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn header(sec: u32, usec: u32, seq: u64) -> [u8; 16] {
        let mut buf = [0u8; 16];
        encode_udp_header(&mut buf, sec, usec, seq, false);
        buf
    }

    #[test]
    fn in_order_packets_report_no_loss() {
        let counters = StreamCounters::new();
        let mut tracker = UdpLossTracker::new();
        for seq in 0..5u64 {
            let buf = header(100, seq as u32 * 1000, seq);
            tracker.on_datagram(&buf, false, 100.0 + seq as f64 * 0.001, &counters);
        }
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 0);
        assert_eq!(counters.out_of_order_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn a_gap_in_sequence_counts_as_lost() {
        let counters = StreamCounters::new();
        let mut tracker = UdpLossTracker::new();
        tracker.on_datagram(&header(100, 0, 0), false, 100.0, &counters);
        tracker.on_datagram(&header(100, 3000, 3), false, 100.003, &counters);
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn a_late_arrival_is_out_of_order_and_undoes_one_lost_count() {
        let counters = StreamCounters::new();
        let mut tracker = UdpLossTracker::new();
        tracker.on_datagram(&header(100, 0, 0), false, 100.0, &counters);
        tracker.on_datagram(&header(100, 2000, 2), false, 100.002, &counters);
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 1);
        // packet 1 now shows up late.
        tracker.on_datagram(&header(100, 1000, 1), false, 100.0015, &counters);
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 0);
        assert_eq!(counters.out_of_order_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lost_count_never_goes_negative_on_repeated_reorders() {
        let counters = StreamCounters::new();
        let mut tracker = UdpLossTracker::new();
        tracker.on_datagram(&header(100, 0, 0), false, 100.0, &counters);
        // Several late/duplicate arrivals with nothing actually lost.
        for _ in 0..5 {
            tracker.on_datagram(&header(100, 0, 0), false, 100.0, &counters);
        }
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn jitter_accumulates_towards_the_transit_delta() {
        let counters = StreamCounters::new();
        let mut tracker = UdpLossTracker::new();
        tracker.on_datagram(&header(100, 0, 0), false, 100.0, &counters);
        assert_eq!(counters.jitter_millis(), 0.0);
        tracker.on_datagram(&header(100, 0, 1), false, 100.010, &counters);
        assert!(counters.jitter_millis() > 0.0);
    }

    #[tokio::test]
    async fn connect_handshake_binds_and_replies_to_the_connect_sentinel() {
        let server_hint: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // Port 0 here only to keep the test self-contained (any free port
        // stands in for the server's configured port); `accept_stream`'s
        // callers always pass the real configured port.
        let server = bind_for_stream(0, server_hint).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            wait_for_connect(&server).await.unwrap();
            server
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();
        client.send(&UDP_CONNECT_MSG.to_be_bytes()).await.unwrap();

        let mut reply = [0u8; 4];
        let n = timeout(Duration::from_secs(1), client.recv(&mut reply)).await.unwrap().unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_be_bytes(reply), UDP_CONNECT_REPLY);

        let server = accept.await.unwrap();
        assert_eq!(server.peer_addr().unwrap(), client.local_addr().unwrap());
    }
}
