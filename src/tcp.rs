//! TCP data-stream accept and hot-path send/receive helpers.
//!
//! The send side tracks how much of the current block is still
//! unwritten across calls (`pending`), decrementing as partial writes land
//! and only counting a full block as "sent" (and logging a packet) once
//! `pending` reaches zero and gets refilled for the next block. The receive
//! side counts bytes only while the caller says the test is actually in
//! `TEST_RUNNING` — bytes read during setup or teardown are tracked
//! separately by the caller rather than folded into throughput.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Iperf3Error, Result};
use crate::net::read_exact_with_deadline;
use crate::protocol::COOKIE_SIZE;
use crate::stream::StreamCounters;

/// Tracks a partially-written block across calls so a short write doesn't
/// lose its place.
pub struct TcpSender {
    pending: usize,
}

impl TcpSender {
    pub fn new() -> Self {
        Self { pending: 0 }
    }

    /// Write as much of `block` as the kernel accepts in one call. Returns
    /// the number of bytes written. When the whole block has finally been
    /// flushed, increments the packet counter; byte counting only happens
    /// when `counting_enabled` (the caller passes `phase == TestRunning`).
    pub async fn send_block(
        &mut self,
        stream: &mut TcpStream,
        block: &[u8],
        counters: &StreamCounters,
        counting_enabled: bool,
    ) -> Result<usize> {
        if self.pending == 0 {
            self.pending = block.len();
        }
        let offset = block.len() - self.pending;
        let n = stream.write(&block[offset..]).await.map_err(Iperf3Error::StreamWrite)?;
        self.pending = self.pending.saturating_sub(n);
        if counting_enabled {
            counters.add_bytes(n as u64);
        }
        if self.pending == 0 {
            counters.add_packet();
        }
        Ok(n)
    }
}

impl Default for TcpSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Read up to `buf.len()` bytes, counting them only when `counting_enabled`.
/// Returns `0` on a clean peer close, matching the std/tokio `read`
/// convention (the original tool's `Nread == 0` case).
pub async fn recv_block(
    stream: &mut TcpStream,
    buf: &mut [u8],
    counters: &StreamCounters,
    counting_enabled: bool,
) -> Result<usize> {
    let n = stream.read(buf).await.map_err(Iperf3Error::StreamRead)?;
    if counting_enabled && n > 0 {
        counters.add_bytes(n as u64);
        counters.add_packet();
    }
    Ok(n)
}

/// Read the client's cookie off a newly-accepted TCP connection, failing
/// with `IERECVCOOKIE` if it doesn't arrive within `deadline`.
pub async fn read_cookie(stream: &mut TcpStream, deadline: Duration) -> Result<[u8; COOKIE_SIZE]> {
    let mut cookie = [0u8; COOKIE_SIZE];
    read_exact_with_deadline(stream, &mut cookie, deadline)
        .await
        .map_err(Iperf3Error::RecvCookie)?;
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn sender_only_counts_a_packet_once_the_block_is_fully_flushed() {
        let (mut client, mut server) = loopback_pair().await;
        let counters = StreamCounters::new();
        let block = vec![7u8; 4096];
        let mut sender = TcpSender::new();

        let mut total = 0;
        while total < block.len() {
            let n = sender.send_block(&mut client, &block, &counters, true).await.unwrap();
            total += n;
        }
        assert_eq!(counters.packets_total.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(counters.bytes_total.load(std::sync::atomic::Ordering::Relaxed), 4096);

        let mut received = vec![0u8; 4096];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, block);
    }

    #[tokio::test]
    async fn recv_does_not_count_bytes_outside_test_running() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[1, 2, 3, 4]).await.unwrap();
        let counters = StreamCounters::new();
        let mut buf = [0u8; 16];
        let n = recv_block(&mut server, &mut buf, &counters, false).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(counters.bytes_total.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn recv_returns_zero_on_clean_close() {
        let (client, mut server) = loopback_pair().await;
        drop(client);
        let counters = StreamCounters::new();
        let mut buf = [0u8; 16];
        let n = recv_block(&mut server, &mut buf, &counters, true).await.unwrap();
        assert_eq!(n, 0);
    }
}
