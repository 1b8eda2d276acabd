//! Per-stream worker tasks.
//!
//! The original tool runs one OS thread per stream, asynchronously
//! cancelled with `pthread_cancel`/`pthread_join` (swallowing `ESRCH` if the
//! thread had already exited). The structured-concurrency reading of that
//! here is one `tokio::task` per stream: the task loops on a cooperative
//! `done` check, and cleanup both aborts the task's `JoinHandle` (the
//! analogue of `pthread_cancel`, for a task parked in an uncooperative
//! syscall) and always awaits it afterwards (the analogue of
//! `pthread_join`), discarding the resulting cancellation error the same
//! way the original discards `ESRCH`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::error::Iperf3Error;
use crate::protocol::udp_header_size;
use crate::stream::{Direction, StreamCounters};
use crate::tcp::{recv_block, TcpSender};
use crate::udp::{UdpLossTracker, UdpSender};

/// Whether an error from a send/recv hot-path call is the soft,
/// would-block kind spec §4.4/§4.5 say to retry on, as opposed to a hard
/// error that should end the worker.
fn is_soft_error(err: &Iperf3Error) -> bool {
    matches!(
        err,
        Iperf3Error::StreamWrite(e) | Iperf3Error::StreamRead(e) if e.kind() == std::io::ErrorKind::WouldBlock
    )
}

/// Shared flag a worker checks every iteration; set once the session has
/// moved past `TEST_RUNNING` or wants the stream torn down early.
pub type TestDone = Arc<std::sync::atomic::AtomicBool>;

/// Spawn a worker task driving one TCP stream until `test_done` is set, a
/// hard I/O error occurs, or the peer closes the connection.
pub fn spawn_tcp_worker(
    mut stream: TcpStream,
    direction: Direction,
    blksize: u32,
    counters: Arc<StreamCounters>,
    test_done: TestDone,
    counting_enabled: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; blksize as usize];
        let mut sender = TcpSender::new();
        while !test_done.load(Ordering::Relaxed) && !counters.done.load(Ordering::Relaxed) {
            let counting = counting_enabled.load(Ordering::Relaxed);
            let outcome = match direction {
                Direction::Sending => sender.send_block(&mut stream, &buf, &counters, counting).await.map(|n| n > 0),
                Direction::Receiving => recv_block(&mut stream, &mut buf, &counters, counting).await.map(|n| n > 0),
            };
            match outcome {
                Ok(true) => continue,
                Ok(false) => {
                    counters.done.store(true, Ordering::Relaxed);
                    break;
                }
                Err(e) if is_soft_error(&e) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "tcp worker exiting on error");
                    counters.done.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    })
}

/// Spawn a worker task driving one UDP stream until `test_done` is set or a
/// hard I/O error occurs. UDP has no peer-close signal, so this only stops
/// cooperatively or on abort.
pub fn spawn_udp_worker(
    socket: Arc<UdpSocket>,
    direction: Direction,
    blksize: u32,
    counters_64bit: bool,
    counters: Arc<StreamCounters>,
    test_done: TestDone,
    counting_enabled: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let header_len = udp_header_size(counters_64bit);
        let mut buf = vec![0u8; blksize.max(header_len as u32) as usize];
        let mut sender = UdpSender::new(counters_64bit);
        let mut tracker = UdpLossTracker::new();

        while !test_done.load(Ordering::Relaxed) && !counters.done.load(Ordering::Relaxed) {
            let counting = counting_enabled.load(Ordering::Relaxed);
            match direction {
                Direction::Sending => {
                    if let Err(e) = sender.send(&socket, &mut buf, &counters, counting).await {
                        if is_soft_error(&e) {
                            continue;
                        }
                        tracing::warn!(error = %e, "udp worker exiting on send error");
                        counters.done.store(true, Ordering::Relaxed);
                        break;
                    }
                }
                Direction::Receiving => match socket.recv(&mut buf).await {
                    Ok(n) if n >= header_len => {
                        if counting {
                            let arrival = std::time::SystemTime::now()
                                .duration_since(std::time::UNIX_EPOCH)
                                .unwrap_or_default()
                                .as_secs_f64();
                            tracker.on_datagram(&buf[..n], counters_64bit, arrival, &counters);
                            counters.add_bytes(n as u64);
                            counters.add_packet();
                        }
                    }
                    Ok(_) => tracing::warn!("udp datagram shorter than the header, dropped"),
                    Err(e) => {
                        tracing::warn!(error = %e, "udp worker exiting on recv error");
                        counters.done.store(true, Ordering::Relaxed);
                        break;
                    }
                },
            }
        }
    })
}

/// Abort `handle` and await it, discarding the resulting cancellation
/// error — the async analogue of `pthread_cancel` + `pthread_join`
/// swallowing `ESRCH`.
pub async fn cancel_and_join(handle: JoinHandle<()>) {
    handle.abort();
    let _ = handle.await;
}
