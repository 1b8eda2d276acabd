//! Per-client test session: control-channel framing, phase bookkeeping, and
//! the worker lifecycle for a session's data streams.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Iperf3Error, Result};
use crate::protocol::{
    ConnectedInfo, EndInfo, IntervalResult, Phase, ServerResults, StartInfo, StreamEndResult,
    StreamResult, TestMode, TestParameters, TestStartInfo,
};
use crate::stats::{cpu_utilization_percent, CpuSample, Hooks, NoopHooks};
use crate::stream::{Direction, Stream, StreamCounters, Transport};
use crate::timer::TimerQueue;
use crate::worker::{cancel_and_join, spawn_tcp_worker, spawn_udp_worker};

/// Maximum length of a single control-channel JSON message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// One client's test session, from the moment its cookie is read until
/// `IPERF_DONE`.
pub struct TestSession {
    pub cookie: Vec<u8>,
    pub client_addr: SocketAddr,
    pub params: Mutex<TestParameters>,
    control_stream: Arc<Mutex<TcpStream>>,
    phase: Mutex<Phase>,
    streams: Mutex<Vec<Stream>>,
    pub timers: Mutex<TimerQueue>,
    pub started_at: Instant,
    test_started_at: Mutex<Option<Instant>>,
    cpu_at_start: Mutex<Option<CpuSample>>,
    test_done: Arc<AtomicBool>,
    counting_enabled: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Counters for every stream a worker was spawned for, kept after the
    /// transport itself moves into the worker task, so stats/reporting can
    /// still read a live snapshot.
    stream_counters: Mutex<Vec<Arc<StreamCounters>>>,
    hooks: Hooks,
}

impl TestSession {
    pub fn new(cookie: Vec<u8>, client_addr: SocketAddr, control_stream: TcpStream) -> Self {
        Self::with_hooks(cookie, client_addr, control_stream, Arc::new(NoopHooks))
    }

    pub fn with_hooks(cookie: Vec<u8>, client_addr: SocketAddr, control_stream: TcpStream, hooks: Hooks) -> Self {
        Self {
            cookie,
            client_addr,
            params: Mutex::new(TestParameters::default()),
            control_stream: Arc::new(Mutex::new(control_stream)),
            phase: Mutex::new(Phase::ParamExchange),
            streams: Mutex::new(Vec::new()),
            timers: Mutex::new(TimerQueue::new()),
            started_at: Instant::now(),
            test_started_at: Mutex::new(None),
            cpu_at_start: Mutex::new(None),
            test_done: Arc::new(AtomicBool::new(false)),
            counting_enabled: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            worker_handles: Mutex::new(Vec::new()),
            stream_counters: Mutex::new(Vec::new()),
            hooks,
        }
    }

    /// Snapshot of every stream's counters, for stats timers and final
    /// reporting.
    pub async fn stream_counters(&self) -> Vec<Arc<StreamCounters>> {
        self.stream_counters.lock().await.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.test_done.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.lock().await
    }

    /// Advance to `next`, logging (but not rejecting) a transition the
    /// table doesn't recognize — `CLIENT_TERMINATE`/`ACCESS_DENIED` are
    /// legitimately reachable from anywhere and aren't represented in
    /// `can_advance_to`.
    pub async fn set_phase(&self, next: Phase) {
        let mut current = self.phase.lock().await;
        if !current.can_advance_to(next) && !matches!(next, Phase::ClientTerminate | Phase::AccessDenied) {
            tracing::warn!(?current, ?next, "unexpected phase transition");
        }
        *current = next;
    }

    pub async fn add_stream(&self, stream: Stream) {
        self.streams.lock().await.push(stream);
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn start_test(&self) {
        *self.test_started_at.lock().await = Some(Instant::now());
        *self.cpu_at_start.lock().await = crate::stats::sample_cpu();
    }

    pub async fn test_elapsed(&self) -> Option<Duration> {
        self.test_started_at.lock().await.map(|t| t.elapsed())
    }

    /// Enable or disable per-stream byte/packet counting — on for
    /// `TEST_RUNNING`, off otherwise, and briefly off again during the
    /// omit warm-up window.
    pub fn set_counting_enabled(&self, enabled: bool) {
        self.counting_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Spawn one worker task per data stream according to the session's
    /// negotiated test mode, draining `streams` as it goes.
    pub async fn start_workers(&self) {
        let params = self.params.lock().await.clone();
        let mode = TestMode::from_params(&params);
        let mut streams = self.streams.lock().await;
        let mut handles = self.worker_handles.lock().await;

        for (idx, stream) in streams.drain(..).enumerate() {
            let direction = match mode {
                TestMode::Receiver => Direction::Receiving,
                TestMode::Sender => Direction::Sending,
                TestMode::Bidirectional => {
                    if idx % 2 == 0 {
                        Direction::Receiving
                    } else {
                        Direction::Sending
                    }
                }
            };
            self.hooks.on_new_stream(stream.id);
            let counters = stream.counters.clone();
            let handle = match stream.transport {
                Transport::Tcp(tcp) => spawn_tcp_worker(
                    tcp,
                    direction,
                    params.blksize,
                    counters.clone(),
                    self.test_done.clone(),
                    self.counting_enabled.clone(),
                ),
                Transport::Udp(udp) => spawn_udp_worker(
                    Arc::new(udp),
                    direction,
                    params.blksize,
                    params.udp_counters_64bit,
                    counters.clone(),
                    self.test_done.clone(),
                    self.counting_enabled.clone(),
                ),
            };
            handles.push(handle);
            self.stream_counters.lock().await.push(counters);
        }
    }

    /// Stop every worker, aborting and joining each one.
    pub async fn stop_workers(&self) {
        self.test_done.store(true, Ordering::SeqCst);
        let handles = { self.worker_handles.lock().await.drain(..).collect::<Vec<_>>() };
        for handle in handles {
            cancel_and_join(handle).await;
        }
    }

    /// Read a length-prefixed JSON message off the control connection.
    pub async fn read_json_message(&self) -> Result<serde_json::Value> {
        let mut stream = self.control_stream.lock().await;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(Iperf3Error::RecvMessage)?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(Iperf3Error::Message(format!("message too large: {len} bytes")));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await.map_err(Iperf3Error::RecvMessage)?;

        serde_json::from_slice(&data).map_err(Iperf3Error::Json)
    }

    pub async fn write_json_message(&self, json: &serde_json::Value) -> Result<()> {
        let mut stream = self.control_stream.lock().await;

        let data = serde_json::to_vec(json).map_err(Iperf3Error::Json)?;
        let len = data.len() as u32;

        stream.write_all(&len.to_be_bytes()).await.map_err(Iperf3Error::SendMessage)?;
        stream.write_all(&data).await.map_err(Iperf3Error::SendMessage)?;
        stream.flush().await.map_err(Iperf3Error::SendMessage)?;

        Ok(())
    }

    pub async fn send_phase(&self, phase: Phase) -> Result<()> {
        {
            let mut stream = self.control_stream.lock().await;
            stream.write_all(&[phase.to_byte()]).await.map_err(Iperf3Error::SendMessage)?;
            stream.flush().await.map_err(Iperf3Error::SendMessage)?;
        }
        self.set_phase(phase).await;
        Ok(())
    }

    /// Read one phase byte with no deadline. Only appropriate for the
    /// `TEST_RUNNING` main loop's wait for `TEST_END`, which is legitimately
    /// bounded by the test's own duration timer rather than a short
    /// control-byte deadline.
    pub async fn read_phase(&self) -> Result<Phase> {
        let mut stream = self.control_stream.lock().await;
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.map_err(Iperf3Error::RecvMessage)?;
        Phase::from_byte(buf[0]).ok_or_else(|| Iperf3Error::Message(format!("unknown phase byte: {}", buf[0])))
    }

    /// Read one phase byte, failing if it doesn't arrive within `deadline` —
    /// the `ctrl_wait_ms`-bounded read spec §5 requires for control-byte
    /// reads outside the main test loop (e.g. the final `IPERF_DONE`
    /// handshake), so a connected-but-silent peer can't park the session
    /// task forever.
    pub async fn read_phase_timeout(&self, deadline: Duration) -> Result<Phase> {
        let mut stream = self.control_stream.lock().await;
        let mut buf = [0u8; 1];
        crate::net::read_exact_with_deadline(&mut *stream, &mut buf, deadline)
            .await
            .map_err(Iperf3Error::RecvMessage)?;
        Phase::from_byte(buf[0]).ok_or_else(|| Iperf3Error::Message(format!("unknown phase byte: {}", buf[0])))
    }

    /// Fold every stream's current counters into one [`IntervalResult`] and
    /// reset their per-interval counters, invoking the reporter hook.
    pub async fn emit_interval(&self, streams_counters: &[Arc<StreamCounters>]) {
        let mut results = Vec::with_capacity(streams_counters.len());
        let mut sum = StreamResult::default();
        for (id, counters) in streams_counters.iter().enumerate() {
            let bytes = counters.bytes_this_interval.load(Ordering::Relaxed);
            let packets = counters.packets_this_interval.load(Ordering::Relaxed);
            let lost = counters.lost_this_interval.load(Ordering::Relaxed);
            let result = StreamResult {
                id: id as u32 + 1,
                bytes,
                seconds: 0.0,
                bits_per_second: 0.0,
                retransmits: None,
                jitter_ms: Some(counters.jitter_millis()),
                lost_packets: Some(lost),
                packets: Some(packets),
                lost_percent: if packets > 0 {
                    Some(lost as f64 / packets as f64 * 100.0)
                } else {
                    None
                },
            };
            sum.bytes += bytes;
            results.push(result);
            counters.reset_interval();
        }
        let interval = IntervalResult { streams: results, sum };
        self.hooks.on_interval(&interval);
    }

    /// Build the final result payload from every stream's cumulative
    /// counters.
    pub async fn generate_results(&self, test_duration: f64, stream_counters: &[Arc<StreamCounters>]) -> ServerResults {
        let params = self.params.lock().await.clone();

        let mut per_stream = Vec::with_capacity(stream_counters.len());
        let mut sum_bytes = 0u64;
        for (idx, counters) in stream_counters.iter().enumerate() {
            let bytes = counters.bytes_total.load(Ordering::Relaxed);
            let packets = counters.packets_total.load(Ordering::Relaxed);
            let lost = counters.lost_total.load(Ordering::Relaxed);
            sum_bytes += bytes;
            let bps = if test_duration > 0.0 {
                (bytes as f64 * 8.0) / test_duration
            } else {
                0.0
            };
            let result = StreamResult {
                id: idx as u32 + 1,
                bytes,
                seconds: test_duration,
                bits_per_second: bps,
                retransmits: None,
                jitter_ms: if params.udp { Some(counters.jitter_millis()) } else { None },
                lost_packets: if params.udp { Some(lost) } else { None },
                packets: if params.udp { Some(packets) } else { None },
                lost_percent: if params.udp && packets > 0 {
                    Some(lost as f64 / packets as f64 * 100.0)
                } else {
                    None
                },
            };
            per_stream.push(StreamEndResult {
                sender: result.clone(),
                receiver: result,
            });
        }

        let sum_bps = if test_duration > 0.0 {
            (sum_bytes as f64 * 8.0) / test_duration
        } else {
            0.0
        };
        let sum_result = StreamResult {
            id: 0,
            bytes: sum_bytes,
            seconds: test_duration,
            bits_per_second: sum_bps,
            retransmits: None,
            jitter_ms: None,
            lost_packets: None,
            packets: None,
            lost_percent: None,
        };

        let cpu_pct = match *self.cpu_at_start.lock().await {
            Some(start) => crate::stats::sample_cpu().map(|end| {
                let pct = cpu_utilization_percent(start, end, test_duration);
                crate::protocol::CpuUtilization {
                    host_total: pct,
                    host_user: 0.0,
                    host_system: 0.0,
                    remote_total: 0.0,
                    remote_user: 0.0,
                    remote_system: 0.0,
                }
            }),
            None => None,
        };

        let results = ServerResults {
            start: StartInfo {
                connected: vec![ConnectedInfo {
                    socket: 0,
                    local_host: "0.0.0.0".to_string(),
                    local_port: 5201,
                    remote_host: self.client_addr.ip().to_string(),
                    remote_port: self.client_addr.port(),
                }],
                version: env!("CARGO_PKG_VERSION").to_string(),
                system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
                timestamp: chrono::Utc::now().to_rfc2822(),
                test_start: TestStartInfo {
                    protocol: params.protocol.clone(),
                    num_streams: params.parallel,
                    blksize: params.blksize,
                    omit: params.omit,
                    duration: params.time,
                    bytes: params.bytes,
                    blocks: params.blockcount,
                    reverse: params.reverse,
                },
            },
            intervals: vec![],
            end: EndInfo {
                streams: per_stream,
                sum_sent: Some(sum_result.clone()),
                sum_received: Some(sum_result),
                cpu_utilization_percent: cpu_pct,
            },
        };
        self.hooks.on_test_finish(&results);
        results
    }
}
