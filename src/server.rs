//! Top-level server: listens for control connections, keeps at most one
//! active session (a second concurrent client is turned away with
//! `ACCESS_DENIED` without the server reading anything further from its
//! socket), and drives each session's control-phase walk end to end.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::config::Iperf3Config;
use crate::error::{Iperf3Error, Result};
use crate::net;
use crate::protocol::{Phase, TestParameters};
use crate::session::TestSession;
use crate::stats::{Hooks, NoopHooks};
use crate::stream::{Direction, Stream, Transport};
use crate::tcp::read_cookie;
use crate::timer::TimerKind;
use crate::udp;

/// Normalize an IP address by mapping IPv4-mapped IPv6 addresses back to
/// IPv4, so a dual-stack listener's session bookkeeping doesn't see the
/// same peer as two different addresses.
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        IpAddr::V4(_) => ip,
    }
}

/// Listens for whichever of SIGTERM/SIGHUP/SIGINT the platform can
/// deliver. Workers mask these so only the event-loop task ever observes
/// them, mirroring the original tool's signal-masked-worker-threads
/// design; here the event loop just routes the signal into the same
/// cleanup path `CLIENT_TERMINATE` uses. Registered once outside the
/// accept loop rather than per-iteration, since installing a signal
/// handler is not free and the server may cycle through many iterations
/// (new connections, idle-timeout restarts) over its lifetime.
#[cfg(unix)]
struct TerminationSignals {
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => {}
            _ = self.sighup.recv() => {}
            _ = self.sigint.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

type ActiveSession = Option<(Vec<u8>, Arc<TestSession>)>;

/// A session's request that the main accept loop close the current data
/// listener and rebuild it with `buffer_size` pre-set, replying once the
/// replacement listener is live. The original tool does this by closing
/// and recreating its own listening socket; here the listener is owned by
/// the accept loop task, not the session task, so the swap has to be
/// requested across that boundary instead of performed in place.
struct ListenerRebuildRequest {
    buffer_size: u32,
    reply: oneshot::Sender<Result<()>>,
}

/// The iperf3 server core.
pub struct Iperf3Server {
    config: Iperf3Config,
    active_session: Arc<Mutex<ActiveSession>>,
    shutdown_tx: broadcast::Sender<()>,
    hooks: Hooks,
    rebuild_tx: mpsc::Sender<ListenerRebuildRequest>,
    rebuild_rx: Mutex<Option<mpsc::Receiver<ListenerRebuildRequest>>>,
}

impl Iperf3Server {
    pub fn new(config: Iperf3Config) -> Self {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(config: Iperf3Config, hooks: Hooks) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (rebuild_tx, rebuild_rx) = mpsc::channel(4);
        Self {
            config,
            active_session: Arc::new(Mutex::new(None)),
            shutdown_tx,
            hooks,
            rebuild_tx,
            rebuild_rx: Mutex::new(Some(rebuild_rx)),
        }
    }

    /// Whether a session is currently active.
    pub async fn session_count(&self) -> usize {
        if self.active_session.lock().await.is_some() {
            1
        } else {
            0
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("iperf3 server is disabled");
            return Ok(());
        }

        let listener = net::announce_tcp_on_device(
            &self.config.host,
            self.config.port,
            self.config.address_family,
            self.config.bind_device.as_deref(),
        )?;
        tracing::info!(host = %self.config.host, port = self.config.port, "iperf3 server listening");
        self.run_with_listener(listener).await
    }

    /// Drive the accept loop over an already-bound listener. Split out from
    /// [`Self::run`] so a caller (or a test) can bind to an ephemeral port
    /// and learn its address before the loop takes over.
    pub async fn run_with_listener(&self, mut listener: tokio::net::TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let idle_timeout = (self.config.idle_timeout_secs > 0).then(|| Duration::from_secs(self.config.idle_timeout_secs));
        let mut term_signals = TerminationSignals::install().map_err(Iperf3Error::Io)?;
        let mut rebuild_rx = self
            .rebuild_rx
            .lock()
            .await
            .take()
            .expect("run_with_listener must not be called concurrently on the same server");

        loop {
            let idle_sleep = async {
                match idle_timeout {
                    Some(d) => {
                        if self.session_count().await == 0 {
                            tokio::time::sleep(d).await;
                        } else {
                            std::future::pending::<()>().await
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            tracing::info!(%peer_addr, "new connection");
                            self.hooks.on_connect(peer_addr);
                            self.handle_connection(stream, peer_addr);
                        }
                        Err(e) => tracing::error!(error = %e, "accept failed"),
                    }
                }
                _ = idle_sleep => {
                    if self.config.one_off {
                        tracing::info!("idle timeout reached with no client in one-off mode, stopping");
                        break;
                    }
                    tracing::info!("idle timeout reached with no client, restarting listener");
                    listener = net::announce_tcp_on_device(
                        &self.config.host,
                        self.config.port,
                        self.config.address_family,
                        self.config.bind_device.as_deref(),
                    )?;
                }
                Some(req) = rebuild_rx.recv() => {
                    tracing::info!(buffer_size = req.buffer_size, "rebuilding the data listener with the requested socket buffer size");
                    let rebuilt = net::announce_tcp_on_device_with_buffer(
                        &self.config.host,
                        self.config.port,
                        self.config.address_family,
                        self.config.bind_device.as_deref(),
                        req.buffer_size,
                    );
                    match rebuilt {
                        Ok(new_listener) => {
                            listener = new_listener;
                            let _ = req.reply.send(Ok(()));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to rebuild the data listener with the requested buffer size");
                            let _ = req.reply.send(Err(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("iperf3 server shutting down");
                    break;
                }
                _ = term_signals.recv() => {
                    tracing::info!("termination signal received, shutting down");
                    if let Some((_, session)) = self.active_session.lock().await.as_ref() {
                        session.cancel();
                    }
                    break;
                }
            }
        }

        *self.rebuild_rx.lock().await = Some(rebuild_rx);
        Ok(())
    }

    /// Apply whichever per-session socket options the negotiated parameters
    /// requested to a freshly-accepted TCP data stream: `TCP_NODELAY`,
    /// `TCP_MAXSEG`, `TCP_CONGESTION`, and fair-queue pacing. The requested
    /// send/receive buffer size is deliberately NOT set here: TCP window
    /// scaling is negotiated during the handshake, so by the time a stream
    /// reaches `accept()` it's too late for a buffer change to affect the
    /// window that handshake already settled on. That option is instead
    /// applied to the *listener* before `CREATE_STREAMS` data connections
    /// start arriving — see the `ListenerRebuildRequest` round-trip in
    /// `run_session_protocol` — mirroring the original tool's close-and-
    /// rebuild-the-listener approach. Every option here is best-effort: a
    /// platform or kernel that refuses one is logged and otherwise doesn't
    /// block the stream from joining the test, since `MSS` in particular is
    /// "very buggy" on some stacks.
    fn apply_stream_socket_options(stream: &TcpStream, params: &TestParameters) -> Result<()> {
        if params.nodelay {
            net::set_nodelay(stream, true)?;
        }
        if params.mss > 0 {
            if let Err(e) = net::set_mss(stream, params.mss) {
                tracing::warn!(mss = params.mss, error = %e, "TCP_MAXSEG not applied");
            }
        }
        if let Some(name) = &params.congestion {
            if let Err(e) = net::set_congestion(stream, name) {
                tracing::warn!(congestion = %name, error = %e, "TCP_CONGESTION not applied");
            }
        }
        if params.fqrate > 0 {
            if let Err(e) = net::set_pacing_rate(stream, params.fqrate) {
                tracing::warn!(fqrate = params.fqrate, error = %e, "SO_MAX_PACING_RATE not applied");
            }
        }
        Ok(())
    }

    async fn send_access_denied(mut stream: TcpStream) {
        let _ = stream.write_all(&[Phase::AccessDenied.to_byte()]).await;
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let active_session = self.active_session.clone();
        let config = self.config.clone();
        let hooks = self.hooks.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let rebuild_tx = self.rebuild_tx.clone();

        tokio::spawn(async move {
            let one_off = config.one_off;
            let result = Self::handle_session(stream, peer_addr, active_session, config, hooks, rebuild_tx).await;
            if let Err(e) = &result {
                tracing::error!(%peer_addr, error = %e, "session ended with an error");
            }
            if one_off && matches!(result, Ok(true) | Err(_)) {
                let _ = shutdown_tx.send(());
            }
        });
    }

    /// Returns `Ok(true)` when this connection ran a full control session
    /// to completion (as opposed to just attaching a data stream or being
    /// turned away), so the caller can tell whether `one_off` should stop
    /// the server.
    async fn handle_session(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        active_session: Arc<Mutex<ActiveSession>>,
        config: Iperf3Config,
        hooks: Hooks,
        rebuild_tx: mpsc::Sender<ListenerRebuildRequest>,
    ) -> Result<bool> {
        // If a session is already past CREATE_STREAMS (no longer expecting
        // new data connections), a second connection is a busy client, not
        // a data stream — deny it without reading anything from its fd,
        // since reading could block waiting on a peer that never sends.
        let live_session = { active_session.lock().await.clone() };
        if let Some((_, session)) = &live_session {
            if session.phase().await != Phase::CreateStreams {
                tracing::warn!(%peer_addr, "a second client tried to connect while a session is active");
                Self::send_access_denied(stream).await;
                return Ok(false);
            }
        }

        let cookie = match read_cookie(&mut stream, Duration::from_millis(config.ctrl_wait_ms)).await {
            Ok(c) => c.to_vec(),
            Err(e) => {
                Self::send_access_denied(stream).await;
                return Err(e);
            }
        };

        {
            let slot = active_session.lock().await;
            if let Some((existing_cookie, session)) = slot.as_ref() {
                if *existing_cookie == cookie {
                    let params = session.params.lock().await.clone();
                    if let Err(e) = Self::apply_stream_socket_options(&stream, &params) {
                        tracing::warn!(?cookie, error = %e, "failed to apply a requested TCP data-stream socket option");
                    }
                    let id = session.stream_count().await as u32 + 1;
                    session.add_stream(Stream::new(id, Direction::Receiving, Transport::Tcp(stream))).await;
                    tracing::debug!(?cookie, "new data stream attached to the active session");
                    return Ok(false);
                } else {
                    tracing::warn!(%peer_addr, "a second client tried to connect while a session is active");
                    Self::send_access_denied(stream).await;
                    return Ok(false);
                }
            }
        }

        let normalized_addr = SocketAddr::new(normalize_ip(peer_addr.ip()), peer_addr.port());
        let session = Arc::new(TestSession::with_hooks(cookie.clone(), normalized_addr, stream, hooks));
        *active_session.lock().await = Some((cookie.clone(), session.clone()));

        let result = Self::run_session_protocol(session, &config, rebuild_tx).await;

        *active_session.lock().await = None;
        tracing::info!(?cookie, "session ended");
        result.map(|_| true)
    }

    /// Walk a session through its full control-phase sequence: parameter
    /// exchange, stream creation, the test itself, and result exchange.
    async fn run_session_protocol(
        session: Arc<TestSession>,
        config: &Iperf3Config,
        rebuild_tx: mpsc::Sender<ListenerRebuildRequest>,
    ) -> Result<()> {
        session.send_phase(Phase::ParamExchange).await?;

        let params_json = session.read_json_message().await?;
        let mut params: TestParameters = serde_json::from_value(params_json)?;

        if config.max_duration_secs > 0 && params.time > config.max_duration_secs {
            tracing::info!(requested = params.time, capped = config.max_duration_secs, "capping test duration");
            params.time = config.max_duration_secs;
        }
        if config.max_bandwidth > 0 && params.bandwidth > config.max_bandwidth {
            params.bandwidth = config.max_bandwidth;
        }
        if params.window == 0 && config.default_socket_buffer_size > 0 {
            params.window = config.default_socket_buffer_size;
        }
        if params.congestion.is_none() {
            params.congestion = config.congestion.clone();
        }

        let bidi_factor = if params.bidirectional { 2 } else { 1 };
        if config.max_bandwidth > 0 && params.bandwidth > 0 {
            let aggregate = params.parallel as u64 * params.bandwidth * bidi_factor;
            if aggregate > config.max_bandwidth {
                return Err(Iperf3Error::TotalRate {
                    parallel: params.parallel,
                    rate: params.bandwidth,
                    bidi: if params.bidirectional { " (bidirectional)" } else { "" },
                    limit: config.max_bandwidth,
                });
            }
        }

        *session.params.lock().await = params.clone();

        // A requested TCP window must be in effect on the listener before
        // any data connection's handshake happens, so the rebuild has to
        // complete before CREATE_STREAMS is announced to the client (which
        // is what triggers the client to start opening data connections).
        if !params.udp && params.window > 0 {
            Self::rebuild_data_listener(&rebuild_tx, params.window).await;
        }

        session.send_phase(Phase::CreateStreams).await?;

        // BIDIRECTIONAL needs N streams in each direction (2N total); SENDER
        // and RECEIVER each need just N.
        let expected_streams = params.parallel as usize * if params.bidirectional { 2 } else { 1 };
        let create_streams_timeout = Duration::from_secs(config.create_streams_timeout_secs);
        if params.udp {
            Self::accept_udp_streams(&session, expected_streams, config.port, create_streams_timeout).await?;
        } else {
            Self::wait_for_tcp_streams(&session, expected_streams, create_streams_timeout).await?;
        }

        session.send_phase(Phase::TestStart).await?;
        session.start_test().await;
        session.send_phase(Phase::TestRunning).await?;
        session.set_counting_enabled(true);
        session.start_workers().await;

        // Whatever ends the event loop — a clean TEST_END, an early
        // CLIENT_TERMINATE, or a watchdog timeout — every worker task must be
        // aborted and joined before this function returns, or the stream's
        // tokio task outlives its session (invariant: zero workers once
        // cleanup has run). `stop_workers` runs unconditionally, so none of
        // the early-return error paths below can skip it.
        let event_loop_result = Self::run_event_loop(&session, &params, config).await;
        session.stop_workers().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Err(e) = event_loop_result {
            if matches!(e, Iperf3Error::ClientTerm) {
                // "Any phase --CLIENT_TERMINATE--> DISPLAY_RESULTS (for final
                // report) --> IPERF_DONE --> IDLE": the client has already
                // said it's done, so there is no further JSON exchange to
                // wait on — just fire the reporter hook locally and walk the
                // remaining two phases best-effort before surfacing the
                // error to the caller.
                let elapsed = session.test_elapsed().await.unwrap_or_default();
                let counters = session.stream_counters().await;
                let _ = session.generate_results(elapsed.as_secs_f64(), &counters).await;
                let _ = session.send_phase(Phase::DisplayResults).await;
                let _ = session.send_phase(Phase::IperfDone).await;
            }
            return Err(e);
        }

        session.send_phase(Phase::ExchangeResults).await?;
        let _client_results = session.read_json_message().await?;

        let elapsed = session.test_elapsed().await.unwrap_or_default();
        let counters = session.stream_counters().await;
        let results = session.generate_results(elapsed.as_secs_f64(), &counters).await;
        session.write_json_message(&serde_json::to_value(&results)?).await?;

        session.send_phase(Phase::DisplayResults).await?;

        let client_phase = session.read_phase_timeout(Duration::from_millis(config.ctrl_wait_ms)).await?;
        if !matches!(client_phase, Phase::IperfDone) {
            tracing::warn!(?client_phase, "expected IPERF_DONE");
        }
        session.send_phase(Phase::IperfStart).await?;

        Ok(())
    }

    /// Run the per-session readiness loop: wait for the client's
    /// `TEST_END`, interleaved with firing the session's stats/reporter/
    /// duration timers.
    async fn run_event_loop(session: &Arc<TestSession>, params: &TestParameters, config: &Iperf3Config) -> Result<()> {
        let now = Instant::now();
        // SENDER mode means the server only transmits; there is nothing for
        // the no-progress watchdog to watch, since the server itself drives
        // the only byte counter that could stall.
        let receive_capable = !params.reverse || params.bidirectional;
        let rcv_timeout = Duration::from_millis(config.rcv_timeout_ms.max(1));
        {
            let mut timers = session.timers.lock().await;
            if params.time > 0 {
                // Grace period matches the original tool's max_rtt(4s) *
                // state_transitions(10) = 40s bound on top of the test's own
                // duration plus the omit warm-up, covering the time it takes
                // the client to notice the test ended and send TEST_END.
                timers.schedule_once(
                    now,
                    TimerKind::Duration,
                    Duration::from_secs(params.time + params.omit as u64) + Duration::from_secs(40),
                );
            }
            if params.interval > 0.0 {
                let period = Duration::from_secs_f64(params.interval);
                timers.schedule_periodic(now, TimerKind::Stats, period);
                timers.schedule_periodic(now, TimerKind::Reporter, period);
            }
            if params.omit > 0 {
                timers.schedule_once(now, TimerKind::Omit, Duration::from_secs(params.omit as u64));
            }
            if receive_capable {
                timers.schedule_periodic(now, TimerKind::ReceiveWatchdog, rcv_timeout);
            }
        }

        let mut last_bytes_seen: Option<u64> = None;

        loop {
            let next_deadline = session.timers.lock().await.next_deadline();
            let sleep = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                phase = session.read_phase() => {
                    match phase {
                        Ok(Phase::TestEnd) => return Ok(()),
                        Ok(Phase::ClientTerminate) => return Err(Iperf3Error::ClientTerm),
                        Ok(other) => tracing::warn!(?other, "unexpected phase byte while a test is running"),
                        Err(e) => return Err(e),
                    }
                }
                _ = sleep => {
                    let fired = session.timers.lock().await.run(Instant::now());
                    for kind in fired {
                        match kind {
                            TimerKind::Duration => {
                                tracing::warn!("test duration plus grace period elapsed with no TEST_END, giving up on the sender");
                                return Err(Iperf3Error::Timeout(params.time));
                            }
                            TimerKind::Stats => {
                                let counters = session.stream_counters().await;
                                session.emit_interval(&counters).await;
                            }
                            TimerKind::Reporter => {}
                            TimerKind::Omit => {
                                // Counting runs throughout the omit window (matching
                                // the original tool) so the receive watchdog sees real
                                // progress; the warm-up traffic itself is discarded
                                // here by zeroing the cumulative totals, not by gating
                                // the counters.
                                let counters = session.stream_counters().await;
                                for c in &counters {
                                    c.reset_interval();
                                    c.reset_totals();
                                }
                                last_bytes_seen = None;
                                if params.interval > 0.0 {
                                    let period = Duration::from_secs_f64(params.interval);
                                    let now = Instant::now();
                                    let mut timers = session.timers.lock().await;
                                    timers.reset(now, TimerKind::Stats, period);
                                    timers.reset(now, TimerKind::Reporter, period);
                                }
                            }
                            TimerKind::ReceiveWatchdog => {
                                let counters = session.stream_counters().await;
                                let total: u64 = counters
                                    .iter()
                                    .map(|c| c.bytes_total.load(std::sync::atomic::Ordering::Relaxed))
                                    .sum();
                                if let Some(previous) = last_bytes_seen {
                                    if total == previous {
                                        tracing::warn!("no bytes received within rcv_timeout, sender appears dead");
                                        return Err(Iperf3Error::NoMsg);
                                    }
                                }
                                last_bytes_seen = Some(total);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Ask the accept loop to close the current data listener and rebuild
    /// it with `buffer_size` pre-set, and wait for the swap to complete.
    /// Best-effort: a failure here is logged and the session proceeds on
    /// whatever listener is already live, rather than failing the whole
    /// test over a socket option the client didn't strictly require.
    async fn rebuild_data_listener(rebuild_tx: &mpsc::Sender<ListenerRebuildRequest>, buffer_size: u32) {
        let (reply, reply_rx) = oneshot::channel();
        if rebuild_tx.send(ListenerRebuildRequest { buffer_size, reply }).await.is_err() {
            tracing::warn!("accept loop is gone, could not request a data listener rebuild");
            return;
        }
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "data listener rebuild failed, data streams will use the kernel default buffer size"),
            Err(_) => tracing::warn!("data listener rebuild request was dropped without a reply"),
        }
    }

    async fn wait_for_tcp_streams(session: &Arc<TestSession>, expected: usize, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        while session.stream_count().await < expected {
            if start.elapsed() > timeout {
                return Err(Iperf3Error::InitTest(format!(
                    "timed out waiting for data streams: got {} of {expected}",
                    session.stream_count().await
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    async fn accept_udp_streams(session: &Arc<TestSession>, expected: usize, server_port: u16, timeout: Duration) -> Result<()> {
        let params = session.params.lock().await.clone();
        for id in 0..expected {
            let socket = tokio::time::timeout(timeout, udp::accept_stream(server_port, session.client_addr))
                .await
                .map_err(|_| Iperf3Error::InitTest(format!("timed out waiting for UDP stream {}", id + 1)))??;
            udp::buffer_check(&socket, params.window, params.blksize)?;
            session
                .add_stream(Stream::new(id as u32 + 1, Direction::Receiving, Transport::Udp(socket)))
                .await;
        }
        Ok(())
    }
}
