//! Socket setup and low-level send/receive helpers shared by the TCP and UDP
//! engines.
//!
//! Buffer sizing follows the original tool's own caution: a requested size
//! is set, then read back with `getsockopt`, and the two are compared
//! directly rather than assumed to match (Linux famously reports back
//! roughly double what was requested). Dual-stack announcement mirrors the
//! same policy: an unspecified family with no explicit bind address prefers
//! an IPv6 socket with `IPV6_V6ONLY` turned off, falling back to IPv4 if the
//! kernel refuses with `EAFNOSUPPORT`.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::AddressFamily;
use crate::error::{Iperf3Error, Result};

/// Bounded-time read helper: read exactly `buf.len()` bytes from `reader`
/// before `deadline` elapses, or fail. Mirrors the original tool's
/// `wait_read` contract (spec §4.1) — it must not consume more than the
/// requested bytes and must not block past the deadline; a deadline miss
/// surfaces as a `TimedOut` `io::Error` rather than a distinct type, so
/// every caller already handling a plain I/O error on this read handles a
/// timeout too.
pub async fn read_exact_with_deadline<R>(reader: &mut R, buf: &mut [u8], deadline: Duration) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(deadline, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for control data")),
    }
}

/// Build and bind the control-channel TCP listener, applying the dual-stack
/// policy described above.
pub fn announce_tcp(host: &str, port: u16, family: AddressFamily) -> Result<TcpListener> {
    announce_tcp_on_device(host, port, family, None)
}

/// Same as [`announce_tcp`], additionally binding to a network device via
/// `SO_BINDTODEVICE` (Linux-only; a non-`None` device on another platform is
/// logged and otherwise ignored rather than failing the listen).
pub fn announce_tcp_on_device(host: &str, port: u16, family: AddressFamily, device: Option<&str>) -> Result<TcpListener> {
    announce_tcp_on_device_with_buffer(host, port, family, device, 0)
}

/// Same as [`announce_tcp_on_device`], additionally pre-setting the
/// listening socket's `SO_RCVBUF`/`SO_SNDBUF` to `buffer_size` before
/// `listen()` (a `buffer_size` of 0 leaves the kernel default alone). TCP
/// window scaling is negotiated during the handshake, so a data stream's
/// requested window only takes full effect when the buffer is set on the
/// *listening* socket an accepted stream inherits it from, not on the
/// stream itself after `accept()` has already completed the handshake.
pub fn announce_tcp_on_device_with_buffer(
    host: &str,
    port: u16,
    family: AddressFamily,
    device: Option<&str>,
    buffer_size: u32,
) -> Result<TcpListener> {
    let unspecified_host = host.is_empty() || host == "0.0.0.0" || host == "::";
    let want_v6 = match family {
        AddressFamily::V6 => true,
        AddressFamily::V4 => false,
        AddressFamily::Any => unspecified_host,
    };

    if want_v6 && family != AddressFamily::V4 {
        match bind_listener(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), false, device, buffer_size) {
            Ok(socket) => {
                verify_listener_buffer(&socket, buffer_size)?;
                return into_tokio_listener(socket);
            }
            Err(e) if family == AddressFamily::Any && e.kind() == io::ErrorKind::Unsupported => {
                tracing::warn!("IPv6 unsupported (EAFNOSUPPORT-equivalent), falling back to IPv4");
            }
            Err(e) if family == AddressFamily::V6 => {
                return Err(Iperf3Error::Listen {
                    addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
                    source: e,
                });
            }
            Err(e) if family == AddressFamily::Any => {
                tracing::warn!(error = %e, "IPv6 bind failed, falling back to IPv4");
            }
            Err(e) => {
                return Err(Iperf3Error::Listen {
                    addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
                    source: e,
                })
            }
        }
    }

    let addr: SocketAddr = format!("{}:{}", if unspecified_host { "0.0.0.0" } else { host }, port)
        .parse()
        .map_err(|_| Iperf3Error::InvalidParameter(format!("bad bind address: {host}")))?;
    let socket = bind_listener(addr, true, device, buffer_size).map_err(|source| Iperf3Error::Listen { addr, source })?;
    verify_listener_buffer(&socket, buffer_size)?;
    into_tokio_listener(socket)
}

fn bind_listener(addr: SocketAddr, is_v4: bool, device: Option<&str>, buffer_size: u32) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if !is_v4 && addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    if let Some(dev) = device {
        bind_to_device(&socket, dev);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    if buffer_size > 0 {
        socket.set_recv_buffer_size(buffer_size as usize)?;
        socket.set_send_buffer_size(buffer_size as usize)?;
    }
    socket.listen(i32::MAX)?;
    Ok(socket)
}

/// After a listener has had its buffer size pre-set (or left alone, if
/// `buffer_size` is 0), read back what the kernel actually applied and
/// surface `SetBuf2` if it's smaller than requested — the same
/// set-then-verify discipline [`set_and_verify_buffer_size`] applies to an
/// already-accepted stream, applied here to the listening socket instead.
fn verify_listener_buffer(socket: &Socket, buffer_size: u32) -> Result<()> {
    if buffer_size == 0 {
        return Ok(());
    }
    let actual = socket.recv_buffer_size().map_err(Iperf3Error::SetBuf)?;
    if actual < buffer_size as usize {
        tracing::warn!(requested = buffer_size, actual, "kernel did not honor requested listener buffer size");
        return Err(Iperf3Error::SetBuf2 {
            requested: buffer_size as usize,
            actual,
        });
    }
    Ok(())
}

/// Best-effort `SO_BINDTODEVICE`. Unsupported platforms just log and carry
/// on, matching the rest of this module's "raw socket option, not fatal"
/// treatment of platform-specific knobs.
#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, device: &str) {
    if let Err(e) = socket.bind_device(Some(device.as_bytes())) {
        tracing::warn!(device, error = %e, "failed to bind listener to device");
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, device: &str) {
    tracing::warn!(device, "binding to a network device is not supported on this platform");
}

fn into_tokio_listener(socket: Socket) -> Result<TcpListener> {
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(Iperf3Error::Io)
}

/// Set a TCP stream's send/receive buffer sizes and verify what the kernel
/// actually applied, returning `SetBuf2` if the requested size was not
/// honored (and the stream keeps whatever the kernel gave it — this is a
/// warning-grade mismatch, not a hard failure).
pub fn set_and_verify_buffer_size(stream: &TcpStream, requested: u32) -> Result<()> {
    if requested == 0 {
        return Ok(());
    }
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref
        .set_recv_buffer_size(requested as usize)
        .map_err(Iperf3Error::SetBuf)?;
    sock_ref
        .set_send_buffer_size(requested as usize)
        .map_err(Iperf3Error::SetBuf)?;
    let actual = sock_ref.recv_buffer_size().map_err(Iperf3Error::SetBuf)?;
    if actual < requested as usize {
        tracing::warn!(requested, actual, "kernel did not honor requested socket buffer size");
        return Err(Iperf3Error::SetBuf2 {
            requested: requested as usize,
            actual,
        });
    }
    Ok(())
}

/// Apply `TCP_NODELAY`.
pub fn set_nodelay(stream: &TcpStream, nodelay: bool) -> Result<()> {
    stream.set_nodelay(nodelay).map_err(Iperf3Error::SetNoDelay)
}

/// Best-effort `TCP_MAXSEG`. The original tool calls MSS tuning "very
/// buggy" on some stacks; failures here are logged and returned to the
/// caller to decide on, not escalated into aborting the session.
#[cfg(target_os = "linux")]
pub fn set_mss(stream: &TcpStream, mss: u32) -> Result<()> {
    use std::os::fd::AsRawFd;
    if mss == 0 {
        return Ok(());
    }
    let fd = stream.as_raw_fd();
    let value = mss as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        tracing::warn!(mss, error = %err, "failed to set TCP_MAXSEG");
        return Err(Iperf3Error::SetMss(err));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_mss(_stream: &TcpStream, mss: u32) -> Result<()> {
    if mss != 0 {
        tracing::warn!("TCP_MAXSEG is not supported on this platform");
    }
    Ok(())
}

/// Best-effort `TCP_CONGESTION`. An unsupported algorithm name is a warning,
/// matching the original tool's treatment of `ENOENT` from this call as
/// non-fatal.
#[cfg(target_os = "linux")]
pub fn set_congestion(stream: &TcpStream, name: &str) -> Result<()> {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let cname = std::ffi::CString::new(name)
        .map_err(|_| Iperf3Error::InvalidParameter(format!("invalid congestion algorithm name: {name}")))?;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            cname.as_ptr() as *const libc::c_void,
            cname.as_bytes().len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        tracing::warn!(congestion = name, error = %err, "failed to set TCP_CONGESTION");
        return Err(Iperf3Error::SetCongestion {
            name: name.to_string(),
            source: err,
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_congestion(_stream: &TcpStream, name: &str) -> Result<()> {
    tracing::warn!(congestion = name, "TCP_CONGESTION is not supported on this platform");
    Ok(())
}

/// Best-effort `SO_MAX_PACING_RATE`, bits/second converted to bytes/second.
#[cfg(target_os = "linux")]
pub fn set_pacing_rate(stream: &TcpStream, bits_per_second: u64) -> Result<()> {
    use std::os::fd::AsRawFd;
    if bits_per_second == 0 {
        return Ok(());
    }
    let fd = stream.as_raw_fd();
    let bytes_per_second = (bits_per_second / 8) as u32;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MAX_PACING_RATE,
            &bytes_per_second as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        tracing::warn!(error = %err, "failed to set SO_MAX_PACING_RATE");
        return Err(Iperf3Error::SetFlow(err));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_pacing_rate(_stream: &TcpStream, bits_per_second: u64) -> Result<()> {
    if bits_per_second != 0 {
        tracing::warn!("SO_MAX_PACING_RATE is not supported on this platform");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn announce_tcp_any_family_binds_and_accepts() {
        let listener = announce_tcp("127.0.0.1", 0, AddressFamily::V4).unwrap();
        let local = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let _client = TcpStream::connect(local).await.unwrap();
        let (_stream, _peer) = accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn zero_requested_buffer_size_is_a_no_op() {
        let listener = announce_tcp("127.0.0.1", 0, AddressFamily::V4).unwrap();
        let local = listener.local_addr().unwrap();
        let client = TcpStream::connect(local).await.unwrap();
        assert!(set_and_verify_buffer_size(&client, 0).is_ok());
    }

    #[tokio::test]
    async fn read_exact_with_deadline_returns_the_bytes_when_they_arrive_in_time() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client.write_all(&[1, 2, 3, 4]).await.unwrap();
        let mut buf = [0u8; 4];
        read_exact_with_deadline(&mut server, &mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn read_exact_with_deadline_times_out_on_a_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 4];
        let err = read_exact_with_deadline(&mut server, &mut buf, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
