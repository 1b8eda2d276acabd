//! Integration tests for the iperf3 server core.

use std::time::Duration;

use iperf3_server::config::AddressFamily;
use iperf3_server::protocol::{Phase, TestParameters, COOKIE_SIZE};
use iperf3_server::{Iperf3Config, Iperf3Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[test]
fn test_config_defaults() {
    let config = Iperf3Config::default();
    assert!(!config.enabled);
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 5201);
    assert_eq!(config.address_family, AddressFamily::Any);
    assert_eq!(config.max_duration_secs, 3600);
    assert_eq!(config.max_bandwidth, 0);
}

#[test]
fn test_config_serialization() {
    let config = Iperf3Config {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 5202,
        max_duration_secs: 600,
        max_bandwidth: 1_000_000_000,
        ..Iperf3Config::default()
    };

    let json = serde_json::to_string(&config).unwrap();
    let parsed: Iperf3Config = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.enabled, config.enabled);
    assert_eq!(parsed.host, config.host);
    assert_eq!(parsed.port, config.port);
    assert_eq!(parsed.max_duration_secs, config.max_duration_secs);
    assert_eq!(parsed.max_bandwidth, config.max_bandwidth);
}

#[tokio::test]
async fn test_server_creation() {
    let config = Iperf3Config::default();
    let server = Iperf3Server::new(config);
    assert_eq!(server.session_count().await, 0);
}

#[test]
fn test_protocol_phase_conversion() {
    let phases = [
        Phase::ParamExchange,
        Phase::CreateStreams,
        Phase::TestStart,
        Phase::TestRunning,
        Phase::TestEnd,
        Phase::ExchangeResults,
        Phase::DisplayResults,
        Phase::IperfDone,
        Phase::IperfStart,
        Phase::ClientTerminate,
        Phase::AccessDenied,
    ];

    for phase in phases {
        let byte = phase.to_byte();
        assert_eq!(Phase::from_byte(byte), Some(phase));
    }
}

#[test]
fn test_test_parameters_defaults() {
    let params = TestParameters::default();
    assert_eq!(params.protocol, "TCP");
    assert_eq!(params.time, 10);
    assert_eq!(params.parallel, 1);
    assert!(!params.reverse);
    assert!(!params.bidirectional);
    assert_eq!(params.bandwidth, 0);
    assert_eq!(params.blksize, 128 * 1024);
}

/// Drives one complete short TCP session against a real server loop over
/// loopback: cookie, parameter exchange, one data stream, and the full
/// result-exchange tail, asserting the control phases arrive in the
/// expected order.
#[tokio::test]
async fn full_tcp_session_over_loopback_completes_all_phases() {
    let mut config = Iperf3Config::default();
    config.enabled = true;
    config.one_off = true;
    let server = Iperf3Server::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move { server.run_with_listener(listener).await });

    let mut control = TcpStream::connect(addr).await.unwrap();
    let cookie = vec![b'a'; COOKIE_SIZE];
    control.write_all(&cookie).await.unwrap();

    let mut phase_byte = [0u8; 1];
    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::ParamExchange));

    let params = TestParameters {
        time: 1,
        parallel: 1,
        blksize: 4096,
        ..TestParameters::default()
    };
    send_json(&mut control, &serde_json::to_value(&params).unwrap()).await;

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::CreateStreams));

    let mut data_stream = TcpStream::connect(addr).await.unwrap();
    data_stream.write_all(&cookie).await.unwrap();

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::TestStart));
    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::TestRunning));

    let mut sent = vec![0u8; 4096];
    let _ = data_stream.write_all(&mut sent).await;
    drop(data_stream);

    control.write_all(&[Phase::TestEnd.to_byte()]).await.unwrap();

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::ExchangeResults));
    send_json(&mut control, &serde_json::json!({})).await;

    let _results = read_json(&mut control).await;

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::DisplayResults));

    control.write_all(&[Phase::IperfDone.to_byte()]).await.unwrap();

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::IperfStart));

    tokio::time::timeout(Duration::from_secs(2), server_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn second_client_is_turned_away_while_a_session_is_active() {
    let mut config = Iperf3Config::default();
    config.enabled = true;
    let server = Iperf3Server::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::sync::Arc::new(server);
    let server_for_task = server.clone();
    let _server_task = tokio::spawn(async move { server_for_task.run_with_listener(listener).await });

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(&vec![b'a'; COOKIE_SIZE]).await.unwrap();
    let mut phase_byte = [0u8; 1];
    first.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::ParamExchange));

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(&vec![b'b'; COOKIE_SIZE]).await.unwrap();
    let mut second_byte = [0u8; 1];
    let n = second.read(&mut second_byte).await.unwrap();
    assert_eq!(n, 1);
    assert_eq!(Phase::from_byte(second_byte[0]), Some(Phase::AccessDenied));

    server.shutdown();
}

/// A bidirectional test needs `2 * parallel` data connections (N receiving,
/// N sending), not just `parallel` — this drives one bidirectional stream
/// pair through `CREATE_STREAMS` and confirms the server only moves on to
/// `TEST_START` once both halves have connected.
#[tokio::test]
async fn bidirectional_mode_waits_for_twice_the_stream_count() {
    let mut config = Iperf3Config::default();
    config.enabled = true;
    config.one_off = true;
    let server = Iperf3Server::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(async move { server.run_with_listener(listener).await });

    let mut control = TcpStream::connect(addr).await.unwrap();
    let cookie = vec![b'a'; COOKIE_SIZE];
    control.write_all(&cookie).await.unwrap();

    let mut phase_byte = [0u8; 1];
    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::ParamExchange));

    let params = TestParameters {
        time: 1,
        parallel: 1,
        blksize: 4096,
        bidirectional: true,
        ..TestParameters::default()
    };
    send_json(&mut control, &serde_json::to_value(&params).unwrap()).await;

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::CreateStreams));

    // Only one of the two required data connections so far: the server must
    // not advance past CREATE_STREAMS yet.
    let mut first_data = TcpStream::connect(addr).await.unwrap();
    first_data.write_all(&cookie).await.unwrap();

    let advanced_early = tokio::time::timeout(Duration::from_millis(200), control.read_exact(&mut phase_byte)).await;
    assert!(advanced_early.is_err(), "server advanced past CREATE_STREAMS with only 1 of 2 required streams");

    let mut second_data = TcpStream::connect(addr).await.unwrap();
    second_data.write_all(&cookie).await.unwrap();

    control.read_exact(&mut phase_byte).await.unwrap();
    assert_eq!(Phase::from_byte(phase_byte[0]), Some(Phase::TestStart));

    control.write_all(&[Phase::ClientTerminate.to_byte()]).await.unwrap();
    drop(first_data);
    drop(second_data);
    let _ = tokio::time::timeout(Duration::from_secs(2), server_task).await;
}

/// With `idle_timeout_secs` set and no client ever connecting, a one-off
/// server should give up and return rather than block forever.
#[tokio::test]
async fn one_off_server_exits_after_idle_timeout_with_no_client() {
    let mut config = Iperf3Config::default();
    config.enabled = true;
    config.one_off = true;
    config.idle_timeout_secs = 1;
    let server = Iperf3Server::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_task = tokio::spawn(async move { server.run_with_listener(listener).await });

    tokio::time::timeout(Duration::from_secs(3), server_task)
        .await
        .expect("server should have returned after its idle timeout")
        .unwrap()
        .unwrap();
}

async fn send_json(stream: &mut TcpStream, value: &serde_json::Value) {
    let data = serde_json::to_vec(value).unwrap();
    stream.write_all(&(data.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&data).await.unwrap();
}

async fn read_json(stream: &mut TcpStream) -> serde_json::Value {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.unwrap();
    serde_json::from_slice(&data).unwrap()
}
