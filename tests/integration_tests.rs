use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use protoprobe::config::ProbeConfig;
use protoprobe::probe::adapters::bitcoin::{build_version_payload, encode_message, Network, HEADER_LEN, PROTOCOL_VERSION};
use protoprobe::probe::adapters::database::RiakAdapter;
use protoprobe::probe::adapters::infra::to_ntp;
use protoprobe::probe::adapters::{AdapterInfo, Pattern, ProtocolAdapter, Registry, REGISTRY};
use protoprobe::probe::transport::Connection;
use protoprobe::probe::{
    ErrorKind, Interception, Payload, ProbeError, ProbeParams, ProbeRequest, ProbeStage, Prober, TransportKind,
};

/// Accepts forever, running `handler` on every connection.
async fn serve<F, Fut>(handler: F) -> u16
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(handler(sock));
        }
    });
    port
}

/// Accepts and holds connections without ever writing.
async fn silent_tcp_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });
    port
}

/// Sends FIN, then reads until the client hangs up so the close never
/// turns into a reset that races the reply.
async fn close_after_drain(mut sock: TcpStream) -> std::io::Result<()> {
    sock.shutdown().await?;
    let mut rest = Vec::new();
    let _ = sock.read_to_end(&mut rest).await;
    Ok(())
}

fn prober() -> Prober {
    Prober::new(ProbeConfig::default())
}

fn request(protocol: &str, port: u16, timeout_ms: u64) -> ProbeRequest {
    ProbeRequest::new(protocol, "127.0.0.1", port, timeout_ms).unwrap()
}

#[tokio::test]
async fn test_riak_ping_pong() {
    let port = serve(|mut sock| async move {
        let mut req = [0u8; 5];
        sock.read_exact(&mut req).await?;
        if req == [0, 0, 0, 1, 1] {
            sock.write_all(&[0, 0, 0, 1, 2]).await?;
        }
        Ok(())
    })
    .await;

    let result = prober().probe(request("riak", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.state, ProbeStage::Completed);
    assert_eq!(result.field("pong"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(result.bytes_sent, 5);
    assert_eq!(result.bytes_received, 5);
    assert!(result.connect_ms.is_some());
}

#[tokio::test]
async fn test_bitcoin_version_verack_handshake() {
    let port = serve(|mut sock| async move {
        let mut header = [0u8; HEADER_LEN];
        sock.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).await?;
        if &header[4..11] != b"version" {
            return Ok(());
        }

        let version = build_version_payload(sock.peer_addr()?, 0xdead_beef, chrono::Utc::now().timestamp(), "/Satoshi:27.0.0/");
        sock.write_all(&encode_message(Network::Regtest, "version", &version)).await?;
        sock.write_all(&encode_message(Network::Regtest, "verack", &[])).await?;
        let mut rest = Vec::new();
        let _ = sock.read_to_end(&mut rest).await;
        Ok(())
    })
    .await;

    let result = prober()
        .probe(request("bitcoin", port, 3000).with_param("network", "regtest"))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.field("handshakeComplete"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(result.field("network").and_then(|v| v.as_str()), Some("regtest"));
    assert_eq!(result.field("userAgent").and_then(|v| v.as_str()), Some("/Satoshi:27.0.0/"));
    assert_eq!(
        result.field("protocolVersion").and_then(|v| v.as_i64()),
        Some(PROTOCOL_VERSION as i64)
    );
    assert!(result.rtt_ms.unwrap() >= 0.0);
}

#[tokio::test]
async fn test_bitcoin_wrong_network_is_mismatch() {
    let port = serve(|mut sock| async move {
        let mut header = [0u8; HEADER_LEN];
        sock.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        sock.read_exact(&mut vec![0u8; len]).await?;
        sock.write_all(&encode_message(Network::Testnet3, "verack", &[])).await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober()
        .probe(request("btc", port, 2000).with_param("network", "mainnet"))
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ProtocolMismatch);
    assert!(error.raw_hex.is_some());
}

fn livestatus_reply(status: u16, body: &str) -> Vec<u8> {
    let mut reply = format!("{:03} {:>11}\n", status, body.len()).into_bytes();
    reply.extend_from_slice(body.as_bytes());
    reply
}

async fn livestatus_server(status: u16, body: &'static str) -> u16 {
    serve(move |mut sock| async move {
        let mut query = Vec::new();
        let mut byte = [0u8; 1];
        while !query.ends_with(b"\n\n") {
            if sock.read(&mut byte).await? == 0 {
                return Ok(());
            }
            query.push(byte[0]);
        }
        sock.write_all(&livestatus_reply(status, body)).await?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn test_livestatus_fixed16_json_body() {
    let port = livestatus_server(200, r#"[["2.2.0p1","2.2.0p1",1700000000,12,80]]"#).await;
    let result = prober().probe(request("livestatus", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.field("statusCode").and_then(|v| v.as_u64()), Some(200));
    assert!(result.field("body").unwrap().is_array());
    assert_eq!(result.field("row").unwrap()["num_hosts"], 12);
}

#[tokio::test]
async fn test_livestatus_error_status_is_service_error() {
    let port = livestatus_server(404, "Invalid GET request, no such table 'statsu'\n").await;
    let result = prober().probe(request("mk-livestatus", port, 2000)).await;
    assert_eq!(result.protocol, "livestatus");
    assert_eq!(result.error_kind(), Some(ErrorKind::ServiceError));
}

#[tokio::test]
async fn test_ntp_over_udp() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if n < 48 {
                continue;
            }
            let now = chrono::Utc::now().timestamp() as f64;
            let mut reply = [0u8; 48];
            reply[0] = 0x24; // LI 0, version 4, server mode
            reply[1] = 2;
            reply[2] = 6;
            reply[3] = 0xec;
            reply[12..16].copy_from_slice(&[10, 0, 0, 1]);
            reply[24..32].copy_from_slice(&buf[40..48]);
            reply[32..40].copy_from_slice(&to_ntp(now).to_be_bytes());
            reply[40..48].copy_from_slice(&to_ntp(now).to_be_bytes());
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    let result = prober().probe(request("sntp", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.transport, TransportKind::Udp);
    assert_eq!(result.field("stratum").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(result.field("reference").and_then(|v| v.as_str()), Some("10.0.0.1"));
}

#[tokio::test]
async fn test_one_millisecond_deadline_times_out_promptly() {
    let tcp_port = silent_tcp_server().await;
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_port = udp.local_addr().unwrap().port();

    let prober = prober();
    for adapter in REGISTRY.adapters() {
        let info = adapter.info();
        // Silence is what a discard server is expected to produce.
        if info.id == "discard" {
            continue;
        }
        let port = match info.transport {
            TransportKind::Tcp => tcp_port,
            TransportKind::Udp => udp_port,
        };
        let started = Instant::now();
        let result = prober.probe(request(info.id, port, 1)).await;
        let overhead = started.elapsed().saturating_sub(Duration::from_millis(1));

        assert!(!result.success, "{} succeeded against a silent server", info.id);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout), "{}: {:?}", info.id, result.error);
        assert_ne!(result.error.as_ref().unwrap().stage, ProbeStage::Idle);
        assert!(overhead < Duration::from_millis(50), "{} overran by {:?}", info.id, overhead);
    }
    drop(udp);
}

#[tokio::test]
async fn test_refused_connection_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let started = Instant::now();
    let result = prober().probe(request("redis", port, 2000)).await;
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TransportError);
    assert_eq!(error.stage, ProbeStage::Connecting);
    assert!(started.elapsed() < Duration::from_millis(2000));
}

#[tokio::test]
async fn test_immediate_close_fails_every_tcp_adapter() {
    let port = serve(|sock| async move {
        drop(sock);
        Ok(())
    })
    .await;

    let requests: Vec<ProbeRequest> = REGISTRY
        .adapters()
        .map(|a| a.info())
        .filter(|info| info.transport == TransportKind::Tcp)
        .map(|info| request(info.id, port, 2000))
        .collect();
    let count = requests.len();

    let results = prober().probe_all(requests, None).await;
    assert_eq!(results.len(), count);
    for result in results {
        assert!(!result.success, "{} succeeded against a closed socket", result.protocol);
        let kind = result.error_kind().unwrap();
        assert!(
            matches!(
                kind,
                ErrorKind::ProtocolMismatch | ErrorKind::TransportError | ErrorKind::MalformedResponse
            ),
            "{} failed with {:?}",
            result.protocol,
            result.error
        );
    }
}

#[tokio::test]
async fn test_http_reply_on_binary_port_is_flagged() {
    let port = serve(|mut sock| async move {
        let mut buf = [0u8; 256];
        let _ = sock.read(&mut buf).await?;
        sock.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober().probe(request("mqtt", port, 2000)).await;
    assert_eq!(result.interception, Some(Interception::Http));
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ProtocolMismatch);
    assert!(error.raw_hex.unwrap().starts_with("48545450"));
}

#[tokio::test]
async fn test_tls_alert_on_plaintext_port_is_flagged() {
    let port = serve(|mut sock| async move {
        let mut buf = [0u8; 256];
        let _ = sock.read(&mut buf).await?;
        sock.write_all(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]).await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober().probe(request("redis", port, 2000)).await;
    assert!(!result.success);
    assert_eq!(result.interception, Some(Interception::Tls));
}

struct PanickingAdapter;

#[async_trait]
impl ProtocolAdapter for PanickingAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "panicky",
            name: "Panics after its first write",
            default_port: 1,
            transport: TransportKind::Tcp,
            pattern: Pattern::GreetingOnly,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        conn.send(b"hello\r\n").await?;
        panic!("decoder bug");
    }
}

#[tokio::test]
async fn test_panicking_adapter_is_contained() {
    let silent = silent_tcp_server().await;
    let riak = serve(|mut sock| async move {
        let mut req = [0u8; 5];
        sock.read_exact(&mut req).await?;
        sock.write_all(&[0, 0, 0, 1, 2]).await?;
        Ok(())
    })
    .await;

    let registry = Registry::builder().register(PanickingAdapter).register(RiakAdapter).build();
    let prober = Prober::with_registry(
        Arc::new(registry),
        ProbeConfig {
            max_concurrent_probes: 1,
            max_pending_probes: 4,
            ..ProbeConfig::default()
        },
    );

    let results = prober
        .probe_all(vec![request("panicky", silent, 2000), request("riak", riak, 2000)], None)
        .await;
    let fault = results[0].error.as_ref().unwrap();
    assert_eq!(fault.kind, ErrorKind::AdapterFault);
    assert!(fault.message.contains("decoder bug"));
    assert_eq!(fault.stage, ProbeStage::Handshaking);
    assert!(results[1].success, "{:?}", results[1].error);

    // Permit and pending slot were both released.
    assert_eq!(prober.pending(), 0);
    assert!(prober.probe(request("riak", riak, 2000)).await.success);
}

#[tokio::test]
async fn test_result_envelope_json_shape() {
    let result = prober().probe(request("carrier-pigeon", 1, 100)).await;
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["protocol"], "carrier-pigeon");
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["kind"], "InvalidRequest");
    assert!(json["startedAt"].is_string());
    assert!(json.get("rawHex").is_none());
}

/// Reads one CRLF-terminated query line, as the reference finger server does.
async fn read_query(sock: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut query = Vec::new();
    let mut byte = [0u8; 1];
    while !query.ends_with(b"\n") {
        if sock.read(&mut byte).await? == 0 {
            break;
        }
        query.push(byte[0]);
    }
    Ok(query)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let port = serve(|mut sock| async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            sock.write_all(&buf[..n]).await?;
        }
    })
    .await;

    let result = prober()
        .probe(request("echo", port, 2000).with_param("payload", "ping-7"))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.field("echoed"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(result.field("payloadBytes").and_then(|v| v.as_u64()), Some(8));
    assert_eq!(result.bytes_sent, result.bytes_received);
}

#[tokio::test]
async fn test_discard_held_open_succeeds() {
    let port = serve(|mut sock| async move {
        let mut buf = [0u8; 4096];
        while sock.read(&mut buf).await? > 0 {}
        Ok(())
    })
    .await;

    let result = prober().probe(request("discard", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.field("silentForMs").and_then(|v| v.as_u64()), Some(300));
    assert_eq!(result.bytes_received, 0);
}

#[tokio::test]
async fn test_daytime_line() {
    let port = serve(|mut sock| async move {
        sock.write_all(b"Friday, February 16, 2024 12:00:00 \r\n").await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober().probe(request("daytime", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.field("daytime").and_then(|v| v.as_str()),
        Some("Friday, February 16, 2024 12:00:00")
    );
}

#[tokio::test]
async fn test_line_services_do_not_wait_for_close() {
    let port = serve(|mut sock| async move {
        sock.write_all(b"Friday, February 16, 2024 12:00:00\r\n").await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    })
    .await;

    for protocol in ["daytime", "qotd"] {
        let started = Instant::now();
        let result = prober().probe(request(protocol, port, 3000)).await;
        assert!(result.success, "{}: {:?}", protocol, result.error);
        assert!(started.elapsed() < Duration::from_secs(1), "{} waited for close", protocol);
    }
}

#[tokio::test]
async fn test_chargen_rotating_pattern() {
    let port = serve(|mut sock| async move {
        let mut offset = 0;
        loop {
            let mut line: Vec<u8> = (0..72).map(|i| (((i + offset) % 94) + 33) as u8).collect();
            line.extend_from_slice(b"\r\n");
            if sock.write_all(&line).await.is_err() {
                return Ok(());
            }
            offset = (offset + 1) % 94;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    let result = prober().probe(request("chargen", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.field("lineLength").and_then(|v| v.as_u64()), Some(72));
    assert_eq!(result.field("rotatingPattern"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test]
async fn test_chargen_rejects_plain_text_lines() {
    let port = serve(|mut sock| async move {
        sock.write_all(b"hello world\r\nfoo bar baz\r\n").await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober().probe(request("chargen", port, 2000)).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ProtocolMismatch));
}

#[tokio::test]
async fn test_time_seconds_since_1900() {
    let port = serve(|mut sock| async move {
        let now = chrono::Utc::now().timestamp() + 2_208_988_800;
        sock.write_all(&(now as u32).to_be_bytes()).await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober().probe(request("time", port, 2000)).await;
    assert!(result.success, "{:?}", result.error);
    let skew = result.field("skewSeconds").and_then(|v| v.as_i64()).unwrap();
    assert!(skew.abs() <= 2, "skew {}", skew);
    assert_eq!(result.bytes_received, 4);
}

#[tokio::test]
async fn test_finger_no_such_user() {
    let port = serve(|mut sock| async move {
        let query = read_query(&mut sock).await?;
        let user = String::from_utf8_lossy(&query).trim().to_string();
        sock.write_all(format!("finger: {}: no such user\r\n", user).as_bytes()).await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober()
        .probe(request("finger", port, 2000).with_param("user", "nobody"))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.field("userFound"), Some(&serde_json::Value::Bool(false)));
    assert_eq!(
        result.field("response").and_then(|v| v.as_str()),
        Some("finger: nobody: no such user")
    );
}

#[tokio::test]
async fn test_beanstalkd_huge_stats_length_is_malformed() {
    let port = serve(|mut sock| async move {
        read_query(&mut sock).await?;
        sock.write_all(b"OK 18446744073709551615\r\n").await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober().probe(request("beanstalkd", port, 2000)).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::MalformedResponse), "{:?}", result.error);
}

#[tokio::test]
async fn test_zookeeper_isro_from_foreign_service() {
    let port = serve(|mut sock| async move {
        let mut word = [0u8; 4];
        sock.read_exact(&mut word).await?;
        sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await?;
        close_after_drain(sock).await
    })
    .await;

    let result = prober()
        .probe(request("zookeeper", port, 2000).with_param("command", "isro"))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ProtocolMismatch));
}
