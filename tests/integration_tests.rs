//! End-to-end gateway tests
//!
//! Each test boots a real gateway on ephemeral ports with a local TCP
//! echo backend and drives it through real WebSocket and QUIC clients.

use std::sync::{Arc, Once};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use anylink::server::SessionTable;
use anylink::{
    decode_frame, encode_frame, AnylinkError, Config, Server, TlsManager, BRIDGE_STREAM_ID,
};

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Spawn a TCP echo server and return its address
async fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

async fn start_gateway(
    allowed_targets: Vec<String>,
) -> (Arc<Server>, JoinHandle<Result<(), AnylinkError>>) {
    init_crypto_provider();
    let cfg = Config {
        ws_listen: "127.0.0.1:0".into(),
        quic_listen: "127.0.0.1:0".into(),
        allowed_targets,
        ..Config::default()
    };
    let server = Arc::new(Server::bind(cfg).await.unwrap());
    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };
    (server, runner)
}

/// Accepts any certificate; the gateway serves a self-signed one
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

fn quic_client_endpoint() -> quinn::Endpoint {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    tls.alpn_protocols = vec![b"anylink-quic".to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls).unwrap();
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));
    endpoint
}

#[tokio::test]
async fn ws_echo_round_trip() {
    let echo = spawn_echo().await;
    let (server, _runner) = start_gateway(vec![echo.clone()]).await;

    let url = format!("ws://{}/{}", server.ws_addr(), echo);
    let (mut ws, _) = connect_async(&url).await.unwrap();

    ws.send(Message::Binary(encode_frame(BRIDGE_STREAM_ID, b"hello")))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("echo within 2s")
        .unwrap()
        .unwrap();
    let Message::Binary(body) = reply else {
        panic!("expected binary reply, got {reply:?}");
    };
    let (id, payload) = decode_frame(&body).unwrap();
    assert_eq!(id, BRIDGE_STREAM_ID);
    assert_eq!(payload, b"hello");

    ws.close(None).await.unwrap();
    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn ws_denied_target_gets_403() {
    let echo = spawn_echo().await;
    let (server, _runner) = start_gateway(vec![echo]).await;

    let url = format!("ws://{}/127.0.0.1:22", server.ws_addr());
    let err = connect_async(&url).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
        other => panic!("expected HTTP 403 before upgrade, got {other:?}"),
    }

    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn ws_missing_target_gets_400() {
    let (server, _runner) = start_gateway(vec!["127.0.0.1:1".into()]).await;

    let url = format!("ws://{}/", server.ws_addr());
    let err = connect_async(&url).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
        other => panic!("expected HTTP 400, got {other:?}"),
    }

    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn quic_echo_with_target_handshake() {
    let echo = spawn_echo().await;
    let (server, _runner) = start_gateway(vec![echo.clone()]).await;

    let endpoint = quic_client_endpoint();
    let conn = endpoint
        .connect(server.quic_addr(), "anylink.local")
        .unwrap()
        .await
        .unwrap();

    let (mut send, mut recv) = conn.open_bi().await.unwrap();

    // First write names the target; the pause keeps it in its own chunk.
    send.write_all(echo.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    send.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), recv.read_exact(&mut buf))
        .await
        .expect("echo within 2s")
        .unwrap();
    // The target bytes must not appear in the echoed stream.
    assert_eq!(&buf, b"ping");

    conn.close(quinn::VarInt::from_u32(0), b"done");
    endpoint.wait_idle().await;
    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn quic_denied_target_resets_stream() {
    let (server, _runner) = start_gateway(vec!["10.9.9.9:1".into()]).await;

    let endpoint = quic_client_endpoint();
    let conn = endpoint
        .connect(server.quic_addr(), "anylink.local")
        .unwrap()
        .await
        .unwrap();

    let (mut send, mut recv) = conn.open_bi().await.unwrap();
    send.write_all(b"127.0.0.1:22").await.unwrap();

    // The server resets the stream with a non-zero application code.
    let result = timeout(Duration::from_secs(2), recv.read_to_end(64)).await;
    match result {
        Ok(Err(_)) => {}
        other => panic!("expected stream reset, got {other:?}"),
    }

    conn.close(quinn::VarInt::from_u32(0), b"done");
    endpoint.wait_idle().await;
    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn quic_session_multiplexes_streams() {
    let echo = spawn_echo().await;
    let (server, _runner) = start_gateway(vec![echo.clone()]).await;

    let endpoint = quic_client_endpoint();
    let conn = endpoint
        .connect(server.quic_addr(), "anylink.local")
        .unwrap()
        .await
        .unwrap();

    for payload in [b"alpha".as_slice(), b"bravo".as_slice()] {
        let (mut send, mut recv) = conn.open_bi().await.unwrap();
        send.write_all(echo.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        send.write_all(payload).await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        timeout(Duration::from_secs(2), recv.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, payload);
        send.finish().unwrap();
    }

    assert_eq!(server.session_count(), 1);

    conn.close(quinn::VarInt::from_u32(0), b"done");
    endpoint.wait_idle().await;
    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn pool_reuses_connection_across_ws_sessions() {
    let echo = spawn_echo().await;
    let (server, _runner) = start_gateway(vec![echo.clone()]).await;
    let url = format!("ws://{}/{}", server.ws_addr(), echo);

    for _ in 0..2 {
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(Message::Binary(encode_frame(BRIDGE_STREAM_ID, b"ping")))
            .await
            .unwrap();
        let reply = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Message::Binary(_)));
        ws.close(None).await.unwrap();

        // Let the server finish the bridge and pool the connection.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert_eq!(
        server.pool().dials(),
        1,
        "second session must reuse the pooled connection"
    );

    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    init_crypto_provider();

    // Table with short timing; a real QUIC pair drives it.
    let tls = TlsManager::new(
        Duration::from_secs(3600),
        &["anylink-quic".to_string()],
        false,
        &[],
    )
    .unwrap();
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls.server_config()).unwrap();
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let server_endpoint =
        quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = server_endpoint.local_addr().unwrap();

    let table = Arc::new(SessionTable::with_timing(
        Duration::from_millis(300),
        Duration::from_millis(100),
    ));

    {
        let table = Arc::clone(&table);
        tokio::spawn(async move {
            while let Some(incoming) = server_endpoint.accept().await {
                if let Ok(connecting) = incoming.accept() {
                    if let Ok(conn) = connecting.await {
                        table.insert(conn);
                    }
                }
            }
        });
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let reaper = table.run_reaper(shutdown_tx.subscribe());

    let endpoint = quic_client_endpoint();
    let conn = endpoint
        .connect(server_addr, "anylink.local")
        .unwrap()
        .await
        .unwrap();

    // Open no streams; the session goes idle and must be evicted.
    let reason = timeout(Duration::from_secs(5), conn.closed())
        .await
        .expect("session reaped before timeout");
    match reason {
        quinn::ConnectionError::ApplicationClosed(app) => {
            assert_eq!(app.error_code, quinn::VarInt::from_u32(0));
            assert_eq!(app.reason.as_ref(), b"idle timeout");
        }
        other => panic!("expected application close, got {other:?}"),
    }
    assert_eq!(table.len(), 0);

    let _ = shutdown_tx.send(());
    let _ = reaper.await;
}

#[tokio::test]
async fn served_certificate_rotates() {
    let echo = spawn_echo().await;
    init_crypto_provider();
    let cfg = Config {
        ws_listen: "127.0.0.1:0".into(),
        quic_listen: "127.0.0.1:0".into(),
        allowed_targets: vec![echo],
        tls_rotation: 1,
        ..Config::default()
    };
    let server = Arc::new(Server::bind(cfg).await.unwrap());
    let _runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    let peer_cert = |conn: &quinn::Connection| -> Vec<u8> {
        conn.peer_identity()
            .unwrap()
            .downcast::<Vec<CertificateDer<'static>>>()
            .unwrap()[0]
            .as_ref()
            .to_vec()
    };

    let endpoint = quic_client_endpoint();
    let first = endpoint
        .connect(server.quic_addr(), "anylink.local")
        .unwrap()
        .await
        .unwrap();
    let cert_at_start = peer_cert(&first);
    first.close(quinn::VarInt::from_u32(0), b"done");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let second = endpoint
        .connect(server.quic_addr(), "anylink.local")
        .unwrap()
        .await
        .unwrap();
    let cert_after_rotation = peer_cert(&second);
    second.close(quinn::VarInt::from_u32(0), b"done");

    assert_ne!(cert_at_start, cert_after_rotation);

    endpoint.wait_idle().await;
    server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn metrics_track_traffic() {
    let echo = spawn_echo().await;
    let (server, _runner) = start_gateway(vec![echo.clone()]).await;

    let url = format!("ws://{}/{}", server.ws_addr(), echo);
    let (mut ws, _) = connect_async(&url).await.unwrap();
    ws.send(Message::Binary(encode_frame(BRIDGE_STREAM_ID, b"12345678")))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let metrics = server.metrics();
    assert_eq!(metrics.bytes_received_total(), 8);
    assert_eq!(metrics.bytes_sent_total(), 8);
    assert_eq!(metrics.active_connections(), 0);

    let text = metrics.render();
    assert!(text.contains("bytes_sent_total 8"));

    server.shutdown(Duration::from_secs(1)).await;
}
