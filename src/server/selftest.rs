//! Built-in echo self-test
//!
//! Boots a real gateway on ephemeral ports next to a local TCP echo
//! server, then checks both data paths end to end: a framed binary
//! message over WebSocket and a target handshake followed by a payload
//! over QUIC. Used by `--selftest`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

use super::Server;
use crate::bridge::{decode_frame, encode_frame, BRIDGE_STREAM_ID};
use crate::config::Config;
use crate::error::AnylinkError;

const TEST_PAYLOAD: &[u8] = b"hello_anylink_test";
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

fn check_failed(msg: impl Into<String>) -> AnylinkError {
    AnylinkError::Io(io::Error::other(msg.into()))
}

/// Run the WS and QUIC echo checks against a throwaway gateway
///
/// # Errors
///
/// Returns [`AnylinkError`] when either check fails.
pub async fn run() -> Result<(), AnylinkError> {
    info!("self-test starting");

    // Echo backend.
    let echo = TcpListener::bind("127.0.0.1:0").await?;
    let echo_addr = echo.local_addr()?.to_string();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = echo.accept().await {
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
    info!(addr = %echo_addr, "echo server running");

    let cfg = Config {
        ws_listen: "127.0.0.1:0".into(),
        quic_listen: "127.0.0.1:0".into(),
        allowed_targets: vec![echo_addr.clone()],
        ..Config::default()
    };
    let server = Arc::new(Server::bind(cfg).await?);
    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    let ws_result = ws_echo_check(&server, &echo_addr).await;
    let quic_result = match ws_result {
        Ok(()) => {
            info!("WS echo OK");
            quic_echo_check(&server, &echo_addr).await
        }
        Err(e) => Err(e),
    };

    server.shutdown(Duration::from_secs(1)).await;
    let _ = runner.await;

    quic_result.map(|()| info!("QUIC echo OK; all self-tests passed"))
}

async fn ws_echo_check(server: &Server, echo_addr: &str) -> Result<(), AnylinkError> {
    let url = format!("ws://{}/{}", server.ws_addr(), echo_addr);
    let (mut ws, _) = connect_async(&url)
        .await
        .map_err(|e| check_failed(format!("WS dial failed: {e}")))?;

    ws.send(Message::Binary(encode_frame(BRIDGE_STREAM_ID, TEST_PAYLOAD)))
        .await
        .map_err(|e| check_failed(format!("WS write failed: {e}")))?;

    let reply = timeout(REPLY_TIMEOUT, ws.next())
        .await
        .map_err(|_| check_failed("WS echo timed out"))?
        .ok_or_else(|| check_failed("WS closed before echo"))?
        .map_err(|e| check_failed(format!("WS read failed: {e}")))?;

    let Message::Binary(body) = reply else {
        return Err(check_failed(format!("unexpected WS message: {reply:?}")));
    };
    let (id, payload) =
        decode_frame(&body).ok_or_else(|| check_failed("malformed echo frame"))?;
    if id != BRIDGE_STREAM_ID || payload != TEST_PAYLOAD {
        return Err(check_failed("WS echo mismatch"));
    }

    let _ = ws.close(None).await;
    Ok(())
}

async fn quic_echo_check(server: &Server, echo_addr: &str) -> Result<(), AnylinkError> {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SelfSignedVerifier))
        .with_no_client_auth();
    tls.alpn_protocols = vec![b"anylink-quic".to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| check_failed(format!("QUIC client crypto: {e}")))?;
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap())
        .map_err(|e| check_failed(format!("QUIC client endpoint: {e}")))?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

    let conn = endpoint
        .connect(server.quic_addr(), "anylink.local")
        .map_err(|e| check_failed(format!("QUIC connect: {e}")))?
        .await
        .map_err(|e| check_failed(format!("QUIC handshake: {e}")))?;

    let (mut send, mut recv) = conn
        .open_bi()
        .await
        .map_err(|e| check_failed(format!("QUIC stream: {e}")))?;

    // The first write names the target; a pause keeps it in its own
    // chunk so the gateway consumes it whole.
    send.write_all(echo_addr.as_bytes())
        .await
        .map_err(|e| check_failed(format!("QUIC target write: {e}")))?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    send.write_all(TEST_PAYLOAD)
        .await
        .map_err(|e| check_failed(format!("QUIC payload write: {e}")))?;

    let mut buf = vec![0u8; TEST_PAYLOAD.len()];
    timeout(REPLY_TIMEOUT, recv.read_exact(&mut buf))
        .await
        .map_err(|_| check_failed("QUIC echo timed out"))?
        .map_err(|e| check_failed(format!("QUIC read: {e}")))?;

    if buf != TEST_PAYLOAD {
        return Err(check_failed(
            "QUIC echo mismatch (target bytes must not be forwarded)",
        ));
    }

    conn.close(quinn::VarInt::from_u32(0), b"selftest done");
    endpoint.wait_idle().await;
    Ok(())
}

/// Accepts the gateway's self-signed certificate
#[derive(Debug)]
struct SelfSignedVerifier;

impl ServerCertVerifier for SelfSignedVerifier {
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
