//! TLS identity manager
//!
//! Generates a self-signed ECDSA P-256 certificate at startup and
//! regenerates it on a fixed cadence. The rustls server configuration is
//! built once with a certificate *resolver* backed by an atomic swap, so
//! every handshake (WSS and QUIC alike) picks up the newest certificate
//! without rebuilding listeners, and in-flight handshakes finish with the
//! certificate they started with.
//!
//! Rotation state machine: *Running* → tick → regenerate (swap on
//! success, keep the old certificate on failure) → *Running*;
//! [`stop`](TlsManager::stop) → *Stopped* (terminal).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use crate::error::TlsError;

/// Certificate common name
const CERT_COMMON_NAME: &str = "anylink.local";

/// Certificate organization
const CERT_ORGANIZATION: &str = "AnyLink";

/// Certificate validity window
const CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Metadata of the currently served certificate
#[derive(Debug, Clone)]
pub struct CertIdentity {
    /// Serial number, drawn from a 62-bit random range
    pub serial: u64,

    /// Start of the validity window
    pub not_before: SystemTime,

    /// DER-encoded certificate
    pub cert_der: CertificateDer<'static>,
}

/// Cert resolver reading the current key from an atomic cell
struct RotatingCertResolver {
    current: ArcSwap<CertifiedKey>,
}

impl std::fmt::Debug for RotatingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for RotatingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load_full())
    }
}

/// Process-wide TLS identity with periodic self-signed rotation
pub struct TlsManager {
    resolver: Arc<RotatingCertResolver>,
    identity: ArcSwap<CertIdentity>,
    server_config: Arc<rustls::ServerConfig>,
    rotation: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl TlsManager {
    /// Create the manager with a freshly generated certificate
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if the initial certificate cannot be
    /// generated, a client CA PEM fails to parse, or the rustls
    /// configuration cannot be built.
    pub fn new(
        rotation: Duration,
        alpn: &[String],
        client_auth: bool,
        client_cas: &[String],
    ) -> Result<Arc<Self>, TlsError> {
        let (certified, identity) = generate_identity()?;

        let resolver = Arc::new(RotatingCertResolver {
            current: ArcSwap::from_pointee(certified),
        });

        let builder =
            rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

        let builder = if client_auth {
            let mut roots = RootCertStore::empty();
            for pem in client_cas {
                for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
                    let cert = cert.map_err(|e| TlsError::ClientCa(e.to_string()))?;
                    roots
                        .add(cert)
                        .map_err(|e| TlsError::ClientCa(e.to_string()))?;
                }
            }
            if roots.is_empty() {
                return Err(TlsError::ClientCa(
                    "no certificates found in client_cas".into(),
                ));
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsError::Crypto(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder.with_cert_resolver(resolver.clone());
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        // Accept 0-RTT; session tickets are on by default in TLS 1.3.
        config.max_early_data_size = u32::MAX;

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            serial = identity.serial,
            rotation_secs = rotation.as_secs(),
            "TLS identity ready"
        );

        Ok(Arc::new(Self {
            resolver,
            identity: ArcSwap::from_pointee(identity),
            server_config: Arc::new(config),
            rotation,
            shutdown_tx,
        }))
    }

    /// Shared rustls server configuration
    ///
    /// The configuration is built once; rotation swaps the certificate
    /// underneath it.
    #[must_use]
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Metadata of the certificate served to new handshakes
    #[must_use]
    pub fn current_identity(&self) -> Arc<CertIdentity> {
        self.identity.load_full()
    }

    /// Regenerate the certificate and swap it in
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Generation`] and leaves the previous
    /// certificate in force.
    pub fn rotate_now(&self) -> Result<(), TlsError> {
        let (certified, identity) = generate_identity()?;
        let serial = identity.serial;
        self.resolver.current.store(Arc::new(certified));
        self.identity.store(Arc::new(identity));
        debug!(serial, "TLS certificate rotated");
        Ok(())
    }

    /// Spawn the background rotation task
    ///
    /// Regenerates on each tick of the rotation interval; a failed
    /// regeneration is logged and retried on the next tick.
    pub fn spawn_rotation(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + manager.rotation, manager.rotation);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.rotate_now() {
                            error!(error = %e, "TLS rotation failed, keeping previous certificate");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("TLS rotation stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Stop the rotation task. Terminal; the current certificate remains
    /// usable.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsManager")
            .field("serial", &self.current_identity().serial)
            .field("rotation", &self.rotation)
            .finish()
    }
}

/// Generate a self-signed ECDSA P-256 certificate valid for 24 hours
fn generate_identity() -> Result<(CertifiedKey, CertIdentity), TlsError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TlsError::Generation(format!("key generation: {e}")))?;

    let serial: u64 = rand::random::<u64>() & ((1 << 62) - 1);
    let not_before = time::OffsetDateTime::now_utc();
    let not_after = not_before + time::Duration::seconds(CERT_VALIDITY.as_secs() as i64);

    let mut params = CertificateParams::new(vec![CERT_COMMON_NAME.to_string()])
        .map_err(|e| TlsError::Generation(format!("certificate params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CERT_COMMON_NAME);
    dn.push(DnType::OrganizationName, CERT_ORGANIZATION);
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(serial));
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Generation(format!("self-sign: {e}")))?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let signing_key = rustls::crypto::ring::sign::any_ecdsa_type(&key_der)
        .map_err(|e| TlsError::Generation(format!("signing key: {e}")))?;

    let certified = CertifiedKey::new(vec![cert_der.clone()], signing_key);
    let identity = CertIdentity {
        serial,
        not_before: SystemTime::from(not_before),
        cert_der,
    };

    Ok((certified, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT_CRYPTO: Once = Once::new();

    fn init_crypto_provider() {
        INIT_CRYPTO.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn alpn() -> Vec<String> {
        vec!["anylink-quic".to_string()]
    }

    #[test]
    fn test_generate_identity() {
        init_crypto_provider();
        let (_, identity) = generate_identity().unwrap();
        assert!(identity.serial < (1 << 62));
        assert!(!identity.cert_der.as_ref().is_empty());
    }

    #[test]
    fn test_serials_differ() {
        init_crypto_provider();
        let (_, a) = generate_identity().unwrap();
        let (_, b) = generate_identity().unwrap();
        assert_ne!(a.serial, b.serial);
    }

    #[tokio::test]
    async fn test_rotate_now_swaps_identity() {
        init_crypto_provider();
        let manager = TlsManager::new(Duration::from_secs(3600), &alpn(), false, &[]).unwrap();

        let before = manager.current_identity();
        manager.rotate_now().unwrap();
        let after = manager.current_identity();

        assert_ne!(before.serial, after.serial);
        assert_ne!(before.cert_der, after.cert_der);
    }

    #[tokio::test]
    async fn test_background_rotation() {
        init_crypto_provider();
        let manager = TlsManager::new(Duration::from_millis(100), &alpn(), false, &[]).unwrap();
        let handle = manager.spawn_rotation();

        let first = manager.current_identity().serial;
        tokio::time::sleep(Duration::from_millis(350)).await;
        let second = manager.current_identity().serial;
        assert_ne!(first, second);

        manager.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_liveness_window() {
        init_crypto_provider();
        let rotation = Duration::from_millis(200);
        let manager = TlsManager::new(rotation, &alpn(), false, &[]).unwrap();
        let handle = manager.spawn_rotation();

        // After two rotation periods the served certificate must have
        // been issued within the last period.
        tokio::time::sleep(rotation * 2 + Duration::from_millis(50)).await;
        let identity = manager.current_identity();
        let age = SystemTime::now()
            .duration_since(identity.not_before)
            .unwrap_or_default();
        assert!(age <= rotation + Duration::from_secs(1), "cert too old: {age:?}");

        manager.stop();
        handle.await.unwrap();
    }

    #[test]
    fn test_server_config_alpn() {
        init_crypto_provider();
        let manager = TlsManager::new(Duration::from_secs(3600), &alpn(), false, &[]).unwrap();
        let config = manager.server_config();
        assert_eq!(config.alpn_protocols, vec![b"anylink-quic".to_vec()]);
        assert_eq!(config.max_early_data_size, u32::MAX);
    }

    #[test]
    fn test_client_auth_requires_valid_ca() {
        init_crypto_provider();
        let result = TlsManager::new(
            Duration::from_secs(3600),
            &alpn(),
            true,
            &["not a pem".to_string()],
        );
        assert!(result.is_err());
    }
}
