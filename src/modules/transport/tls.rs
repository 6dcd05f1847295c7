//! TLS options, certificate loading and the sans-IO TLS session used to
//! upgrade live connections.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls_pemfile::{certs, private_key};
use tracing::{debug, info};

use super::error::{TransportError, TransportResult};

/// Plaintext the session buffers before refusing writes.
const PLAINTEXT_BUFFER_LIMIT: usize = 64 * 1024;

/// Which side of the handshake a TLS upgrade plays.
#[derive(Clone)]
pub enum TlsRole {
    /// Accept the handshake with the given server configuration.
    Server(Arc<rustls::ServerConfig>),
    /// Initiate the handshake towards `server_name`.
    Client {
        /// Client configuration.
        config: Arc<rustls::ClientConfig>,
        /// Name to verify the peer certificate against (and send as SNI).
        server_name: ServerName<'static>,
    },
}

/// Options for [`Connection::upgrade_tls`](super::Connection::upgrade_tls).
#[derive(Clone)]
pub struct TlsOptions {
    /// Handshake role and rustls configuration.
    pub role: TlsRole,

    /// Ask the peer for a certificate.
    pub request_cert: bool,

    /// Destroy the socket when the peer fails verification.
    pub reject_unauthorized: bool,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match &self.role {
            TlsRole::Server(_) => "server".to_string(),
            TlsRole::Client { server_name, .. } => format!("client({server_name:?})"),
        };
        f.debug_struct("TlsOptions")
            .field("role", &role)
            .field("request_cert", &self.request_cert)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .finish()
    }
}

impl TlsOptions {
    /// Server-side options from a PEM certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be loaded or do not form a valid
    /// certificate/key pair.
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        info!(cert_path = %cert_path.display(), "Loading TLS server certificate");

        let certificates = load_certificates(cert_path)?;
        if certificates.is_empty() {
            return Err(TransportError::CertificateLoadError {
                path: cert_path.display().to_string(),
                message: "No certificates found in file".to_string(),
            });
        }
        let key = load_private_key(key_path)?;

        let config = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_config_error)?
            .with_no_client_auth()
            .with_single_cert(certificates, key)
            .map_err(tls_config_error)?;

        Ok(Self {
            role: TlsRole::Server(Arc::new(config)),
            request_cert: false,
            reject_unauthorized: false,
        })
    }

    /// Client-side options verifying `server_name` against the bundled web
    /// PKI roots.
    ///
    /// # Errors
    ///
    /// Returns an error if `server_name` is not a valid DNS name or IP address.
    pub fn client(server_name: &str) -> TransportResult<Self> {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        };
        Self::client_with_roots(server_name, roots)
    }

    /// Client-side options trusting only the certificates in `ca_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA file cannot be loaded or `server_name` is
    /// invalid.
    pub fn client_with_ca(server_name: &str, ca_path: &Path) -> TransportResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for certificate in load_certificates(ca_path)? {
            roots
                .add(certificate)
                .map_err(|e| TransportError::CertificateLoadError {
                    path: ca_path.display().to_string(),
                    message: e.to_string(),
                })?;
        }
        Self::client_with_roots(server_name, roots)
    }

    fn client_with_roots(server_name: &str, roots: rustls::RootCertStore) -> TransportResult<Self> {
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            TransportError::TlsConfigError {
                message: format!("invalid server name '{server_name}': {e}"),
            }
        })?;

        let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_config_error)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            role: TlsRole::Client {
                config: Arc::new(config),
                server_name,
            },
            request_cert: true,
            reject_unauthorized: true,
        })
    }

    /// Require a verified peer.
    #[must_use]
    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    /// Whether this side initiates the handshake.
    #[must_use]
    pub fn is_client(&self) -> bool {
        matches!(self.role, TlsRole::Client { .. })
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_config_error(error: rustls::Error) -> TransportError {
    TransportError::TlsConfigError {
        message: error.to_string(),
    }
}

/// Load certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or parsed.
pub fn load_certificates(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TransportError::CertificateLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);

    let certs_result: Result<Vec<_>, _> = certs(&mut reader).collect();
    let certificates = certs_result.map_err(|e| TransportError::CertificateLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    debug!(path = %path.display(), count = certificates.len(), "Certificates loaded");
    Ok(certificates)
}

/// Load a private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or holds no key.
pub fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| TransportError::PrivateKeyLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TransportError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TransportError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: "No private key found in file".to_string(),
        })
}

/// Result of feeding ciphertext into a [`TlsSession`].
#[derive(Debug, Default)]
pub(crate) struct TlsInput {
    /// Decrypted application data, in order.
    pub plaintext: Vec<Bytes>,
    /// The handshake completed during this call.
    pub handshake_completed: bool,
    /// The peer sent close_notify.
    pub peer_closed: bool,
}

/// Why a TLS session rejected inbound records.
#[derive(Debug)]
pub(crate) enum TlsFailure {
    /// The peer certificate failed verification.
    Verification(String),
    /// Any other protocol failure.
    Protocol(String),
}

/// A sans-IO TLS session layered over a live byte stream.
pub(crate) struct TlsSession {
    conn: rustls::Connection,
    handshake_reported: bool,
}

impl TlsSession {
    pub(crate) fn new(options: &TlsOptions) -> Result<Self, rustls::Error> {
        let mut conn = match &options.role {
            TlsRole::Server(config) => {
                rustls::Connection::Server(rustls::ServerConnection::new(Arc::clone(config))?)
            },
            TlsRole::Client {
                config,
                server_name,
            } => rustls::Connection::Client(rustls::ClientConnection::new(
                Arc::clone(config),
                server_name.clone(),
            )?),
        };
        conn.set_buffer_limit(Some(PLAINTEXT_BUFFER_LIMIT));

        Ok(Self {
            conn,
            handshake_reported: false,
        })
    }

    /// Buffer plaintext for encryption. Returns the bytes accepted.
    pub(crate) fn write_plaintext(&mut self, data: &[u8]) -> usize {
        self.conn.writer().write(data).unwrap_or(0)
    }

    /// Whether encrypted records are waiting to be sent.
    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Queue a close_notify alert.
    pub(crate) fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    /// Flush encrypted records into `sink`. Returns `Ok(true)` once nothing
    /// is left to send and `Ok(false)` when the sink would block.
    pub(crate) fn flush<W: Write>(&mut self, sink: &mut W) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sink) {
                Ok(0) => return Ok(false),
                Ok(_) => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Feed ciphertext read from the stream.
    pub(crate) fn receive(&mut self, mut data: &[u8]) -> Result<TlsInput, TlsFailure> {
        let mut input = TlsInput::default();

        while !data.is_empty() {
            let read = self
                .conn
                .read_tls(&mut data)
                .map_err(|e| TlsFailure::Protocol(e.to_string()))?;

            let state = self.conn.process_new_packets().map_err(|e| match e {
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
                    TlsFailure::Verification(e.to_string())
                },
                other => TlsFailure::Protocol(other.to_string()),
            })?;

            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let mut plaintext = vec![0u8; available];
                self.conn
                    .reader()
                    .read_exact(&mut plaintext)
                    .map_err(|e| TlsFailure::Protocol(e.to_string()))?;
                input.plaintext.push(Bytes::from(plaintext));
            }

            if state.peer_has_closed() {
                input.peer_closed = true;
            }

            if read == 0 {
                break;
            }
        }

        if !self.handshake_reported && !self.conn.is_handshaking() {
            self.handshake_reported = true;
            input.handshake_completed = true;
        }

        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_client_options() {
        let options = TlsOptions::client("example.com").unwrap();
        assert!(options.is_client());
        assert!(options.request_cert);
        assert!(options.reject_unauthorized);

        let relaxed = options.reject_unauthorized(false);
        assert!(!relaxed.reject_unauthorized);
    }

    #[test]
    fn test_client_invalid_server_name() {
        let result = TlsOptions::client("not a hostname!");
        assert!(matches!(result, Err(TransportError::TlsConfigError { .. })));
    }

    #[test]
    fn test_load_missing_certificate() {
        let result = load_certificates(Path::new("/nonexistent/cert.pem"));
        assert!(matches!(
            result,
            Err(TransportError::CertificateLoadError { .. })
        ));
    }

    #[test]
    fn test_load_key_from_empty_file() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        std::fs::write(&key_path, "").unwrap();

        let result = load_private_key(&key_path);
        assert!(matches!(
            result,
            Err(TransportError::PrivateKeyLoadError { .. })
        ));
    }

    #[test]
    fn test_client_session_starts_handshake() {
        let options = TlsOptions::client("example.com").unwrap();
        let mut session = TlsSession::new(&options).unwrap();

        // A client session queues its ClientHello immediately.
        assert!(session.wants_write());

        let mut sink = Vec::new();
        assert!(session.flush(&mut sink).unwrap());
        assert!(!sink.is_empty());
        // TLS handshake record.
        assert_eq!(sink[0], 0x16);
    }
}
