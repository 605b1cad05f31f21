use crate::error::{Error, Kind};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use std::{fmt, fs, io};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Load the PEM-encoded certificate chain from a file.
#[inline]
pub fn load_certs(path: impl AsRef<Path>) -> io::Result<Vec<CertificateDer<'static>>> {
    let certfile = fs::File::open(path)?;
    let mut reader = io::BufReader::new(certfile);

    rustls_pemfile::certs(&mut reader).collect()
}

/// Load the first PEM-encoded private key from a file.
#[inline]
pub fn load_private_key(path: impl AsRef<Path>) -> io::Result<PrivateKeyDer<'static>> {
    let keyfile = fs::File::open(path)?;
    let mut reader = io::BufReader::new(keyfile);

    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "No private key found in file"))
}

/// Builds the server TLS configuration for a certificate/key file pair.
///
/// When `existing` is given its settings are kept and only the certificate is
/// replaced. ALPN defaults to `h2` and `http/1.1` unless the configuration
/// already lists protocols.
pub fn tls_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
    existing: Option<ServerConfig>,
) -> Result<Arc<ServerConfig>, Error> {
    let load_error = |e: io::Error| Error::new(Kind::CertificateLoad).with(e);

    let certs = load_certs(cert_file).map_err(load_error)?;
    if certs.is_empty() {
        return Err(Error::new(Kind::CertificateLoad).with("no certificates found in file"));
    }
    let key = load_private_key(key_file).map_err(load_error)?;

    let mut config = match existing {
        Some(mut config) => {
            let signing_key = config
                .crypto_provider()
                .key_provider
                .load_private_key(key)
                .map_err(|e| Error::new(Kind::CertificateLoad).with(e))?;
            config.cert_resolver = Arc::new(FixedCert(Arc::new(CertifiedKey::new(
                certs,
                signing_key,
            ))));
            config
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::new(Kind::CertificateLoad).with(e))?,
    };

    if config.alpn_protocols.is_empty() {
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    }

    Ok(Arc::new(config))
}

/// Wraps `listener` so every accepted connection goes through a TLS handshake
/// before it is served.
pub fn wrap_tls(
    listener: TcpListener,
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
    existing: Option<ServerConfig>,
) -> Result<SecureListener, Error> {
    let config = tls_config(cert_file, key_file, existing)?;
    Ok(SecureListener::new(listener, config))
}

/// A TCP listener paired with the TLS acceptor used on its connections.
pub struct SecureListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl SecureListener {
    /// Terminates TLS with `config` on every connection `listener` accepts.
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            listener,
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// The wrapped TCP listener.
    pub fn get_ref(&self) -> &TcpListener {
        &self.listener
    }

    /// The rustls config handshakes are run with.
    pub fn config(&self) -> &Arc<ServerConfig> {
        self.acceptor.config()
    }

    /// Gives back the plain listener, dropping the TLS layer.
    pub fn into_inner(self) -> TcpListener {
        self.listener
    }

    pub(crate) fn into_parts(self) -> (TcpListener, TlsAcceptor) {
        (self.listener, self.acceptor)
    }
}

impl fmt::Debug for SecureListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureListener")
            .field("listener", &self.listener)
            .field("alpn_protocols", &self.config().alpn_protocols)
            .finish()
    }
}

/// Serves one certificate to every client.
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_certs {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A self-signed `localhost` certificate written to a fresh temp dir.
    pub(crate) struct TestCert {
        pub(crate) dir: PathBuf,
        pub(crate) cert: PathBuf,
        pub(crate) key: PathBuf,
        pub(crate) cert_pem: String,
    }

    impl TestCert {
        pub(crate) fn generate() -> Self {
            static NEXT: AtomicUsize = AtomicUsize::new(0);

            let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .expect("generate certificate");

            let dir = std::env::temp_dir().join(format!(
                "hyper-graceful-certs-{}-{}",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::SeqCst)
            ));
            std::fs::create_dir_all(&dir).unwrap();

            let cert = dir.join("cert.pem");
            let key = dir.join("key.pem");
            let cert_pem = certified.cert.pem();
            std::fs::write(&cert, &cert_pem).unwrap();
            std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

            Self {
                dir,
                cert,
                key,
                cert_pem,
            }
        }
    }

    impl Drop for TestCert {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    pub(crate) fn init_crypto_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}
