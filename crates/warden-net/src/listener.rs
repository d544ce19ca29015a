//! Listeners for the panel port.
//!
//! [`SniffingListener`] wraps every accepted socket in a [`SniffingStream`].
//! [`TlsListener`] layers TLS on top of it, so a browser that types the
//! panel address without `https://` is redirected instead of failing the
//! handshake. Both implement axum's [`Listener`], so `axum::serve` is
//! unaware of the wrapping.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::serve::Listener;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

use crate::error::{NetError, Result};
use crate::sniff::SniffingStream;

/// Time a client gets to complete the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshaken connections waiting for the server to pick them up.
const ACCEPT_BACKLOG: usize = 128;

/// Binds a TCP listener with `SO_REUSEADDR`.
pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetError::Bind(addr, e))?;

    // Allow address reuse (helps with TIME_WAIT sockets after a restart)
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::Bind(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::Bind(addr, e))?;
    socket.listen(128).map_err(|e| NetError::Bind(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::Bind(addr, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| NetError::Bind(addr, e))
}

/// Loads a PEM certificate chain and private key into a server config.
pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Tls(format!("Invalid certificate or key: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("Failed to open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetError::Tls(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(NetError::Tls(format!("No certificates found in {:?}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("Failed to open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NetError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| NetError::Tls(format!("No private key found in {:?}", path)))
}

/// TCP listener whose connections redirect plaintext HTTP to HTTPS.
pub struct SniffingListener {
    inner: TcpListener,
}

impl SniffingListener {
    /// Wraps a bound listener.
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }

    /// Binds a new listener on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Ok(Self::new(bind(addr)?))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Listener for SniffingListener {
    type Io = SniffingStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => return (SniffingStream::new(stream), addr),
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// TLS listener over a [`SniffingListener`].
///
/// Handshakes run on their own tasks so a slow client never holds up the
/// accept loop. Dropping the listener closes the socket.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<SniffingStream<TcpStream>>, SocketAddr)>,
    task: JoinHandle<()>,
}

impl TlsListener {
    /// Starts accepting TLS connections on `listener`.
    pub fn new(listener: SniffingListener, config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(config);
        let (tx, ready) = mpsc::channel(ACCEPT_BACKLOG);

        let task = tokio::spawn(accept_loop(listener, acceptor, tx));

        Ok(Self {
            local_addr,
            ready,
            task,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<SniffingStream<TcpStream>>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept loop only ends when the listener is dropped
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn accept_loop(
    mut listener: SniffingListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<SniffingStream<TcpStream>>, SocketAddr)>,
) {
    loop {
        let (stream, addr) = Listener::accept(&mut listener).await;
        let acceptor = acceptor.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, addr)).await;
                }
                Ok(Err(e)) => debug!(%addr, "TLS handshake failed: {}", e),
                Err(_) => debug!(%addr, "TLS handshake timed out"),
            }
        });
    }
}

async fn handle_accept_error(e: io::Error) {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    ) {
        return;
    }

    // Typically EMFILE; back off instead of spinning
    error!("Accept error: {}", e);
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    struct TestCert {
        _dir: tempfile::TempDir,
        cert_file: std::path::PathBuf,
        key_file: std::path::PathBuf,
        der: CertificateDer<'static>,
    }

    fn test_cert() -> TestCert {
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        std::fs::write(&cert_file, cert.pem()).unwrap();
        std::fs::write(&key_file, key_pair.serialize_pem()).unwrap();

        TestCert {
            _dir: dir,
            cert_file,
            key_file,
            der: cert.der().clone(),
        }
    }

    fn connector(der: CertificateDer<'static>) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(der).unwrap();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn sniffing_listener_redirects_http() {
        let mut listener = SniffingListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /panel/ HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let (mut conn, _) = Listener::accept(&mut listener).await;
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        drop(conn);

        let response = client.await.unwrap();
        assert!(response.contains("Location: https://127.0.0.1:9/panel/\r\n"));
    }

    #[tokio::test]
    async fn tls_listener_serves_tls_and_redirects_http() {
        let cert = test_cert();
        let config = load_tls_config(&cert.cert_file, &cert.key_file).unwrap();
        let sniffing = SniffingListener::bind(loopback()).unwrap();
        let addr = sniffing.local_addr().unwrap();
        let mut listener = TlsListener::new(sniffing, config).unwrap();
        assert_eq!(Listener::local_addr(&listener).unwrap(), addr);

        // Plaintext HTTP is answered by the sniffer and never reaches accept()
        let mut plain = TcpStream::connect(addr).await.unwrap();
        plain
            .write_all(b"GET /login HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        plain.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 307"));
        assert!(response.contains("Location: https://localhost/login\r\n"));

        // TLS goes through untouched
        let connector = connector(cert.der.clone());
        let client = tokio::spawn(async move {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, tcp).await.unwrap();
            tls.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            tls.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (mut conn, _) = Listener::accept(&mut listener).await;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();
        conn.flush().await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }

    #[test]
    fn missing_cert_file_is_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_tls_config(&dir.path().join("no.pem"), &dir.path().join("no.key"))
            .unwrap_err();
        assert!(matches!(err, NetError::Tls(_)));
    }

    #[test]
    fn key_file_without_key_is_tls_error() {
        let cert = test_cert();
        let err = load_tls_config(&cert.cert_file, &cert.cert_file).unwrap_err();
        assert!(matches!(err, NetError::Tls(_)));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = bind(loopback()).unwrap();
        let addr = first.local_addr().unwrap();
        // SO_REUSEADDR does not allow two live listeners on one port
        assert!(matches!(bind(addr), Err(NetError::Bind(..))));
    }
}
