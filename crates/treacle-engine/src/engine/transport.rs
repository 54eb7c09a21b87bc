//! Byte transports under a connection: plain TCP or TLS.
//!
//! The event loop only ever sees the [`Transport`] trait; whether a
//! connection runs rustls is decided once at creation. TLS handshakes are
//! driven non-blocking: a handshake step that cannot finish reports whether
//! it is stalled on reading or writing so the loop can arm the right
//! interest.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

use mio::net::TcpStream;
use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

/// Plaintext rustls buffers this large force short writes instead of
/// swallowing whole templates, which keeps partial-send accounting honest.
const TLS_BUFFER_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    Done,
    WantRead,
    WantWrite,
}

pub trait Transport {
    /// Drives any in-flight handshake one step. [`HandshakeProgress::Done`]
    /// means application data can flow.
    fn handshake(&mut self) -> io::Result<HandshakeProgress>;

    fn is_handshaking(&self) -> bool;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// True while the layer itself still has bytes to push to the socket
    /// (buffered TLS records), independent of caller payloads.
    fn wants_write(&self) -> bool;

    fn socket(&self) -> &TcpStream;

    fn socket_mut(&mut self) -> &mut TcpStream;

    fn shutdown(&mut self);
}

/// Direct TCP.
pub struct PlainTransport {
    sock: TcpStream,
}

impl PlainTransport {
    pub fn new(sock: TcpStream) -> Self {
        PlainTransport { sock }
    }
}

impl Transport for PlainTransport {
    fn handshake(&mut self) -> io::Result<HandshakeProgress> {
        Ok(HandshakeProgress::Done)
    }

    fn is_handshaking(&self) -> bool {
        false
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.write(buf)
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn socket(&self) -> &TcpStream {
        &self.sock
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    fn shutdown(&mut self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

/// TLS over TCP via rustls.
pub struct TlsTransport {
    sock: TcpStream,
    tls: ClientConnection,
}

impl TlsTransport {
    pub fn new(sock: TcpStream, server_name: ServerName<'static>) -> io::Result<Self> {
        let mut tls = ClientConnection::new(tls_config(), server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        tls.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        Ok(TlsTransport { sock, tls })
    }

    /// Pushes buffered TLS records to the socket until it backs up.
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Pulls TLS records from the socket into rustls. Returns the raw byte
    /// count; zero is TCP EOF.
    fn fill_tls(&mut self) -> io::Result<usize> {
        loop {
            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.tls
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for TlsTransport {
    fn handshake(&mut self) -> io::Result<HandshakeProgress> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                match self.tls.write_tls(&mut self.sock) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeProgress::WantWrite)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            if self.tls.wants_read() {
                match self.fill_tls() {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed during TLS handshake",
                        ))
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeProgress::WantRead)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        // The handshake can finish with the client Finished still queued.
        self.flush_tls()?;
        Ok(HandshakeProgress::Done)
    }

    fn is_handshaking(&self) -> bool {
        self.tls.is_handshaking()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match self.fill_tls() {
                    Ok(0) => return Ok(0),
                    Ok(_) => continue,
                    Err(e2) => return Err(e2),
                },
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Make room first, then queue plaintext, then push records out.
        self.flush_tls()?;
        let n = self.tls.writer().write(buf)?;
        self.flush_tls()?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Ok(n)
    }

    fn wants_write(&self) -> bool {
        self.tls.wants_write()
    }

    fn socket(&self) -> &TcpStream {
        &self.sock
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    fn shutdown(&mut self) {
        self.tls.send_close_notify();
        let _ = self.flush_tls();
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

/// Chooses the transport for new connections; built once at setup.
#[derive(Clone)]
pub enum TransportKind {
    Plain,
    Tls { server_name: ServerName<'static> },
}

impl TransportKind {
    pub fn create(&self, sock: TcpStream) -> io::Result<Box<dyn Transport>> {
        match self {
            TransportKind::Plain => Ok(Box::new(PlainTransport::new(sock))),
            TransportKind::Tls { server_name } => {
                Ok(Box::new(TlsTransport::new(sock, server_name.clone())?))
            }
        }
    }
}

/// One shared client config per process. Certificate verification is
/// intentionally permissive: the tool points at servers its operator
/// controls, frequently with self-signed certs.
fn tls_config() -> Arc<ClientConfig> {
    static CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        Arc::new(config)
    });
    CONFIG.clone()
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
