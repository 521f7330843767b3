use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig};

use tracing::{debug, info};

use crate::config::{RemoteConfig, TlsFiles};
use crate::error::{Error, ErrorKind, Result};
use crate::lock;

// Upper bound for a handshake to complete.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// Raw bytes read from the socket at once.
const TLS_READ_SIZE: usize = 16 * 1024;

/// A bidirectional raw byte transport.
///
/// A link is shared by a single reader thread and any number of writers:
/// concurrent [`Link::write_all`] calls never interleave their bytes.
pub trait Link: Send + Sync {
    /// Reads some bytes.
    ///
    /// Returns `Ok(0)` once the peer has closed the link. A read which times
    /// out returns an error of kind [`io::ErrorKind::WouldBlock`] or
    /// [`io::ErrorKind::TimedOut`], after which reading can continue.
    ///
    /// # Errors
    ///
    /// The read timed out or the link failed.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all the given bytes.
    ///
    /// # Errors
    ///
    /// The link failed.
    fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Shuts the link down in both directions, unblocking any pending read.
    fn shutdown(&self);
}

/// A plain `TCP` link.
pub struct TcpLink {
    socket: TcpStream,
    write_lock: Mutex<()>,
}

impl TcpLink {
    /// Creates a [`TcpLink`] whose reads time out after `tick`.
    ///
    /// # Errors
    ///
    /// The socket options could not be set.
    pub fn new(socket: TcpStream, tick: Duration) -> Result<Self> {
        configure(&socket, tick)?;
        Ok(Self {
            socket,
            write_lock: Mutex::new(()),
        })
    }
}

impl Link for TcpLink {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let _guard = lock(&self.write_lock);
        (&self.socket).write_all(data)
    }

    fn shutdown(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// A mutually-authenticated `TLS` link.
///
/// The session lock is never held across a socket operation. Raw bytes are
/// read without it, and encrypted records are taken out of the session before
/// being written, so a blocked writer never stops the reader from draining
/// the peer.
pub struct TlsLink {
    socket: TcpStream,
    session: Mutex<Connection>,
    // Keeps the records of concurrent writers in order on the socket.
    write_lock: Mutex<()>,
}

impl TlsLink {
    fn handshake(socket: TcpStream, mut session: Connection, tick: Duration) -> Result<Self> {
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        socket.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut stream = &socket;
        while session.is_handshaking() {
            let _ = session
                .complete_io(&mut stream)
                .map_err(|e| Error::new(ErrorKind::Tls, format!("Handshake failed: {e}")))?;
        }

        socket.set_write_timeout(None)?;
        configure(&socket, tick)?;

        Ok(Self {
            socket,
            session: Mutex::new(session),
            write_lock: Mutex::new(()),
        })
    }

    fn take_records(session: &mut Connection) -> io::Result<Vec<u8>> {
        let mut records = Vec::new();
        while session.wants_write() {
            let _ = session.write_tls(&mut records)?;
        }
        Ok(records)
    }

    // Sends the records queued by the session, unless a writer is active.
    // An active writer sends them together with its own.
    fn flush_pending(&self) -> io::Result<()> {
        let Ok(_writer) = self.write_lock.try_lock() else {
            return Ok(());
        };
        let records = Self::take_records(&mut lock(&self.session))?;
        (&self.socket).write_all(&records)
    }

    fn read_plaintext(session: &mut Connection, buf: &mut [u8]) -> Option<io::Result<usize>> {
        match session.reader().read(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            outcome => Some(outcome),
        }
    }
}

impl Link for TlsLink {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(outcome) = Self::read_plaintext(&mut lock(&self.session), buf) {
            return outcome;
        }

        let mut raw = [0; TLS_READ_SIZE];
        let read = (&self.socket).read(&mut raw)?;
        if read == 0 {
            return Ok(0);
        }

        let outcome = {
            let mut session = lock(&self.session);
            let mut input = &raw[..read];
            while !input.is_empty() {
                let _ = session.read_tls(&mut input)?;
                let _ = session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Self::read_plaintext(&mut session, buf)
        };

        // Alerts and key updates.
        self.flush_pending()?;

        outcome.unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let _writer = lock(&self.write_lock);

        // The session buffers a bounded amount of outgoing records, so the
        // data is handed over in pieces and the records sent in between.
        let mut remaining = data;
        loop {
            let records = {
                let mut session = lock(&self.session);
                while !remaining.is_empty() {
                    let accepted = session.writer().write(remaining)?;
                    if accepted == 0 {
                        break;
                    }
                    remaining = &remaining[accepted..];
                }
                Self::take_records(&mut session)?
            };

            if records.is_empty() {
                return if remaining.is_empty() {
                    Ok(())
                } else {
                    Err(io::ErrorKind::WriteZero.into())
                };
            }
            (&self.socket).write_all(&records)?;
        }
    }

    fn shutdown(&self) {
        lock(&self.session).send_close_notify();
        let _ = self.flush_pending();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

fn configure(socket: &TcpStream, tick: Duration) -> Result<()> {
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(tick))?;
    Ok(())
}

/// Opens a client link towards the configured host.
///
/// # Errors
///
/// The connection could not be established, the `TLS` material could not be
/// loaded, or the handshake failed.
pub fn connect(config: &RemoteConfig) -> Result<Arc<dyn Link>> {
    let tls = config.tls.as_ref().map(client_tls_config).transpose()?;

    let socket = TcpStream::connect((config.host.as_str(), config.port))?;
    info!("Connected to {}:{}", config.host, config.port);

    let tick = config.timings.tick;
    match tls {
        None => Ok(Arc::new(TcpLink::new(socket, tick)?)),
        Some(tls) => {
            let name = ServerName::try_from(config.host.clone()).map_err(|e| {
                Error::new(
                    ErrorKind::Config,
                    format!("Invalid server name `{}`: {e}", config.host),
                )
            })?;
            let session = ClientConnection::new(tls, name)?;
            let link = TlsLink::handshake(socket, Connection::Client(session), tick)?;
            debug!("TLS handshake completed with {}", config.host);
            Ok(Arc::new(link))
        }
    }
}

/// Wraps an accepted socket into a server link.
///
/// # Errors
///
/// The socket options could not be set or the handshake failed.
pub fn accept(
    socket: TcpStream,
    tls: Option<&Arc<ServerConfig>>,
    tick: Duration,
) -> Result<Arc<dyn Link>> {
    match tls {
        None => Ok(Arc::new(TcpLink::new(socket, tick)?)),
        Some(tls) => {
            let session = rustls::ServerConnection::new(Arc::clone(tls))?;
            let link = TlsLink::handshake(socket, Connection::Server(session), tick)?;
            debug!("TLS handshake completed");
            Ok(Arc::new(link))
        }
    }
}

fn tls_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::new(
        ErrorKind::Tls,
        format!("Impossible to load `{}`: {e}", path.display()),
    )
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certificates = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_error(path, e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;

    if certificates.is_empty() {
        return Err(tls_error(path, "no certificates found"));
    }
    Ok(certificates)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| tls_error(path, e))
}

fn load_roots(path: &Path) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for certificate in load_certificates(path)? {
        roots.add(certificate)?;
    }
    Ok(Arc::new(roots))
}

/// Builds the server side `TLS` configuration.
///
/// # Errors
///
/// The files could not be loaded or do not form a valid configuration.
pub fn server_tls_config(files: &TlsFiles) -> Result<Arc<ServerConfig>> {
    let verifier = WebPkiClientVerifier::builder(load_roots(&files.client_certificate)?)
        .build()
        .map_err(|e| Error::new(ErrorKind::Tls, e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certificates(&files.server_certificate)?,
            load_key(&files.key)?,
        )?;

    Ok(Arc::new(config))
}

/// Builds the client side `TLS` configuration.
///
/// # Errors
///
/// The files could not be loaded or do not form a valid configuration.
pub fn client_tls_config(files: &TlsFiles) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder()
        .with_root_certificates(load_roots(&files.server_certificate)?)
        .with_client_auth_cert(
            load_certificates(&files.client_certificate)?,
            load_key(&files.key)?,
        )?;

    Ok(Arc::new(config))
}
