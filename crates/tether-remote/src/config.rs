use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// Default interval between two consecutive retry sweeps.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default time after which an unacknowledged envelope is sent again.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Default window within which a connection must show some traffic to be
/// considered alive.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Timing parameters of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub(crate) tick: Duration,
    pub(crate) retry_after: Duration,
    pub(crate) liveness_window: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self::new()
    }
}

impl Timings {
    /// Creates [`Timings`] with the default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tick: DEFAULT_TICK,
            retry_after: DEFAULT_RETRY_AFTER,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }

    /// Sets the socket read timeout, which is also the interval between two
    /// retry sweeps.
    #[must_use]
    pub const fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets the time after which an unacknowledged envelope is sent again.
    #[must_use]
    pub const fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Sets the liveness window of a server connection.
    #[must_use]
    pub const fn liveness_window(mut self, liveness_window: Duration) -> Self {
        self.liveness_window = liveness_window;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(Error::new(ErrorKind::Config, "The tick must not be zero"));
        }
        if self.retry_after.is_zero() {
            return Err(Error::new(
                ErrorKind::Config,
                "The retry interval must not be zero",
            ));
        }
        Ok(())
    }
}

/// Files enabling a mutually-authenticated transport.
///
/// A single private key is shared by both ends. The server presents the
/// server certificate and only accepts clients presenting a certificate
/// issued by the client certificate, while the client presents the client
/// certificate and only trusts the server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub(crate) key: PathBuf,
    pub(crate) server_certificate: PathBuf,
    pub(crate) client_certificate: PathBuf,
}

impl TlsFiles {
    /// Creates [`TlsFiles`] from the paths of the private key, of the server
    /// certificate and of the client certificate.
    ///
    /// # Errors
    ///
    /// One of the files does not exist.
    pub fn from_paths(
        key: impl AsRef<Path>,
        server_certificate: impl AsRef<Path>,
        client_certificate: impl AsRef<Path>,
    ) -> Result<Self> {
        let files = Self {
            key: key.as_ref().to_path_buf(),
            server_certificate: server_certificate.as_ref().to_path_buf(),
            client_certificate: client_certificate.as_ref().to_path_buf(),
        };

        for path in [
            &files.key,
            &files.server_certificate,
            &files.client_certificate,
        ] {
            if !path.is_file() {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("`{}` is not a readable file", path.display()),
                ));
            }
        }

        Ok(files)
    }

    /// Creates [`TlsFiles`] from optional paths, as they usually come from a
    /// command line.
    ///
    /// Returns `None` when no path is given, so that the plain transport is
    /// used.
    ///
    /// # Errors
    ///
    /// Only some of the paths are given, or one of the files does not exist.
    pub fn from_optional<P: AsRef<Path>>(
        key: Option<P>,
        server_certificate: Option<P>,
        client_certificate: Option<P>,
    ) -> Result<Option<Self>> {
        match (key, server_certificate, client_certificate) {
            (None, None, None) => Ok(None),
            (Some(key), Some(server_certificate), Some(client_certificate)) => {
                Self::from_paths(key, server_certificate, client_certificate).map(Some)
            }
            _ => Err(Error::new(
                ErrorKind::Config,
                "The key, the server certificate and the client certificate must be given together",
            )),
        }
    }
}

/// The configuration shared by both ends of a link.
#[derive(Clone)]
pub struct RemoteConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) password: String,
    pub(crate) tls: Option<TlsFiles>,
    pub(crate) timings: Timings,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl RemoteConfig {
    /// Creates a [`RemoteConfig`] for a plain transport with the default
    /// [`Timings`].
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            tls: None,
            timings: Timings::new(),
        }
    }

    /// Enables the mutually-authenticated transport.
    #[must_use]
    pub fn tls(mut self, files: TlsFiles) -> Self {
        self.tls = Some(files);
        self
    }

    /// Sets the [`Timings`].
    #[must_use]
    pub const fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Returns the host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the mutually-authenticated transport is enabled.
    #[must_use]
    pub const fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::new(ErrorKind::Config, "The host must not be empty"));
        }
        if self.password.is_empty() {
            return Err(Error::new(
                ErrorKind::Config,
                "The password must not be empty",
            ));
        }
        self.timings.validate()
    }
}
