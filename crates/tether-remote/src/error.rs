use std::borrow::Cow;

use tether::envelope::{CallError, CallErrorKind};

/// All `tether-remote` error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or incomplete configuration.
    Config,
    /// Input/output failure on the underlying socket.
    Io,
    /// Transport security setup or handshake failure.
    Tls,
    /// Envelope encoding, framing, or encryption failure.
    Wire,
    /// The channel was closed while an operation was in flight.
    ChannelClosed,
    /// The remote call surface does not provide the requested operation.
    UnknownOperation,
    /// The remote operation rejected its arguments.
    InvalidArguments,
    /// The remote operation failed during its execution.
    OperationFailed,
    /// A value could not be serialized or deserialized.
    Serialization,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Io => "Input/Output",
            Self::Tls => "Transport security",
            Self::Wire => "Wire",
            Self::ChannelClosed => "Channel closed",
            Self::UnknownOperation => "Unknown operation",
            Self::InvalidArguments => "Invalid arguments",
            Self::OperationFailed => "Operation failed",
            Self::Serialization => "Serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A `tether-remote` error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[must_use]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn channel_closed() -> Self {
        Self::new(ErrorKind::ChannelClosed, "The channel has been closed")
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, e.to_string())
    }
}

impl From<tether::error::Error> for Error {
    fn from(e: tether::error::Error) -> Self {
        Self::new(ErrorKind::Wire, e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::new(ErrorKind::Tls, e.to_string())
    }
}

impl From<CallError> for Error {
    fn from(e: CallError) -> Self {
        let kind = match e.kind {
            CallErrorKind::UnknownOperation => ErrorKind::UnknownOperation,
            CallErrorKind::InvalidArguments => ErrorKind::InvalidArguments,
            CallErrorKind::Failed => ErrorKind::OperationFailed,
        };
        Self::new(kind, e.message)
    }
}

/// A specialized [`Result`] type for `tether-remote` operations.
pub type Result<T> = std::result::Result<T, Error>;
