use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::token::Token;

/// The body of an [`Envelope`].
///
/// Exactly one body travels with each envelope: either an encrypted payload
/// or a control message referencing the token of another envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    /// An encrypted payload, encoded as base64 text.
    Contents(String),
    /// Asks the peer to transmit again the envelope with the given token.
    Resend(Token),
    /// Acknowledges the envelope with the given token.
    Ok(Token),
}

/// A single wire record.
///
/// On the wire an envelope is a flat object, for example
/// `{"id":"...","contents":"..."}` or `{"id":"...","ok":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope token.
    pub id: Token,
    /// Envelope body.
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Creates an [`Envelope`] carrying an encrypted payload.
    #[must_use]
    #[inline]
    pub fn contents(id: Token, ciphertext: String) -> Self {
        Self {
            id,
            body: Body::Contents(ciphertext),
        }
    }

    /// Creates an [`Envelope`] acknowledging the envelope with the given
    /// token.
    #[must_use]
    #[inline]
    pub fn ok(token: Token) -> Self {
        Self {
            id: Token::generate(),
            body: Body::Ok(token),
        }
    }

    /// Creates an [`Envelope`] asking for the retransmission of the envelope
    /// with the given token.
    #[must_use]
    #[inline]
    pub fn resend(token: Token) -> Self {
        Self {
            id: Token::generate(),
            body: Body::Resend(token),
        }
    }
}

/// All the reasons why a remote call may fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallErrorKind {
    /// The operation name is not part of the call surface.
    UnknownOperation,
    /// The operation rejected its arguments.
    InvalidArguments,
    /// The operation failed during its execution.
    Failed,
}

impl std::fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOperation => "Unknown operation",
            Self::InvalidArguments => "Invalid arguments",
            Self::Failed => "Operation failed",
        }
        .fmt(f)
    }
}

/// A failure produced while executing a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Failure kind.
    pub kind: CallErrorKind,
    /// Failure message.
    pub message: String,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

impl CallError {
    /// Creates a [`CallError`].
    #[must_use]
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a [`CallError`] for an operation missing from the call
    /// surface.
    #[must_use]
    pub fn unknown_operation(func: &str) -> Self {
        Self::new(
            CallErrorKind::UnknownOperation,
            format!("`{func}` is not a registered operation"),
        )
    }

    /// Creates a [`CallError`] for rejected arguments.
    #[must_use]
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::InvalidArguments, message)
    }

    /// Creates a [`CallError`] for a failed execution.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Failed, message)
    }
}

/// The outcome of a remote call.
///
/// A legitimate `null` return value is `Ok(Value::Null)` and is therefore
/// distinguishable from a failure.
pub type CallResult = Result<Value, CallError>;

/// A request to execute an operation of the call surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Call token, used to match the result with its caller.
    pub id: Token,
    /// Operation name.
    pub func: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Named arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallEnvelope {
    /// Creates a [`CallEnvelope`] with a fresh call token.
    #[must_use]
    pub fn new(func: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            id: Token::generate(),
            func: func.into(),
            args,
            kwargs,
        }
    }
}

/// The result of a call, sent back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// The token of the [`CallEnvelope`] this result answers.
    pub id: Token,
    /// Call outcome.
    pub result: CallResult,
}

/// An asynchronous notification with no caller waiting for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// The opaque notification value.
    pub notification: Value,
}

/// All decrypted payloads carried inside a `contents` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A call request.
    Call(CallEnvelope),
    /// A call result.
    Result(ResultEnvelope),
    /// A notification.
    Notification(NotificationEnvelope),
}

impl Payload {
    /// Creates a [`Payload::Result`].
    #[must_use]
    #[inline]
    pub fn result(id: Token, result: CallResult) -> Self {
        Self::Result(ResultEnvelope { id, result })
    }

    /// Creates a [`Payload::Notification`].
    #[must_use]
    #[inline]
    pub fn notification(notification: Value) -> Self {
        Self::Notification(NotificationEnvelope { notification })
    }
}
