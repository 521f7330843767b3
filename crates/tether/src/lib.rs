//! The wire interface between a `tether` device manager and its remote
//! controllers.
//!
//! This crate provides APIs to:
//!
//! - Generate the unique tokens correlating an envelope with its
//!   acknowledgement, or a call with its result
//! - Describe the envelopes exchanged over the network, along with the
//!   call, result, and notification payloads they carry
//! - Encrypt and decrypt payloads with a cipher keyed by a shared password
//! - Encode envelopes as newline-delimited lines and decode them back from
//!   a byte stream
//!
//! The runtime side, which keeps a link reliable and dispatches calls and
//! notifications, lives in the `tether-remote` crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Symmetric payload encryption.
pub mod cipher;
/// Envelopes and payloads.
pub mod envelope;
/// Error management.
pub mod error;
/// Newline-delimited envelope framing.
pub mod frame;
/// Unique envelope tokens.
pub mod token;
