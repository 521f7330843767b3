//! The `tether-remote` library crate exposes a device manager, running in one
//! process beside the hardware, to remote controllers over an untrusted
//! network link.
//!
//! Core functionalities of this crate include:
//!
//! - Keeping a raw byte stream reliable through acknowledgements and
//!   timeout-driven retransmissions, with every payload encrypted by a cipher
//!   keyed with a shared password
//! - Optionally upgrading the link to a mutually-authenticated `TLS`
//!   transport
//! - Executing remote calls against an explicit allow-list of operations
//! - Pushing device notifications from the device manager to the connected
//!   controller without ever blocking the producer
//! - Delivering notifications in strict order, with at most one handler
//!   running at a time for each owner
//! - Fanning out notifications to application callbacks through a signal bus
//!
//! All components run on a small set of operating system threads: each link
//! endpoint owns a reader thread and a couple of consumer threads, while the
//! dispatcher starts a worker thread only for the owners that currently have
//! pending work.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use tether;

/// The reliable channel.
pub mod channel;
/// The remote client.
pub mod client;
/// Connection configuration.
pub mod config;
/// The notification dispatcher.
pub mod dispatcher;
/// Error management.
pub mod error;
/// Raw byte transports.
pub mod link;
/// Routing of remote notifications to owners and signals.
pub mod router;
/// The remote server.
pub mod server;
/// The signal bus.
pub mod signals;
/// The call surface.
pub mod surface;


// A panicking holder never leaves the guarded data in an inconsistent state,
// so the lock is taken back.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
