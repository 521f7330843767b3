use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use indexmap::IndexSet;

use tracing::{debug, trace, warn};

use tether::cipher::Cipher;
use tether::envelope::{Body, Envelope, Payload};
use tether::frame::{FrameDecoder, encode};
use tether::token::Token;

use crate::error::{Error, Result};
use crate::link::Link;
use crate::lock;

// Bytes read from a link at once.
const READ_BUFFER_SIZE: usize = 8 * 1024;

// Number of received tokens remembered to detect retransmitted envelopes.
const RECEIVED_HISTORY: usize = 4096;

#[derive(Debug)]
struct PendingSend {
    frame: Vec<u8>,
    sent_at: Instant,
}

/// A reliable, encrypted channel over a [`Link`].
///
/// Every payload travels encrypted inside a `contents` envelope and stays
/// pending until the peer acknowledges it with an `ok` envelope. Pending
/// envelopes are sent again, unchanged, whenever the peer asks for it with a
/// `resend` envelope or no acknowledgement arrives within the retry interval.
///
/// A payload received more than once is acknowledged each time, but
/// delivered only once.
pub struct ReliableChannel {
    link: Arc<dyn Link>,
    cipher: Cipher,
    retry_after: Duration,
    pending: Mutex<HashMap<Token, PendingSend>>,
    received: Mutex<IndexSet<Token>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl ReliableChannel {
    /// Creates a [`ReliableChannel`].
    #[must_use]
    pub fn new(link: Arc<dyn Link>, cipher: Cipher, retry_after: Duration) -> Self {
        Self {
            link,
            cipher,
            retry_after,
            pending: Mutex::new(HashMap::new()),
            received: Mutex::new(IndexSet::new()),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Encrypts and sends a payload, returning the token of its envelope.
    ///
    /// # Errors
    ///
    /// The channel is closed, the payload could not be encrypted, or the
    /// link failed.
    pub fn send(&self, payload: &Payload) -> Result<Token> {
        if self.is_closed() {
            return Err(Error::channel_closed());
        }

        let token = Token::generate();
        let ciphertext = self.cipher.encrypt_payload(payload)?;
        let frame = encode(&Envelope::contents(token, ciphertext))?;

        // Recorded before writing, so an immediate acknowledgement finds it.
        let _ = lock(&self.pending).insert(
            token,
            PendingSend {
                frame: frame.clone(),
                sent_at: Instant::now(),
            },
        );

        self.write(&frame)?;
        trace!("Sent envelope {token}");
        Ok(token)
    }

    /// Processes an envelope read from the link.
    ///
    /// Returns the decrypted payload of a `contents` envelope seen for the
    /// first time, `None` otherwise.
    ///
    /// # Errors
    ///
    /// The link failed while answering the envelope.
    pub fn receive(&self, envelope: Envelope) -> Result<Option<Payload>> {
        match envelope.body {
            Body::Resend(token) => {
                let frame = lock(&self.pending).get_mut(&token).map(|entry| {
                    entry.sent_at = Instant::now();
                    entry.frame.clone()
                });
                match frame {
                    Some(frame) => {
                        debug!("Peer asked to resend envelope {token}");
                        self.write(&frame)?;
                    }
                    None => debug!("Ignoring resend request for unknown envelope {token}"),
                }
                Ok(None)
            }
            Body::Ok(token) => {
                if lock(&self.pending).remove(&token).is_none() {
                    trace!("Ignoring acknowledgement for unknown envelope {token}");
                }
                Ok(None)
            }
            Body::Contents(ciphertext) => match self.cipher.decrypt_payload(&ciphertext) {
                Ok(payload) => {
                    self.write_envelope(&Envelope::ok(envelope.id))?;
                    if self.remember(envelope.id) {
                        Ok(Some(payload))
                    } else {
                        debug!("Envelope {} received again, not delivered", envelope.id);
                        Ok(None)
                    }
                }
                Err(e) => {
                    warn!(
                        "Corrupted envelope {}, asking to resend it: {e}",
                        envelope.id
                    );
                    self.write_envelope(&Envelope::resend(envelope.id))?;
                    Ok(None)
                }
            },
        }
    }

    /// Sends again every pending envelope older than the retry interval.
    ///
    /// Returns the number of envelopes sent again.
    ///
    /// # Errors
    ///
    /// The link failed.
    pub fn retry_sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let stale: Vec<Vec<u8>> = lock(&self.pending)
            .values_mut()
            .filter(|entry| now.duration_since(entry.sent_at) >= self.retry_after)
            .map(|entry| {
                entry.sent_at = now;
                entry.frame.clone()
            })
            .collect();

        for frame in &stale {
            self.write(frame)?;
        }

        if !stale.is_empty() {
            debug!("Sent again {} unacknowledged envelopes", stale.len());
        }
        Ok(stale.len())
    }

    /// Reads the link until it is closed, it fails, or `stop` is raised.
    ///
    /// Each read waits at most `tick`. Retry sweeps run at least once per
    /// tick, and every delivered payload is handed to `on_payload`.
    ///
    /// # Errors
    ///
    /// The link failed.
    pub fn run_reader<F>(&self, stop: &AtomicBool, tick: Duration, mut on_payload: F) -> Result<()>
    where
        F: FnMut(Payload),
    {
        let mut decoder = FrameDecoder::new();
        let mut buffer = vec![0; READ_BUFFER_SIZE];
        let mut last_sweep = Instant::now();

        while !stop.load(Ordering::Acquire) && !self.is_closed() {
            match self.link.read(&mut buffer) {
                Ok(0) => {
                    debug!("Link closed by the peer");
                    return Ok(());
                }
                Ok(read) => {
                    self.touch();
                    decoder.feed(&buffer[..read]);
                    for frame in decoder.frames() {
                        match frame {
                            Ok(envelope) => {
                                if let Some(payload) = self.receive(envelope)? {
                                    on_payload(payload);
                                }
                            }
                            Err(e) => warn!("Discarding frame: {e}"),
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    if self.is_closed() {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            }

            if last_sweep.elapsed() >= tick {
                let _ = self.retry_sweep()?;
                last_sweep = Instant::now();
            }
        }

        Ok(())
    }

    /// Closes the channel, shutting down the link and discarding every
    /// pending envelope.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.shutdown();
        let discarded = {
            let mut pending = lock(&self.pending);
            let discarded = pending.len();
            pending.clear();
            discarded
        };
        debug!("Channel closed, {discarded} pending envelopes discarded");
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of envelopes waiting for an acknowledgement.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Returns the instant of the last byte read from or written to the
    /// link.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Returns the time elapsed since the last byte read from or written to
    /// the link.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    fn write_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.write(&encode(envelope)?)
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        self.link.write_all(frame)?;
        self.touch();
        Ok(())
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn remember(&self, token: Token) -> bool {
        let mut received = lock(&self.received);
        if !received.insert(token) {
            return false;
        }
        if received.len() > RECEIVED_HISTORY {
            let _ = received.shift_remove_index(0);
        }
        true
    }
}
