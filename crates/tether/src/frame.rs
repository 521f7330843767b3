use crate::envelope::Envelope;
use crate::error::{Error, ErrorKind, Result};

/// Envelope delimiter.
pub const DELIMITER: u8 = b'\n';

/// Maximum number of bytes buffered while waiting for a delimiter.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes an [`Envelope`] as a single delimiter-terminated line.
///
/// # Errors
///
/// The envelope could not be serialized.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(DELIMITER);
    Ok(line)
}

/// An incremental decoder turning a byte stream into [`Envelope`]s.
///
/// Bytes are buffered until a complete line is available, so partial
/// envelopes never surface to the caller. Once all complete lines have been
/// consumed, decoding resumes as soon as more bytes are fed.
///
/// Only the syntax of a line is checked: any line holding a well-formed
/// envelope object is returned.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Start of the bytes not yet scanned for a delimiter.
    scanned: usize,
    overflow: bool,
}

impl FrameDecoder {
    /// Creates an empty [`FrameDecoder`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            overflow: false,
        }
    }

    /// Appends bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the number of buffered bytes, including complete lines not
    /// decoded yet.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next complete envelope.
    ///
    /// Returns `None` when no complete line is buffered. A complete line which
    /// is not a valid envelope is consumed and returned as an error, so that
    /// decoding can continue with the following lines.
    pub fn next_frame(&mut self) -> Option<Result<Envelope>> {
        loop {
            let Some(position) = self.buffer[self.scanned..]
                .iter()
                .position(|byte| *byte == DELIMITER)
            else {
                self.scanned = self.buffer.len();
                return self.check_overflow();
            };

            let end = self.scanned + position;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;

            if self.overflow {
                // Tail of an oversized line, already reported.
                self.overflow = false;
                continue;
            }

            // Surrounding whitespace, including a trailing `\r`, is ignored.
            let line = line[..line.len() - 1].trim_ascii();
            if line.is_empty() {
                continue;
            }

            return Some(serde_json::from_slice(line).map_err(|e| {
                Error::new(ErrorKind::Frame, format!("Malformed envelope: {e}"))
            }));
        }
    }

    /// Returns an iterator over the currently complete envelopes.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    fn check_overflow(&mut self) -> Option<Result<Envelope>> {
        if self.buffer.len() <= MAX_FRAME_SIZE {
            return None;
        }

        let discarded = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;

        if self.overflow {
            return None;
        }
        self.overflow = true;

        Some(Err(Error::new(
            ErrorKind::Frame,
            format!("Discarded {discarded} bytes without a delimiter"),
        )))
    }
}

/// An iterator over the complete envelopes buffered in a [`FrameDecoder`].
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use crate::envelope::{Body, Envelope};
    use crate::error::ErrorKind;
    use crate::token::Token;

    use super::{FrameDecoder, MAX_FRAME_SIZE, encode};

    #[test]
    fn single_line() {
        let envelope = Envelope::ok(Token::generate());
        let line = encode(&envelope).unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|byte| **byte == b'\n').count(), 1);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&line);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), envelope);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn partial_frames_are_buffered() {
        let first = Envelope::contents(Token::generate(), "Zmlyc3Q=".into());
        let second = Envelope::resend(Token::generate());

        let mut stream = encode(&first).unwrap();
        stream.extend(encode(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let (head, tail) = stream.split_at(10);

        decoder.feed(head);
        assert!(decoder.frames().next().is_none());
        assert_eq!(decoder.buffered(), 10);

        // Feed the rest one byte at a time.
        let mut decoded = Vec::new();
        for byte in tail {
            decoder.feed(&[*byte]);
            decoded.extend(decoder.frames().map(Result::unwrap));
        }

        assert_eq!(decoded, vec![first, second]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn buffered_counts_undecoded_lines() {
        let line = encode(&Envelope::ok(Token::generate())).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&line);
        decoder.feed(b"{\"id\"");
        assert_eq!(decoder.buffered(), line.len() + 5);

        assert!(decoder.next_frame().unwrap().is_ok());
        assert_eq!(decoder.buffered(), 5);
    }

    #[test]
    fn malformed_line_does_not_stop_decoding() {
        let envelope = Envelope::ok(Token::generate());

        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"id\": 12, \"garbage\"\n\r\n\n");
        decoder.feed(&encode(&envelope).unwrap());

        let error = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Frame);

        // Blank lines are skipped.
        assert_eq!(decoder.next_frame().unwrap().unwrap(), envelope);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn carriage_return_is_tolerated() {
        let token = Token::generate();

        let mut decoder = FrameDecoder::new();
        decoder.feed(format!("{{\"id\":\"{token}\",\"ok\":\"{token}\"}}\r\n").as_bytes());

        let envelope = decoder.next_frame().unwrap().unwrap();
        assert_eq!(envelope.body, Body::Ok(token));
    }

    #[test]
    fn oversized_line_is_discarded() {
        let envelope = Envelope::ok(Token::generate());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&vec![b'a'; MAX_FRAME_SIZE + 1]);

        let error = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Frame);
        assert_eq!(decoder.buffered(), 0);

        // The remaining part of the oversized line is dropped.
        decoder.feed(b"aaaa\n");
        decoder.feed(&encode(&envelope).unwrap());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), envelope);
    }
}
