//! Newline-delimited JSON framing for the command channel.
//!
//! Every message is one compact JSON object terminated by `\n`:
//!
//! ```text
//! {"id":1,"method":"JSONRPC.Hello"}\n
//! {"id":1,"status":"success","params":{...}}\n
//! ```
//!
//! Partial reads are buffered until a newline shows up. A line that is not a
//! valid message is yielded as `Err(TransportError::Parse)` *inside* the
//! stream item, so one bad frame never ends the connection.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;
use crate::protocol::{Inbound, Request};

/// Largest frame we are willing to buffer
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One decoded frame: a message, or the reason this line was unusable
pub type Decoded = std::result::Result<Inbound, TransportError>;

/// Codec for `{json}\n` frames
#[derive(Debug, Default)]
pub struct JsonLineCodec {
    /// Where to resume scanning for a newline
    next_index: usize,
    /// Skipping the rest of an oversized frame
    discarding: bool,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_line(line: &[u8]) -> Option<Decoded> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_slice::<Inbound>(trimmed).map_err(|e| {
        TransportError::Parse(format!("{} ({})", e, String::from_utf8_lossy(trimmed)))
    }))
}

impl Decoder for JsonLineCodec {
    type Item = Decoded;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, TransportError> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if buf.len() > MAX_FRAME_LEN {
                    tracing::warn!("Frame of {} bytes exceeds limit, discarding until next newline", buf.len());
                    buf.clear();
                    self.discarding = true;
                    self.next_index = 0;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                return Ok(Some(Err(TransportError::Parse(format!(
                    "frame larger than {} bytes",
                    MAX_FRAME_LEN
                )))));
            }

            if let Some(decoded) = parse_line(&line[..line.len() - 1]) {
                return Ok(Some(decoded));
            }
            // blank line, keep scanning
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, TransportError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        // Trailing frame without a newline
        let rest = buf.split();
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        Ok(parse_line(&rest))
    }
}

impl Encoder<Request> for JsonLineCodec {
    type Error = TransportError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), TransportError> {
        let json = serde_json::to_vec(&request)
            .map_err(|e| TransportError::Parse(format!("failed to encode request: {e}")))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
