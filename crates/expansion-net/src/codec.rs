//! Newline-delimited JSON codec.
//!
//! Every message on the wire is one UTF-8 JSON object followed by a single
//! `\n`:
//!
//! ```text
//! {"type":"TURN_CHANGE","data":{"nextTurn":"pc","actionId":"s1:4"}}\n
//! ```
//!
//! TCP is a byte stream, so one read may carry a fragment of a line or several
//! lines at once. [`LineDecoder`] buffers partial input and yields complete
//! messages in order. A blank line is ignored. A line longer than
//! [`CodecConfig::max_line_len`] is discarded up to its terminating newline and
//! reported once.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::messages::{ErrorReport, NetworkMessage};

/// Byte that terminates every encoded message.
pub const MESSAGE_DELIMITER: u8 = b'\n';

/// Configuration for the codec layer.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Maximum length of one encoded line, delimiter excluded. Default: 1 MiB.
    pub max_line_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_line_len: 1_048_576,
        }
    }
}

/// Errors produced while encoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The encoded message exceeds the configured maximum.
    #[error("encoded message is {size} bytes, maximum is {max}")]
    TooLarge {
        /// Actual encoded length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while decoding one line.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The line is not valid UTF-8.
    #[error("line is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// The line is not a well-formed message.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// The line exceeded the configured maximum and was dropped.
    #[error("line exceeds {max} bytes")]
    Oversized {
        /// Configured maximum.
        max: usize,
    },
}

impl DecodeError {
    /// The `ERROR` report a receiver surfaces in place of the bad line.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            message: format!("invalid message format: {self}"),
        }
    }
}

/// Encode `msg` as one JSON line, delimiter included.
pub fn encode(msg: &NetworkMessage) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(MESSAGE_DELIMITER);
    Ok(bytes)
}

/// Decode one line, without its delimiter.
///
/// A trailing `\r` is tolerated.
pub fn decode(line: &[u8]) -> Result<NetworkMessage, DecodeError> {
    let text = std::str::from_utf8(line)?;
    let text = text.strip_suffix('\r').unwrap_or(text);
    Ok(serde_json::from_str(text)?)
}

/// Encode `msg` and write it to `writer` in one `write_all`, then flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &NetworkMessage,
    config: &CodecConfig,
) -> Result<(), CodecError> {
    let bytes = encode(msg)?;
    let size = bytes.len() - 1;
    if size > config.max_line_len {
        return Err(CodecError::TooLarge {
            size,
            max: config.max_line_len,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stream decoder
// ---------------------------------------------------------------------------

/// Incremental splitter that turns arbitrary byte chunks into messages.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Start of the not-yet-scanned region of `buf`.
    scanned: usize,
    /// Dropping bytes until the next delimiter after an oversized line.
    discarding: bool,
    max_line_len: usize,
}

impl LineDecoder {
    /// Create a decoder enforcing `config.max_line_len`.
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            discarding: false,
            max_line_len: config.max_line_len,
        }
    }

    /// Append bytes received from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete line.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// Returns `None` when more input is needed. Blank lines are skipped.
    pub fn next_message(&mut self) -> Option<Result<NetworkMessage, DecodeError>> {
        loop {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|&b| b == MESSAGE_DELIMITER)
                .map(|offset| self.scanned + offset);

            let Some(end) = found else {
                self.scanned = self.buf.len();
                if !self.discarding && self.buf.len() > self.max_line_len {
                    // Keep nothing of the oversized line; drop the rest when it arrives.
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Some(Err(DecodeError::Oversized {
                        max: self.max_line_len,
                    }));
                }
                if self.discarding {
                    self.buf.clear();
                    self.scanned = 0;
                }
                return None;
            };

            let line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;
            let line = &line[..line.len() - 1];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line_len {
                return Some(Err(DecodeError::Oversized {
                    max: self.max_line_len,
                }));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(decode(line));
        }
    }
}
