//! Message framing over a byte stream.
//!
//! Each message is encoded as compact JSON followed by a single `\n`. The
//! [`Framer`] buffers incoming bytes for one connection and hands back every
//! complete line as a decoded [`Message`], keeping a trailing partial line
//! until the rest of it arrives.

use std::io;

use futures_util::Stream;
use futures_util::stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::messages::Message;

/// Byte that terminates every encoded message.
pub const TERMINATOR: u8 = b'\n';

/// Longest segment accepted, terminator excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Failure to turn a segment into a message, or a message into bytes.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("segment of {len} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    Oversized { len: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Per-connection reassembly buffer.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
    /// Set after an oversized segment was reported while still unterminated;
    /// the bytes up to the next terminator belong to it and are dropped.
    discarding: bool,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a message followed by the terminator.
    pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
        let mut bytes = serde_json::to_vec(message).map_err(FrameError::Encode)?;
        debug_assert!(!bytes.contains(&TERMINATOR));
        bytes.push(TERMINATOR);
        Ok(bytes)
    }

    /// Append bytes and iterate over every complete message now buffered.
    ///
    /// The iterator is lazy: segments it does not reach stay buffered and
    /// come out of the next `feed` (an empty slice is enough).
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(bytes);
        Frames { framer: self }
    }

    /// Number of bytes held back waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Option<Result<Message, FrameError>> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == TERMINATOR) else {
                if !self.discarding && self.buffer.len() > MAX_FRAME_LEN {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(Err(FrameError::Oversized { len }));
                }
                if self.discarding {
                    self.buffer.clear();
                }
                return None;
            };

            let mut segment: Vec<u8> = self.buffer.drain(..=end).collect();
            segment.pop();

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if segment.last() == Some(&b'\r') {
                segment.pop();
            }
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if segment.len() > MAX_FRAME_LEN {
                return Some(Err(FrameError::Oversized { len: segment.len() }));
            }

            return Some(decode(&segment));
        }
    }
}

fn decode(segment: &[u8]) -> Result<Message, FrameError> {
    serde_json::from_slice(segment).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Lazy sequence of decoded messages produced by [`Framer::feed`].
pub struct Frames<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Message, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}

/// Async reader yielding framed messages from any byte source.
pub struct FramedReader<R> {
    reader: R,
    framer: Framer,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            framer: Framer::new(),
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
            eof: false,
        }
    }

    /// Wait for the next complete segment.
    ///
    /// Returns `Ok(None)` once the peer has closed its side and every buffered
    /// message has been handed out. A trailing partial segment is dropped.
    pub async fn next_frame(&mut self) -> io::Result<Option<Result<Message, FrameError>>> {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }

            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                self.eof = true;
                if self.framer.buffered() > 0 {
                    log::debug!(
                        "Dropping {} bytes of unterminated input at end of stream",
                        self.framer.buffered()
                    );
                }
                continue;
            }
            self.framer.buffer.extend_from_slice(&self.chunk[..read]);
        }
    }

    /// Consume the reader as a stream of messages. The stream ends at end of
    /// input or on the first read error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, FrameError>> {
        stream::unfold(self, |mut frames| async move {
            match frames.next_frame().await {
                Ok(Some(frame)) => Some((frame, frames)),
                Ok(None) => None,
                Err(e) => {
                    log::debug!("Framed stream ended with read error: {}", e);
                    None
                }
            }
        })
    }
}
