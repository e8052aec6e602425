//! Length-prefixed message framing.
//!
//! Every message on a stream is a little-endian `u32` byte count followed
//! by exactly that many payload bytes. The decoder is a two-state machine:
//!
//! - [`ParserState::GetPrefix`]: accumulate 4 prefix bytes
//! - [`ParserState::GetMessage`]: accumulate `length` payload bytes, then
//!   deliver the message and return to `GetPrefix`
//!
//! A zero length is a protocol violation. The frame is dropped and logged,
//! the stream stays usable because nothing follows an empty prefix. A length
//! above the configured limit cannot be skipped safely, so decoding fails
//! and the owner closes that connection.

use crate::error::{NetError, Result};
use crate::socket::WriteQueue;

/// Size of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Default upper bound for a single message.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Largest up-front reservation for an incoming message. Anything longer
/// grows as bytes arrive, so a prefix alone never commits memory.
pub const INITIAL_MESSAGE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserState {
  GetPrefix,
  GetMessage,
}

/// Per-connection framing state. Not shared between connections.
#[derive(Debug)]
pub struct PrefixLengthCodec {
  state: ParserState,
  prefix: [u8; PREFIX_LEN],
  prefix_filled: usize,
  expected: usize,
  message: Vec<u8>,
  max_frame_len: usize,
  rejected_frames: u64,
}

impl Default for PrefixLengthCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl PrefixLengthCodec {
  pub fn new() -> Self {
    Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
  }

  pub fn with_max_frame_len(max_frame_len: usize) -> Self {
    Self {
      state: ParserState::GetPrefix,
      prefix: [0; PREFIX_LEN],
      prefix_filled: 0,
      expected: 0,
      message: Vec::new(),
      max_frame_len,
      rejected_frames: 0,
    }
  }

  pub fn state(&self) -> ParserState {
    self.state
  }

  pub fn max_frame_len(&self) -> usize {
    self.max_frame_len
  }

  /// Number of zero-length frames dropped so far.
  pub fn rejected_frames(&self) -> u64 {
    self.rejected_frames
  }

  /// Discard any partially decoded frame.
  pub fn reset(&mut self) {
    self.state = ParserState::GetPrefix;
    self.prefix_filled = 0;
    self.expected = 0;
    self.message.clear();
  }

  /// Feed raw stream bytes, invoking `on_message` for every completed
  /// message in arrival order.
  pub fn feed<F>(&mut self, mut bytes: &[u8], mut on_message: F) -> Result<()>
  where
    F: FnMut(Vec<u8>),
  {
    while !bytes.is_empty() {
      match self.state {
        ParserState::GetPrefix => {
          let take = (PREFIX_LEN - self.prefix_filled).min(bytes.len());
          self.prefix[self.prefix_filled..self.prefix_filled + take].copy_from_slice(&bytes[..take]);
          self.prefix_filled += take;
          bytes = &bytes[take..];

          if self.prefix_filled < PREFIX_LEN {
            continue;
          }
          self.prefix_filled = 0;

          let len = u32::from_le_bytes(self.prefix) as usize;
          if len == 0 {
            self.rejected_frames += 1;
            tracing::warn!("dropping zero-length frame");
            continue;
          }
          if len > self.max_frame_len {
            return Err(NetError::FrameTooLarge {
              len,
              max: self.max_frame_len,
            });
          }

          self.expected = len;
          self.message = Vec::with_capacity(len.min(INITIAL_MESSAGE_CAPACITY));
          self.state = ParserState::GetMessage;
        }
        ParserState::GetMessage => {
          let take = (self.expected - self.message.len()).min(bytes.len());
          self.message.extend_from_slice(&bytes[..take]);
          bytes = &bytes[take..];

          if self.message.len() == self.expected {
            self.state = ParserState::GetPrefix;
            self.expected = 0;
            on_message(std::mem::take(&mut self.message));
          }
        }
      }
    }
    Ok(())
  }

  /// Frame `payload` and queue it as a single write.
  pub fn send_message(&self, queue: &WriteQueue, payload: &[u8]) -> Result<()> {
    send_frame(queue, payload, self.max_frame_len)
  }
}

/// Frame `payload` and queue it, enforcing `max_frame_len`.
pub fn send_frame(queue: &WriteQueue, payload: &[u8], max_frame_len: usize) -> Result<()> {
  if payload.len() > max_frame_len {
    return Err(NetError::FrameTooLarge {
      len: payload.len(),
      max: max_frame_len,
    });
  }
  queue.push(&encode_frame(payload)?);
  Ok(())
}

/// Prefix `payload` with its little-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
  if payload.is_empty() {
    return Err(NetError::EmptyFrame);
  }
  let len = u32::try_from(payload.len()).map_err(|_| NetError::FrameTooLarge {
    len: payload.len(),
    max: u32::MAX as usize,
  })?;

  let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
  frame.extend_from_slice(&len.to_le_bytes());
  frame.extend_from_slice(payload);
  Ok(frame)
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
