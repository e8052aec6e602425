//! Error types for the transport layer.

use thiserror::Error;

use crate::handler::ConnectionId;

#[derive(Debug, Error)]
pub enum NetError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("frame of {len} bytes exceeds the {max} byte limit")]
  FrameTooLarge { len: usize, max: usize },

  #[error("empty frames cannot be sent")]
  EmptyFrame,

  #[error("connection {0:?} is closed or unknown")]
  UnknownConnection(ConnectionId),

  #[error("connection closed by peer")]
  Closed,

  #[error("serialization failed: {0}")]
  Serialize(#[from] postcard::Error),

  #[error("{0} loop is already running")]
  AlreadyRunning(&'static str),
}

pub type Result<T> = std::result::Result<T, NetError>;
