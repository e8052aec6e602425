//! Error types for the broker, workers and host client.

use bake_net::NetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FarmError {
	#[error(transparent)]
	Net(#[from] NetError),

	#[error("payload serialization failed: {0}")]
	Payload(#[from] postcard::Error),

	#[error("no route to peer '{0}'")]
	UnknownPeer(String),

	#[error("protocol violation: {0}")]
	Protocol(String),

	#[error("image decoding failed: {0}")]
	Image(#[from] image::ImageError),

	#[error("splitting task {task} failed: {reason}")]
	Split { task: String, reason: String },

	#[error("joining task {task} failed: {reason}")]
	Join { task: String, reason: String },

	#[error("encoder failed: {0}")]
	Encode(String),

	#[error("failed to spawn worker: {0}")]
	Spawn(#[source] std::io::Error),

	#[error("failed to launch broker: {0}")]
	Launch(#[source] std::io::Error),

	#[error("broker disconnected")]
	Disconnected,

	#[error("timed out waiting for {0}")]
	Timeout(&'static str),
}

pub type Result<T> = std::result::Result<T, FarmError>;
