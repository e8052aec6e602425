//! bake_farm - Broker/worker task distribution for asset encoding
//!
//! An engine hands encode requests to a [`broker::Broker`]. The broker splits
//! each [`task::Task`] into sub-tasks, runs one short-lived worker per
//! sub-task, tracks byte-weighted progress and joins the results.
//!
//! # Channels
//!
//! - **Front** (engine <-> broker): [`protocol::HostMessageType`]
//! - **Back** (broker <-> worker): [`protocol::WorkerMessageType`]
//!
//! Both are [`router`] channels: multipart messages addressed by routing
//! identity, carried over `bake_net` length-framed TCP.
//!
//! # Example
//!
//! ```ignore
//! use bake_farm::host::{HostClient, HostEvent};
//! use bake_farm::task::TaskImage;
//!
//! let host = HostClient::connect(&ctx, broker_addr, "engine")?;
//! host.submit_image("albedo", TaskImage { generate_mips: true, ..Default::default() }, png)?;
//! while let Some(event) = host.next_event(Duration::from_secs(30)) {
//!     if let HostEvent::Image { result, .. } = event {
//!         save(result.data);
//!     }
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod resource_host;
pub mod router;
pub mod splitter;
pub mod task;
pub mod worker;

pub use broker::{Broker, ProcessSpawner, ThreadSpawner, WorkerSpawner};
pub use config::{BrokerConfig, HostConfig};
pub use error::{FarmError, Result};
pub use host::{HostClient, HostEvent, HostEvents};
pub use resource_host::{BrokerLauncher, InProcessLauncher, ProcessLauncher, ResourceHost};
pub use worker::{Encoder, PassthroughEncoder, Worker, WorkerOptions};
