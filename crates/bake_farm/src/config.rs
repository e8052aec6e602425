//! Broker and engine-side host configuration.

use anyhow::{bail, Context, Result};
use bake_net::discovery::BeaconConfig;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::MAX_FRAME_LEN;

/// Engine-facing port.
pub const DEFAULT_FRONT_PORT: u16 = 12134;

/// Worker-facing port.
pub const DEFAULT_BACK_PORT: u16 = 12135;

/// Root configuration for a broker.
#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
	/// Interface both routers bind to.
	#[serde(default = "default_bind_ip")]
	pub bind_ip: Ipv4Addr,
	#[serde(default = "default_front_port")]
	pub front_port: u16,
	#[serde(default = "default_back_port")]
	pub back_port: u16,
	/// Routing identity; a random one is generated when absent.
	#[serde(default)]
	pub identity: Option<String>,
	/// Worker cap. Defaults to one less than the number of cores.
	#[serde(default)]
	pub max_workers: Option<usize>,
	/// Sleep when a loop iteration found nothing to do.
	#[serde(default = "default_idle_sleep_ms")]
	pub idle_sleep_ms: u64,
	#[serde(default = "default_max_frame_len")]
	pub max_frame_len: usize,
	/// Advertise over the beacon and exit when the engine goes away.
	#[serde(default)]
	pub headless: bool,
	/// Worker binary; defaults to `bake_worker` next to the running executable.
	#[serde(default)]
	pub worker_executable: Option<PathBuf>,
	#[serde(default)]
	pub beacon: BeaconConfig,
}

fn default_bind_ip() -> Ipv4Addr {
	Ipv4Addr::UNSPECIFIED
}

fn default_front_port() -> u16 {
	DEFAULT_FRONT_PORT
}

fn default_back_port() -> u16 {
	DEFAULT_BACK_PORT
}

fn default_idle_sleep_ms() -> u64 {
	100
}

fn default_max_frame_len() -> usize {
	MAX_FRAME_LEN
}

fn default_startup_delay_ms() -> u64 {
	4000
}

fn default_shutdown_grace_ms() -> u64 {
	5000
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			bind_ip: default_bind_ip(),
			front_port: default_front_port(),
			back_port: default_back_port(),
			identity: None,
			max_workers: None,
			idle_sleep_ms: default_idle_sleep_ms(),
			max_frame_len: default_max_frame_len(),
			headless: false,
			worker_executable: None,
			beacon: BeaconConfig::default(),
		}
	}
}

impl BrokerConfig {
	/// Load and validate configuration from a TOML file.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read config: {}", path.display()))?;
		Self::parse(&content).with_context(|| format!("Invalid config: {}", path.display()))
	}

	pub fn parse(content: &str) -> Result<Self> {
		let config: BrokerConfig = toml::from_str(content).context("Failed to parse TOML")?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.front_port != 0 && self.front_port == self.back_port {
			bail!("front_port and back_port must differ (both {})", self.front_port);
		}
		if self.idle_sleep_ms == 0 {
			bail!("idle_sleep_ms must be positive");
		}
		if self.max_frame_len == 0 {
			bail!("max_frame_len must be positive");
		}
		if self.beacon.notify_interval_ms == 0 {
			bail!("beacon.notify_interval_ms must be positive");
		}
		if self.beacon.keep_alive_timeout_ms <= self.beacon.notify_interval_ms {
			bail!(
				"beacon.keep_alive_timeout_ms ({}) must exceed notify_interval_ms ({})",
				self.beacon.keep_alive_timeout_ms,
				self.beacon.notify_interval_ms
			);
		}
		Ok(())
	}

	pub fn idle_sleep(&self) -> Duration {
		Duration::from_millis(self.idle_sleep_ms)
	}

	/// Concurrent worker limit: the configured cap, or `cores - 1`.
	pub fn worker_capacity(&self) -> usize {
		self.max_workers.unwrap_or_else(|| {
			let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
			cores.saturating_sub(1)
		})
	}
}

/// Engine-side [`ResourceHost`](crate::resource_host::ResourceHost) settings.
#[derive(Clone, Debug, Deserialize)]
pub struct HostConfig {
	/// Routing identity towards every broker; a random one is generated when
	/// absent.
	#[serde(default)]
	pub identity: Option<String>,
	/// Front port of discovered brokers, also used for a local broker.
	#[serde(default = "default_front_port")]
	pub front_port: u16,
	/// How long to wait for a broker to advertise before launching one.
	#[serde(default = "default_startup_delay_ms")]
	pub startup_delay_ms: u64,
	/// How long a local broker gets to exit after `ShutdownProcessor`.
	#[serde(default = "default_shutdown_grace_ms")]
	pub shutdown_grace_ms: u64,
	#[serde(default)]
	pub beacon: BeaconConfig,
}

impl Default for HostConfig {
	fn default() -> Self {
		Self {
			identity: None,
			front_port: default_front_port(),
			startup_delay_ms: default_startup_delay_ms(),
			shutdown_grace_ms: default_shutdown_grace_ms(),
			beacon: BeaconConfig::default(),
		}
	}
}

impl HostConfig {
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read config: {}", path.display()))?;
		Self::parse(&content).with_context(|| format!("Invalid config: {}", path.display()))
	}

	pub fn parse(content: &str) -> Result<Self> {
		let config: HostConfig = toml::from_str(content).context("Failed to parse TOML")?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.front_port == 0 {
			bail!("front_port must be a fixed port");
		}
		if self.beacon.notify_interval_ms == 0 {
			bail!("beacon.notify_interval_ms must be positive");
		}
		Ok(())
	}

	pub fn startup_delay(&self) -> Duration {
		Duration::from_millis(self.startup_delay_ms)
	}

	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_millis(self.shutdown_grace_ms)
	}
}
