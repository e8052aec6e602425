//! Asset encoding broker.
//!
//! Accepts encode requests from an engine and farms sub-tasks out to
//! `bake_worker` processes.

use anyhow::{Context, Result};
use bake_farm::broker::{Broker, ProcessSpawner};
use bake_farm::config::BrokerConfig;
use bake_farm::splitter::DefaultSplitter;
use bake_net::NetworkContext;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bake_broker")]
#[command(about = "Distributes asset encoding work across worker processes")]
struct Args {
	/// Path to configuration TOML file.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Routing identity of the engine-facing channel.
	#[arg(long)]
	identity: Option<String>,

	/// Advertise over the beacon and exit when the engine goes away.
	#[arg(long)]
	headless: bool,

	#[arg(long)]
	front_port: Option<u16>,

	#[arg(long)]
	back_port: Option<u16>,

	/// Worker cap (default: cores - 1).
	#[arg(long)]
	max_workers: Option<usize>,
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let mut config = match &args.config {
		Some(path) => BrokerConfig::load(path)?,
		None => BrokerConfig::default(),
	};
	if args.identity.is_some() {
		config.identity = args.identity;
	}
	if args.headless {
		config.headless = true;
	}
	if let Some(port) = args.front_port {
		config.front_port = port;
	}
	if let Some(port) = args.back_port {
		config.back_port = port;
	}
	if args.max_workers.is_some() {
		config.max_workers = args.max_workers;
	}
	config.validate()?;

	let spawner = match &config.worker_executable {
		Some(path) => ProcessSpawner::new(path),
		None => ProcessSpawner::beside_current_exe().context("Failed to locate bake_worker")?,
	};

	let ctx = NetworkContext::new();
	let splitter = Arc::new(DefaultSplitter::default());
	let mut broker = Broker::new(&ctx, &config, Arc::new(spawner), splitter.clone(), splitter)
		.context("Failed to bind broker")?;
	broker.start().context("Failed to start broker")?;

	tracing::info!(
		identity = %broker.identity(),
		front = %broker.front_addr(),
		back = %broker.back_addr(),
		headless = config.headless,
		"broker started"
	);
	broker.wait();
	Ok(())
}
