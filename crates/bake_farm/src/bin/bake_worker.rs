//! Asset encoding worker.
//!
//! Launched by the broker; connects back, encodes one sub-task and exits.

use anyhow::{Context, Result};
use bake_farm::worker::{PassthroughEncoder, Worker, WorkerOptions};
use bake_net::NetworkContext;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bake_worker")]
#[command(about = "Executes encode sub-tasks for a bake_broker")]
struct Args {
	/// Broker address.
	#[arg(long)]
	ip: String,

	/// Broker worker-facing port.
	#[arg(long)]
	port: u16,

	/// Routing identity of this worker.
	#[arg(long)]
	id: String,

	/// Routing identity of the broker's worker channel.
	#[arg(long = "hostid")]
	host_id: String,
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let options = WorkerOptions {
		ip: args.ip,
		port: args.port,
		id: args.id,
		host_id: args.host_id,
	};

	let ctx = NetworkContext::new();
	let worker = Worker::connect(&ctx, options, Arc::new(PassthroughEncoder))
		.context("Failed to connect to broker")?;
	let completed = worker.run().context("Worker failed")?;
	tracing::info!(completed, "worker finished");
	Ok(())
}
