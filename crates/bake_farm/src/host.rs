//! Engine-side client of the broker's front channel.

use bake_net::discovery::{Beacon, BeaconConfig, BeaconEvent, BeaconRole};
use bake_net::NetworkContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{FarmError, Result};
use crate::protocol::{
	CoreResponse, HostMessageType, ImageRequest, ImageResponse, Message, ModelRequest, ModelResponse,
	ProgressMessageReport, ProgressReport, TaskNotice,
};
use crate::router::{RouterClient, RouterEvent};
use crate::task::{TaskImage, TaskImageResult, TaskModel, TaskModelResult};

/// Notification from the broker, keyed by the engine's task id.
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
	Cores(CoreResponse),
	Started { host_task_id: String },
	Progress { host_task_id: String, progress: f32 },
	ProgressMessage { host_task_id: String, progress: f32, message: String },
	Image { host_task_id: String, result: TaskImageResult },
	Model { host_task_id: String, result: TaskModelResult },
	Finished { host_task_id: String },
	Disconnected,
}

/// Callbacks for [`HostClient::dispatch`]. Every method defaults to a no-op.
pub trait HostEvents {
	fn on_cores(&mut self, _cores: &CoreResponse) {}

	fn on_started(&mut self, _host_task_id: &str) {}

	fn on_progress(&mut self, _host_task_id: &str, _progress: f32) {}

	fn on_progress_message(&mut self, _host_task_id: &str, _progress: f32, _message: &str) {}

	fn on_image(&mut self, _host_task_id: &str, _result: TaskImageResult) {}

	fn on_model(&mut self, _host_task_id: &str, _result: TaskModelResult) {}

	fn on_finished(&mut self, _host_task_id: &str) {}

	fn on_disconnected(&mut self) {}
}

pub struct HostClient {
	client: RouterClient,
	beacon: Option<Beacon>,
}

impl HostClient {
	pub fn connect(ctx: &Arc<NetworkContext>, broker: SocketAddr, id: impl Into<String>) -> Result<Self> {
		let client = RouterClient::connect(ctx, broker, id)?;
		tracing::info!(id = %client.identity(), %broker, "connected to broker");
		Ok(Self { client, beacon: None })
	}

	/// Start a consumer beacon, wait for a broker to advertise itself and
	/// connect to its front port. The beacon keeps running so a headless
	/// broker can tell when this engine goes away.
	pub fn discover(
		ctx: &Arc<NetworkContext>,
		beacon: BeaconConfig,
		front_port: u16,
		id: impl Into<String>,
		timeout: Duration,
	) -> Result<Self> {
		let id = id.into();
		let mut beacon = Beacon::new(ctx, beacon, BeaconRole::Consumer, id.clone())?;
		beacon.start()?;

		let deadline = Instant::now() + timeout;
		let producer = loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			match beacon.events().recv_timeout(remaining) {
				Ok(BeaconEvent::Discovered(peer)) if peer.role == BeaconRole::Producer => break peer,
				Ok(_) => {}
				Err(_) => return Err(FarmError::Timeout("broker discovery")),
			}
		};

		let addr = broker_addr(&producer.ip, front_port)?;
		let mut host = Self::connect(ctx, addr, id)?;
		host.beacon = Some(beacon);
		Ok(host)
	}

	pub fn id(&self) -> &str {
		self.client.identity()
	}

	pub fn is_connected(&self) -> bool {
		self.client.is_connected()
	}

	pub fn request_cores(&self) -> Result<()> {
		self.client.send(&Message::new(&HostMessageType::CoreRequest)?)
	}

	pub fn submit_image(&self, host_task_id: impl Into<String>, image: TaskImage, data: Vec<u8>) -> Result<()> {
		let request = ImageRequest {
			host_task_id: host_task_id.into(),
			image,
			data,
		};
		self.client
			.send(&Message::new(&HostMessageType::TaskImageRequest)?.with(&request)?)
	}

	pub fn submit_model(&self, host_task_id: impl Into<String>, model: TaskModel, data: Vec<u8>) -> Result<()> {
		let request = ModelRequest {
			host_task_id: host_task_id.into(),
			model,
			data,
		};
		self.client
			.send(&Message::new(&HostMessageType::TaskModelRequest)?.with(&request)?)
	}

	/// Ask the broker process to exit.
	pub fn shutdown_broker(&self) -> Result<()> {
		self.client.send(&Message::new(&HostMessageType::ShutdownProcessor)?)
	}

	/// Next notification, waiting up to `timeout`. Malformed messages are
	/// skipped.
	pub fn next_event(&self, timeout: Duration) -> Option<HostEvent> {
		let deadline = Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			match self.client.recv_timeout(remaining)? {
				RouterEvent::Disconnected(_) => return Some(HostEvent::Disconnected),
				RouterEvent::Message(envelope) => match decode_event(&envelope.message) {
					Ok(Some(event)) => return Some(event),
					Ok(None) => {}
					Err(err) => tracing::warn!(%err, "dropping malformed broker message"),
				},
			}
			if remaining.is_zero() {
				return None;
			}
		}
	}

	/// Route the next notification to `handler`. Returns `false` on timeout.
	pub fn dispatch(&self, handler: &mut dyn HostEvents, timeout: Duration) -> bool {
		let Some(event) = self.next_event(timeout) else {
			return false;
		};
		match event {
			HostEvent::Cores(cores) => handler.on_cores(&cores),
			HostEvent::Started { host_task_id } => handler.on_started(&host_task_id),
			HostEvent::Progress { host_task_id, progress } => handler.on_progress(&host_task_id, progress),
			HostEvent::ProgressMessage {
				host_task_id,
				progress,
				message,
			} => handler.on_progress_message(&host_task_id, progress, &message),
			HostEvent::Image { host_task_id, result } => handler.on_image(&host_task_id, result),
			HostEvent::Model { host_task_id, result } => handler.on_model(&host_task_id, result),
			HostEvent::Finished { host_task_id } => handler.on_finished(&host_task_id),
			HostEvent::Disconnected => handler.on_disconnected(),
		}
		true
	}

	/// Disconnect, announcing `Leaving` first when discovery is running.
	pub fn close(mut self) {
		if let Some(mut beacon) = self.beacon.take() {
			beacon.stop();
		}
		self.client.close();
	}
}

/// Front channel address of a broker advertised from `ip`.
pub(crate) fn broker_addr(ip: &str, front_port: u16) -> Result<SocketAddr> {
	format!("{ip}:{front_port}")
		.parse()
		.map_err(|err| FarmError::Protocol(format!("bad broker address {ip}: {err}")))
}

fn decode_event(message: &Message) -> Result<Option<HostEvent>> {
	let event = match message.kind::<HostMessageType>()? {
		HostMessageType::CoreResponse => HostEvent::Cores(message.payload(0)?),
		HostMessageType::TaskStarted => {
			let notice: TaskNotice = message.payload(0)?;
			HostEvent::Started {
				host_task_id: notice.host_task_id,
			}
		}
		HostMessageType::TaskProgress => {
			let report: ProgressReport = message.payload(0)?;
			HostEvent::Progress {
				host_task_id: report.id,
				progress: report.progress,
			}
		}
		HostMessageType::TaskProgressMessage => {
			let report: ProgressMessageReport = message.payload(0)?;
			HostEvent::ProgressMessage {
				host_task_id: report.id,
				progress: report.progress,
				message: report.message,
			}
		}
		HostMessageType::TaskImageResponse => {
			let response: ImageResponse = message.payload(0)?;
			HostEvent::Image {
				host_task_id: response.host_task_id,
				result: response.result,
			}
		}
		HostMessageType::TaskModelResponse => {
			let response: ModelResponse = message.payload(0)?;
			HostEvent::Model {
				host_task_id: response.host_task_id,
				result: response.result,
			}
		}
		HostMessageType::TaskFinished => {
			let notice: TaskNotice = message.payload(0)?;
			HostEvent::Finished {
				host_task_id: notice.host_task_id,
			}
		}
		other => {
			tracing::warn!(?other, "unexpected message from broker");
			return Ok(None);
		}
	};
	Ok(Some(event))
}
