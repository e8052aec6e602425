use super::*;
use crate::protocol::{HostMessageType, TaskNotice};
use std::net::Ipv4Addr;

const WAIT: Duration = Duration::from_secs(5);

fn ctx() -> Arc<NetworkContext> {
	Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST))
}

fn started(id: &str) -> Message {
	Message::new(&HostMessageType::TaskStarted)
		.unwrap()
		.with(&TaskNotice {
			host_task_id: id.to_string(),
		})
		.unwrap()
}

fn expect_message(event: Option<RouterEvent>) -> Envelope {
	match event {
		Some(RouterEvent::Message(envelope)) => envelope,
		other => panic!("expected message, got {:?}", other),
	}
}

#[test]
fn test_routes_by_identity() {
	let ctx = ctx();
	let mut server = RouterServer::bind(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), "broker").unwrap();
	server.start().unwrap();

	let client = RouterClient::connect(&ctx, server.local_addr(), "engine-1").unwrap();
	client.send(&started("a")).unwrap();

	let envelope = expect_message(server.recv_timeout(WAIT));
	assert_eq!(envelope.address, "engine-1");
	assert_eq!(envelope.message.payload::<TaskNotice>(0).unwrap().host_task_id, "a");
	assert!(server.is_routable("engine-1"));

	server.send("engine-1", &started("b")).unwrap();
	let reply = expect_message(client.recv_timeout(WAIT));
	assert_eq!(reply.address, "broker");
	assert_eq!(reply.message.kind::<HostMessageType>().unwrap(), HostMessageType::TaskStarted);
}

#[test]
fn test_unknown_peer_is_an_error() {
	let ctx = ctx();
	let mut server = RouterServer::bind(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), "broker").unwrap();
	server.start().unwrap();

	match server.send("nobody", &started("x")) {
		Err(FarmError::UnknownPeer(peer)) => assert_eq!(peer, "nobody"),
		other => panic!("expected unknown peer, got {:?}", other),
	}
}

#[test]
fn test_disconnect_forgets_route() {
	let ctx = ctx();
	let mut server = RouterServer::bind(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), "broker").unwrap();
	server.start().unwrap();

	let client = RouterClient::connect(&ctx, server.local_addr(), "worker-9").unwrap();
	client.send(&started("hello")).unwrap();
	expect_message(server.recv_timeout(WAIT));

	client.close();
	assert_eq!(
		server.recv_timeout(WAIT),
		Some(RouterEvent::Disconnected("worker-9".to_string()))
	);
	assert!(!server.is_routable("worker-9"));
	assert!(matches!(server.send("worker-9", &started("late")), Err(FarmError::UnknownPeer(_))));
}

#[test]
fn test_client_reports_lost_server_once() {
	let ctx = ctx();
	let mut server = RouterServer::bind(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), "broker").unwrap();
	server.start().unwrap();

	let client = RouterClient::connect(&ctx, server.local_addr(), "engine-2").unwrap();
	client.send(&started("hello")).unwrap();
	expect_message(server.recv_timeout(WAIT));
	server.send("engine-2", &started("reply")).unwrap();
	expect_message(client.recv_timeout(WAIT));

	server.stop();

	let deadline = std::time::Instant::now() + WAIT;
	let mut lost = 0;
	while std::time::Instant::now() < deadline && lost == 0 {
		if let Some(RouterEvent::Disconnected(_)) = client.recv_timeout(Duration::from_millis(20)) {
			lost += 1;
		}
	}
	assert_eq!(lost, 1);
	assert!(!client.is_connected());
	assert_eq!(client.try_recv(), None);
	assert_eq!(client.recv_timeout(Duration::from_millis(20)), None);
	assert!(matches!(client.send(&started("late")), Err(FarmError::Disconnected)));
}
