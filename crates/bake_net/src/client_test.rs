use super::*;
use crate::handler::{ChannelHandler, NetEvent};
use crate::server::SocketServer;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn ctx() -> Arc<NetworkContext> {
  Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST))
}

#[test]
fn test_client_server_exchange() {
  let ctx = ctx();
  let (server_handler, server_events) = ChannelHandler::new();
  let mut server = SocketServer::bind(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), server_handler).unwrap();
  server.start().unwrap();

  let (client_handler, client_events) = ChannelHandler::new();
  let mut client = SocketClient::connect(&ctx, server.local_addr(), client_handler).unwrap();
  client.start().unwrap();
  assert_eq!(client_events.recv_timeout(WAIT).unwrap(), NetEvent::Connected(client.id()));

  let conn = match server_events.recv_timeout(WAIT).unwrap() {
    NetEvent::Connected(id) => id,
    other => panic!("unexpected {:?}", other),
  };

  client.send(b"request").unwrap();
  assert_eq!(
    server_events.recv_timeout(WAIT).unwrap(),
    NetEvent::Message(conn, b"request".to_vec())
  );

  server.send(conn, b"response").unwrap();
  assert_eq!(
    client_events.recv_timeout(WAIT).unwrap(),
    NetEvent::Message(client.id(), b"response".to_vec())
  );
}

#[test]
fn test_client_notices_server_shutdown() {
  let ctx = ctx();
  let (server_handler, _server_events) = ChannelHandler::new();
  let mut server = SocketServer::bind(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), server_handler).unwrap();
  server.start().unwrap();

  let (client_handler, client_events) = ChannelHandler::new();
  let mut client = SocketClient::connect(&ctx, server.local_addr(), client_handler).unwrap();
  client.start().unwrap();
  assert_eq!(client_events.recv_timeout(WAIT).unwrap(), NetEvent::Connected(client.id()));

  server.stop();
  assert_eq!(client_events.recv_timeout(WAIT).unwrap(), NetEvent::Disconnected(client.id()));
  assert!(!client.is_connected());
  assert!(matches!(client.send(b"late"), Err(NetError::Closed)));
}

#[test]
fn test_broadcast_mode_delivers_frames() {
  let ctx = ctx();
  let (server_handler, server_events) = ChannelHandler::new();
  let mut listener =
    SocketServer::bind_broadcast(&ctx, (Ipv4Addr::LOCALHOST, 0).into(), server_handler).unwrap();
  listener.start().unwrap();

  let target: SocketAddr = (Ipv4Addr::LOCALHOST, listener.local_addr().port()).into();
  let mut sender = SocketClient::broadcast(&ctx, target, Arc::new(crate::handler::NullHandler)).unwrap();
  sender.start().unwrap();

  sender.send(b"hello everyone").unwrap();
  match server_events.recv_timeout(WAIT).unwrap() {
    NetEvent::Message(_, bytes) => assert_eq!(bytes, b"hello everyone"),
    other => panic!("unexpected {:?}", other),
  }
}
