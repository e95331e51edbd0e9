//! End-to-end scenarios over real loopback TCP: a live [`ServerEndpoint`]
//! paired with a live `msgframe_client::ClientEndpoint`.

use std::time::Duration;

use msgframe_client::{ClientEndpoint, ClientEvent};
use msgframe_core::{ClientConfig, ServerConfig};
use msgframe_proto::Metadata;
use msgframe_server::{ServerEndpoint, ServerEvent};
use tokio::time::timeout;

async fn start_server(
    config: ServerConfig,
) -> (ServerEndpoint, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
    ServerEndpoint::start("127.0.0.1:0", config, None).await.expect("server should bind")
}

async fn connect(
    addr: std::net::SocketAddr,
) -> (ClientEndpoint, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
    ClientEndpoint::connect(&addr.ip().to_string(), addr.port(), &ClientConfig::default(), None)
        .await
        .expect("client should connect")
}

#[tokio::test]
async fn happy_path_send_without_preshared_key() {
    let (server, mut server_events) = start_server(ServerConfig::default()).await;
    let addr = server.local_addr().unwrap();
    let (client, mut client_events) = connect(addr).await;

    assert!(matches!(client_events.recv().await.unwrap(), ClientEvent::ServerConnected));
    assert!(matches!(client_events.recv().await.unwrap(), ClientEvent::AuthenticationSucceeded));
    assert!(matches!(server_events.recv().await.unwrap(), ServerEvent::ClientConnected { .. }));

    client.send(&b"hello"[..], Metadata::new()).await.expect("send should succeed");

    let event = timeout(Duration::from_secs(1), server_events.recv()).await.unwrap().unwrap();
    match event {
        ServerEvent::MessageReceived { payload, .. } => assert_eq!(&payload[..], b"hello"),
        other => panic!("expected MessageReceived, got {other:?}"),
    }
}

#[tokio::test]
async fn preshared_key_handshake_succeeds() {
    let key = [7u8; 16];
    let config = ServerConfig { preshared_key: Some(key), ..ServerConfig::default() };
    let (server, mut server_events) = start_server(config).await;
    let addr = server.local_addr().unwrap();
    let (client, mut client_events) = connect(addr).await;

    assert!(matches!(client_events.recv().await.unwrap(), ClientEvent::ServerConnected));
    assert!(matches!(client_events.recv().await.unwrap(), ClientEvent::AuthenticationRequired));
    assert!(matches!(server_events.recv().await.unwrap(), ServerEvent::ClientConnected { .. }));

    client.authenticate(&key).await.expect("authenticate should succeed");

    assert!(matches!(client_events.recv().await.unwrap(), ClientEvent::AuthenticationSucceeded));
    assert!(matches!(
        server_events.recv().await.unwrap(),
        ServerEvent::AuthenticationSucceeded { .. }
    ));
}

#[tokio::test]
async fn preshared_key_handshake_fails_on_mismatch() {
    let config = ServerConfig { preshared_key: Some([7u8; 16]), ..ServerConfig::default() };
    let (server, mut server_events) = start_server(config).await;
    let addr = server.local_addr().unwrap();
    let (client, mut client_events) = connect(addr).await;

    let _ = client_events.recv().await; // ServerConnected
    let _ = client_events.recv().await; // AuthenticationRequired
    let _ = server_events.recv().await; // ClientConnected

    let result = client.authenticate(&[9u8; 16]).await;
    assert!(result.is_err(), "wrong key should be rejected");

    assert!(matches!(
        server_events.recv().await.unwrap(),
        ServerEvent::AuthenticationFailed { .. }
    ));
}

#[tokio::test]
async fn synchronous_request_round_trips() {
    let (server, mut server_events) = start_server(ServerConfig::default()).await;
    let addr = server.local_addr().unwrap();
    let (client, _client_events) = connect(addr).await;

    let request = tokio::spawn(async move {
        client.send_and_wait(Duration::from_secs(2), &b"ping"[..], Metadata::new()).await
    });

    let event = timeout(Duration::from_secs(1), server_events.recv()).await.unwrap().unwrap();
    let (peer, conversation_id) = match event {
        ServerEvent::SyncRequestReceived { peer, conversation_id, payload, .. } => {
            assert_eq!(&payload[..], b"ping");
            (peer, conversation_id)
        },
        other => panic!("expected SyncRequestReceived, got {other:?}"),
    };

    server
        .send_sync_response(&peer, conversation_id, &b"pong"[..], Metadata::new())
        .await
        .expect("reply should send");

    let response = timeout(Duration::from_secs(1), request).await.unwrap().unwrap().unwrap();
    assert_eq!(&response.payload[..], b"pong");
}

#[tokio::test]
async fn synchronous_request_expires_when_unanswered() {
    let (server, mut server_events) = start_server(ServerConfig::default()).await;
    let addr = server.local_addr().unwrap();
    let (client, _client_events) = connect(addr).await;

    let result = client.send_and_wait(Duration::from_secs(1), &b"ping"[..], Metadata::new()).await;
    assert!(result.is_err(), "an unanswered sync request should time out");

    let event = timeout(Duration::from_secs(1), server_events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ServerEvent::SyncRequestReceived { .. }));
}

#[tokio::test]
async fn malformed_frame_terminates_only_the_offending_session() {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    let (server, mut server_events) = start_server(ServerConfig::default()).await;
    let addr = server.local_addr().unwrap();

    let (good_client, mut good_events) = connect(addr).await;
    let _ = good_events.recv().await; // ServerConnected
    let _ = good_events.recv().await; // AuthenticationSucceeded
    let _ = server_events.recv().await; // ClientConnected for good_client

    let mut bad_stream = TcpStream::connect(addr).await.expect("raw connect should succeed");
    let _ = server_events.recv().await; // ClientConnected for bad_stream
    bad_stream.write_all(&[0xFF; 8]).await.expect("write garbage");

    let event = timeout(Duration::from_secs(2), server_events.recv()).await.unwrap().unwrap();
    assert!(
        matches!(
            event,
            ServerEvent::ExceptionEncountered { .. } | ServerEvent::ClientDisconnected { .. }
        ),
        "garbage should terminate only the sending session: {event:?}"
    );

    good_client.send(&b"still alive"[..], Metadata::new()).await.expect("good client is unaffected");
}

#[tokio::test]
async fn idle_client_is_disconnected_after_the_watchdog_fires() {
    let config =
        ServerConfig { idle_client_timeout: Duration::from_millis(200), ..ServerConfig::default() };
    let (server, mut server_events) = start_server(config).await;
    let addr = server.local_addr().unwrap();
    let (_client, mut client_events) = connect(addr).await;

    let _ = client_events.recv().await; // ServerConnected
    let _ = client_events.recv().await; // AuthenticationSucceeded
    let _ = server_events.recv().await; // ClientConnected

    let event = timeout(Duration::from_secs(2), server_events.recv()).await.unwrap().unwrap();
    match event {
        ServerEvent::ClientDisconnected { reason, .. } => {
            assert_eq!(reason, msgframe_core::DisconnectReason::Timeout);
        },
        other => panic!("expected ClientDisconnected{{Timeout}}, got {other:?}"),
    }

    let client_event = timeout(Duration::from_secs(2), client_events.recv()).await.unwrap().unwrap();
    match client_event {
        ClientEvent::ServerDisconnected { reason } => {
            assert_eq!(reason, msgframe_core::DisconnectReason::Timeout);
        },
        other => panic!("expected ServerDisconnected{{Timeout}}, got {other:?}"),
    }
}

#[tokio::test]
async fn a_payload_clearing_max_proxied_stream_size_is_reported_as_a_stream() {
    let mut config = ServerConfig::default();
    config.transport.max_proxied_stream_size = 1024;
    let (server, mut server_events) = start_server(config).await;
    let addr = server.local_addr().unwrap();
    let (client, mut client_events) = connect(addr).await;

    let _ = client_events.recv().await; // ServerConnected
    let _ = client_events.recv().await; // AuthenticationSucceeded
    let _ = server_events.recv().await; // ClientConnected

    let big = vec![9u8; 4096];
    client.send(big.clone(), Metadata::new()).await.expect("send should succeed");

    let event = timeout(Duration::from_secs(1), server_events.recv()).await.unwrap().unwrap();
    match event {
        ServerEvent::StreamReceived { length, .. } => assert_eq!(length, big.len() as u64),
        other => panic!("expected StreamReceived, got {other:?}"),
    }
}
