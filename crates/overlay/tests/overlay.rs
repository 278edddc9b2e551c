//! End-to-end tests driving a running manager over real sockets.

use courier_overlay::{
    Connection, NetworkId, OutboundParcel, OutboundTarget, OverlayConfig, Parcel, ParcelType,
    PeerManager, DEFAULT_MAX_PARCEL_SIZE,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config() -> OverlayConfig {
    let mut config = OverlayConfig::test_network();
    config.bind_ip = "127.0.0.1".to_string();
    config.listen_port = 0;
    config.rng_seed = Some(1);
    config.dial_timeout = Duration::from_millis(500);
    config.redial_interval = Duration::from_secs(60);
    config
}

async fn connect_client(manager: &PeerManager) -> Connection {
    let addr = manager.local_addr().expect("manager not started");
    Connection::connect(&addr.to_string(), Duration::from_secs(5), DEFAULT_MAX_PARCEL_SIZE)
        .await
        .expect("client connect")
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Serves `body` as plain text to every HTTP request on a local port.
async fn serve_text(body: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let mut request = Vec::new();
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn seed_bootstrap_populates_the_store() {
    let seed_addr = serve_text("10.0.0.1:8108\n10.0.0.2:8108\n").await;

    let mut config = test_config();
    config.seed_url = format!("http://{}/seeds.txt", seed_addr);
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    let seeded = wait_for(
        || {
            ["10.0.0.1:8108", "10.0.0.2:8108"].iter().all(|hash| {
                manager
                    .get_peer(hash)
                    .map(|p| p.is_offline() && p.is_outgoing() && p.can_dial())
                    .unwrap_or(false)
            })
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(seeded, "seed peers missing: {:?}", manager.peer_infos());

    manager.stop().await;
}

#[tokio::test]
async fn seed_bootstrap_skips_comments_and_bad_lines() {
    let seed_addr = serve_text("# header\n\n10.0.0.3:8108\nnot a peer\n").await;

    let mut config = test_config();
    config.seed_url = format!("http://{}/seeds.txt", seed_addr);
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    assert!(
        wait_for(
            || manager.get_peer("10.0.0.3:8108").is_some(),
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(manager.peer_count(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn silent_peer_receives_pings() {
    let mut config = test_config();
    config.ping_interval = Duration::from_millis(100);
    config.peer_request_interval = Duration::from_secs(60);
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;

    // Count pings until the manager's idle timeout drops the silent peer.
    let mut pings = 0;
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, client.recv()).await {
            Ok(Ok(Some(parcel))) => {
                if parcel.header.parcel_type == ParcelType::Ping {
                    pings += 1;
                }
            }
            _ => break,
        }
    }
    assert!(pings >= 2, "expected at least two pings, got {}", pings);

    manager.stop().await;
}

#[tokio::test]
async fn peer_share_requests_are_rate_limited() {
    let mut config = test_config();
    config.ping_interval = Duration::from_secs(5);
    config.peer_request_interval = Duration::from_millis(200);
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager.get_peer("127.0.0.1:0").is_some(),
            Duration::from_secs(1)
        )
        .await
    );

    // Let the manager's initial burst (peer request, ping) age past the
    // share interval, then fire two requests back to back.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let request = Parcel::control(NetworkId::TEST, ParcelType::PeerRequest);
    client.send(request.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.send(request).await.unwrap();

    let mut responses = 0;
    let deadline = Instant::now() + Duration::from_millis(400);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, client.recv()).await {
            Ok(Ok(Some(parcel))) => {
                if parcel.header.parcel_type == ParcelType::PeerResponse {
                    responses += 1;
                }
            }
            _ => break,
        }
    }
    assert_eq!(responses, 1, "exactly one response for two rapid requests");
    assert!(
        manager.get_peer("127.0.0.1:0").is_some(),
        "rate violation must not ban"
    );

    manager.stop().await;
}

#[tokio::test]
async fn network_mismatch_bans_the_sender() {
    let (manager, _controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager
                .get_peer("127.0.0.1:0")
                .map(|p| p.is_online())
                .unwrap_or(false),
            Duration::from_secs(1)
        )
        .await
    );

    let foreign = Parcel::message(NetworkId(NetworkId::TEST.0 + 1), b"wrong net".to_vec());
    client.send(foreign).await.unwrap();

    assert!(
        wait_for(
            || manager.get_peer("127.0.0.1:0").is_none(),
            Duration::from_secs(1)
        )
        .await,
        "sender still in the store"
    );
    assert!(manager.is_banned("127.0.0.1:0"));

    // The connection is torn down too.
    let closed = tokio::time::timeout(Duration::from_secs(2), client.recv()).await;
    assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));

    manager.stop().await;
}

#[tokio::test]
async fn inbound_messages_reach_the_controller_in_order() {
    let (manager, mut controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;
    for i in 0..3u8 {
        client
            .send(Parcel::message(NetworkId::TEST, vec![i]))
            .await
            .unwrap();
    }

    for i in 0..3u8 {
        let pp = tokio::time::timeout(Duration::from_secs(2), controller.inbound.recv())
            .await
            .expect("inbound message timed out")
            .expect("inbound channel closed");
        assert_eq!(pp.parcel.payload, vec![i]);
        assert_eq!(pp.peer.hash(), "127.0.0.1:0");
    }

    manager.stop().await;
}

#[tokio::test]
async fn controller_broadcast_reaches_connected_peers() {
    let (manager, controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager
                .get_peer("127.0.0.1:0")
                .map(|p| p.is_online())
                .unwrap_or(false),
            Duration::from_secs(1)
        )
        .await
    );

    controller
        .outbound
        .send(OutboundParcel {
            target: OutboundTarget::Broadcast { full: true },
            parcel: Parcel::message(NetworkId::TEST, b"tip of the chain".to_vec()),
        })
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut found = false;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, client.recv()).await {
            Ok(Ok(Some(parcel))) => {
                if parcel.header.parcel_type == ParcelType::Message {
                    assert_eq!(parcel.payload, b"tip of the chain".to_vec());
                    found = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(found, "broadcast message never arrived");

    manager.stop().await;
}

#[tokio::test]
async fn broadcast_with_no_peers_is_a_noop() {
    let (manager, _controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();

    manager.broadcast(Parcel::message(NetworkId::TEST, b"void".to_vec()), true);
    manager.broadcast(Parcel::message(NetworkId::TEST, b"void".to_vec()), false);
    manager.to_peer("", Parcel::message(NetworkId::TEST, b"void".to_vec()));

    manager.stop().await;
}

#[tokio::test]
async fn refuse_incoming_rejects_inbound_connections() {
    let mut config = test_config();
    config.refuse_incoming = true;
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;
    let closed = tokio::time::timeout(Duration::from_secs(2), client.recv()).await;
    assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));
    assert_eq!(manager.peer_count(), 0);

    manager.stop().await;
}

#[tokio::test]
async fn inbound_cap_rejects_at_limit() {
    let mut config = test_config();
    config.incoming = 0;
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    let mut client = connect_client(&manager).await;
    let closed = tokio::time::timeout(Duration::from_secs(2), client.recv()).await;
    assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));
    assert_eq!(manager.peer_count(), 0);

    manager.stop().await;
}

#[tokio::test]
async fn refuse_unknown_admits_only_known_addresses() {
    let mut config = test_config();
    config.refuse_unknown = true;
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    // Unknown address: rejected.
    let mut stranger = connect_client(&manager).await;
    let closed = tokio::time::timeout(Duration::from_secs(2), stranger.recv()).await;
    assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));
    assert_eq!(manager.peer_count(), 0);

    // Make the address known, then the same host is admitted.
    manager.spawn_peer("127.0.0.1", true, 9999, false).unwrap();
    let _known = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager
                .get_peer("127.0.0.1:0")
                .map(|p| p.is_online())
                .unwrap_or(false),
            Duration::from_secs(1)
        )
        .await
    );

    manager.stop().await;
}

#[tokio::test]
async fn special_addresses_bypass_admission_policy() {
    let mut config = test_config();
    config.refuse_incoming = true;
    config.special_peers = vec!["127.0.0.1:1".to_string()];
    let (manager, _controller) = PeerManager::new(config);
    manager.start().await.unwrap();

    let _client = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager
                .get_peer("127.0.0.1:0")
                .map(|p| p.is_online() && p.is_special())
                .unwrap_or(false),
            Duration::from_secs(1)
        )
        .await,
        "special inbound peer was not admitted"
    );

    manager.stop().await;
}

#[tokio::test]
async fn second_connection_from_same_address_is_rejected() {
    let (manager, _controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();

    let _first = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager
                .get_peer("127.0.0.1:0")
                .map(|p| p.is_online())
                .unwrap_or(false),
            Duration::from_secs(1)
        )
        .await
    );

    let mut second = connect_client(&manager).await;
    let closed = tokio::time::timeout(Duration::from_secs(2), second.recv()).await;
    assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));
    assert_eq!(manager.peer_count(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn shutdown_completes_promptly_with_connected_peers() {
    let (manager, _controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();

    let _a = connect_client(&manager).await;
    assert!(
        wait_for(
            || manager
                .get_peer("127.0.0.1:0")
                .map(|p| p.is_online())
                .unwrap_or(false),
            Duration::from_secs(1)
        )
        .await
    );

    tokio::time::timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("stop did not complete in time");
    assert!(!manager.is_running());
    assert!(manager
        .peer_infos()
        .iter()
        .all(|info| info.state == courier_overlay::PeerState::Offline));

    // Stop is idempotent.
    tokio::time::timeout(Duration::from_secs(1), manager.stop())
        .await
        .expect("second stop did not complete");
}

#[tokio::test]
async fn invalid_seed_url_is_fatal_at_startup() {
    let mut config = test_config();
    config.seed_url = "not a url".to_string();
    let (manager, _controller) = PeerManager::new(config);
    assert!(manager.start().await.is_err());
    assert!(!manager.is_running());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (manager, _controller) = PeerManager::new(test_config());
    manager.start().await.unwrap();
    assert!(manager.start().await.is_err());
    manager.stop().await;
}
