mod common;

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{eventually, is_quit, setup, wait_data, wait_event, WAIT};
use framenet::{
    decode, encode, AppError, ControlKind, EngineState, NetClient, NetConfig, NetEvent,
    NetServer, NetSystem, Node, ReactorKind, Sinks, DATA_TAG,
};
use rstest::rstest;

fn udp_server(
    system: &NetSystem,
    kind: ReactorKind,
) -> Result<(NetServer, async_channel::Receiver<framenet::NetMessage>, u16), AppError> {
    let mut config = NetConfig::udp("127.0.0.1", 0);
    config.reactor.kind = kind;
    let (sinks, rx) = Sinks::channel(1024);
    let server = NetServer::new(system.clone(), config, sinks);
    let port = server.start()?.port();
    Ok((server, rx, port))
}

#[rstest]
#[case::completion(ReactorKind::Completion)]
#[case::readiness(ReactorKind::Readiness)]
fn test_hello_and_data(_setup: (), #[case] kind: ReactorKind) -> Result<(), AppError> {
    let system = NetSystem::init();
    let (server, server_rx, port) = udp_server(&system, kind)?;

    let (sinks, client_rx) = Sinks::channel(64);
    let client = NetClient::new(system.clone(), NetConfig::udp("127.0.0.1", port), sinks);
    client.start()?;

    // the client says hello on start; the server answers with what it saw
    let (peer, NetEvent::Hello(seen)) =
        wait_event(&server_rx, |e| matches!(e, NetEvent::Hello(_))).expect("server hello")
    else {
        unreachable!()
    };
    let (_, NetEvent::Hello(reported)) =
        wait_event(&client_rx, |e| matches!(e, NetEvent::Hello(_))).expect("client hello")
    else {
        unreachable!()
    };
    assert_eq!(seen, reported);
    assert_eq!(peer.peer_addr(), reported);
    assert_eq!(client.remote_port(), Some(reported.port()));
    assert_eq!(server.client_count(), 1);

    client.send(b"over udp")?;
    let (node, data) = wait_data(&server_rx).expect("data at server");
    assert_eq!(&data[..], b"over udp");
    assert_eq!(node.id(), peer.id());

    node.send(b"reply")?;
    let (_, data) = wait_data(&client_rx).expect("reply at client");
    assert_eq!(&data[..], b"reply");

    // a voluntary stop tells the server
    client.stop()?;
    let (gone, _) = wait_event(&server_rx, is_quit).expect("server sees quit");
    assert_eq!(gone.id(), peer.id());
    assert!(eventually(|| server.client_count() == 0));

    server.stop()?;
    Ok(())
}

#[rstest]
fn test_malformed_datagrams_are_dropped(_setup: ()) -> Result<(), AppError> {
    let system = NetSystem::init();
    let (server, server_rx, port) = udp_server(&system, ReactorKind::default())?;
    let raw = UdpSocket::bind("127.0.0.1:0")?;
    raw.connect(("127.0.0.1", port))?;

    // truncated frame, then a valid one followed by trailing garbage
    let frame = encode(b"kept", DATA_TAG);
    raw.send(&frame[..frame.len() - 1])?;
    let mut padded = frame.to_vec();
    padded.extend_from_slice(b"trailing");
    raw.send(&padded)?;

    let (_, data) = wait_data(&server_rx).expect("valid frame delivered");
    assert_eq!(&data[..], b"kept");

    // quit from this peer removes it
    raw.send(&encode(&[], ControlKind::Quit.tag()))?;
    assert!(wait_event(&server_rx, is_quit).is_some());
    assert!(eventually(|| server.client_count() == 0));
    server.stop()?;
    Ok(())
}

#[rstest]
fn test_server_echoes_heart_and_says_goodbye(_setup: ()) -> Result<(), AppError> {
    let system = NetSystem::init();
    let (server, server_rx, port) = udp_server(&system, ReactorKind::default())?;
    let raw = UdpSocket::bind("127.0.0.1:0")?;
    raw.set_read_timeout(Some(WAIT))?;
    raw.connect(("127.0.0.1", port))?;

    let beat = framenet::HeartBeat {
        sender: 12345,
        sequence: 9,
        fail_count: 0,
    };
    raw.send(&encode(&beat.encode(), ControlKind::Heart.tag()))?;
    let mut buf = [0u8; 128];
    let len = raw.recv(&mut buf)?;
    let decoded = decode(&buf[..len]);
    assert!(decoded.complete);
    assert_eq!(ControlKind::from_tag(decoded.tag), Some(ControlKind::Heart));
    let echo = framenet::HeartBeat::decode(decoded.payload)?;
    assert_eq!(echo.sender, 12345);
    assert_eq!(echo.sequence, 10);
    assert!(wait_event(&server_rx, |e| matches!(e, NetEvent::Heart { .. })).is_some());

    // peers still registered on stop get a best-effort quit
    server.stop()?;
    let len = raw.recv(&mut buf)?;
    assert_eq!(
        ControlKind::from_tag(decode(&buf[..len]).tag),
        Some(ControlKind::Quit)
    );
    Ok(())
}

#[rstest]
fn test_heartbeat_keeps_live_peer(_setup: ()) -> Result<(), AppError> {
    let system = NetSystem::init();
    let (server, _server_rx, port) = udp_server(&system, ReactorKind::default())?;

    let mut config = NetConfig::udp("127.0.0.1", port);
    config.heartbeat.slice_ms = 20;
    let (sinks, client_rx) = Sinks::channel(1024);
    let client = NetClient::new(system, config, sinks);
    client.enable_heart(Duration::from_millis(100), 1)?;
    client.start()?;

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(client.state(), EngineState::Running);
    let state = client.heartbeat_state().expect("heartbeat enabled");
    assert_eq!(state.failures(), 0);
    assert!(state.last_acked() > 0);
    assert!(wait_event(&client_rx, |e| matches!(e, NetEvent::Heart { .. })).is_some());

    client.stop()?;
    server.stop()?;
    Ok(())
}

#[rstest]
fn test_heartbeat_keeps_pinging_while_data_sink_blocks(_setup: ()) -> Result<(), AppError> {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};

    let server = UdpSocket::bind("127.0.0.1:0")?;
    server.set_read_timeout(Some(WAIT))?;

    let hearts = Arc::new(AtomicUsize::new(0));
    let blocked = Arc::new(AtomicBool::new(false));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let sinks = {
        let hearts = hearts.clone();
        let blocked = blocked.clone();
        Sinks::new(
            move |_: &Node, event: NetEvent| {
                if matches!(event, NetEvent::Heart { .. }) {
                    hearts.fetch_add(1, Ordering::SeqCst);
                }
            },
            move |_: &Node, _: Bytes| {
                blocked.store(true, Ordering::SeqCst);
                if let Ok(release) = release_rx.lock() {
                    let _ = release.recv_timeout(WAIT);
                }
            },
        )
    };

    let mut config = NetConfig::udp("127.0.0.1", server.local_addr()?.port());
    config.heartbeat.slice_ms = 20;
    let client = NetClient::new(NetSystem::init(), config, sinks);
    // nobody acknowledges, so allow plenty of misses
    client.enable_heart(Duration::from_millis(100), 50)?;
    client.start()?;

    let mut buf = [0u8; 64];
    let (_, client_addr) = server.recv_from(&mut buf)?;
    server.send_to(&encode(b"hold the reader", DATA_TAG), client_addr)?;
    assert!(eventually(|| blocked.load(Ordering::SeqCst)));

    let before = hearts.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(500));
    let during = hearts.load(Ordering::SeqCst) - before;
    assert!(during >= 3, "only {} pings while the reader was blocked", during);

    let _ = release_tx.send(());
    client.stop()?;
    Ok(())
}

#[rstest]
fn test_heartbeat_gives_up_on_silent_peer(_setup: ()) -> Result<(), AppError> {
    // bound but never read
    let black_hole = UdpSocket::bind("127.0.0.1:0")?;
    let port = black_hole.local_addr()?.port();

    let mut config = NetConfig::udp("127.0.0.1", port);
    config.heartbeat.slice_ms = 20;
    let (sinks, client_rx) = Sinks::channel(1024);
    let client = NetClient::new(NetSystem::init(), config, sinks);
    let period = Duration::from_millis(100);
    client.enable_heart(period, 2)?;

    let started = Instant::now();
    client.start()?;
    assert!(wait_event(&client_rx, is_quit).is_some());
    let elapsed = started.elapsed();
    assert!(elapsed >= period * 3, "gave up after {:?}", elapsed);
    assert!(eventually(|| client.state() == EngineState::Stopped));
    assert!(client.node().is_none());
    Ok(())
}
