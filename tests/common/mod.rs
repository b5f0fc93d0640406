#![allow(dead_code)]

use std::time::{Duration, Instant};

use framenet::{setup_local_tracing, NetEvent, NetMessage, Node};
use rstest::fixture;

pub const WAIT: Duration = Duration::from_secs(5);

#[fixture]
#[once]
pub fn setup() {
    // a second installation attempt from another test binary is harmless
    let _ = setup_local_tracing();
}

/// Pulls messages until one matches `pred` or `timeout` expires. Everything skipped is
/// returned alongside so tests can assert on what came before.
pub fn wait_for<F>(
    rx: &async_channel::Receiver<NetMessage>,
    timeout: Duration,
    mut pred: F,
) -> Option<NetMessage>
where
    F: FnMut(&NetMessage) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(message) if pred(&message) => return Some(message),
            Ok(_) => continue,
            Err(async_channel::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(async_channel::TryRecvError::Closed) => return None,
        }
    }
    None
}

pub fn wait_event<F>(
    rx: &async_channel::Receiver<NetMessage>,
    mut pred: F,
) -> Option<(Node, NetEvent)>
where
    F: FnMut(&NetEvent) -> bool,
{
    match wait_for(rx, WAIT, |message| {
        matches!(message, NetMessage::Event(_, event) if pred(event))
    }) {
        Some(NetMessage::Event(node, event)) => Some((node, event)),
        _ => None,
    }
}

pub fn wait_data(rx: &async_channel::Receiver<NetMessage>) -> Option<(Node, bytes::Bytes)> {
    match wait_for(rx, WAIT, |message| matches!(message, NetMessage::Data(..))) {
        Some(NetMessage::Data(node, data)) => Some((node, data)),
        _ => None,
    }
}

pub fn is_quit(event: &NetEvent) -> bool {
    matches!(event, NetEvent::Quit(_))
}

/// Polls `check` until it holds or `WAIT` expires.
pub fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
