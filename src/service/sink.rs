// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::network::Node;

/// Lifecycle notifications delivered to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// the engine's own socket is bound or connected; carries its descriptor
    Ready(String),
    /// a server accepted a TCP connection; carries the new node's descriptor
    Accept(String),
    /// handshake: the peer's address as the server sees it
    Hello(SocketAddr),
    Heart { sequence: u32, fail_count: u32 },
    /// emitted exactly once per node, and once more for the engine itself on stop
    Quit(String),
}

impl NetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NetEvent::Ready(_) => "ready",
            NetEvent::Accept(_) => "accept",
            NetEvent::Hello(_) => "hello",
            NetEvent::Heart { .. } => "heart",
            NetEvent::Quit(_) => "quit",
        }
    }
}

impl fmt::Display for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetEvent::Ready(desc) | NetEvent::Accept(desc) | NetEvent::Quit(desc) => {
                write!(f, "{} {}", self.kind(), desc)
            }
            NetEvent::Hello(addr) => write!(f, "hello {}", addr),
            NetEvent::Heart {
                sequence,
                fail_count,
            } => write!(f, "heart seq={} fail={}", sequence, fail_count),
        }
    }
}

/// Receives lifecycle events. Called from reactor and worker threads, so it must not
/// block for long.
pub trait EventSink: Send + Sync {
    fn on_event(&self, node: &Node, event: NetEvent);

    /// An engine delivering here is about to start.
    fn engine_starting(&self) {}

    /// An engine delivering here is being stopped and waits for its thread. A sink that
    /// can block must stop doing so until the next [`EventSink::engine_starting`].
    fn engine_stopping(&self) {}
}

/// Receives the payload of every complete application frame, in arrival order per node.
pub trait DataSink: Send + Sync {
    fn on_data(&self, node: &Node, data: Bytes);

    fn engine_starting(&self) {}

    /// See [`EventSink::engine_stopping`].
    fn engine_stopping(&self) {}
}

impl<F> EventSink for F
where
    F: Fn(&Node, NetEvent) + Send + Sync,
{
    fn on_event(&self, node: &Node, event: NetEvent) {
        self(node, event)
    }
}

impl<F> DataSink for F
where
    F: Fn(&Node, Bytes) + Send + Sync,
{
    fn on_data(&self, node: &Node, data: Bytes) {
        self(node, data)
    }
}

/// What a [`ChannelSink`] pushes onto its queue.
#[derive(Debug, Clone)]
pub enum NetMessage {
    Event(Node, NetEvent),
    Data(Node, Bytes),
}

/// Queue based delivery: events and data are pushed onto one bounded channel.
///
/// Pushing blocks the producing reactor thread while the queue is full, which applies
/// backpressure to the socket. Once an engine using the sink is being stopped, a full
/// queue drops the message instead so the engine can finish. Messages produced after
/// every receiver is gone are dropped with a warning.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: async_channel::Sender<NetMessage>,
    draining: Arc<AtomicBool>,
}

const FULL_RETRY: Duration = Duration::from_millis(1);

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (ChannelSink, async_channel::Receiver<NetMessage>) {
        let (tx, rx) = async_channel::bounded(capacity);
        let sink = ChannelSink {
            tx,
            draining: Arc::new(AtomicBool::new(false)),
        };
        (sink, rx)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn push(&self, mut message: NetMessage) {
        loop {
            match self.tx.try_send(message) {
                Ok(()) => return,
                Err(async_channel::TrySendError::Closed(message)) => {
                    warn!("dropping message, channel sink closed: {:?}", message);
                    return;
                }
                Err(async_channel::TrySendError::Full(rejected)) => {
                    if self.is_draining() {
                        warn!("dropping message, channel sink full during stop: {:?}", rejected);
                        return;
                    }
                    message = rejected;
                    std::thread::sleep(FULL_RETRY);
                }
            }
        }
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, node: &Node, event: NetEvent) {
        self.push(NetMessage::Event(node.clone(), event));
    }

    fn engine_starting(&self) {
        self.draining.store(false, Ordering::Release);
    }

    fn engine_stopping(&self) {
        self.draining.store(true, Ordering::Release);
    }
}

impl DataSink for ChannelSink {
    fn on_data(&self, node: &Node, data: Bytes) {
        self.push(NetMessage::Data(node.clone(), data));
    }

    fn engine_starting(&self) {
        self.draining.store(false, Ordering::Release);
    }

    fn engine_stopping(&self) {
        self.draining.store(true, Ordering::Release);
    }
}

/// The pair of sinks an engine delivers to.
#[derive(Clone)]
pub struct Sinks {
    pub events: Arc<dyn EventSink>,
    pub data: Arc<dyn DataSink>,
}

impl Sinks {
    pub fn new(events: impl EventSink + 'static, data: impl DataSink + 'static) -> Sinks {
        Sinks {
            events: Arc::new(events),
            data: Arc::new(data),
        }
    }

    /// Both sinks backed by one [`ChannelSink`].
    pub fn channel(capacity: usize) -> (Sinks, async_channel::Receiver<NetMessage>) {
        let (sink, rx) = ChannelSink::bounded(capacity);
        let sink = Arc::new(sink);
        (
            Sinks {
                events: sink.clone(),
                data: sink,
            },
            rx,
        )
    }

    pub fn event(&self, node: &Node, event: NetEvent) {
        self.events.on_event(node, event);
    }

    pub fn data(&self, node: &Node, data: Bytes) {
        self.data.on_data(node, data);
    }

    pub(crate) fn engine_starting(&self) {
        self.events.engine_starting();
        self.data.engine_starting();
    }

    pub(crate) fn engine_stopping(&self) {
        self.events.engine_stopping();
        self.data.engine_stopping();
    }
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::network::Protocol;

    #[tokio::test]
    async fn test_closure_and_channel_sinks() -> crate::AppResult<()> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let node = Node::udp(1, 5, Protocol::Udp, socket.local_addr()?, socket);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sinks = Sinks::new(
            move |_: &Node, event: NetEvent| seen_clone.lock().push(event.kind()),
            |_: &Node, _: Bytes| {},
        );
        sinks.event(&node, NetEvent::Ready(node.to_string()));
        sinks.event(&node, NetEvent::Quit(node.to_string()));
        assert_eq!(*seen.lock(), vec!["ready", "quit"]);

        let (sinks, rx) = Sinks::channel(4);
        sinks.data(&node, Bytes::from_static(b"payload"));
        sinks.event(
            &node,
            NetEvent::Heart {
                sequence: 3,
                fail_count: 0,
            },
        );
        match rx.recv().await.unwrap() {
            NetMessage::Data(from, data) => {
                assert_eq!(from, node);
                assert_eq!(&data[..], b"payload");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            NetMessage::Event(_, NetEvent::Heart { sequence: 3, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_full_channel_sink_drops_while_engine_stops() -> crate::AppResult<()> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let node = Node::udp(1, 5, Protocol::Udp, socket.local_addr()?, socket);

        let (sink, rx) = ChannelSink::bounded(1);
        let sink = Arc::new(sink);
        let sinks = Sinks {
            events: sink.clone(),
            data: sink.clone(),
        };
        sinks.event(&node, NetEvent::Ready(node.to_string()));
        assert_eq!(rx.len(), 1);

        // the queue is full and nobody reads; this would block without the stop notice
        sinks.engine_stopping();
        assert!(sink.is_draining());
        sinks.event(&node, NetEvent::Quit(node.to_string()));
        sinks.data(&node, Bytes::from_static(b"late"));
        assert_eq!(rx.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            NetMessage::Event(_, NetEvent::Ready(_))
        ));

        sinks.engine_starting();
        assert!(!sink.is_draining());
        sinks.data(&node, Bytes::from_static(b"fresh"));
        assert!(matches!(rx.recv().await.unwrap(), NetMessage::Data(_, data) if &data[..] == b"fresh"));
        Ok(())
    }
}
