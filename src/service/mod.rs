pub use app_error::{AppError, AppResult};
pub use client::NetClient;
pub use config::{HeartbeatConfig, MulticastConfig, NetConfig, NetworkConfig, ReactorConfig};
pub use heartbeat::{HeartbeatExit, HeartbeatState, HeartbeatTick};
pub use multicast::MulticastSender;
pub use registry::{Registry, UserData};
pub use server::NetServer;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use sink::{ChannelSink, DataSink, EventSink, NetEvent, NetMessage, Sinks};
pub use state::EngineState;
pub use system::NetSystem;
pub(crate) use system::enter_engine;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod heartbeat;
mod multicast;
mod registry;
mod server;
mod shutdown;
mod sink;
mod state;
mod system;
mod tracing_config;
