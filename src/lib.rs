mod network;
mod reactor;
mod service;

pub use network::{
    decode, encode, encode_into, ControlKind, ControlProtocol, Decoded, Disposition, Frame,
    FrameHeader, HeartBeat, Node, NodeId, Protocol, Role, SockAddrBytes, StreamReassembler,
    DATA_TAG, DEFAULT_MAX_CACHE_SIZE, HEADER_LEN, SOCKADDR_LEN,
};
pub use reactor::ReactorKind;
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ChannelSink, DataSink,
    EngineState, EventSink, HeartbeatConfig, HeartbeatExit, HeartbeatState, HeartbeatTick,
    MulticastConfig, MulticastSender, NetClient, NetConfig, NetEvent, NetMessage, NetServer,
    NetSystem, NetworkConfig, ReactorConfig, Registry, Shutdown, ShutdownSignal, Sinks,
    UserData,
};
