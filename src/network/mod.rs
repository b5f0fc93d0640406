//! Wire Level Networking
//!
//! Everything between a socket read and the application callbacks that does not depend
//! on how the OS reports readiness.
//!
//! # Components
//!
//! - `Node`: one transport endpoint, a cheap cloneable handle
//! - `frame`: the 8 byte length + tag header and the heart payload layout
//! - `StreamReassembler`: turns fragmented TCP reads back into frames
//! - `ControlProtocol`: Hello/Heart/Quit handling and data forwarding
//!
//! UDP datagrams skip reassembly; each datagram is decoded as exactly one frame.

pub use addr::{SockAddrBytes, SOCKADDR_LEN};
pub use control::{ControlProtocol, Disposition, Role};
pub use frame::{
    decode, encode, encode_into, ControlKind, Decoded, Frame, FrameHeader, HeartBeat,
    DATA_TAG, DEFAULT_MAX_CACHE_SIZE, HEADER_LEN,
};
pub use node::{Node, NodeId, Protocol};
pub use reassembler::StreamReassembler;

mod addr;
mod control;
mod frame;
mod node;
mod reassembler;
