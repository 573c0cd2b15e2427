//! Packet and stream endpoints on top of the socket scheduler.

pub mod packet;
pub mod stream;

pub use packet::{ManagedPacketSocket, PacketConfig, PacketSocket};
pub use stream::{
    ManagedStreamSocket, Session, SessionState, StreamConfig, StreamError, StreamListener,
    StreamSocketConfig,
};
