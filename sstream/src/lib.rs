//! Structured Stream Transport: a reliable, ordered, multi-stream transport
//! layered over an unreliable datagram substrate.
//!
//! Each connection multiplexes many byte streams (and best-effort
//! datagrams) over one channel of the datagram layer, identified by a pair
//! of endpoints — an opaque application id plus a 16-bit port. Streams may
//! be parents of other streams, so request/sub-request structure can be
//! expressed without opening new connections.
//!
//! - [`ConnectionManager`] is the per-process entry point: connect, listen,
//!   register datagram layers.
//! - [`Connection`] runs the channel handshake, congestion window, and
//!   stream demultiplexing.
//! - [`Stream`] provides the reliable ordered byte-stream semantics: flow
//!   control, reassembly, retransmission.
//! - [`datagram::DatagramLayer`] is the substrate interface; the in-process
//!   [`datagram::memory`] adapter backs tests and demos.
//!
//! All protocol state is mutated on a single serialized executor (the
//! [`strand::Strand`]); application threads only take short locks to
//! enqueue work.

pub mod connection;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod packet;
pub mod rtt;
pub mod segment;
pub mod strand;
pub mod stream;

// Re-export key public types at crate root.
pub use connection::{
    Connection, ConnectionReturnCallback, ConnectionState, DatagramSendDoneCallback,
    ReadDatagramCallback,
};
pub use endpoint::{Endpoint, EndpointId};
pub use error::{Result, SstError};
pub use manager::{ConnectionManager, TransportConfig};
pub use packet::{ChannelHeader, StreamHeader, StreamPacketType};
pub use segment::{ReceivedSegmentList, SegmentRange};
pub use stream::{
    Lsid, ReadCallback, Stream, StreamListenCallback, StreamReturnCallback, StreamState, Usid,
};
