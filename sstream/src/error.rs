use thiserror::Error;

/// All errors produced by the SST transport core.
#[derive(Debug, Error)]
pub enum SstError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("unknown stream packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("local endpoint {0} is already in use")]
    EndpointInUse(String),

    #[error("no free channel available at the local endpoint")]
    NoChannelAvailable,

    #[error("no datagram layer registered for this endpoint")]
    NoDatagramLayer,

    #[error("a connect is already pending on this local endpoint")]
    ConnectPending,

    #[error("handshake with the remote endpoint failed")]
    HandshakeFailed,

    #[error("stream creation failed")]
    StreamSetupFailed,

    #[error("stream is closed")]
    StreamClosed,

    #[error("connection is closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, SstError>;
