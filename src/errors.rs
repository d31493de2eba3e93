use thiserror::Error;

/// errors during decode of client frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits set in frame header {0:#04x}")]
    ReservedBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("client frame is not masked")]
    UnmaskedFrame,
    #[error("declared payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(u64),
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("data frame while a fragmented message is in progress")]
    UnfinishedMessage,
}

/// errors surfaced by the gateway, from the request line to the redis link
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed HTTP at any step of request parsing. Pre-upgrade this maps
    /// to a 400 response; there is no post-upgrade occurrence.
    #[error("malformed http request")]
    BadRequest,
    /// Frame-level violation. The engine is already `Closed` when this is
    /// returned; the connection tears down without a close frame.
    #[error("websocket protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    /// Operation on an engine that has not been upgraded or is closed.
    /// Returned without side effects.
    #[error("engine is closed or awaiting upgrade")]
    InvalidState,
    /// The backing redis connection is down. Local pub/sub state is never
    /// mutated on this path; the caller may retry.
    #[error("redis backend unavailable")]
    Disconnected,
    #[error("request head larger than {0} bytes")]
    RequestTooLarge(usize),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
