//! Wire protocol between sync peers
//!
//! - `message`: the `SyncMessage` envelope and its typed payloads
//! - `protocol`: builders, validation, signing, sealing and the handshake
//! - `transport`: the duplex frame seam the engine talks through

pub mod message;
pub mod protocol;
pub mod transport;

pub use message::{
    AckPayload, ConflictNotice, ErrorPayload, HandshakePayload, MessageAuth, MessageType,
    OperationHeader, Payload, SyncMessage, SyncRequestPayload, SyncResponsePayload,
    VerificationResult, PROTOCOL_VERSION,
};
pub use protocol::{Direction, LoggedMessage, SyncProtocol};
pub use transport::{ChannelTransport, SyncTransport};
