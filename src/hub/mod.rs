//! Notification hub client protocol.
//!
//! A hub connection is set up in three steps:
//! 1. Negotiate - ask the server which transports it offers
//! 2. Transport start - open the first usable transport (see [`crate::transport`])
//! 3. Handshake - agree on the JSON protocol over the open transport
//!
//! After the handshake the server pushes `Invocation` records. The client
//! listens for the notification target and writes only keepalive pings and
//! the invocations a caller asks for.

pub mod negotiate;
pub mod protocol;

pub use negotiate::{negotiate, negotiate_url, AvailableTransport, NegotiateResponse, Negotiated};
pub use protocol::{
    encode_handshake, encode_invocation, encode_ping, parse_handshake_response, HubMessage,
    MessageType, RecordBuffer, MAX_RECORD_SIZE, RECORD_SEPARATOR,
};
