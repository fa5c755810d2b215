//! Gateway: WebSocket client for the Moltbot control plane.
//!
//! Protocol: the client's first request must be `connect` (optionally preceded by a
//! `connect.challenge` event from the server); after that, requests (req/res correlated by id)
//! and server-pushed events flow over the same socket.

mod backoff;
mod client;
mod error;
mod events;
mod pending;
pub mod protocol;

pub use backoff::{Backoff, ReconnectPolicy};
pub use client::{ClientOptions, ConnectionState, GatewayClient, DEFAULT_GATEWAY_URL};
pub use error::BridgeError;
pub use events::{handler_fn, EventDispatcher, EventHandler, HandlerId, WILDCARD};
pub use pending::{Outcome, PendingHandle, PendingTable};
pub use protocol::{
    ConnectParams, DecodeError, ErrorShape, Frame, HelloOk, WsEvent, WsRequest, WsResponse,
};
