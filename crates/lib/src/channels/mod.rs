//! Chat-platform side of the bridge.
//!
//! Inbound chat messages pass the allow-list gate and become `chat` turns on the gateway;
//! replies and gateway pushes go back out through a [`ChatOutbound`] supplied by the
//! platform adapter.

mod handler;
mod inbound;
mod outbound;
mod push;

pub use handler::{InboundHandler, Notices};
pub use inbound::InboundMessage;
pub use outbound::ChatOutbound;
pub use push::PushForwarder;
