//! moltqq core library: gateway client, session routing, and the chat bridge
//! used by the CLI and by chat-platform adapters.

pub mod bridge;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod routing;
