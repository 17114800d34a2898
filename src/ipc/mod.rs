//! Control surface for the running daemon
//!
//! Uses a Unix socket with length-prefixed JSON frames between:
//! - the daemon (server, answers requests)
//! - the CLI (client, one request at a time)

pub mod client;
pub mod messages;
pub mod server;

pub use client::{connect_with_retry, IpcClient};
pub use messages::*;
pub use server::{IpcRequest, IpcServer};
