//! banwarden: watches service logs for repeated authentication failures
//! and blocks offending addresses through a pluggable firewall backend.
//!
//! Each jail binds one log source and one pattern set to a ban policy.
//! Matched failures are counted per address in a sliding window; crossing
//! the threshold persists a ban in the [`store::BanStore`] and installs it
//! through the [`enforcement::Enforcer`]. The [`supervisor::Supervisor`]
//! expires bans, restores them after a restart and serves the control
//! socket.

pub mod backoff;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod filter;
pub mod ipc;
pub mod jail;
pub mod models;
pub mod store;
pub mod supervisor;
pub mod tailer;
pub mod window;

pub use config::Config;
pub use error::{Error, Result};
pub use jail::{Jail, JailHandle};
pub use store::BanStore;
pub use supervisor::Supervisor;
