//! The live event channel: one authenticated connection per session, with
//! reconnects, heartbeat, and typed dispatch of inbound messages.

mod config;
mod error;
mod manager;
mod notices;
mod notifications;
mod router;

pub use config::*;
pub use error::*;
pub use manager::*;
pub(crate) use notices::*;
pub use notifications::*;
pub use router::*;
