//! portfwd - Layer-4 TCP port forwarder
//!
//! Listens on external ports and relays every accepted connection, byte for
//! byte, to a configured internal host:port.

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod shutdown;

pub use config::{ForwardingRule, Settings, ShutdownPolicy};
pub use error::ForwardError;
pub use server::Forwarder;
pub use shutdown::{ShutdownController, ShutdownSignal};
