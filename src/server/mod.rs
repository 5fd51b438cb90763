//! Control plane: listeners and the engine that runs them.

pub mod engine;
pub mod listener;

pub use engine::Forwarder;
pub use listener::{Listener, ListenerSettings, ListenerStats};
