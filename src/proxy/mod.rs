//! Data plane
//!
//! A [`ConnectionPair`] couples one accepted client socket with one dialed
//! backend socket and runs two [`Relay`]s over them, one per direction.

pub mod pair;
pub mod relay;

pub use pair::{CloseReason, ConnectionPair, PairReport};
pub use relay::{Direction, Relay, RelayEnd, RelayReport, BUFFER_SIZE};
