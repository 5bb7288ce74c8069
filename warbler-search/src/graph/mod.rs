//! Search network representations: the mutable build-time arena, the
//! persistent network with exits and roots, and the frozen decoder form.

pub mod compact;
pub mod network;
pub mod persistent;

pub use compact::{CompactNetwork, NetworkStats};
pub use network::{CleanupResult, Edge, StateNetwork};
pub use persistent::{Exit, NetworkCleanupResult, SearchNetwork};
