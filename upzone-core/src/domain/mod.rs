//! Peers, their addresses and the per-zone registry.

pub mod address;
pub mod peer;
pub mod registry;

pub use address::{Endpoint, LiteralResolver, PeerAddress, Resolver, SystemResolver, DEFAULT_PORT};
pub use peer::{PeerRef, PeerSettings, PeerView};
pub use registry::{PeerRegistry, Peers, RegistrySummary};
