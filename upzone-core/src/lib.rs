//! Upzone Core functionality.
//!
//! This crate contains the shared peer registry behind a reverse proxy's
//! upstreams: the shared memory segment and its slab allocator, the
//! append-only peer chain with its write protocol, and the directory that
//! maps zone names to segments. Every worker process mapping a zone's
//! segment sees the same peers.

pub mod domain;
pub mod error;
pub mod shm;
pub mod zone;

pub use domain::{
    Endpoint, PeerAddress, PeerRef, PeerRegistry, PeerSettings, PeerView, RegistrySummary,
};
pub use error::{DirectoryError, ErrorKind, OutOfMemory, RegistryError, SegmentError};
pub use shm::Segment;
pub use zone::{Zone, ZoneDirectory, ZoneHandle};
