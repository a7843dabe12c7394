//! Error types for the shared segment and the peer registry.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to create, attach or validate a shared segment.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// The backing file could not be opened, sized, locked or mapped.
    #[error("segment {path}: {source}")]
    Io {
        /// Path of the backing file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The requested size is outside the supported range.
    #[error("segment size {size} is outside {min}..={max} bytes")]
    Size {
        /// Requested size.
        size: usize,
        /// Smallest accepted size.
        min: usize,
        /// Largest accepted size.
        max: usize,
    },

    /// The segment name does not fit in the header.
    #[error("segment name {name:?} is longer than {max} bytes")]
    NameTooLong {
        /// Offending name.
        name: String,
        /// Maximum length in bytes.
        max: usize,
    },

    /// The file exists but is not an upzone segment.
    #[error("segment {path}: bad magic")]
    BadMagic {
        /// Path of the backing file.
        path: PathBuf,
    },

    /// The file was written by an incompatible layout version.
    #[error("segment {path}: layout version {found}, expected {expected}")]
    Version {
        /// Path of the backing file.
        path: PathBuf,
        /// Version found in the header.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// The file size does not match the configured size.
    #[error("segment {path}: size is {found} bytes, configured {expected}")]
    SizeMismatch {
        /// Path of the backing file.
        path: PathBuf,
        /// Size on disk.
        found: u64,
        /// Configured size.
        expected: u64,
    },

    /// The file belongs to another zone.
    #[error("segment {path}: belongs to zone {found:?}, expected {expected:?}")]
    NameMismatch {
        /// Path of the backing file.
        path: PathBuf,
        /// Name stored in the header.
        found: String,
        /// Name requested by the caller.
        expected: String,
    },
}

/// The slab could not satisfy an allocation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("out of memory: {requested} bytes requested")]
pub struct OutOfMemory {
    /// Number of bytes the caller asked for.
    pub requested: usize,
}

/// Coarse classification of a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Zone, peer or registry data missing.
    NotFound,
    /// Peer address already registered.
    Duplicate,
    /// Peer address could not be parsed or resolved.
    InvalidAddress,
    /// The zone's slab is exhausted.
    Allocation,
}

/// Errors returned by zone resolution and registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No zone with a shared segment of that name exists.
    #[error("zone not found")]
    ZoneNotFound,

    /// The zone's segment carries no registry.
    #[error("no peer data")]
    NoPeerData,

    /// No peer with that name exists in the zone.
    #[error("server not found")]
    PeerNotFound,

    /// A peer with the same name is already registered.
    #[error("the peer is exist")]
    AlreadyExists,

    /// The address could not be turned into an endpoint.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// Address as given by the caller.
        address: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The zone's slab is exhausted.
    #[error("failed to allocate memory from slab")]
    OutOfMemory,
}

impl RegistryError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ZoneNotFound | Self::NoPeerData | Self::PeerNotFound => ErrorKind::NotFound,
            Self::AlreadyExists => ErrorKind::Duplicate,
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Self::OutOfMemory => ErrorKind::Allocation,
        }
    }

    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_owned(),
            reason: reason.into(),
        }
    }
}

impl From<OutOfMemory> for RegistryError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

/// The zone list handed to [`ZoneDirectory::new`](crate::zone::ZoneDirectory::new)
/// is inconsistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Two zones share an upstream name.
    #[error("duplicate upstream {0:?}")]
    DuplicateUpstream(String),

    /// Two zones share a segment name.
    #[error("duplicate zone {0:?}")]
    DuplicateZone(String),
}
