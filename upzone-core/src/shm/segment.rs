//! File-backed shared memory segment.
//!
//! Every worker maps the same file, so a segment is the only state the
//! workers share. All references inside it are `u32` offsets from the
//! mapping base, never pointers, because each process maps the file at a
//! different address.
//!
//! # Layout
//!
//! ```text
//! 0     SegmentHeader   magic, version, size, name, registry root
//! 128   SlabHeader      slab mutex, cursor, free list, counters
//! 192   data region     slab blocks: [size: u32][next_free: u32][payload]
//! ```

use super::slab::{self, Slab, SlabHeader, SLAB_HEADER_SIZE};
use crate::error::SegmentError;
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// Magic bytes marking a fully initialised segment.
pub const MAGIC: [u8; 8] = *b"UPZONE01";

/// Layout version written into new segments.
pub const LAYOUT_VERSION: u32 = 1;

/// Size of the fixed segment header.
pub const HEADER_SIZE: usize = 128;

/// Longest segment name the header can hold.
pub const MAX_NAME_LEN: usize = 64;

/// Smallest accepted segment.
pub const MIN_SEGMENT_SIZE: usize = 4096;

/// Largest accepted segment. Offsets are `u32`.
pub const MAX_SEGMENT_SIZE: usize = 1 << 30;

/// Size used when the configuration does not name one.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// Offset of the first slab block header.
pub(crate) const DATA_START: usize = HEADER_SIZE + SLAB_HEADER_SIZE;

#[repr(C)]
pub(crate) struct SegmentHeader {
    magic: [u8; 8],           // 0..8, zero until init completed
    version: u32,             // 8..12
    size: u32,                // 12..16
    name_len: u32,            // 16..20
    root: AtomicU32,          // 20..24, registry root offset, 0 = none
    name: [u8; MAX_NAME_LEN], // 24..88
    _pad: [u8; 40],
}

const _: () = assert!(mem::size_of::<SegmentHeader>() == HEADER_SIZE);

/// A mapped shared segment holding one zone's slab and registry.
pub struct Segment {
    name: String,
    path: Option<PathBuf>,
    file: Option<File>,
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping outlives `base`; everything reachable through it is
// either immutable after initialisation, atomic, or written under the slab
// mutex.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl Segment {
    /// Create or attach the segment backed by `path`.
    ///
    /// An advisory lock on the file is held for the whole call, so exactly
    /// one process formats a new segment and runs `init` on it. Processes
    /// arriving later validate the header and attach. When `init` fails
    /// the segment is left unsealed and the next `open` formats it again.
    pub fn open<F, E>(path: impl AsRef<Path>, name: &str, size: usize, init: F) -> Result<Self, E>
    where
        F: FnOnce(&Segment) -> Result<(), E>,
        E: From<SegmentError>,
    {
        check_params(name, size)?;
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;

        file.lock_exclusive()
            .map_err(|source| io_error(&path, source))?;

        let segment = Self::map_file(file, &path, name, size)?;
        let outcome = segment.finish_open(init);

        if let Some(file) = &segment.file {
            FileExt::unlock(file).map_err(|source| io_error(&path, source))?;
        }

        outcome.map(|()| segment)
    }

    /// Create a segment backed by anonymous memory.
    ///
    /// Only this process sees it. Used for zones that never need to be
    /// attached by another worker, and in tests.
    pub fn anonymous<F, E>(name: &str, size: usize, init: F) -> Result<Self, E>
    where
        F: FnOnce(&Segment) -> Result<(), E>,
        E: From<SegmentError>,
    {
        check_params(name, size)?;

        let mut map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| io_error(Path::new("<anonymous>"), source))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io_error(Path::new("<anonymous>"), std::io::ErrorKind::Other.into()))?;

        let segment = Self {
            name: name.to_owned(),
            path: None,
            file: None,
            _map: map,
            base,
            len: size,
        };

        segment.format();
        init(&segment)?;
        segment.seal();
        Ok(segment)
    }

    fn map_file(file: File, path: &Path, name: &str, size: usize) -> Result<Self, SegmentError> {
        let on_disk = file
            .metadata()
            .map_err(|source| io_error(path, source))?
            .len();

        if on_disk == 0 {
            file.set_len(size as u64)
                .map_err(|source| io_error(path, source))?;
        } else if on_disk != size as u64 {
            return Err(SegmentError::SizeMismatch {
                path: path.to_path_buf(),
                found: on_disk,
                expected: size as u64,
            });
        }

        // SAFETY: the file is only ever resized by this function under the
        // advisory lock, and never shrunk while mapped.
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|source| io_error(path, source))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io_error(path, std::io::ErrorKind::Other.into()))?;

        Ok(Self {
            name: name.to_owned(),
            path: Some(path.to_path_buf()),
            file: Some(file),
            _map: map,
            base,
            len: size,
        })
    }

    fn finish_open<F, E>(&self, init: F) -> Result<(), E>
    where
        F: FnOnce(&Segment) -> Result<(), E>,
        E: From<SegmentError>,
    {
        // SAFETY: the header lies inside the mapping; we hold the file lock.
        let magic = unsafe { ptr::read(self.base.as_ptr() as *const [u8; 8]) };

        if magic == [0; 8] {
            self.format();
            init(self)?;
            self.seal();
            info!(zone = %self.name, path = ?self.path, size = self.len, "shared segment created");
            return Ok(());
        }

        self.validate(magic)?;
        info!(
            zone = %self.name,
            path = ?self.path,
            registry = self.root() != 0,
            "shared segment attached"
        );
        Ok(())
    }

    fn validate(&self, magic: [u8; 8]) -> Result<(), SegmentError> {
        let path = self.path.clone().unwrap_or_default();
        if magic != MAGIC {
            return Err(SegmentError::BadMagic { path });
        }

        let header = self.header();
        if header.version != LAYOUT_VERSION {
            return Err(SegmentError::Version {
                path,
                found: header.version,
                expected: LAYOUT_VERSION,
            });
        }

        if header.size as usize != self.len {
            return Err(SegmentError::SizeMismatch {
                path,
                found: header.size as u64,
                expected: self.len as u64,
            });
        }

        let len = (header.name_len as usize).min(MAX_NAME_LEN);
        let stored = &header.name[..len];
        if stored != self.name.as_bytes() {
            return Err(SegmentError::NameMismatch {
                path,
                found: String::from_utf8_lossy(stored).into_owned(),
                expected: self.name.clone(),
            });
        }

        Ok(())
    }

    /// Write a fresh header and an empty slab. Leaves the magic zeroed.
    fn format(&self) {
        let mut name = [0u8; MAX_NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());

        let header = SegmentHeader {
            magic: [0; 8],
            version: LAYOUT_VERSION,
            size: self.len as u32,
            name_len: self.name.len() as u32,
            root: AtomicU32::new(0),
            name,
            _pad: [0; 40],
        };

        // SAFETY: both headers lie inside the mapping and nobody else can
        // reach the segment until it is sealed.
        unsafe {
            ptr::write(self.base.as_ptr() as *mut SegmentHeader, header);
            slab::format(
                self.base.as_ptr().add(HEADER_SIZE) as *mut SlabHeader,
                DATA_START as u32,
                self.len as u32,
            );
        }

        debug!(zone = %self.name, size = self.len, "segment formatted");
    }

    fn seal(&self) {
        std::sync::atomic::fence(Ordering::Release);
        // SAFETY: the magic lies inside the mapping.
        unsafe { ptr::write(self.base.as_ptr() as *mut [u8; 8], MAGIC) };
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: formatted or validated before any caller sees `self`.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    /// Name of the zone this segment backs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file, `None` for anonymous segments.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// The allocator managing this segment's data region.
    pub fn slab(&self) -> Slab<'_> {
        Slab::new(self)
    }

    pub(crate) fn slab_header(&self) -> &SlabHeader {
        // SAFETY: formatted before any caller sees `self`.
        unsafe { self.get(HEADER_SIZE as u32) }
    }

    pub(crate) fn root(&self) -> u32 {
        self.header().root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, offset: u32) {
        self.header().root.store(offset, Ordering::Release);
    }

    /// Raw pointer to `offset` bytes past the base.
    pub(crate) fn ptr(&self, offset: u32) -> *mut u8 {
        assert!((offset as usize) < self.len, "offset {offset} outside segment");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    /// # Safety
    ///
    /// `offset` must hold an initialised `T`, suitably aligned, that is
    /// only mutated through atomics while the reference is alive.
    pub(crate) unsafe fn get<T>(&self, offset: u32) -> &T {
        assert!(offset as usize + mem::size_of::<T>() <= self.len);
        debug_assert_eq!(offset as usize % mem::align_of::<T>(), 0);
        &*(self.ptr(offset) as *const T)
    }

    /// # Safety
    ///
    /// The range must have been fully written before it was published.
    pub(crate) unsafe fn bytes(&self, offset: u32, len: u32) -> &[u8] {
        if len == 0 {
            return &[];
        }
        assert!(offset as usize + len as usize <= self.len);
        std::slice::from_raw_parts(self.ptr(offset), len as usize)
    }
}

fn check_params(name: &str, size: usize) -> Result<(), SegmentError> {
    if name.len() > MAX_NAME_LEN {
        return Err(SegmentError::NameTooLong {
            name: name.to_owned(),
            max: MAX_NAME_LEN,
        });
    }

    if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&size) {
        return Err(SegmentError::Size {
            size,
            min: MIN_SEGMENT_SIZE,
            max: MAX_SEGMENT_SIZE,
        });
    }

    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> SegmentError {
    SegmentError::Io {
        path: path.to_path_buf(),
        source,
    }
}
