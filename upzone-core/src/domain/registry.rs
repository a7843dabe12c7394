//! The per-zone peer registry and its write protocol.
//!
//! Peers form a singly linked, append-only chain inside the zone's
//! segment. Writers serialise on the slab mutex, which doubles as the
//! zone's write lock. Readers never lock: a record is fully written
//! before the release store that links it, and linked records are never
//! unlinked, so a reader sees a consistent prefix of the chain.

use super::address::{PeerAddress, SockAddrRecord};
use super::peer::{PeerRecord, PeerRef, PeerSettings, PeerView};
use crate::error::RegistryError;
use crate::shm::{Segment, SlabGuard};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{info, warn};

#[repr(C)]
pub(crate) struct PeersHeader {
    head: AtomicU32,
    number: AtomicU32,
    total_weight: AtomicU64,
    single: AtomicBool,
    weighted: AtomicBool,
}

/// Aggregate counters of a registry, read together under the zone lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySummary {
    /// Number of peers.
    pub number: usize,
    /// Sum of all configured weights.
    pub total_weight: u64,
    /// Exactly one peer.
    pub single: bool,
    /// At least one weight differs from 1.
    pub weighted: bool,
}

/// The peers of one zone.
#[derive(Clone, Copy)]
pub struct PeerRegistry<'a> {
    segment: &'a Segment,
    root: u32,
}

impl<'a> PeerRegistry<'a> {
    /// Install an empty registry in `segment`, or return the one already there.
    pub fn install(segment: &'a Segment) -> Result<Self, RegistryError> {
        let mut slab = segment.slab().lock();

        let root = segment.root();
        if root != 0 {
            return Ok(Self { segment, root });
        }

        let block = slab.alloc_zeroed(mem::size_of::<PeersHeader>())?;
        segment.set_root(block.offset());

        info!(zone = %segment.name(), "peer registry installed");
        Ok(Self {
            segment,
            root: block.offset(),
        })
    }

    /// The registry of `segment`, if one was installed.
    pub fn attach(segment: &'a Segment) -> Result<Self, RegistryError> {
        match segment.root() {
            0 => Err(RegistryError::NoPeerData),
            root => Ok(Self { segment, root }),
        }
    }

    fn header(&self) -> &'a PeersHeader {
        // SAFETY: `root` was allocated zeroed for a PeersHeader.
        unsafe { self.segment.get(self.root) }
    }

    /// The segment holding this registry.
    pub fn segment(&self) -> &'a Segment {
        self.segment
    }

    /// Walk the chain without locking.
    pub fn peers(&self) -> Peers<'a> {
        Peers {
            segment: self.segment,
            next: self.header().head.load(Ordering::Acquire),
        }
    }

    /// Copy every peer out, in insertion order.
    pub fn list(&self) -> Vec<PeerView> {
        self.peers().map(|peer| peer.view()).collect()
    }

    /// First peer whose name equals `name`.
    pub fn find(&self, name: &str) -> Option<PeerRef<'a>> {
        self.peers().find(|peer| peer.name_bytes() == name.as_bytes())
    }

    /// Number of peers. May lag a concurrent [`PeerRegistry::add`].
    pub fn len(&self) -> usize {
        self.header().number.load(Ordering::Acquire) as usize
    }

    /// Whether the registry holds no peer.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate counters, consistent with each other.
    pub fn summary(&self) -> RegistrySummary {
        let _slab = self.segment.slab().lock();
        let header = self.header();
        RegistrySummary {
            number: header.number.load(Ordering::Relaxed) as usize,
            total_weight: header.total_weight.load(Ordering::Relaxed),
            single: header.single.load(Ordering::Relaxed),
            weighted: header.weighted.load(Ordering::Relaxed),
        }
    }

    /// Append a peer.
    ///
    /// Either the peer is linked and every counter updated, or an error is
    /// returned and the chain and counters are exactly as before.
    pub fn add(
        &self,
        address: &PeerAddress,
        settings: &PeerSettings,
    ) -> Result<PeerRef<'a>, RegistryError> {
        let mut slab = self.segment.slab().lock();
        let name = address.name().as_bytes();

        let string = slab.alloc(name.len())?;
        // SAFETY: the block is ours and at least `name.len()` long.
        unsafe {
            ptr::copy_nonoverlapping(name.as_ptr(), self.segment.ptr(string.offset()), name.len())
        };
        let sockaddr = SockAddrRecord::encode(address.endpoint());

        let mut tail = 0;
        for peer in self.peers() {
            if peer.name_bytes() == name {
                slab.free(string);
                warn!(zone = %self.segment.name(), peer = %address.name(), "peer already exists");
                return Err(RegistryError::AlreadyExists);
            }
            tail = peer.offset();
        }

        let block = match slab.alloc_zeroed(mem::size_of::<PeerRecord>()) {
            Ok(block) => block,
            Err(err) => {
                slab.free(string);
                return Err(err.into());
            }
        };

        let weight = settings.weight.get();
        let record = PeerRecord {
            next: AtomicU32::new(0),
            name: string.offset(),
            name_len: name.len() as u32,
            server: string.offset(),
            server_len: name.len() as u32,
            socklen: address.endpoint().socklen(),
            sockaddr,
            weight,
            max_fails: settings.max_fails,
            fails: AtomicU32::new(0),
            fail_timeout: settings.fail_timeout.as_secs(),
            current_weight: 0.into(),
            effective_weight: i64::from(weight).into(),
            accessed: 0.into(),
            checked: 0.into(),
            down: AtomicBool::new(settings.down),
        };
        // SAFETY: the block is ours, aligned and sized for a PeerRecord.
        unsafe { ptr::write(self.segment.ptr(block.offset()) as *mut PeerRecord, record) };

        self.link(&slab, tail, block.offset(), weight);
        drop(slab);

        info!(
            zone = %self.segment.name(),
            peer = %address.name(),
            endpoint = %address.endpoint(),
            weight,
            down = settings.down,
            "peer added"
        );
        Ok(PeerRef::new(self.segment, block.offset()))
    }

    fn link(&self, _held: &SlabGuard<'a>, tail: u32, offset: u32, weight: u32) {
        let header = self.header();

        if tail == 0 {
            header.head.store(offset, Ordering::Release);
        } else {
            PeerRef::new(self.segment, tail)
                .record()
                .next
                .store(offset, Ordering::Release);
        }

        let number = header.number.load(Ordering::Relaxed) + 1;
        let total = header.total_weight.load(Ordering::Relaxed) + u64::from(weight);
        header.number.store(number, Ordering::Release);
        header.total_weight.store(total, Ordering::Release);
        header.single.store(number == 1, Ordering::Release);
        header.weighted.store(total != u64::from(number), Ordering::Release);
    }

    /// Set the administrative down flag of the peer named `name`.
    ///
    /// Takes the zone lock so the write is ordered against concurrent adds.
    pub fn set_down(&self, name: &str, down: bool) -> Result<(), RegistryError> {
        let _slab = self.segment.slab().lock();

        let peer = self.find(name).ok_or(RegistryError::PeerNotFound)?;
        peer.set_down(down);

        info!(zone = %self.segment.name(), peer = name, down, "peer state set");
        Ok(())
    }
}

impl std::fmt::Debug for PeerRegistry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("zone", &self.segment.name())
            .field("peers", &self.len())
            .finish()
    }
}

/// Iterator over a registry's chain.
pub struct Peers<'a> {
    segment: &'a Segment,
    next: u32,
}

impl<'a> Iterator for Peers<'a> {
    type Item = PeerRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }
        let peer = PeerRef::new(self.segment, self.next);
        self.next = peer.next();
        Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::address::LiteralResolver;
    use crate::error::{ErrorKind, SegmentError};
    use proptest::prelude::*;
    use std::num::NonZeroU32;
    use std::thread;
    use std::time::Duration;

    fn segment(size: usize) -> Segment {
        let seg = Segment::anonymous("backend_pool", size, |_| Ok::<_, SegmentError>(())).unwrap();
        PeerRegistry::install(&seg).unwrap();
        seg
    }

    fn addr(address: &str) -> PeerAddress {
        PeerAddress::parse(address, &LiteralResolver).unwrap()
    }

    fn settings(weight: u32) -> PeerSettings {
        PeerSettings {
            weight: NonZeroU32::new(weight).unwrap(),
            max_fails: 3,
            fail_timeout: Duration::from_secs(10),
            down: false,
        }
    }

    #[test]
    fn added_peer_is_described_with_initial_state() {
        let seg = segment(8192);
        let registry = PeerRegistry::attach(&seg).unwrap();

        registry.add(&addr("10.0.0.1:8080"), &settings(5)).unwrap();

        let peers = registry.list();
        assert_eq!(peers.len(), 1);
        let peer = &peers[0];
        assert_eq!(peer.name, "10.0.0.1:8080");
        assert_eq!(peer.server, "10.0.0.1:8080");
        assert_eq!(peer.weight, 5);
        assert_eq!(peer.current_weight, 0);
        assert_eq!(peer.effective_weight, 5);
        assert_eq!(peer.fails, 0);
        assert_eq!(peer.max_fails, 3);
        assert_eq!(peer.fail_timeout, 10);
        assert_eq!(peer.accessed, None);
        assert_eq!(peer.checked, None);
        assert!(!peer.down);

        let summary = registry.summary();
        assert_eq!(
            summary,
            RegistrySummary {
                number: 1,
                total_weight: 5,
                single: true,
                weighted: true,
            }
        );
    }

    #[test]
    fn duplicate_add_changes_nothing() {
        let seg = segment(8192);
        let registry = PeerRegistry::attach(&seg).unwrap();
        registry.add(&addr("10.0.0.1:80"), &settings(2)).unwrap();

        let before = registry.summary();
        let used = seg.slab().stats().used;

        let err = registry.add(&addr("10.0.0.1:80"), &settings(7)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert_eq!(registry.summary(), before);
        assert_eq!(seg.slab().stats().used, used);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn exhausted_slab_leaves_registry_intact() {
        let seg = segment(4096);
        let registry = PeerRegistry::attach(&seg).unwrap();

        let mut added = 0;
        let err = loop {
            match registry.add(&addr(&format!("10.0.{}.{}:80", added / 250, added % 250)), &settings(1)) {
                Ok(_) => added += 1,
                Err(err) => break err,
            }
        };

        assert_eq!(err, RegistryError::OutOfMemory);
        assert!(added > 0);
        let summary = registry.summary();
        assert_eq!(summary.number, added);
        assert_eq!(summary.total_weight, added as u64);
        assert_eq!(registry.list().len(), added);
    }

    #[test]
    fn set_down_toggles_and_is_idempotent() {
        let seg = segment(8192);
        let registry = PeerRegistry::attach(&seg).unwrap();
        registry.add(&addr("10.0.0.1:8080"), &settings(1)).unwrap();

        registry.set_down("10.0.0.1:8080", true).unwrap();
        registry.set_down("10.0.0.1:8080", true).unwrap();
        assert!(registry.find("10.0.0.1:8080").unwrap().is_down());

        registry.set_down("10.0.0.1:8080", false).unwrap();
        assert!(!registry.list()[0].down);

        let err = registry.set_down("no.such.host:1", true).unwrap_err();
        assert_eq!(err, RegistryError::PeerNotFound);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn peers_can_start_down() {
        let seg = segment(8192);
        let registry = PeerRegistry::attach(&seg).unwrap();
        let peer = registry
            .add(
                &addr("unix:/run/app.sock"),
                &PeerSettings {
                    down: true,
                    ..PeerSettings::default()
                },
            )
            .unwrap();

        assert!(peer.is_down());
        assert_eq!(peer.weight(), 1);
        assert_eq!(peer.max_fails(), 1);
        assert_eq!(peer.fail_timeout(), Duration::from_secs(10));
        assert_eq!(peer.socklen(), 2 + 13 + 1);
    }

    #[test]
    fn routing_fields_are_visible_to_readers() {
        let seg = segment(8192);
        let registry = PeerRegistry::attach(&seg).unwrap();
        let peer = registry.add(&addr("10.0.0.9:80"), &settings(4)).unwrap();

        peer.set_fails(2);
        peer.set_effective_weight(3);
        peer.set_current_weight(-1);
        peer.set_accessed(1_700_000_000);
        peer.set_checked(1_700_000_005);

        let view = &registry.list()[0];
        assert_eq!(view.fails, 2);
        assert_eq!(view.effective_weight, 3);
        assert_eq!(view.current_weight, -1);
        assert_eq!(view.accessed, Some(1_700_000_000));
        assert_eq!(view.checked, Some(1_700_000_005));
    }

    #[test]
    fn segment_without_registry_has_no_peer_data() {
        let seg = Segment::anonymous("bare", 8192, |_| Ok::<_, SegmentError>(())).unwrap();
        assert_eq!(PeerRegistry::attach(&seg).unwrap_err(), RegistryError::NoPeerData);

        let installed = PeerRegistry::install(&seg).unwrap();
        let again = PeerRegistry::install(&seg).unwrap();
        assert_eq!(installed.root, again.root);
    }

    #[test]
    fn mappings_of_one_file_share_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend_pool.zone");
        let open = || {
            Segment::open(&path, "backend_pool", 64 * 1024, |seg| {
                PeerRegistry::install(seg)
                    .map(drop)
                    .map_err(Box::<dyn std::error::Error>::from)
            })
            .unwrap()
        };
        let worker_a = open();
        let worker_b = open();

        thread::scope(|s| {
            for (worker, base) in [(&worker_a, 0u32), (&worker_b, 100)] {
                s.spawn(move || {
                    let registry = PeerRegistry::attach(worker).unwrap();
                    for i in 0..50 {
                        let name = format!("10.1.0.{}:80", base + i);
                        registry.add(&addr(&name), &settings(2)).unwrap();
                    }
                });
            }
        });

        let from_a = PeerRegistry::attach(&worker_a).unwrap();
        let from_b = PeerRegistry::attach(&worker_b).unwrap();
        assert_eq!(from_a.list(), from_b.list());

        let summary = from_b.summary();
        assert_eq!(summary.number, 100);
        assert_eq!(summary.total_weight, 200);
        assert!(summary.weighted);

        from_a.set_down("10.1.0.7:80", true).unwrap();
        assert!(from_b.find("10.1.0.7:80").unwrap().is_down());
    }

    #[test]
    fn zones_are_isolated() {
        let first = segment(8192);
        let second = segment(8192);
        let a = PeerRegistry::attach(&first).unwrap();
        let b = PeerRegistry::attach(&second).unwrap();

        b.add(&addr("10.0.0.1:80"), &settings(1)).unwrap();
        a.add(&addr("10.0.0.1:80"), &settings(3)).unwrap();
        a.add(&addr("10.0.0.2:80"), &settings(3)).unwrap();

        assert_eq!(b.summary().number, 1);
        assert_eq!(b.summary().total_weight, 1);
        assert!(!b.summary().weighted);
        assert_eq!(a.summary().number, 2);
    }

    #[test]
    fn readers_see_a_prefix_while_a_writer_appends() {
        let seg = segment(512 * 1024);
        let registry = PeerRegistry::attach(&seg).unwrap();
        let expected: Vec<String> = (0..2000)
            .map(|i| format!("10.{}.{}.1:80", i / 250, i % 250))
            .collect();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for name in &expected {
                    registry.add(&addr(name), &settings(1)).unwrap();
                }
                done.store(true, Ordering::Release);
            });

            s.spawn(|| {
                let mut longest = 0;
                while !done.load(Ordering::Acquire) {
                    let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
                    assert!(names.len() >= longest, "chain shrank");
                    assert_eq!(names[..], expected[..names.len()]);
                    longest = names.len();
                }
            });
        });

        assert_eq!(registry.len(), expected.len());
    }

    proptest! {
        #[test]
        fn aggregates_track_every_add(ops in prop::collection::vec((0u8..16, 1u32..8), 1..40)) {
            let seg = segment(64 * 1024);
            let registry = PeerRegistry::attach(&seg).unwrap();
            let mut expected: Vec<(String, u32)> = Vec::new();

            for (host, weight) in ops {
                let name = format!("10.9.0.{host}:80");
                let before = registry.summary();
                let result = registry.add(&addr(&name), &settings(weight));

                if expected.iter().any(|(n, _)| *n == name) {
                    prop_assert_eq!(result.unwrap_err(), RegistryError::AlreadyExists);
                    prop_assert_eq!(registry.summary(), before);
                } else {
                    prop_assert!(result.is_ok());
                    expected.push((name, weight));
                }

                let summary = registry.summary();
                let total: u64 = expected.iter().map(|(_, w)| u64::from(*w)).sum();
                prop_assert_eq!(summary.number, expected.len());
                prop_assert_eq!(summary.total_weight, total);
                prop_assert_eq!(summary.single, expected.len() == 1);
                prop_assert_eq!(summary.weighted, total != expected.len() as u64);
            }

            let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
            let order: Vec<String> = expected.into_iter().map(|(n, _)| n).collect();
            prop_assert_eq!(names, order);
        }
    }
}
