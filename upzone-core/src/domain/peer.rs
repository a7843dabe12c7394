//! Peer records living in a zone's shared segment.

use super::address::{Endpoint, SockAddrRecord};
use crate::shm::Segment;
use std::borrow::Cow;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

/// One backend server, as laid out in shared memory.
///
/// Plain fields are written once, before the record is linked, and never
/// change afterwards. Fields the routing logic or the operator mutate are
/// atomics so readers can walk the chain without the zone lock.
#[repr(C)]
pub(crate) struct PeerRecord {
    pub(crate) next: AtomicU32,
    pub(crate) name: u32,
    pub(crate) name_len: u32,
    pub(crate) server: u32,
    pub(crate) server_len: u32,
    pub(crate) socklen: u32,
    pub(crate) sockaddr: SockAddrRecord,
    pub(crate) weight: u32,
    pub(crate) max_fails: u32,
    pub(crate) fails: AtomicU32,
    pub(crate) fail_timeout: u64,
    pub(crate) current_weight: AtomicI64,
    pub(crate) effective_weight: AtomicI64,
    pub(crate) accessed: AtomicI64,
    pub(crate) checked: AtomicI64,
    pub(crate) down: AtomicBool,
}

/// Static settings of a peer being added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    /// Configured weight.
    pub weight: NonZeroU32,
    /// Failures tolerated within `fail_timeout` before the routing logic
    /// considers the peer unavailable.
    pub max_fails: u32,
    /// Failure accounting window, whole seconds.
    pub fail_timeout: Duration,
    /// Whether the peer starts administratively down.
    pub down: bool,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            weight: NonZeroU32::MIN,
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            down: false,
        }
    }
}

/// A live reference to a peer inside a segment.
#[derive(Clone, Copy)]
pub struct PeerRef<'a> {
    segment: &'a Segment,
    offset: u32,
}

impl<'a> PeerRef<'a> {
    pub(crate) fn new(segment: &'a Segment, offset: u32) -> Self {
        Self { segment, offset }
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn record(&self) -> &'a PeerRecord {
        // SAFETY: offsets handed to `new` point at linked, initialised records.
        unsafe { self.segment.get(self.offset) }
    }

    pub(crate) fn next(&self) -> u32 {
        self.record().next.load(Ordering::Acquire)
    }

    /// Raw name bytes.
    pub fn name_bytes(&self) -> &'a [u8] {
        let record = self.record();
        // SAFETY: the name was copied in before the record was linked.
        unsafe { self.segment.bytes(record.name, record.name_len) }
    }

    /// Display name, typically `host:port` or `unix:/path`.
    pub fn name(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.name_bytes())
    }

    /// Server address. Same bytes as the name for dynamically added peers.
    pub fn server(&self) -> Cow<'a, str> {
        let record = self.record();
        // SAFETY: as for the name.
        String::from_utf8_lossy(unsafe { self.segment.bytes(record.server, record.server_len) })
    }

    /// The resolved endpoint.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.record().sockaddr.decode(&self.name())
    }

    /// Length of the C socket address.
    pub fn socklen(&self) -> u32 {
        self.record().socklen
    }

    /// Configured weight.
    pub fn weight(&self) -> u32 {
        self.record().weight
    }

    /// Configured failure threshold.
    pub fn max_fails(&self) -> u32 {
        self.record().max_fails
    }

    /// Configured failure window.
    pub fn fail_timeout(&self) -> Duration {
        Duration::from_secs(self.record().fail_timeout)
    }

    /// Failures counted by the routing logic.
    pub fn fails(&self) -> u32 {
        self.record().fails.load(Ordering::Relaxed)
    }

    /// Record the failure count.
    pub fn set_fails(&self, fails: u32) {
        self.record().fails.store(fails, Ordering::Relaxed);
    }

    /// Selection scratch value.
    pub fn current_weight(&self) -> i64 {
        self.record().current_weight.load(Ordering::Relaxed)
    }

    /// Update the selection scratch value.
    pub fn set_current_weight(&self, weight: i64) {
        self.record().current_weight.store(weight, Ordering::Relaxed);
    }

    /// Weight as adjusted by failure history.
    pub fn effective_weight(&self) -> i64 {
        self.record().effective_weight.load(Ordering::Relaxed)
    }

    /// Update the adjusted weight.
    pub fn set_effective_weight(&self, weight: i64) {
        self.record().effective_weight.store(weight, Ordering::Relaxed);
    }

    /// Last time the peer was selected, unix seconds.
    pub fn accessed(&self) -> Option<i64> {
        nonzero(self.record().accessed.load(Ordering::Relaxed))
    }

    /// Record the last selection time. `0` clears it.
    pub fn set_accessed(&self, unix_secs: i64) {
        self.record().accessed.store(unix_secs, Ordering::Relaxed);
    }

    /// Last time the peer was checked, unix seconds.
    pub fn checked(&self) -> Option<i64> {
        nonzero(self.record().checked.load(Ordering::Relaxed))
    }

    /// Record the last check time. `0` clears it.
    pub fn set_checked(&self, unix_secs: i64) {
        self.record().checked.store(unix_secs, Ordering::Relaxed);
    }

    /// Whether the peer is administratively down.
    pub fn is_down(&self) -> bool {
        self.record().down.load(Ordering::Acquire)
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.record().down.store(down, Ordering::Release);
    }

    /// Copy the peer out of shared memory.
    pub fn view(&self) -> PeerView {
        PeerView {
            name: self.name().into_owned(),
            server: self.server().into_owned(),
            endpoint: self.endpoint(),
            weight: self.weight(),
            current_weight: self.current_weight(),
            effective_weight: self.effective_weight(),
            fails: self.fails(),
            max_fails: self.max_fails(),
            fail_timeout: self.record().fail_timeout,
            accessed: self.accessed(),
            checked: self.checked(),
            down: self.is_down(),
        }
    }
}

impl std::fmt::Debug for PeerRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRef")
            .field("zone", &self.segment.name())
            .field("offset", &self.offset)
            .field("name", &self.name())
            .finish()
    }
}

fn nonzero(value: i64) -> Option<i64> {
    (value != 0).then_some(value)
}

/// Point-in-time copy of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    /// Display name.
    pub name: String,
    /// Server address.
    pub server: String,
    /// Resolved endpoint, `None` if the record is unreadable.
    pub endpoint: Option<Endpoint>,
    /// Configured weight.
    pub weight: u32,
    /// Selection scratch value.
    pub current_weight: i64,
    /// Failure-adjusted weight.
    pub effective_weight: i64,
    /// Failure count.
    pub fails: u32,
    /// Failure threshold.
    pub max_fails: u32,
    /// Failure window in seconds.
    pub fail_timeout: u64,
    /// Last selection time, unix seconds.
    pub accessed: Option<i64>,
    /// Last check time, unix seconds.
    pub checked: Option<i64>,
    /// Administrative down flag.
    pub down: bool,
}
