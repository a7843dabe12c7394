//! Cross-process spin lock stored inside a shared segment.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use tracing::warn;

/// Busy-wait iterations between two `yield_now` calls.
const SPINS_PER_YIELD: u32 = 1024;

/// A lock word living in shared memory.
///
/// The word holds the process id of the holder, `0` while free. Every
/// process mapping the segment contends on the same word, so the lock
/// serialises writers across workers as well as across threads of one
/// worker. It is not reentrant: locking twice from the same thread spins
/// forever.
///
/// A worker that dies while holding the lock would wedge every other
/// worker. Waiters therefore check, once per yield, whether the recorded
/// holder is still alive and take the lock over when it is not.
#[repr(C)]
#[derive(Debug)]
pub struct ShmMutex {
    lock: AtomicU32,
    contended: AtomicU32,
}

impl ShmMutex {
    #[cfg(test)]
    pub(crate) const fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
            contended: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        let pid = holder_id();
        let mut spins: u32 = 0;

        loop {
            if self.lock.load(Ordering::Relaxed) == 0
                && self
                    .lock
                    .compare_exchange_weak(0, pid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ShmMutexGuard { mutex: self };
            }

            if spins == 0 {
                self.contended.fetch_add(1, Ordering::Relaxed);
            }
            spins = spins.wrapping_add(1);

            if spins % SPINS_PER_YIELD == 0 {
                if let Some(guard) = self.steal_from_dead(pid) {
                    return guard;
                }
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.lock
            .compare_exchange(0, holder_id(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { mutex: self })
    }

    fn steal_from_dead(&self, pid: u32) -> Option<ShmMutexGuard<'_>> {
        let holder = self.lock.load(Ordering::Relaxed);
        if holder == 0 || holder == pid || process_alive(holder) {
            return None;
        }

        self.lock
            .compare_exchange(holder, pid, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        warn!(dead = holder, "recovered shared lock from exited holder");
        Some(ShmMutexGuard { mutex: self })
    }

    /// Process id of the current holder, if any.
    pub fn holder(&self) -> Option<u32> {
        match self.lock.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Number of acquisitions that had to wait.
    pub fn contended(&self) -> u32 {
        self.contended.load(Ordering::Relaxed)
    }
}

fn holder_id() -> u32 {
    // pid 0 never names a user process, but keep the free marker unambiguous
    std::process::id().max(1)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new("/proc").join(pid.to_string()).exists()
}

// No cheap liveness probe without procfs; never steal.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Releases the [`ShmMutex`] when dropped.
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.lock.store(0, Ordering::Release);
    }
}
