// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robust ownership tracking for role slots.
//!
//! Every sender, pinner, and watcher slot carries a tracker word shaped like
//! a robust futex: the low bits hold the owning thread's TID, and
//! `FUTEX_OWNER_DIED` marks a slot whose owner is known to have exited
//! without releasing it. On kernels the real robust-futex machinery would set
//! that bit for us; here death is *harvested* explicitly instead: the
//! consistency sweep, which only ever runs while holding the channel's setup
//! mutex, probes each claimed owner with `tgkill(pid, tid, 0)` and latches
//! the dead bit on `ESRCH`. The hot paths never probe.
//!
//! TID reuse can in principle alias a dead owner with an unrelated live
//! thread. The window is the same one the kernel mechanism has across
//! reboots; recovery is idempotent, so a missed harvest is retried by the
//! next attacher.

use std::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};

/// Bit layout shared with the kernel's robust-futex convention.
pub const FUTEX_TID_MASK: u32 = 0x3fff_ffff;
pub const FUTEX_OWNER_DIED: u32 = 0x4000_0000;
pub const FUTEX_WAITERS: u32 = 0x8000_0000;

/// TID of the calling thread.
#[must_use]
pub fn current_tid() -> u32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    (unsafe { libc::gettid() }) as u32
}

/// True when thread `tid` in process `pid` still exists. Signal 0 performs
/// only the existence and permission checks; `EPERM` means the thread exists
/// but belongs to another user, which still counts as alive.
#[must_use]
pub fn thread_exists(pid: i32, tid: u32) -> bool {
    // SAFETY: tgkill with signal 0 delivers nothing; it only validates the
    // (tgid, tid) pair. Any argument values are acceptable to the kernel.
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Point-in-time copy of a tracker word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipSnapshot(u32);

impl OwnershipSnapshot {
    /// The snapshot of a slot nobody holds.
    #[must_use]
    pub fn unclaimed() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn tid(&self) -> u32 {
        self.0 & FUTEX_TID_MASK
    }

    #[must_use]
    pub fn is_unclaimed(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn owner_died(&self) -> bool {
        self.0 & FUTEX_OWNER_DIED != 0
    }
}

/// The per-slot tracker living in shared memory.
///
/// `pid` is only written while holding the setup mutex (slot claims are
/// serialized by it), so the word and the pid can be two plain atomics
/// rather than one packed word.
#[repr(C)]
pub struct RobustOwnershipTracker {
    futex: AtomicU32,
    pid: AtomicI32,
}

impl RobustOwnershipTracker {
    /// Take the slot for the calling thread. Caller holds the setup mutex.
    pub fn acquire(&self) {
        // SAFETY: getpid has no preconditions.
        self.pid.store(unsafe { libc::getpid() }, Ordering::Relaxed);
        self.futex.store(current_tid(), Ordering::Release);
    }

    /// Release the slot on clean shutdown.
    pub fn release(&self) {
        debug_assert!(self.is_held_by_current_thread());
        self.futex.store(0, Ordering::Release);
    }

    /// Reset a slot after recovery. Caller holds the setup mutex and has
    /// finished repairing whatever the dead owner left behind.
    pub fn force_clear(&self) {
        self.futex.store(0, Ordering::Relaxed);
    }

    pub fn load(&self) -> OwnershipSnapshot {
        OwnershipSnapshot(self.futex.load(Ordering::Acquire))
    }

    pub fn relaxed_load(&self) -> OwnershipSnapshot {
        OwnershipSnapshot(self.futex.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.load().tid() == current_tid()
    }

    /// The owning process recorded at claim time, for signal targeting.
    #[must_use]
    pub fn owner_pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    /// True when the slot's owner is definitely gone. Latches the dead bit
    /// (mirroring what the kernel does to a robust futex) so later passes
    /// don't have to probe again. Only call while holding the setup mutex.
    pub fn owner_is_definitely_dead(&self) -> bool {
        let raw = self.futex.load(Ordering::Acquire);
        if raw & FUTEX_OWNER_DIED != 0 {
            return true;
        }
        let tid = raw & FUTEX_TID_MASK;
        if tid == 0 {
            return false;
        }
        if thread_exists(self.pid.load(Ordering::Relaxed), tid) {
            return false;
        }
        // Claimed by a thread that no longer exists. Latch it; losing the
        // race just means someone else latched the same conclusion.
        let _ = self.futex.compare_exchange(
            raw,
            FUTEX_OWNER_DIED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // Everything the dead owner wrote must be visible before recovery
        // starts interpreting its slots.
        fence(Ordering::SeqCst);
        self.futex.load(Ordering::Acquire) & FUTEX_OWNER_DIED != 0
    }

    /// Force the dead bit if `tid` currently owns the slot. Lets tests
    /// exercise recovery without actually killing threads.
    pub fn pretend_owner_died_for_testing(&self, tid: u32) -> bool {
        let raw = self.futex.load(Ordering::Acquire);
        if raw & FUTEX_TID_MASK == tid {
            self.futex.store(FUTEX_OWNER_DIED, Ordering::Release);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_tracker() -> RobustOwnershipTracker {
        RobustOwnershipTracker {
            futex: AtomicU32::new(0),
            pid: AtomicI32::new(0),
        }
    }

    #[test]
    fn test_acquire_release() {
        let t = fresh_tracker();
        assert!(t.load().is_unclaimed());

        t.acquire();
        assert!(t.is_held_by_current_thread());
        assert!(!t.load().is_unclaimed());
        assert!(!t.owner_is_definitely_dead());

        t.release();
        assert!(t.load().is_unclaimed());
    }

    #[test]
    fn test_pretend_death_and_clear() {
        let t = fresh_tracker();
        t.acquire();

        assert!(!t.pretend_owner_died_for_testing(current_tid() + 1));
        assert!(t.pretend_owner_died_for_testing(current_tid()));
        assert!(t.load().owner_died());
        assert!(t.owner_is_definitely_dead());

        t.force_clear();
        assert!(t.load().is_unclaimed());
        assert!(!t.owner_is_definitely_dead());
    }

    #[test]
    fn test_dead_thread_is_harvested() {
        let t = fresh_tracker();
        let dead_tid = std::thread::spawn(current_tid)
            .join()
            .expect("thread panicked");

        // Claim "as" the exited thread.
        // SAFETY: getpid has no preconditions.
        t.pid.store(unsafe { libc::getpid() }, Ordering::Relaxed);
        t.futex.store(dead_tid, Ordering::Release);

        assert!(t.owner_is_definitely_dead());
        assert!(t.load().owner_died());
    }

    #[test]
    fn test_thread_exists_self() {
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        assert!(thread_exists(pid, current_tid()));
    }
}
