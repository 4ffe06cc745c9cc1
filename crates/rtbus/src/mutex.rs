// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The channel setup mutex.
//!
//! This is the only blocking lock in a channel region, and it is never held
//! on the data path: it serializes initialization, role attach/detach, and
//! the crash-recovery sweep. It uses the same robust-word shape as the role
//! trackers (TID + `FUTEX_OWNER_DIED` + `FUTEX_WAITERS`), so a zeroed region
//! starts out unlocked and a holder that dies is eventually detected and
//! stepped over by the next acquirer.
//!
//! Waiters sleep on the word with a bounded futex timeout and re-probe the
//! holder's liveness each time around, which is what turns "the initializer
//! crashed mid-init" from a deadlock into an owner-died acquisition.

use crate::futex::{futex_wait, futex_wake};
use crate::ownership::{current_tid, FUTEX_OWNER_DIED, FUTEX_TID_MASK, FUTEX_WAITERS};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// How long a waiter sleeps before re-checking whether the holder is alive.
const LIVENESS_RECHECK: Duration = Duration::from_millis(10);

/// True when a thread with this TID exists anywhere on the system. The setup
/// mutex cannot store the holder's pid race-free alongside the word, so it
/// probes by TID alone.
fn tid_exists(tid: u32) -> bool {
    // SAFETY: tkill with signal 0 only performs existence/permission checks.
    let rc = unsafe { libc::syscall(libc::SYS_tkill, tid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Robust inter-process mutex, one word in shared memory.
#[repr(transparent)]
pub struct SetupMutex {
    futex: AtomicU32,
}

impl SetupMutex {
    /// Acquire, blocking. Returns the guard plus whether a previous holder
    /// died while holding the lock; the caller must treat a dead previous
    /// holder as "anything may be half-done" and run recovery.
    pub fn lock(&self) -> (SetupMutexGuard<'_>, bool) {
        let tid = current_tid();
        loop {
            let cur = self.futex.load(Ordering::Acquire);
            let owner = cur & FUTEX_TID_MASK;

            if owner == 0 {
                let new = tid | (cur & FUTEX_WAITERS);
                if self
                    .futex
                    .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return (SetupMutexGuard { mutex: self }, cur & FUTEX_OWNER_DIED != 0);
                }
                continue;
            }

            debug_assert_ne!(owner, tid, "setup mutex is not recursive");

            if !tid_exists(owner) {
                // Holder is gone. Latch owner-died and clear the TID so the
                // acquisition loop above can take over. Losing the race just
                // means somebody else latched it.
                let _ = self.futex.compare_exchange(
                    cur,
                    FUTEX_OWNER_DIED | (cur & FUTEX_WAITERS),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            // Alive holder: advertise that we're waiting, then sleep with a
            // bound so the liveness probe reruns even if the wake is lost.
            let waiting = cur | FUTEX_WAITERS;
            if cur & FUTEX_WAITERS == 0
                && self
                    .futex
                    .compare_exchange(cur, waiting, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                continue;
            }
            futex_wait(&self.futex, waiting, Some(LIVENESS_RECHECK));
        }
    }

    fn unlock(&self) {
        let prev = self.futex.swap(0, Ordering::Release);
        debug_assert_eq!(prev & FUTEX_TID_MASK, current_tid());
        if prev & FUTEX_WAITERS != 0 {
            futex_wake(&self.futex, 1);
        }
    }

    /// Raw word, for dumps.
    #[must_use]
    pub fn raw(&self) -> u32 {
        self.futex.load(Ordering::Relaxed)
    }
}

/// RAII guard; unlocks on drop.
pub struct SetupMutexGuard<'a> {
    mutex: &'a SetupMutex,
}

impl Drop for SetupMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fresh_mutex() -> SetupMutex {
        SetupMutex {
            futex: AtomicU32::new(0),
        }
    }

    #[test]
    fn test_lock_unlock() {
        let m = fresh_mutex();
        {
            let (_guard, owner_died) = m.lock();
            assert!(!owner_died);
            assert_eq!(m.raw() & FUTEX_TID_MASK, current_tid());
        }
        assert_eq!(m.raw(), 0);
    }

    #[test]
    fn test_contended_handoff() {
        let m = Arc::new(fresh_mutex());
        let (guard, _) = m.lock();

        let m2 = Arc::clone(&m);
        let waiter = thread::spawn(move || {
            let (_guard, owner_died) = m2.lock();
            owner_died
        });

        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert!(!waiter.join().expect("waiter panicked"));
        assert_eq!(m.raw(), 0);
    }

    #[test]
    fn test_dead_holder_is_stepped_over() {
        let m = Arc::new(fresh_mutex());

        // A thread takes the lock and exits without releasing it.
        let m2 = Arc::clone(&m);
        thread::spawn(move || {
            let (guard, _) = m2.lock();
            std::mem::forget(guard);
        })
        .join()
        .expect("locker panicked");

        {
            let (_guard, owner_died) = m.lock();
            assert!(owner_died);
        }

        // Death is reported exactly once; the recovered lock is clean.
        let (_guard, owner_died) = m.lock();
        assert!(!owner_died);
    }

    #[test]
    fn test_mutual_exclusion() {
        let m = Arc::new(fresh_mutex());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let (_guard, _) = m.lock();
                    let v = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().expect("worker panicked");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 400);
    }
}
