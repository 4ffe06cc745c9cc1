// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watchers and the wake-upper: signal-based publish notification.
//!
//! A watcher is a passive registration: `{tid, pid, priority}` in a region
//! slot, nothing more. The active half is the [`WakeUpper`], which a sender
//! (or the event loop around it) invokes after publishing: it snapshots the
//! watcher table, sorts by priority, and queues one realtime signal directly
//! to each registered *thread* (`rt_tgsigqueueinfo`, not process-directed
//! `kill`), highest priority first.
//!
//! If any watcher outranks the calling thread, the caller temporarily
//! boosts itself to the highest watcher priority before delivering, so a
//! high-priority watcher is never left waiting on a low-priority sender
//! that got preempted mid-delivery (priority inversion). The boost is
//! dropped immediately after.
//!
//! Delivery is best-effort: a watcher that dies between snapshot and signal
//! just eats a signal into the void, and a watcher that misses a wakeup is
//! expected to catch up from its last-read queue index.

use crate::channel::Channel;
use crate::layout::QueueMemory;
use crate::ownership::OwnershipSnapshot;
use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

/// The realtime signal watchers receive. `SIGRTMIN` itself is left for the
/// runtime; everything here uses the next one.
#[must_use]
pub fn wakeup_signal() -> i32 {
    libc::SIGRTMIN() + 1
}

/// A registered watcher. Dropping it unregisters the slot.
pub struct Watcher<'a> {
    mem: QueueMemory,
    watcher_index: usize,
    /// The registration names this thread's TID as the signal target; the
    /// raw pointer keeps the handle !Send.
    _channel: PhantomData<(&'a Channel, *const ())>,
}

impl<'a> Watcher<'a> {
    /// Register the calling thread for wakeups at `priority`. Returns `None`
    /// when every watcher slot is taken by a live owner.
    pub fn attach(channel: &'a Channel, priority: i32) -> Option<Self> {
        Self::attach_memory(channel.memory(), priority)
    }

    pub(crate) fn attach_memory(mem: QueueMemory, priority: i32) -> Option<Self> {
        // Everything in the region is self consistent; we only need to keep
        // other attachers out. A dead watcher's slot is recycled in place,
        // no sweep required.
        let (_guard, _owner_died) = mem.header().setup_lock.lock();

        let num_watchers = mem.config().num_watchers;
        let mut watcher_index = None;
        for i in 0..num_watchers {
            let ownership = &mem.watcher(i).ownership;
            // Reusing a slot the owner died in must happen-after whatever
            // that owner did; owner_is_definitely_dead latches that.
            if ownership.load().is_unclaimed() || ownership.owner_is_definitely_dead() {
                watcher_index = Some(i);
                ownership.force_clear();
                break;
            }
        }
        let Some(watcher_index) = watcher_index else {
            log::debug!("[watcher] all watcher slots claimed, bailing");
            return None;
        };

        let watcher = mem.watcher(watcher_index);
        // SAFETY: getpid has no preconditions.
        watcher
            .pid
            .store(unsafe { libc::getpid() }, Ordering::Relaxed);
        watcher.priority.store(priority, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        // Claiming last makes the slot visible to wake-uppers only once the
        // pid and priority are in place.
        watcher.ownership.acquire();

        Some(Self {
            mem,
            watcher_index,
            _channel: PhantomData,
        })
    }
}

impl Drop for Watcher<'_> {
    fn drop(&mut self) {
        let (_guard, _owner_died) = self.mem.header().setup_lock.lock();

        let watcher = self.mem.watcher(self.watcher_index);
        assert!(
            watcher.ownership.is_held_by_current_thread(),
            "watcher slot stolen while we were registered"
        );
        watcher.ownership.release();

        // Nothing else in this region should still be owned by this thread.
        for i in 0..self.mem.config().num_watchers {
            debug_assert!(!self.mem.watcher(i).ownership.is_held_by_current_thread());
        }
    }
}

/// Snapshot of one watcher taken on the wakeup path.
#[derive(Debug, Clone, Copy)]
struct WatcherCopy {
    ownership_snapshot: OwnershipSnapshot,
    pid: i32,
    /// `-1` marks dead/unclaimed/torn entries so sorting pushes them last.
    priority: i32,
}

/// Decide delivery order and whether the caller needs a priority boost.
///
/// Pure so the policy is testable without realtime privileges: sorts
/// `watchers` by descending priority and returns how many are live plus the
/// boost target, if the best watcher outranks `current_priority` (a caller
/// at priority <= 0 isn't realtime and is never boosted).
fn plan_wakeup(watchers: &mut [WatcherCopy], current_priority: i32) -> (usize, Option<i32>) {
    watchers.sort_unstable_by_key(|w| std::cmp::Reverse(w.priority));
    let live = watchers.iter().take_while(|w| w.priority != -1).count();
    if live == 0 {
        return (0, None);
    }
    let max_priority = watchers[0].priority.max(current_priority);
    let boost = (max_priority > current_priority && current_priority > 0).then_some(max_priority);
    (live, boost)
}

fn set_scheduler_priority(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 targets the calling thread; param is a valid sched_param.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        log::warn!(
            "[wakeup] failed to move to SCHED_FIFO priority {priority}: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Kernel siginfo layout for raising queued signals (LP64). `libc` only
/// exposes the receive-side accessors, so the raise side is spelled out.
#[repr(C)]
struct WakeupSiginfo {
    si_signo: i32,
    si_errno: i32,
    si_code: i32,
    _pad: i32,
    si_pid: i32,
    si_uid: u32,
    si_value: usize,
    _rest: [u64; 12],
}

/// Queue `sig` to one specific thread, not the whole process, so multiple
/// watchers inside one process (event loops on different threads) each get
/// their own wakeup.
#[cfg(target_os = "linux")]
fn rt_tgsigqueueinfo(tgid: i32, tid: u32, sig: i32, info: &WakeupSiginfo) -> i32 {
    // SAFETY: info points to a fully initialized, 128-byte siginfo image and
    // the ids are plain integers; the kernel validates them.
    unsafe {
        libc::syscall(
            libc::SYS_rt_tgsigqueueinfo,
            tgid,
            tid as i32,
            sig,
            info as *const WakeupSiginfo,
        ) as i32
    }
}

#[cfg(not(target_os = "linux"))]
fn rt_tgsigqueueinfo(_tgid: i32, _tid: u32, _sig: i32, _info: &WakeupSiginfo) -> i32 {
    -1
}

/// The send-side notifier. One per publishing thread.
pub struct WakeUpper<'a> {
    mem: QueueMemory,
    pid: i32,
    uid: u32,
    /// Preallocated snapshot buffer; the wakeup path never allocates.
    watcher_copy: Vec<WatcherCopy>,
    /// Disabled for non-realtime deployments and tests without CAP_SYS_NICE.
    boost_enabled: bool,
    _channel: PhantomData<&'a Channel>,
}

impl<'a> WakeUpper<'a> {
    #[must_use]
    pub fn attach(channel: &'a Channel) -> Self {
        Self::attach_memory(channel.memory())
    }

    pub(crate) fn attach_memory(mem: QueueMemory) -> Self {
        let num_watchers = mem.config().num_watchers;
        Self {
            mem,
            // SAFETY: getpid/getuid have no preconditions.
            pid: unsafe { libc::getpid() },
            uid: unsafe { libc::getuid() },
            watcher_copy: vec![
                WatcherCopy {
                    ownership_snapshot: OwnershipSnapshot::unclaimed(),
                    pid: 0,
                    priority: -1,
                };
                num_watchers
            ],
            boost_enabled: true,
            _channel: PhantomData,
        }
    }

    /// Skip the `sched_setscheduler` boost (testing, non-RT deployments).
    pub fn set_boost_enabled(&mut self, enabled: bool) {
        self.boost_enabled = enabled;
    }

    /// Signal every live watcher once, highest priority first. Returns the
    /// number of signals queued. `current_priority` is the caller's realtime
    /// priority (0 if not realtime), used for the inversion-avoidance boost.
    pub fn wakeup(&mut self, current_priority: i32) -> usize {
        let num_watchers = self.mem.config().num_watchers;
        debug_assert_eq!(self.watcher_copy.len(), num_watchers);

        // Snapshot, so the table can't change under the sort. A process can
        // still die *after* the snapshot; it just gets a harmless signal.
        // There is no way to close that window without pidfds, and opening
        // one is not realtime-safe.
        for i in 0..num_watchers {
            let watcher = self.mem.watcher(i);
            let entry = &mut self.watcher_copy[i];
            entry.ownership_snapshot = watcher.ownership.relaxed_load();
            // The TID load has to come first.
            fence(Ordering::SeqCst);
            entry.pid = watcher.pid.load(Ordering::Relaxed);
            entry.priority = watcher.priority.load(Ordering::Relaxed);

            if entry.ownership_snapshot.owner_died() || entry.ownership_snapshot.is_unclaimed() {
                entry.priority = -1;
            } else {
                // If the slot was recycled while we read pid/priority, the
                // tracker word changed; drop the entry rather than signal a
                // mismatched thread.
                fence(Ordering::SeqCst);
                if entry.ownership_snapshot != watcher.ownership.relaxed_load() {
                    entry.priority = -1;
                }
            }
        }

        let (live, boost) = plan_wakeup(&mut self.watcher_copy, current_priority);
        if live == 0 {
            return 0;
        }

        if let Some(priority) = boost {
            if self.boost_enabled {
                set_scheduler_priority(priority);
            }
        }

        let info = WakeupSiginfo {
            si_signo: wakeup_signal(),
            si_errno: 0,
            si_code: libc::SI_QUEUE,
            _pad: 0,
            si_pid: self.pid,
            si_uid: self.uid,
            si_value: 0,
            _rest: [0u64; 12],
        };

        let mut count = 0;
        for watcher_copy in &self.watcher_copy[..live] {
            let rc = rt_tgsigqueueinfo(
                watcher_copy.pid,
                watcher_copy.ownership_snapshot.tid(),
                wakeup_signal(),
                &info,
            );
            if rc == 0 {
                count += 1;
            } else {
                // Watcher died since the snapshot, or never set up for the
                // signal; it has to resynchronize on its own anyway.
                log::debug!(
                    "[wakeup] failed to signal pid {} tid {}: {}",
                    watcher_copy.pid,
                    watcher_copy.ownership_snapshot.tid(),
                    std::io::Error::last_os_error()
                );
            }
        }

        if boost.is_some() && self.boost_enabled {
            set_scheduler_priority(current_priority);
        }

        count
    }
}
