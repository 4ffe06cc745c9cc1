// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crash-recovery sweep.
//!
//! Runs whenever a sender or pinner attaches, while holding the setup mutex.
//! It has to put the region back into a state where every §3-style invariant
//! holds, no matter where a previous owner's thread was killed.
//!
//! There are a large number of ways a death can interleave with the publish
//! protocol. Rather than tracking extra state on the (realtime) send path to
//! disambiguate them, the sweep is allowed to be slow: it classifies the
//! easy states directly and, for the one truly ambiguous state, walks the
//! whole region counting which pool messages are reachable until every dead
//! sender can be rolled forward or backward.
//!
//! A dead sender's slots can be in exactly four states:
//!
//! 1. `scratch = x, to_replace = invalid` - idle or fully finished. Nothing
//!    to undo beyond re-invalidating the scratch message (and making sure the
//!    scratch is not a message some pinner holds).
//! 2. `scratch = x, to_replace = y` (distinct) - mid-publish. The ring CAS
//!    may or may not have happened; resolved by the accounting phase.
//! 3. `scratch = y, to_replace = y` - the post-CAS copy completed but the
//!    final invalidation didn't. Just finish it.
//! 4. `scratch = y, to_replace = invalid` - finished; identical to 1.
//!
//! For state 2, exactly one of `scratch`/`to_replace` is reachable from the
//! ring or another owner's scratch: if `scratch` is reachable the CAS
//! succeeded (roll forward, adopt `to_replace`); if `to_replace` is
//! reachable the CAS never happened (roll back, keep `scratch`). With
//! several simultaneous deaths the accounting may only disambiguate one
//! sender per pass, but each pass resolves at least one, and the number of
//! dead senders is fixed while we hold the setup mutex, so it terminates.

use crate::layout::QueueMemory;
use crate::mutex::SetupMutexGuard;
use crate::sender::swap_pinned_sender_scratch;
use std::sync::atomic::{fence, Ordering};

/// Run [`do_cleanup`] until it completes without observing a fresh death.
/// The guard parameter is proof the caller holds the region's setup mutex.
///
/// Bounded because only a finite number of owners can die and no new owners
/// can appear while the setup mutex is held.
pub(crate) fn cleanup(mem: &QueueMemory, _lock: &SetupMutexGuard<'_>) {
    while !do_cleanup(mem) {}
}

/// One full sweep. Returns false if another owner died partway through and
/// the sweep must be restarted from scratch.
fn do_cleanup(mem: &QueueMemory) -> bool {
    // Start from a fresh view of shared memory; everything dead owners wrote
    // must be visible before we interpret their slots.
    fence(Ordering::SeqCst);

    let num_senders = mem.config().num_senders;
    let num_pinners = mem.config().num_pinners;
    let queue_size = mem.config().queue_size;
    let num_messages = mem.num_messages();

    let mut need_recovery = vec![false; num_senders];

    // Phase A: the easy states.
    let mut valid_senders = 0;
    for i in 0..num_senders {
        let sender = mem.sender(i);
        if !sender.ownership.owner_is_definitely_dead() {
            valid_senders += 1;
            continue;
        }
        log::debug!("[recovery] sender {i} died; classifying");
        // Relaxed loads: nobody else touches a dead sender's slots while we
        // hold the setup mutex.
        let to_replace = sender.to_replace.relaxed_load();
        let scratch_index = sender.scratch_index.load();

        if !to_replace.valid() {
            // States 1/4. The scratch may still be pinned from an earlier
            // rotation; resolve that exactly like the send path would have.
            assert!(scratch_index.valid(), "dead sender {i} lost its scratch");
            let scratch_index = swap_pinned_sender_scratch(mem, sender, scratch_index);

            // In state 4 the final invalidation may not have happened yet; in
            // state 1 this is a no-op.
            mem.message_header(scratch_index)
                .queue_index
                .relaxed_invalidate();

            sender.ownership.force_clear();
            valid_senders += 1;
            continue;
        }

        if to_replace == scratch_index {
            // State 3: finish the tail of the publish.
            sender.to_replace.invalidate();

            // Mark the message unused before another sender can claim this
            // slot and find a stale queue index in it.
            mem.message_header(scratch_index)
                .queue_index
                .relaxed_invalidate();
            fence(Ordering::SeqCst);

            sender.ownership.force_clear();
            valid_senders += 1;
            continue;
        }

        // State 2. Defer to the accounting phase.
        need_recovery[i] = true;
    }

    // Dead pinners only leave a stale `pinned` behind; their scratch is
    // already consistent.
    for i in 0..num_pinners {
        let pinner = mem.pinner(i);
        if !pinner.ownership.owner_is_definitely_dead() {
            continue;
        }
        log::debug!("[recovery] pinner {i} died; releasing its pin");
        pinner.pinned.invalidate();
        pinner.ownership.force_clear();
    }

    if valid_senders == num_senders {
        return true;
    }

    log::debug!("[recovery] ambiguous senders remain; starting accounting");

    // Phase B: account for every pool message reachable from the ring and
    // from live owners' scratch slots. The queue stays active while we scan,
    // so it can take several passes for the counts to close.
    let mut num_accounted_for = 0usize;
    let mut num_missing = 0usize;
    let mut accounted_for = vec![false; num_messages];

    while num_accounted_for + num_missing != num_messages {
        num_missing = 0;
        for i in 0..num_senders {
            let sender = mem.sender(i);
            if sender.ownership.owner_is_definitely_dead() {
                if !need_recovery[i] {
                    // Somebody died after phase A looked at them; restart.
                    return false;
                }
                num_missing += 1;
                continue;
            }
            assert!(
                !need_recovery[i],
                "sender {i} recovered while the setup mutex was held"
            );
            // Live sender: whatever it holds now will be seen eventually if
            // we keep making passes.
            let scratch = sender.scratch_index.relaxed_load();
            if !accounted_for[scratch.message_index()] {
                num_accounted_for += 1;
                accounted_for[scratch.message_index()] = true;
            }
        }

        for i in 0..queue_size {
            let index = mem.queue(i).relaxed_load();
            if !accounted_for[index.message_index()] {
                num_accounted_for += 1;
                accounted_for[index.message_index()] = true;
            }
        }

        for i in 0..num_pinners {
            let index = mem.pinner(i).scratch_index.relaxed_load();
            if !accounted_for[index.message_index()] {
                num_accounted_for += 1;
                accounted_for[index.message_index()] = true;
            }
        }

        assert!(num_accounted_for + num_missing <= num_messages);
    }

    // Resolve the ambiguous senders, at least one per pass.
    while num_missing != 0 {
        let starting_num_missing = num_missing;
        for i in 0..num_senders {
            let sender = mem.sender(i);
            if !sender.ownership.owner_is_definitely_dead() {
                assert!(
                    !need_recovery[i],
                    "sender {i} recovered while the setup mutex was held"
                );
                continue;
            }
            if !need_recovery[i] {
                return false;
            }
            let scratch_index = sender.scratch_index.relaxed_load();
            let to_replace = sender.to_replace.relaxed_load();

            if !to_replace.valid() || accounted_for[to_replace.message_index()] {
                // `to_replace` is reachable elsewhere, so the ring CAS never
                // happened. Roll back: the sender keeps its scratch.
                log::debug!("[recovery] sender {i}: to_replace accounted for, rolling back");
                assert!(scratch_index.valid());
                assert!(
                    !accounted_for[scratch_index.message_index()],
                    "both of dead sender {i}'s messages are reachable"
                );

                sender.to_replace.invalidate();
                mem.message_header(scratch_index)
                    .queue_index
                    .relaxed_invalidate();

                sender.ownership.force_clear();
                need_recovery[i] = false;

                accounted_for[scratch_index.message_index()] = true;
                num_missing -= 1;
                num_accounted_for += 1;
            } else if !scratch_index.valid() || accounted_for[scratch_index.message_index()] {
                // `scratch` made it into the ring, so the CAS succeeded.
                // Roll forward: adopt `to_replace` as the new scratch.
                log::debug!("[recovery] sender {i}: scratch accounted for, rolling forward");
                assert!(to_replace.valid());

                mem.message_header(to_replace)
                    .queue_index
                    .relaxed_invalidate();
                fence(Ordering::SeqCst);

                sender.scratch_index.store(to_replace);
                sender.to_replace.invalidate();

                sender.ownership.force_clear();
                need_recovery[i] = false;

                accounted_for[to_replace.message_index()] = true;
                num_missing -= 1;
                num_accounted_for += 1;
            } else {
                // Neither reachable yet: some other dead sender's resolution
                // will account for one of them on a later pass.
                log::debug!("[recovery] sender {i}: still ambiguous");
            }
        }
        assert_ne!(
            num_missing, starting_num_missing,
            "recovery made no progress"
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MessageIndex, QueueIndex};
    use crate::layout::QueueConfig;
    use crate::ownership::current_tid;
    use crate::test_support::TestRegion;

    fn test_config() -> QueueConfig {
        QueueConfig {
            num_watchers: 1,
            num_senders: 3,
            num_pinners: 2,
            queue_size: 4,
            message_data_size: 64,
        }
    }

    fn sweep(mem: &crate::layout::QueueMemory) {
        let (guard, _) = mem.header().setup_lock.lock();
        cleanup(mem, &guard);
    }

    /// Claim sender `i` as the current thread, then mark it dead.
    fn claim_and_kill_sender(region: &TestRegion, i: usize) {
        let sender = region.mem.sender(i);
        sender.ownership.acquire();
        assert!(sender.ownership.pretend_owner_died_for_testing(current_tid()));
    }

    #[test]
    fn test_idle_dead_sender_is_cleared() {
        let region = TestRegion::new(test_config());
        let mem = &region.mem;
        claim_and_kill_sender(&region, 0);

        // Leave a stale published index in the scratch message, as state 4
        // would.
        let scratch = mem.sender(0).scratch_index.relaxed_load();
        mem.message_header(scratch)
            .queue_index
            .store(QueueIndex::zero(mem.queue_size()));

        sweep(mem);

        let sender = mem.sender(0);
        assert!(sender.ownership.load().is_unclaimed());
        assert!(sender.scratch_index.relaxed_load().valid());
        assert!(!sender.to_replace.relaxed_load().valid());
        assert!(!mem.message_header(scratch).queue_index.load(mem.queue_size()).valid());
    }

    #[test]
    fn test_copy_done_cleanup_not() {
        // State 3: to_replace was copied into scratch but not invalidated.
        let region = TestRegion::new(test_config());
        let mem = &region.mem;

        let scratch = mem.sender(1).scratch_index.relaxed_load();
        mem.sender(1).to_replace.relaxed_store(scratch);
        claim_and_kill_sender(&region, 1);

        sweep(mem);

        let sender = mem.sender(1);
        assert!(sender.ownership.load().is_unclaimed());
        assert_eq!(sender.scratch_index.relaxed_load(), scratch);
        assert!(!sender.to_replace.relaxed_load().valid());
    }

    #[test]
    fn test_ambiguous_rolls_back_when_cas_failed() {
        // State 2 where to_replace still sits in the ring: the CAS never
        // happened, so the sender must keep its scratch.
        let region = TestRegion::new(test_config());
        let mem = &region.mem;

        let old_scratch = mem.sender(0).scratch_index.relaxed_load();
        let in_ring = mem.queue(0).load();
        mem.sender(0).to_replace.relaxed_store(in_ring);
        claim_and_kill_sender(&region, 0);

        sweep(mem);

        let sender = mem.sender(0);
        assert!(sender.ownership.load().is_unclaimed());
        assert_eq!(sender.scratch_index.relaxed_load(), old_scratch);
        assert!(!sender.to_replace.relaxed_load().valid());
        // The ring entry is untouched.
        assert_eq!(mem.queue(0).load(), in_ring);
    }

    #[test]
    fn test_ambiguous_rolls_forward_when_cas_succeeded() {
        // State 2 after a successful CAS: the scratch message is in the
        // ring, published at queue index 0, and the sender died before
        // adopting the evicted message.
        let region = TestRegion::new(test_config());
        let mem = &region.mem;
        let queue_size = mem.queue_size();

        let target = QueueIndex::zero(queue_size);
        let old_scratch = mem.sender(2).scratch_index.relaxed_load();
        let evicted = mem.queue(0).load();
        let index_to_write = MessageIndex::new(target, old_scratch.message_index());

        mem.message_header(index_to_write).queue_index.store(target);
        mem.sender(2).scratch_index.relaxed_store(index_to_write);
        mem.sender(2).to_replace.relaxed_store(evicted);
        mem.queue(0).store(index_to_write);
        claim_and_kill_sender(&region, 2);

        sweep(mem);

        let sender = mem.sender(2);
        assert!(sender.ownership.load().is_unclaimed());
        // The sender adopted the evicted message...
        assert_eq!(sender.scratch_index.relaxed_load(), evicted);
        assert!(!sender.to_replace.relaxed_load().valid());
        // ...and the published message survived, still in the ring.
        assert_eq!(mem.queue(0).load(), index_to_write);
        assert_eq!(
            mem.message_header(index_to_write)
                .queue_index
                .load(queue_size),
            target
        );
    }

    #[test]
    fn test_two_dead_senders_resolved_together() {
        let region = TestRegion::new(test_config());
        let mem = &region.mem;
        let queue_size = mem.queue_size();

        // Sender 0: successful CAS at slot 1 (roll forward).
        let target = QueueIndex::zero(queue_size).increment();
        let scratch0 = mem.sender(0).scratch_index.relaxed_load();
        let evicted = mem.queue(1).load();
        let written = MessageIndex::new(target, scratch0.message_index());
        mem.message_header(written).queue_index.store(target);
        mem.sender(0).scratch_index.relaxed_store(written);
        mem.sender(0).to_replace.relaxed_store(evicted);
        mem.queue(1).store(written);
        claim_and_kill_sender(&region, 0);

        // Sender 1: failed CAS against slot 2 (roll back).
        let scratch1 = mem.sender(1).scratch_index.relaxed_load();
        mem.sender(1).to_replace.relaxed_store(mem.queue(2).load());
        claim_and_kill_sender(&region, 1);

        sweep(mem);

        assert_eq!(mem.sender(0).scratch_index.relaxed_load(), evicted);
        assert_eq!(mem.sender(1).scratch_index.relaxed_load(), scratch1);
        for i in 0..2 {
            assert!(mem.sender(i).ownership.load().is_unclaimed());
            assert!(!mem.sender(i).to_replace.relaxed_load().valid());
        }
    }

    #[test]
    fn test_dead_pinner_releases_pin() {
        let region = TestRegion::new(test_config());
        let mem = &region.mem;

        let pinner = mem.pinner(0);
        pinner.ownership.acquire();
        pinner.pinned.store(QueueIndex::zero(mem.queue_size()));
        assert!(pinner.ownership.pretend_owner_died_for_testing(current_tid()));

        sweep(mem);

        assert!(pinner.ownership.load().is_unclaimed());
        assert!(!pinner.pinned.load(mem.queue_size()).valid());
        assert!(pinner.scratch_index.relaxed_load().valid());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let region = TestRegion::new(test_config());
        let mem = &region.mem;
        claim_and_kill_sender(&region, 0);

        sweep(mem);
        let scratch_after_first = mem.sender(0).scratch_index.relaxed_load();
        sweep(mem);
        assert_eq!(mem.sender(0).scratch_index.relaxed_load(), scratch_after_first);
    }
}
