// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The reader side: optimistic reads with overwrite detection.
//!
//! Readers never claim anything. A read resolves the requested queue index
//! to a ring slot, loads the message there, and then proves the message it
//! looked at really was the requested publication by rechecking the header's
//! `queue_index` after every step that consumed shared data:
//!
//! - header mismatch by exactly one generation -> nothing published there yet;
//! - header mismatch by more -> the reader fell behind and the slot was
//!   recycled (`TooOld`);
//! - header changed *during* the read -> a sender won the race mid-copy
//!   (`Overwrote`), and the caller should retry with a newer index.
//!
//! The only stores a reader ever issues are the CAS-from-invalid send-time
//! population (so a message is never observed without timestamps) and the
//! best-effort `next_queue_index` repair in [`Reader::latest_index`], both of
//! which are also done by senders.

use crate::channel::Channel;
use crate::index::QueueIndex;
use crate::layout::QueueMemory;
use crate::sender::NO_REMOTE_QUEUE_INDEX;
use crate::time::{MonotonicTime, RealtimeTime};
use crate::uuid::Uuid;
use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

/// Everything known about one received message except the payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Queue index the message was published at.
    pub queue_index: u32,
    pub monotonic_sent_time: MonotonicTime,
    pub realtime_sent_time: RealtimeTime,
    /// Send time on the originating node, or invalid for local messages.
    pub monotonic_remote_time: MonotonicTime,
    pub monotonic_remote_transmit_time: MonotonicTime,
    pub realtime_remote_time: RealtimeTime,
    /// Queue index on the originating node; equals `queue_index` for local
    /// messages.
    pub remote_queue_index: u32,
    pub source_boot_uuid: Uuid,
    /// Valid payload length.
    pub size: usize,
}

/// Outcome of one read attempt.
#[derive(Debug)]
pub enum ReadResult {
    /// The message was read consistently.
    Good(Context),
    /// Nothing has been published at this index yet; retry later.
    NothingNew,
    /// The requested index has already been overwritten; the caller fell at
    /// least one queue wrap behind.
    TooOld,
    /// A sender recycled the message while we were reading it.
    Overwrote,
    /// The filter callback declined the message.
    Filtered,
}

/// A read handle on a channel. Cheap; create as many as needed.
pub struct Reader<'a> {
    mem: QueueMemory,
    _channel: PhantomData<&'a Channel>,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(channel: &'a Channel) -> Self {
        Self {
            mem: channel.memory(),
            _channel: PhantomData,
        }
    }

    pub(crate) fn new_memory(mem: QueueMemory) -> Self {
        Self {
            mem,
            _channel: PhantomData,
        }
    }

    /// Queue index of the most recent publication, or `None` before the
    /// first one.
    ///
    /// Repairs a lagging `next_queue_index` (a sender that died between the
    /// slot swap and the counter bump leaves it one behind), so watchers and
    /// polling readers agree on when a message exists.
    #[must_use]
    pub fn latest_index(&self) -> Option<u32> {
        let queue_size = self.mem.queue_size();

        let mut actual_next_queue_index = self.mem.header().next_queue_index.load(queue_size);
        let next_queue_index = actual_next_queue_index.zero_or_valid();

        // If the slot the counter points at already holds a message for this
        // very generation, the counter lags reality by one: a publish
        // happened and its counter bump didn't. Fix it like a sender would.
        let to_replace = self.mem.queue(next_queue_index.wrapped()).load();
        if to_replace.is_plausible(next_queue_index) {
            let incremented_queue_index = next_queue_index.increment();
            // Success or somebody else fixed it; both fine.
            self.mem
                .header()
                .next_queue_index
                .compare_exchange(actual_next_queue_index, incremented_queue_index);
            log::trace!(
                "[reader] next_queue_index lagged, repaired to {:#x}",
                incremented_queue_index.index()
            );
            actual_next_queue_index = incremented_queue_index;
        }

        if actual_next_queue_index.valid() {
            Some(actual_next_queue_index.decrement_by(1).index())
        } else {
            None
        }
    }

    /// Attempt to read the message at `queue_index`.
    ///
    /// `data`, when supplied, receives the *entire* payload capacity (it
    /// must be at least that large); `Context::size` says how much of it is
    /// meaningful. Copying everything keeps the copy time deterministic.
    ///
    /// `should_read` is consulted after the metadata is proven consistent
    /// but before the payload copy, letting a caller cheaply skip messages
    /// without paying for the copy.
    ///
    /// Hard-realtime safe; never blocks, multiple readers don't coordinate.
    pub fn read(
        &self,
        queue_index: u32,
        mut data: Option<&mut [u8]>,
        should_read: Option<&dyn Fn(&Context) -> bool>,
    ) -> ReadResult {
        let queue_size = self.mem.queue_size();
        let requested = QueueIndex::zero(queue_size).increment_by(queue_index);

        // Read the message currently stored at the requested slot.
        let mut message_index = self.mem.queue(requested.wrapped()).load();

        loop {
            debug_assert!(
                !self.mem.check_both_redzones(message_index),
                "corrupt message found in shared memory"
            );
            // Confirm the message is the publication we asked for before
            // trusting any of its contents.
            let starting_queue_index = self
                .mem
                .message_header(message_index)
                .queue_index
                .load(queue_size);
            if starting_queue_index != requested {
                // Exactly one generation back: this slot hasn't been
                // published in the requested generation yet.
                if starting_queue_index == requested.decrement_by(queue_size) {
                    return ReadResult::NothingNew;
                }

                // Someone recycled the message between our two loads. If the
                // slot now names a different message, start over with it.
                let reloaded = self.mem.queue(requested.wrapped()).load();
                if reloaded.message_index() != message_index.message_index() {
                    log::trace!("[reader] message moved mid-read, retrying");
                    message_index = reloaded;
                    continue;
                }

                // Same message, genuinely different queue index: either we
                // fell behind, or this is one of the never-published seed
                // messages.
                if starting_queue_index.valid() {
                    return ReadResult::TooOld;
                }

                // Asking within the first generation means the caller got
                // ahead of the senders; anything else is ancient history.
                if queue_index < queue_size {
                    return ReadResult::NothingNew;
                }
                return ReadResult::TooOld;
            }
            break;
        }

        // Stamp-or-fetch the send times; a reader outrunning the sender's
        // post-publish stamping populates them itself.
        let header = self.mem.message_header(message_index);
        let (monotonic_sent_time, realtime_sent_time) = header.set_send_times();

        let remote_queue_index = header.remote_queue_index.load(Ordering::Relaxed);
        let context = Context {
            queue_index: requested.index(),
            monotonic_sent_time,
            realtime_sent_time,
            monotonic_remote_time: MonotonicTime::from_nanos(header.monotonic_remote_time.load()),
            monotonic_remote_transmit_time: MonotonicTime::from_nanos(
                header.monotonic_remote_transmit_time.load(),
            ),
            realtime_remote_time: RealtimeTime::from_nanos(header.realtime_remote_time.load()),
            remote_queue_index: if remote_queue_index == NO_REMOTE_QUEUE_INDEX {
                requested.index()
            } else {
                remote_queue_index
            },
            source_boot_uuid: self.mem.read_source_boot_uuid(message_index),
            size: header.length.load(Ordering::Relaxed) as usize,
        };

        if let Some(filter) = should_read {
            // The metadata above was read without protection; prove the
            // message didn't change under us before showing it to the
            // filter.
            fence(Ordering::SeqCst);
            let final_queue_index = header.queue_index.load(queue_size);
            if final_queue_index != requested {
                log::trace!(
                    "[reader] overwritten during metadata read of {:#x}",
                    requested.index()
                );
                return ReadResult::Overwrote;
            }

            if !filter(&context) {
                return ReadResult::Filtered;
            }
        }

        let copied = data.is_some();
        if let Some(buf) = data.take() {
            assert!(
                buf.len() >= self.mem.message_data_size(),
                "payload buffer too small"
            );
            // SAFETY: the payload region is message_data_size() bytes; a
            // torn copy is possible if a sender recycles the message
            // mid-copy, and is detected (and discarded) by the recheck
            // below.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.mem.message_data(message_index),
                    buf.as_mut_ptr(),
                    self.mem.message_data_size(),
                );
            }
        }

        // Final consistency proof for whatever we consumed since the last
        // recheck (the payload copy, or the metadata when no filter ran).
        if copied || should_read.is_none() {
            fence(Ordering::SeqCst);
            let final_queue_index = header.queue_index.load(queue_size);
            if final_queue_index != requested {
                log::trace!(
                    "[reader] overwritten during payload copy of {:#x}",
                    requested.index()
                );
                return ReadResult::Overwrote;
            }
        }

        ReadResult::Good(context)
    }
}
