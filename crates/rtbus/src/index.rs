// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wrap-aware queue and message-pool indices.
//!
//! Two index types address everything in a channel region:
//!
//! - [`QueueIndex`]: the publish counter. A 32-bit value that increments on
//!   every publish and wraps modulo the largest multiple of `queue_size` that
//!   fits in a `u32`, so `index % queue_size` stays continuous across the
//!   wrap. `0xffff_ffff` is reserved as the invalid sentinel and is never
//!   produced by arithmetic.
//!
//! - [`MessageIndex`]: a "pointer" to a slot in the message pool. The low 16
//!   bits are the pool position; the high 16 bits carry the low half of the
//!   queue index the message was (or is about to be) published at. That tag is
//!   what lets a sender detect that a ring slot still holds the message from
//!   exactly one generation ago before it compare-exchanges its own message
//!   in, and it is what makes the ABA window on a ring slot harmless.
//!
//! Both types have atomic shared-memory counterparts with explicit memory
//! orderings; the orderings are chosen at the call sites in the send/read
//! paths and documented there.

use std::sync::atomic::{AtomicU32, Ordering};

/// Reserved bit pattern meaning "no index here".
const SENTINEL: u32 = 0xffff_ffff;

/// Publish counter for one channel.
///
/// Carries `count` (the queue size) so that wrap handling and slot mapping
/// don't need it passed to every operation.
#[derive(Debug, Clone, Copy)]
pub struct QueueIndex {
    index: u32,
    count: u32,
}

impl PartialEq for QueueIndex {
    fn eq(&self, other: &Self) -> bool {
        debug_assert_eq!(self.count, other.count);
        self.index == other.index
    }
}

impl Eq for QueueIndex {}

impl QueueIndex {
    /// First valid index (nothing published yet starts here).
    #[must_use]
    pub fn zero(count: u32) -> Self {
        Self { index: 0, count }
    }

    /// The reserved invalid index.
    #[must_use]
    pub fn invalid(count: u32) -> Self {
        Self {
            index: SENTINEL,
            count,
        }
    }

    /// Rebuild a `QueueIndex` from a raw `u32` previously obtained from
    /// [`QueueIndex::index`]. Values at or past the wrap limit are folded
    /// back into range.
    #[must_use]
    pub fn from_index(index: u32, count: u32) -> Self {
        if index == SENTINEL {
            return Self::invalid(count);
        }
        Self {
            index: index % Self::max_index(count),
            count,
        }
    }

    /// Largest multiple of `count` representable in a `u32`. Arithmetic is
    /// done modulo this value, which keeps `index % count` continuous across
    /// the wrap and keeps the sentinel out of reach.
    fn max_index(count: u32) -> u32 {
        (SENTINEL / count) * count
    }

    /// The raw counter value.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.index != SENTINEL
    }

    /// Ring slot this index maps to.
    #[must_use]
    pub fn wrapped(&self) -> usize {
        debug_assert!(self.valid());
        (self.index % self.count) as usize
    }

    #[must_use]
    pub fn increment(&self) -> Self {
        self.increment_by(1)
    }

    #[must_use]
    pub fn increment_by(&self, amount: u32) -> Self {
        debug_assert!(self.valid());
        let max = u64::from(Self::max_index(self.count));
        let index = ((u64::from(self.index) + u64::from(amount)) % max) as u32;
        Self {
            index,
            count: self.count,
        }
    }

    #[must_use]
    pub fn decrement_by(&self, amount: u32) -> Self {
        debug_assert!(self.valid());
        debug_assert!(amount <= Self::max_index(self.count));
        let max = u64::from(Self::max_index(self.count));
        let index = ((u64::from(self.index) + max - u64::from(amount)) % max) as u32;
        Self {
            index,
            count: self.count,
        }
    }

    /// Maps "invalid" to index 0. Senders use this so the very first publish
    /// on a fresh channel targets queue index 0.
    #[must_use]
    pub fn zero_or_valid(self) -> Self {
        if self.valid() {
            self
        } else {
            Self::zero(self.count)
        }
    }
}

/// Most messages the pool may hold; the pool position must fit in 16 bits
/// with the all-ones pattern reserved for the sentinel.
pub const MAX_MESSAGES: usize = 0xffff;

/// Index into the message pool, tagged with the low 16 bits of the queue
/// index it is associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIndex(u32);

impl MessageIndex {
    #[must_use]
    pub fn invalid() -> Self {
        Self(SENTINEL)
    }

    /// Tag `message_index` with the generation of `queue_index`.
    #[must_use]
    pub fn new(queue_index: QueueIndex, message_index: usize) -> Self {
        debug_assert!(message_index < MAX_MESSAGES);
        Self(((queue_index.index() & 0xffff) << 16) | (message_index as u32 & 0xffff))
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.0 != SENTINEL
    }

    /// Position in the message pool.
    #[must_use]
    pub fn message_index(&self) -> usize {
        debug_assert!(self.valid());
        (self.0 & 0xffff) as usize
    }

    /// True when this entry could be the message published at `queue_index`:
    /// the stored tag matches the low half of that index. Stale entries from
    /// other generations fail this check (up to the 16-bit tag aliasing the
    /// full counter, which the queue-index recheck in the header catches).
    #[must_use]
    pub fn is_plausible(&self, queue_index: QueueIndex) -> bool {
        self.valid() && (self.0 >> 16) == (queue_index.index() & 0xffff)
    }

    /// Raw bits, for dumps and logs.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0
    }

    fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// A `QueueIndex` living in shared memory.
#[repr(transparent)]
pub struct AtomicQueueIndex(AtomicU32);

impl AtomicQueueIndex {
    /// Acquire load; pairs with [`AtomicQueueIndex::store`] by the previous
    /// writer of this location.
    pub fn load(&self, count: u32) -> QueueIndex {
        let raw = self.0.load(Ordering::Acquire);
        if raw == SENTINEL {
            QueueIndex::invalid(count)
        } else {
            QueueIndex { index: raw, count }
        }
    }

    /// Load without ordering, for locations only the caller may write.
    pub fn relaxed_load(&self, count: u32) -> QueueIndex {
        let raw = self.0.load(Ordering::Relaxed);
        if raw == SENTINEL {
            QueueIndex::invalid(count)
        } else {
            QueueIndex { index: raw, count }
        }
    }

    /// Release store; publishes everything written before it.
    pub fn store(&self, value: QueueIndex) {
        self.0.store(value.index, Ordering::Release);
    }

    pub fn relaxed_store(&self, value: QueueIndex) {
        self.0.store(value.index, Ordering::Relaxed);
    }

    pub fn invalidate(&self) {
        self.0.store(SENTINEL, Ordering::Release);
    }

    pub fn relaxed_invalidate(&self) {
        self.0.store(SENTINEL, Ordering::Relaxed);
    }

    /// Strong compare-exchange, returning whether the swap happened.
    pub fn compare_exchange(&self, expected: QueueIndex, value: QueueIndex) -> bool {
        self.0
            .compare_exchange(
                expected.index,
                value.index,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A `MessageIndex` living in shared memory (ring slots, role scratch state).
#[repr(transparent)]
pub struct AtomicMessageIndex(AtomicU32);

impl AtomicMessageIndex {
    pub fn load(&self) -> MessageIndex {
        MessageIndex::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn relaxed_load(&self) -> MessageIndex {
        MessageIndex::from_raw(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: MessageIndex) {
        self.0.store(value.0, Ordering::Release);
    }

    pub fn relaxed_store(&self, value: MessageIndex) {
        self.0.store(value.0, Ordering::Relaxed);
    }

    pub fn invalidate(&self) {
        self.0.store(SENTINEL, Ordering::Release);
    }

    pub fn relaxed_invalidate(&self) {
        self.0.store(SENTINEL, Ordering::Relaxed);
    }

    pub fn compare_exchange(&self, expected: MessageIndex, value: MessageIndex) -> bool {
        self.0
            .compare_exchange(expected.0, value.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
