// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory region layout for one channel.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | QueueHeader (setup mutex, initialized, config, next index)   |
//! +--------------------------------------------------------------+
//! | Ring: AtomicMessageIndex[queue_size]                         |
//! +--------------------------------------------------------------+
//! | MessagePool: Message[queue_size + num_senders + num_pinners] |
//! |   each: header | pre-redzone | aligned payload | post-redzone|
//! +--------------------------------------------------------------+
//! | WatcherSlot[num_watchers]                                    |
//! +--------------------------------------------------------------+
//! | SenderSlot[num_senders]                                      |
//! +--------------------------------------------------------------+
//! | PinnerSlot[num_pinners]                                      |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every section starts at 8-byte alignment (the largest native scalar in
//! any structure here), and the message stride is a multiple of 8, so each
//! payload lands 8-aligned relative to the region base. The total size is a
//! pure function of [`QueueConfig`]; attachers refuse a region whose file
//! size disagrees.
//!
//! # Redzones
//!
//! Each payload is flanked by [`REDZONE_SIZE`] guard bytes. The guard
//! pattern is derived from the byte offset of the redzone inside the region
//! (start byte `(off & 0xff) ^ ((off >> 8) & 0xff)`, incrementing per byte),
//! so every redzone in the region is distinct and a block copied to the
//! wrong place no longer verifies.

use crate::index::{AtomicMessageIndex, AtomicQueueIndex, MessageIndex, MAX_MESSAGES};
use crate::mutex::SetupMutex;
use crate::ownership::RobustOwnershipTracker;
use crate::time::{AtomicTimestamp, MonotonicTime, RealtimeTime, INVALID_NANOS};
use crate::uuid::Uuid;
use crate::{BusError, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Guard bytes on each side of every payload.
pub const REDZONE_SIZE: usize = 16;

/// Payload alignment: the largest native scalar.
pub const DATA_ALIGNMENT: usize = 8;

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Static configuration of one channel, fixed at region initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Watcher slots (signal subscribers).
    pub num_watchers: usize,
    /// Sender slots.
    pub num_senders: usize,
    /// Pinner slots.
    pub num_pinners: usize,
    /// Ring length; also the number of messages replayable before overwrite.
    pub queue_size: usize,
    /// Payload capacity of each message.
    pub message_data_size: usize,
}

impl QueueConfig {
    /// Pool size: every sender and pinner owns a spare message at rest, so
    /// the ring can stay full while they all hold one.
    #[must_use]
    pub fn num_messages(&self) -> usize {
        self.queue_size + self.num_senders + self.num_pinners
    }

    /// Reject degenerate shapes and pools too large to index.
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 || self.message_data_size == 0 {
            return Err(BusError::InvalidConfig(*self));
        }
        // Payloads beyond 1 GiB make the region size computation meaningless
        // long before they make sense.
        if self.message_data_size > 1 << 30 {
            return Err(BusError::InvalidConfig(*self));
        }
        if self.queue_size > u32::MAX as usize / 2 || self.num_messages() >= MAX_MESSAGES {
            return Err(BusError::InvalidConfig(*self));
        }
        Ok(())
    }
}

/// Fixed header at the start of the region. After `initialized` is set, only
/// `next_queue_index` (and the sections behind the header) ever change.
#[repr(C)]
pub struct QueueHeader {
    /// Serializes init, attach/detach, and recovery. Never touched on the
    /// data path.
    pub setup_lock: SetupMutex,
    /// 0 until the configuration, pool, ring, and role tables are all in
    /// place. Written last during initialization.
    pub initialized: AtomicU32,
    pub num_watchers: AtomicU64,
    pub num_senders: AtomicU64,
    pub num_pinners: AtomicU64,
    pub queue_size: AtomicU64,
    pub message_data_size: AtomicU64,
    /// The next publish target. Lags the true state by at most one; every
    /// send and latest-index query repairs it.
    pub next_queue_index: AtomicQueueIndex,
    /// Owner identity recorded at init; see the uid policy in `channel.rs`.
    pub uid: AtomicU32,
}

impl QueueHeader {
    pub(crate) fn config(&self) -> QueueConfig {
        QueueConfig {
            num_watchers: self.num_watchers.load(Ordering::Relaxed) as usize,
            num_senders: self.num_senders.load(Ordering::Relaxed) as usize,
            num_pinners: self.num_pinners.load(Ordering::Relaxed) as usize,
            queue_size: self.queue_size.load(Ordering::Relaxed) as usize,
            message_data_size: self.message_data_size.load(Ordering::Relaxed) as usize,
        }
    }
}

/// Per-message header preceding the redzoned payload.
#[repr(C)]
pub struct MessageHeader {
    /// Which publication this message currently is (or sentinel while it sits
    /// in somebody's scratch). The reader protocol hinges on rechecking this.
    pub queue_index: AtomicQueueIndex,
    /// Valid payload bytes.
    pub length: AtomicU32,
    /// Queue index on the remote node for forwarded messages;
    /// `0xffff_ffff` for locally published ones.
    pub remote_queue_index: AtomicU32,
    /// Boot the message originated from.
    pub source_boot_uuid: UnsafeCell<[u8; 16]>,
    _pad: u32,
    /// Populated post-publish via CAS-from-invalid; see `time.rs`.
    pub monotonic_sent_time: AtomicTimestamp,
    pub realtime_sent_time: AtomicTimestamp,
    /// Pass-through timestamps for bridged messages.
    pub monotonic_remote_time: AtomicTimestamp,
    pub monotonic_remote_transmit_time: AtomicTimestamp,
    pub realtime_remote_time: AtomicTimestamp,
}

// SAFETY: MessageHeader is shared across processes by construction. The
// atomics synchronize themselves; the UnsafeCell payload fields are guarded
// by the queue-index recheck protocol (readers discard anything read across
// a queue_index change).
unsafe impl Send for MessageHeader {}
unsafe impl Sync for MessageHeader {}

impl MessageHeader {
    #[must_use]
    pub fn monotonic_sent_time(&self) -> MonotonicTime {
        MonotonicTime::from_nanos(self.monotonic_sent_time.load())
    }

    #[must_use]
    pub fn realtime_sent_time(&self) -> RealtimeTime {
        RealtimeTime::from_nanos(self.realtime_sent_time.load())
    }

    /// Clear the send times before the slot compare-exchange, realtime first
    /// so the monotonic time is valid whenever the realtime one is.
    pub(crate) fn invalidate_send_times(&self) {
        self.realtime_sent_time.invalidate();
        self.monotonic_sent_time.invalidate();
    }

    /// Populate-or-read the send times. Checking the realtime time first
    /// skips both clock reads in the common already-stamped case, and, more
    /// importantly, bounds a stalled reader's chance of stamping a recycled
    /// message with stale clocks: the stamp only lands if the timestamps are
    /// still in their invalidated state.
    pub(crate) fn set_send_times(&self) -> (MonotonicTime, RealtimeTime) {
        if self.realtime_sent_time.load() != INVALID_NANOS {
            return (self.monotonic_sent_time(), self.realtime_sent_time());
        }
        // Sample the clocks as close together as is reasonable.
        let monotonic_now = MonotonicTime::now();
        let realtime_now = RealtimeTime::now();
        let monotonic = self.monotonic_sent_time.populate(monotonic_now.nanos());
        fence(Ordering::SeqCst);
        // Distinct processes may win the two races; the samples are close
        // enough together that nothing downstream can tell.
        let realtime = self.realtime_sent_time.populate(realtime_now.nanos());
        (
            MonotonicTime::from_nanos(monotonic),
            RealtimeTime::from_nanos(realtime),
        )
    }
}

/// Sender slot: the scratch message it owns at rest, and the ring entry it
/// is in the middle of replacing (sentinel outside of a publish).
#[repr(C)]
pub struct SenderSlot {
    pub ownership: RobustOwnershipTracker,
    pub scratch_index: AtomicMessageIndex,
    pub to_replace: AtomicMessageIndex,
}

/// Pinner slot: a spare message for senders to swap in, plus the queue index
/// this pinner is holding out of the pool.
#[repr(C)]
pub struct PinnerSlot {
    pub ownership: RobustOwnershipTracker,
    pub scratch_index: AtomicMessageIndex,
    pub pinned: AtomicQueueIndex,
}

/// Watcher slot: a registered wakeup target.
#[repr(C)]
pub struct WatcherSlot {
    pub ownership: RobustOwnershipTracker,
    pub pid: AtomicI32,
    pub priority: AtomicI32,
}

/// Byte offsets of every section, derived from the configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionLayout {
    pub ring_offset: usize,
    pub pool_offset: usize,
    pub watchers_offset: usize,
    pub senders_offset: usize,
    pub pinners_offset: usize,
    /// Distance between consecutive messages in the pool.
    pub message_stride: usize,
    /// Payload offset within one message.
    pub data_offset: usize,
    pub total_size: usize,
}

impl RegionLayout {
    pub(crate) fn new(config: &QueueConfig) -> Self {
        let data_offset = align_up(
            std::mem::size_of::<MessageHeader>() + REDZONE_SIZE,
            DATA_ALIGNMENT,
        );
        let message_stride = align_up(
            data_offset + config.message_data_size + REDZONE_SIZE,
            DATA_ALIGNMENT,
        );

        let ring_offset = align_up(std::mem::size_of::<QueueHeader>(), DATA_ALIGNMENT);
        let pool_offset = align_up(
            ring_offset + config.queue_size * std::mem::size_of::<AtomicMessageIndex>(),
            DATA_ALIGNMENT,
        );
        let watchers_offset = pool_offset + config.num_messages() * message_stride;
        let senders_offset = align_up(
            watchers_offset + config.num_watchers * std::mem::size_of::<WatcherSlot>(),
            DATA_ALIGNMENT,
        );
        let pinners_offset = align_up(
            senders_offset + config.num_senders * std::mem::size_of::<SenderSlot>(),
            DATA_ALIGNMENT,
        );
        let total_size = align_up(
            pinners_offset + config.num_pinners * std::mem::size_of::<PinnerSlot>(),
            DATA_ALIGNMENT,
        );

        Self {
            ring_offset,
            pool_offset,
            watchers_offset,
            senders_offset,
            pinners_offset,
            message_stride,
            data_offset,
            total_size,
        }
    }
}

/// Exact byte size a region for `config` must have.
#[must_use]
pub fn region_size(config: &QueueConfig) -> usize {
    RegionLayout::new(config).total_size
}

/// Typed view over a mapped channel region.
///
/// Copyable so every role can carry its own; the mapping it points into is
/// kept alive by the `Channel` the role borrows.
#[derive(Clone, Copy)]
pub(crate) struct QueueMemory {
    base: *mut u8,
    layout: RegionLayout,
    config: QueueConfig,
}

// SAFETY: All shared state behind `base` is atomics (or UnsafeCell regions
// guarded by the queue-index protocol); the region is designed for
// cross-process concurrent access.
unsafe impl Send for QueueMemory {}
unsafe impl Sync for QueueMemory {}

impl QueueMemory {
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `region_size(&config)`
    /// bytes, aligned to at least [`DATA_ALIGNMENT`], that stays valid for
    /// the lifetime of every copy of the returned view.
    pub(crate) unsafe fn new(base: *mut u8, config: QueueConfig) -> Self {
        debug_assert_eq!(base as usize % DATA_ALIGNMENT, 0);
        Self {
            base,
            layout: RegionLayout::new(&config),
            config,
        }
    }

    pub(crate) fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn queue_size(&self) -> u32 {
        self.config.queue_size as u32
    }

    pub(crate) fn num_messages(&self) -> usize {
        self.config.num_messages()
    }

    pub(crate) fn message_data_size(&self) -> usize {
        self.config.message_data_size
    }

    pub(crate) fn header(&self) -> &QueueHeader {
        // SAFETY: The region starts with a QueueHeader (new() guarantees the
        // mapping is big enough and aligned); all fields are atomics.
        unsafe { &*(self.base as *const QueueHeader) }
    }

    /// Ring slot `i`.
    pub(crate) fn queue(&self, i: usize) -> &AtomicMessageIndex {
        debug_assert!(i < self.config.queue_size);
        // SAFETY: ring_offset + i is in bounds for i < queue_size, and the
        // ring section is 4-byte aligned atomics.
        unsafe {
            &*(self
                .base
                .add(self.layout.ring_offset + i * std::mem::size_of::<AtomicMessageIndex>())
                as *const AtomicMessageIndex)
        }
    }

    fn message_offset(&self, index: MessageIndex) -> usize {
        let i = index.message_index();
        debug_assert!(i < self.num_messages());
        self.layout.pool_offset + i * self.layout.message_stride
    }

    pub(crate) fn message_header(&self, index: MessageIndex) -> &MessageHeader {
        // SAFETY: message_offset is in bounds for any pool index, the stride
        // keeps each message 8-aligned, and MessageHeader is all atomics
        // plus an UnsafeCell.
        unsafe { &*(self.base.add(self.message_offset(index)) as *const MessageHeader) }
    }

    /// Start of the payload. Stable for the lifetime of the mapping.
    pub(crate) fn message_data(&self, index: MessageIndex) -> *mut u8 {
        // SAFETY: data_offset is within the message stride by construction.
        unsafe { self.base.add(self.message_offset(index) + self.layout.data_offset) }
    }

    fn redzone(&self, region_offset: usize) -> &[u8] {
        // SAFETY: callers pass offsets of the pre/post guard areas, which are
        // inside the message stride; plain bytes, read-only here.
        unsafe { std::slice::from_raw_parts(self.base.add(region_offset), REDZONE_SIZE) }
    }

    fn pre_redzone_offset(&self, index: MessageIndex) -> usize {
        self.message_offset(index) + self.layout.data_offset - REDZONE_SIZE
    }

    fn post_redzone_offset(&self, index: MessageIndex) -> usize {
        self.message_offset(index) + self.layout.data_offset + self.config.message_data_size
    }

    /// First pattern byte for a redzone starting at `region_offset`. Derived
    /// from the offset so each redzone in the region is unique.
    fn redzone_start(region_offset: usize) -> u8 {
        ((region_offset & 0xff) ^ ((region_offset >> 8) & 0xff)) as u8
    }

    fn fill_redzone(&self, region_offset: usize) {
        let mut value = Self::redzone_start(region_offset);
        // SAFETY: same bounds argument as redzone(); we own the region during
        // initialization, which is the only caller.
        let zone =
            unsafe { std::slice::from_raw_parts_mut(self.base.add(region_offset), REDZONE_SIZE) };
        for byte in zone {
            *byte = value;
            value = value.wrapping_add(1);
        }
    }

    fn check_redzone(&self, region_offset: usize) -> bool {
        let mut value = Self::redzone_start(region_offset);
        for byte in self.redzone(region_offset) {
            if *byte != value {
                return true;
            }
            value = value.wrapping_add(1);
        }
        false
    }

    /// Write both guard patterns for a message (initialization only).
    pub(crate) fn fill_redzones(&self, index: MessageIndex) {
        self.fill_redzone(self.pre_redzone_offset(index));
        self.fill_redzone(self.post_redzone_offset(index));
        debug_assert!(!self.check_both_redzones(index));
    }

    /// True when either guard area of the message has been scribbled on.
    pub(crate) fn check_both_redzones(&self, index: MessageIndex) -> bool {
        self.check_redzone(self.pre_redzone_offset(index))
            || self.check_redzone(self.post_redzone_offset(index))
    }

    pub(crate) fn sender(&self, i: usize) -> &SenderSlot {
        debug_assert!(i < self.config.num_senders);
        // SAFETY: senders_offset + i is in bounds for i < num_senders; the
        // slot is atomics only.
        unsafe {
            &*(self
                .base
                .add(self.layout.senders_offset + i * std::mem::size_of::<SenderSlot>())
                as *const SenderSlot)
        }
    }

    pub(crate) fn pinner(&self, i: usize) -> &PinnerSlot {
        debug_assert!(i < self.config.num_pinners);
        // SAFETY: as sender(), for the pinner table.
        unsafe {
            &*(self
                .base
                .add(self.layout.pinners_offset + i * std::mem::size_of::<PinnerSlot>())
                as *const PinnerSlot)
        }
    }

    pub(crate) fn watcher(&self, i: usize) -> &WatcherSlot {
        debug_assert!(i < self.config.num_watchers);
        // SAFETY: as sender(), for the watcher table.
        unsafe {
            &*(self
                .base
                .add(self.layout.watchers_offset + i * std::mem::size_of::<WatcherSlot>())
                as *const WatcherSlot)
        }
    }

    /// Copy the caller's boot UUID into a privately held message.
    pub(crate) fn write_source_boot_uuid(&self, index: MessageIndex, uuid: &Uuid) {
        let header = self.message_header(index);
        // SAFETY: the message is in the calling sender's scratch, so nobody
        // else writes it; readers that race see the queue-index recheck fail.
        unsafe {
            *header.source_boot_uuid.get() = *uuid.as_bytes();
        }
    }

    pub(crate) fn read_source_boot_uuid(&self, index: MessageIndex) -> Uuid {
        let header = self.message_header(index);
        // SAFETY: reads may race with a sender recycling the message; the
        // reader protocol rechecks queue_index afterwards and discards the
        // value on mismatch.
        Uuid::from_bytes(unsafe { *header.source_boot_uuid.get() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::QueueIndex;

    fn test_config() -> QueueConfig {
        QueueConfig {
            num_watchers: 2,
            num_senders: 3,
            num_pinners: 1,
            queue_size: 8,
            // Deliberately not a multiple of the alignment.
            message_data_size: 101,
        }
    }

    fn heap_region(config: &QueueConfig) -> (Vec<u64>, QueueMemory) {
        let words = region_size(config).div_ceil(8);
        let storage = vec![0u64; words];
        // SAFETY: the vec provides `region_size` zeroed, 8-aligned bytes and
        // outlives the returned view in every test below.
        let mem = unsafe { QueueMemory::new(storage.as_ptr() as *mut u8, *config) };
        (storage, mem)
    }

    #[test]
    fn test_sections_are_aligned() {
        let layout = RegionLayout::new(&test_config());
        for offset in [
            layout.ring_offset,
            layout.pool_offset,
            layout.watchers_offset,
            layout.senders_offset,
            layout.pinners_offset,
            layout.total_size,
        ] {
            assert_eq!(offset % DATA_ALIGNMENT, 0, "offset {offset} misaligned");
        }
        assert_eq!(layout.message_stride % DATA_ALIGNMENT, 0);
        assert_eq!(layout.data_offset % DATA_ALIGNMENT, 0);
    }

    #[test]
    fn test_region_size_scales_with_pool() {
        let small = test_config();
        let mut big = small;
        big.num_senders += 1;
        // One more sender means one more pool message plus its slot.
        let layout = RegionLayout::new(&small);
        assert!(region_size(&big) >= region_size(&small) + layout.message_stride);
    }

    #[test]
    fn test_validate_rejects_degenerate_configs() {
        let mut config = test_config();
        config.queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.message_data_size = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.queue_size = MAX_MESSAGES;
        assert!(config.validate().is_err());

        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_redzone_roundtrip() {
        let config = test_config();
        let (_storage, mem) = heap_region(&config);
        let index = MessageIndex::new(QueueIndex::zero(config.queue_size as u32), 3);

        // Zeroed guard bytes almost never match the pattern.
        assert!(mem.check_both_redzones(index));
        mem.fill_redzones(index);
        assert!(!mem.check_both_redzones(index));
    }

    #[test]
    fn test_redzone_detects_payload_overrun() {
        let config = test_config();
        let (_storage, mem) = heap_region(&config);
        let index = MessageIndex::new(QueueIndex::zero(config.queue_size as u32), 0);
        mem.fill_redzones(index);

        // Write one byte past the end of the payload.
        // SAFETY: still inside the message stride (the post redzone).
        unsafe {
            *mem.message_data(index).add(config.message_data_size) ^= 0xff;
        }
        assert!(mem.check_both_redzones(index));
    }

    #[test]
    fn test_redzone_patterns_differ_between_messages() {
        let config = test_config();
        let (_storage, mem) = heap_region(&config);
        let a = MessageIndex::new(QueueIndex::zero(8), 0);
        let b = MessageIndex::new(QueueIndex::zero(8), 1);
        mem.fill_redzones(a);
        mem.fill_redzones(b);

        let a_zone = mem.redzone(mem.pre_redzone_offset(a)).to_vec();
        let b_zone = mem.redzone(mem.pre_redzone_offset(b)).to_vec();
        assert_ne!(a_zone, b_zone);
    }

    #[test]
    fn test_payload_pointers_are_aligned_and_disjoint() {
        let config = test_config();
        let (_storage, mem) = heap_region(&config);
        let mut previous_end = 0usize;
        for i in 0..config.num_messages() {
            let index = MessageIndex::new(QueueIndex::zero(8), i);
            let data = mem.message_data(index) as usize;
            assert_eq!(data % DATA_ALIGNMENT, 0);
            assert!(data >= previous_end);
            previous_end = data + config.message_data_size;
        }
    }

    #[test]
    fn test_source_boot_uuid_roundtrip() {
        let config = test_config();
        let (_storage, mem) = heap_region(&config);
        let index = MessageIndex::new(QueueIndex::zero(8), 2);
        let uuid = Uuid::from_bytes([7u8; 16]);
        mem.write_source_boot_uuid(index, &uuid);
        assert_eq!(mem.read_source_boot_uuid(index), uuid);
    }
}
