// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The pinner role: holding one past message out of circulation.
//!
//! A reader that wants unbounded time with a payload (zero-copy dispatch,
//! slow consumers) pins its queue index. The handshake with senders is
//! write-then-verify: the pinner advertises the index in its `pinned` field,
//! then confirms the ring still resolves that index to the same publication.
//! If a sender evicts the pinned message later, it doesn't overwrite it - it
//! trades scratches with the pinner (see `sender.rs`), so the pinned bytes
//! stay untouched in the pool at the same message index for as long as the
//! pin lasts.
//!
//! The pinner's scratch is exactly the spare message that makes this trade
//! always possible; that's why the pool holds one extra message per pinner.

use crate::channel::Channel;
use crate::index::QueueIndex;
use crate::layout::QueueMemory;
use crate::recovery::cleanup;
use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

/// An attached pinner. Dropping it releases the pin and the slot.
pub struct Pinner<'a> {
    mem: QueueMemory,
    pinner_index: usize,
    /// Pool position of the currently pinned message. Process-local: the
    /// position never changes while the pin holds, even if senders trade
    /// the message into our scratch.
    pinned_message: Option<usize>,
    /// Slot ownership is tracked by TID; the handle must stay on the thread
    /// that attached (the raw pointer keeps this !Send).
    _channel: PhantomData<(&'a Channel, *const ())>,
}

impl<'a> Pinner<'a> {
    /// Claim a pinner slot, running the recovery sweep first. Returns `None`
    /// when every slot is taken by a live owner.
    pub fn attach(channel: &'a Channel) -> Option<Self> {
        Self::attach_memory(channel.memory())
    }

    pub(crate) fn attach_memory(mem: QueueMemory) -> Option<Self> {
        let header = mem.header();
        let (guard, _owner_died) = header.setup_lock.lock();
        cleanup(&mem, &guard);

        let num_pinners = mem.config().num_pinners;
        let mut pinner_index = None;
        for i in 0..num_pinners {
            // Claims are serialized by the setup mutex we hold.
            if mem.pinner(i).ownership.relaxed_load().is_unclaimed() {
                pinner_index = Some(i);
                break;
            }
        }
        let Some(pinner_index) = pinner_index else {
            log::debug!("[pinner] all pinner slots claimed, bailing");
            return None;
        };

        let pinner = mem.pinner(pinner_index);
        pinner.pinned.invalidate();
        pinner.ownership.acquire();

        Some(Self {
            mem,
            pinner_index,
            pinned_message: None,
            _channel: PhantomData,
        })
    }

    /// Try to pin the message at `queue_index`. On success returns its pool
    /// position, which stays valid until the next pin or drop. Fails when
    /// the publication is already gone from the ring.
    ///
    /// Never touches any scratch index, so it cannot interfere with message
    /// ownership; hard-realtime safe.
    pub fn pin_index(&mut self, queue_index: u32) -> Option<usize> {
        let queue_size = self.mem.queue_size();
        let requested = QueueIndex::zero(queue_size).increment_by(queue_index);
        let pinner = self.mem.pinner(self.pinner_index);

        // Advertise the pin first; a sender that evicts this message after
        // the fence is guaranteed to see it and trade instead of recycling.
        pinner.pinned.store(requested);
        fence(Ordering::SeqCst);

        let message_index = self.mem.queue(requested.wrapped()).load();
        debug_assert!(
            !self.mem.check_both_redzones(message_index),
            "corrupt message found in shared memory"
        );

        let message_queue_index = self
            .mem
            .message_header(message_index)
            .queue_index
            .load(queue_size);
        if message_queue_index == requested {
            fence(Ordering::SeqCst);
            self.pinned_message = Some(message_index.message_index());
            return self.pinned_message;
        }

        // The message was recycled before our pin could take; back it out.
        log::trace!(
            "[pinner] index {:#x} already recycled, unpinning",
            requested.index()
        );
        pinner.pinned.invalidate();
        self.pinned_message = None;
        None
    }

    /// Payload capacity.
    #[must_use]
    pub fn size(&self) -> usize {
        self.mem.message_data_size()
    }

    /// Payload of the pinned message; `None` when nothing is pinned.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        let message_index = self.pinned_message?;
        let offset_index = crate::index::MessageIndex::new(
            QueueIndex::zero(self.mem.queue_size()),
            message_index,
        );
        // SAFETY: the pinned message cannot be recycled while our `pinned`
        // entry names it (senders trade instead), so the bytes are stable.
        Some(unsafe {
            std::slice::from_raw_parts(self.mem.message_data(offset_index), self.size())
        })
    }

    /// Valid payload length of the pinned message, if any.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        let message_index = self.pinned_message?;
        let offset_index = crate::index::MessageIndex::new(
            QueueIndex::zero(self.mem.queue_size()),
            message_index,
        );
        Some(
            self.mem
                .message_header(offset_index)
                .length
                .load(Ordering::Relaxed) as usize,
        )
    }
}

impl Drop for Pinner<'_> {
    fn drop(&mut self) {
        let pinner = self.mem.pinner(self.pinner_index);
        pinner.pinned.invalidate();
        fence(Ordering::SeqCst);
        pinner.ownership.release();
    }
}
