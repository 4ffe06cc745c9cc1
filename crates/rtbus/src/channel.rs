// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel lifecycle: mapping the region and initializing it exactly once.
//!
//! Any number of processes may race to open the same channel. The segment
//! layer guarantees they all end up mapping the same correctly-sized file;
//! the setup mutex inside the region decides which one initializes. If the
//! initializer dies partway through, `initialized` is still 0 (it is written
//! last), so the next acquirer simply redoes initialization from the top on
//! the zeroed region.
//!
//! # UID policy
//!
//! Wakeup signals are delivered with `rt_tgsigqueueinfo`, which the kernel
//! only permits between processes whose real or effective UID matches the
//! target's real or saved set-UID. Processes attach in arbitrary order, so
//! the check must give the same answer regardless of order: the region
//! records a single UID at init time - the caller's euid when `euid == suid`
//! (letting a process keep a privileged ruid while communicating under a
//! lower euid), otherwise its ruid - and every later attacher must produce
//! the same UID by the same rule. A mismatch is fatal for the attacher and
//! leaves the region untouched.

use crate::index::{MessageIndex, QueueIndex};
use crate::layout::{region_size, QueueConfig, QueueMemory};
use crate::segment::Segment;
use crate::{BusError, Result};
use std::sync::atomic::{fence, Ordering};

/// UID recorded in (and required by) a channel region, per the policy above.
fn queue_uid() -> u32 {
    let mut ruid: libc::uid_t = 0;
    let mut euid: libc::uid_t = 0;
    let mut suid: libc::uid_t = 0;
    // SAFETY: three valid out-pointers; getresuid cannot fail with them.
    let rc = unsafe { libc::getresuid(&mut ruid, &mut euid, &mut suid) };
    debug_assert_eq!(rc, 0);
    if euid == suid {
        euid
    } else {
        ruid
    }
}

/// One mapped channel. Roles borrow this; it must outlive them.
pub struct Channel {
    segment: Segment,
    config: QueueConfig,
}

impl Channel {
    /// Map the named channel, creating and initializing the region if this
    /// caller gets there first. Idempotent across processes; runs the
    /// crash-recovery-aware initialization protocol every time.
    pub fn open_or_create(name: &str, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let segment = Segment::open_or_create(name, region_size(&config))?;
        // SAFETY: the segment is exactly region_size bytes (verified by the
        // segment layer) and page-aligned; it lives as long as the Channel.
        let mem = unsafe { QueueMemory::new(segment.as_ptr(), config) };
        initialize_queue_memory(&mem)?;
        Ok(Self { segment, config })
    }

    /// Remove the channel name from the system. Existing mappings continue
    /// to work; the region is reclaimed once the last one goes away.
    pub fn unlink(name: &str) -> Result<()> {
        Segment::unlink(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Payload capacity of each message.
    #[must_use]
    pub fn message_data_size(&self) -> usize {
        self.config.message_data_size
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.config.queue_size
    }

    pub(crate) fn memory(&self) -> QueueMemory {
        // SAFETY: same argument as in open_or_create; the segment is owned
        // by self and every QueueMemory copy is tied to a borrow of self.
        unsafe { QueueMemory::new(self.segment.as_ptr(), self.config) }
    }

    /// Read the configuration out of an existing region without attaching.
    /// Returns the config plus whether initialization has completed. Lets
    /// tooling discover a channel's shape before mapping the whole region.
    pub fn peek_config(name: &str) -> Result<(QueueConfig, bool)> {
        use crate::layout::QueueHeader;
        use std::ffi::CString;

        let c_name = CString::new(name).map_err(|_| BusError::InvalidName(name.to_string()))?;
        // SAFETY: valid C string; read-only open never creates or resizes.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::NotFound {
                return Err(BusError::NotFound(name.to_string()));
            }
            return Err(BusError::SegmentOpen(err));
        }

        let header_size = std::mem::size_of::<QueueHeader>();
        // SAFETY: mapping just the header; any region is at least that big
        // (the layout starts with it). MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                header_size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: the mapping (if any) holds its own reference to the file.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(BusError::Mmap(std::io::Error::last_os_error()));
        }

        // SAFETY: the mapping covers a full QueueHeader and its fields are
        // all atomics.
        let header = unsafe { &*(ptr as *const QueueHeader) };
        let config = header.config();
        let initialized = header.initialized.load(Ordering::Acquire) != 0;
        // SAFETY: unmapping the mapping created above, exactly once.
        unsafe { libc::munmap(ptr, header_size) };

        Ok((config, initialized))
    }
}

/// Initialize the region if nobody has, else verify it; called with every
/// attach. Holds the setup mutex throughout.
pub(crate) fn initialize_queue_memory(mem: &QueueMemory) -> Result<()> {
    let uid = queue_uid();
    let header = mem.header();
    let config = *mem.config();

    // We don't care whether a previous holder of the lock died: either
    // initialized is still 0 and we redo everything on the zeroed region, or
    // it is 1 and the region is self-consistent.
    let (_guard, _owner_died) = header.setup_lock.lock();

    if header.initialized.load(Ordering::Acquire) == 0 {
        let queue_size = mem.queue_size();

        header
            .num_watchers
            .store(config.num_watchers as u64, Ordering::Relaxed);
        header
            .num_senders
            .store(config.num_senders as u64, Ordering::Relaxed);
        header
            .num_pinners
            .store(config.num_pinners as u64, Ordering::Relaxed);
        header
            .queue_size
            .store(config.queue_size as u64, Ordering::Relaxed);
        header
            .message_data_size
            .store(config.message_data_size as u64, Ordering::Relaxed);

        for i in 0..config.num_messages() {
            let index = MessageIndex::new(QueueIndex::zero(queue_size), i);
            mem.message_header(index).queue_index.invalidate();
            mem.message_header(index).invalidate_send_times();
            mem.fill_redzones(index);
        }

        for i in 0..config.queue_size {
            // Seed each slot one full generation in the past, so the first
            // real publish at that slot always wins its compare-exchange.
            let ancient = QueueIndex::zero(queue_size)
                .increment_by(i as u32)
                .decrement_by(queue_size);
            mem.queue(i).store(MessageIndex::new(ancient, i));
        }

        header.next_queue_index.invalidate();
        header.uid.store(uid, Ordering::Relaxed);

        for i in 0..config.num_senders {
            let sender = mem.sender(i);
            // Nobody else can touch these until initialized flips to 1.
            sender.scratch_index.relaxed_store(MessageIndex::new(
                QueueIndex::invalid(queue_size),
                config.queue_size + i,
            ));
            sender.to_replace.relaxed_invalidate();
        }

        for i in 0..config.num_pinners {
            let pinner = mem.pinner(i);
            pinner.scratch_index.relaxed_store(MessageIndex::new(
                QueueIndex::invalid(queue_size),
                config.queue_size + config.num_senders + i,
            ));
            pinner.pinned.invalidate();
        }

        fence(Ordering::SeqCst);
        // Signal everything is done. This must be last, so if we die here,
        // the next acquirer redoes initialization.
        header.initialized.store(1, Ordering::Release);
        return Ok(());
    }

    // Already initialized: this caller must agree on the shape and identity.
    let existing = header.config();
    if existing != config {
        log::error!(
            "[channel] configuration mismatch: region has {existing:?}, caller wants {config:?}"
        );
        return Err(BusError::ConfigMismatch {
            existing,
            requested: config,
        });
    }

    let memory_uid = header.uid.load(Ordering::Relaxed);
    if memory_uid != uid {
        log::error!(
            "[channel] uid mismatch: region owned by uid {memory_uid}, caller resolves to uid \
             {uid}; signals between these processes would not be deliverable"
        );
        return Err(BusError::UidMismatch {
            region: memory_uid,
            caller: uid,
        });
    }

    Ok(())
}
