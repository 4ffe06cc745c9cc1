// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rtbus - lockless shared-memory message bus
//!
//! The intra-host message bus underneath a realtime robotics middleware.
//! Cooperating processes exchange typed messages on named **channels**; each
//! channel is one POSIX shared-memory region holding a lockless
//! multi-producer ring with bounded, age-based replay.
//!
//! ```text
//! +--------------------+                    +--------------------+
//! |  Process A         |   Shared memory    |  Process B         |
//! |  Sender::send() ---+--> ring buffer  ---+--> Reader::read()  |
//! |  WakeUpper ~~~~~~~~+~~ rt signal ~~~~~~~+~~> Watcher thread  |
//! +--------------------+                    +--------------------+
//! ```
//!
//! ## Key properties
//!
//! - **Hard-realtime data path**: send, read, latest-index, and pin never
//!   block, allocate, or make syscalls. The only blocking lock is the setup
//!   mutex, held during attach/detach and never on the data path.
//! - **Crash robust**: every role slot carries robust ownership; a process
//!   dying at *any* instruction mid-publish is rolled forward or backward by
//!   the recovery sweep the next time anyone attaches.
//! - **Bounded replay**: the ring holds `queue_size` messages; overwrite is
//!   rate-limited by the channel storage duration, so a reader is guaranteed
//!   that window to catch up. Pinners can hold individual messages longer.
//! - **At-most-one syscall wakeup**: publish-side wakeups are queued
//!   realtime signals delivered per-thread, priority ordered, with a
//!   transient priority boost to dodge inversion.
//!
//! ## Roles
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Channel`] | One mapped region; create or attach idempotently |
//! | [`Sender`] | Owns a scratch message; publishes by ring swap |
//! | [`Reader`] | Stateless optimistic reads with overwrite detection |
//! | [`Pinner`] | Holds one past message out of the overwrite cycle |
//! | [`Watcher`] | Registers a thread for publish signals |
//! | [`WakeUpper`] | Delivers those signals, priority ordered |
//!
//! Delivery is best-effort: a wrapped-past message is gone. Cross-machine
//! transport and dynamic channel creation live in layers above.

/// Channel lifecycle (create-or-attach, region initialization, uid policy).
pub mod channel;
/// Region dump for operator tooling.
pub mod dump;
/// SHARED futex wait/wake wrappers.
pub mod futex;
/// Wrap-aware queue and message-pool indices.
pub mod index;
/// Region layout, message headers, redzones.
pub mod layout;
/// The robust setup mutex.
pub mod mutex;
/// Robust slot ownership (TID word + owner-died harvesting).
pub mod ownership;
/// The pinner role.
pub mod pinner;
/// The reader side (optimistic reads, latest-index).
pub mod reader;
/// Crash-recovery sweep run on attach.
pub mod recovery;
/// Process-local channel registry.
pub mod registry;
/// POSIX shared memory segments.
pub mod segment;
/// The sender role and publish algorithm.
pub mod sender;
/// Clocks and CAS-populated shared timestamps.
pub mod time;
/// Boot identity.
pub mod uuid;
/// Watchers and the signal-delivering wake-upper.
pub mod watcher;

pub use channel::Channel;
pub use dump::{dump_channel, DumpOptions};
pub use layout::{region_size, QueueConfig, REDZONE_SIZE};
pub use pinner::Pinner;
pub use reader::{Context, ReadResult, Reader};
pub use registry::ChannelRegistry;
pub use segment::Segment;
pub use sender::{SendError, SendMetadata, Sender, Sent, NO_REMOTE_QUEUE_INDEX};
pub use time::{MonotonicTime, RealtimeTime};
pub use uuid::Uuid;
pub use watcher::{wakeup_signal, WakeUpper, Watcher};

use std::fmt;
use std::io;

/// Errors from channel setup and attachment. The data path never produces
/// these; its outcomes are [`ReadResult`] and [`SendError`].
#[derive(Debug)]
pub enum BusError {
    /// Shared memory segment creation or open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Invalid segment name
    InvalidName(String),

    /// Segment not found
    NotFound(String),

    /// Region file size disagrees with the configured layout
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Degenerate or oversized queue configuration
    InvalidConfig(QueueConfig),

    /// Region was initialized with a different configuration
    ConfigMismatch {
        existing: QueueConfig,
        requested: QueueConfig,
    },

    /// Region belongs to a different user; signals could not be exchanged.
    /// Fatal for the attaching process.
    UidMismatch { region: u32, caller: u32 },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
            Self::SizeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "segment {name} is {actual} bytes, layout requires {expected}"
            ),
            Self::InvalidConfig(config) => write!(f, "invalid queue configuration: {config:?}"),
            Self::ConfigMismatch {
                existing,
                requested,
            } => write!(
                f,
                "region initialized with {existing:?}, caller requested {requested:?}"
            ),
            Self::UidMismatch { region, caller } => write!(
                f,
                "region owned by uid {region} but caller resolves to uid {caller}; log in as the \
                 owning user to access this channel"
            ),
        }
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for bus setup operations
pub type Result<T> = std::result::Result<T, BusError>;
