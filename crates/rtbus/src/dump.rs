// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Region dump for operator tooling.
//!
//! Renders everything in a channel region: header, ring slots with their
//! generations, every pool message with a redzone verdict, and the three
//! role tables. Not on any hot path; used by `rtbus-shm-dump` and by humans
//! staring at a misbehaving channel.

use crate::channel::Channel;
use crate::index::{MessageIndex, QueueIndex};
use crate::layout::QueueMemory;
use crate::ownership::{OwnershipSnapshot, FUTEX_OWNER_DIED, FUTEX_TID_MASK, FUTEX_WAITERS};
use crate::time::MonotonicTime;
use crate::time::RealtimeTime;
use std::io::{self, Write};

/// What to include in a dump.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpOptions {
    /// Also hex-dump each message's payload.
    pub dump_data: bool,
}

fn format_queue_index(index: QueueIndex) -> String {
    if index.valid() {
        format!("{:#010x} (slot {})", index.index(), index.wrapped())
    } else {
        "(invalid)".to_string()
    }
}

fn format_message_index(index: MessageIndex) -> String {
    if index.valid() {
        format!("{:#010x} -> message {}", index.get(), index.message_index())
    } else {
        "(invalid)".to_string()
    }
}

fn format_futex_word(raw: u32) -> String {
    if raw == 0 {
        return format!("{raw:#x}");
    }
    let mut flags = String::new();
    if raw & FUTEX_OWNER_DIED != 0 {
        flags.push_str("OWNER_DIED|");
    }
    if raw & FUTEX_WAITERS != 0 {
        flags.push_str("WAITERS|");
    }
    format!("{:#x}:{}tid={}", raw, flags, raw & FUTEX_TID_MASK)
}

fn format_ownership(snapshot: OwnershipSnapshot, pid: i32) -> String {
    if snapshot.is_unclaimed() {
        "(unclaimed)".to_string()
    } else if snapshot.owner_died() {
        "(owner died)".to_string()
    } else {
        format!("tid={} pid={pid}", snapshot.tid())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write a human-readable rendering of the whole region to `out`.
pub fn dump_channel(
    channel: &Channel,
    options: &DumpOptions,
    out: &mut dyn Write,
) -> io::Result<()> {
    dump_memory(&channel.memory(), channel.name(), options, out)
}

pub(crate) fn dump_memory(
    mem: &QueueMemory,
    name: &str,
    options: &DumpOptions,
    out: &mut dyn Write,
) -> io::Result<()> {
    let header = mem.header();
    let config = mem.config();
    let queue_size = mem.queue_size();

    writeln!(out, "channel {name} {{")?;
    writeln!(
        out,
        "  setup_lock = {}",
        format_futex_word(header.setup_lock.raw())
    )?;
    writeln!(
        out,
        "  initialized = {}",
        header
            .initialized
            .load(std::sync::atomic::Ordering::Acquire)
            != 0
    )?;
    writeln!(out, "  config {{")?;
    writeln!(out, "    num_watchers = {}", config.num_watchers)?;
    writeln!(out, "    num_senders = {}", config.num_senders)?;
    writeln!(out, "    num_pinners = {}", config.num_pinners)?;
    writeln!(out, "    queue_size = {}", config.queue_size)?;
    writeln!(out, "    message_data_size = {}", config.message_data_size)?;
    writeln!(out, "  }}")?;
    writeln!(
        out,
        "  next_queue_index = {}",
        format_queue_index(header.next_queue_index.load(queue_size))
    )?;
    writeln!(
        out,
        "  uid = {}",
        header.uid.load(std::sync::atomic::Ordering::Relaxed)
    )?;

    writeln!(out, "  queue[{}] {{", config.queue_size)?;
    for i in 0..config.queue_size {
        writeln!(
            out,
            "    [{i}] -> {}",
            format_message_index(mem.queue(i).load())
        )?;
    }
    writeln!(out, "  }}")?;

    writeln!(out, "  messages[{}] {{", mem.num_messages())?;
    for i in 0..mem.num_messages() {
        let index = MessageIndex::new(QueueIndex::zero(queue_size), i);
        let message = mem.message_header(index);
        let corrupt = mem.check_both_redzones(index);
        writeln!(out, "    [{i}] {{")?;
        writeln!(
            out,
            "      queue_index = {}",
            format_queue_index(message.queue_index.load(queue_size))
        )?;
        writeln!(
            out,
            "      monotonic_sent_time = {}",
            message.monotonic_sent_time()
        )?;
        writeln!(
            out,
            "      realtime_sent_time = {}",
            message.realtime_sent_time()
        )?;
        writeln!(
            out,
            "      monotonic_remote_time = {}",
            MonotonicTime::from_nanos(message.monotonic_remote_time.load())
        )?;
        writeln!(
            out,
            "      realtime_remote_time = {}",
            RealtimeTime::from_nanos(message.realtime_remote_time.load())
        )?;
        writeln!(
            out,
            "      length = {}",
            message.length.load(std::sync::atomic::Ordering::Relaxed)
        )?;
        if corrupt {
            writeln!(out, "      *** DATA REDZONES ARE CORRUPTED ***")?;
        }
        if options.dump_data {
            let length = message.length.load(std::sync::atomic::Ordering::Relaxed) as usize;
            let shown = if corrupt {
                mem.message_data_size()
            } else {
                length.min(mem.message_data_size())
            };
            // SAFETY: the payload is message_data_size bytes; dumps race
            // with senders by nature and may show torn bytes.
            let data =
                unsafe { std::slice::from_raw_parts(mem.message_data(index), shown) };
            writeln!(out, "      data = {}", hex(data))?;
        }
        writeln!(out, "    }}")?;
    }
    writeln!(out, "  }}")?;

    writeln!(out, "  senders[{}] {{", config.num_senders)?;
    for i in 0..config.num_senders {
        let sender = mem.sender(i);
        writeln!(out, "    [{i}] {{")?;
        writeln!(
            out,
            "      ownership = {}",
            format_ownership(sender.ownership.load(), sender.ownership.owner_pid())
        )?;
        writeln!(
            out,
            "      scratch_index = {}",
            format_message_index(sender.scratch_index.load())
        )?;
        writeln!(
            out,
            "      to_replace = {}",
            format_message_index(sender.to_replace.load())
        )?;
        writeln!(out, "    }}")?;
    }
    writeln!(out, "  }}")?;

    writeln!(out, "  pinners[{}] {{", config.num_pinners)?;
    for i in 0..config.num_pinners {
        let pinner = mem.pinner(i);
        writeln!(out, "    [{i}] {{")?;
        writeln!(
            out,
            "      ownership = {}",
            format_ownership(pinner.ownership.load(), pinner.ownership.owner_pid())
        )?;
        writeln!(
            out,
            "      scratch_index = {}",
            format_message_index(pinner.scratch_index.load())
        )?;
        writeln!(
            out,
            "      pinned = {}",
            format_queue_index(pinner.pinned.load(queue_size))
        )?;
        writeln!(out, "    }}")?;
    }
    writeln!(out, "  }}")?;

    writeln!(out, "  watchers[{}] {{", config.num_watchers)?;
    for i in 0..config.num_watchers {
        let watcher = mem.watcher(i);
        writeln!(out, "    [{i}] {{")?;
        writeln!(
            out,
            "      ownership = {}",
            format_ownership(watcher.ownership.load(), watcher.ownership.owner_pid())
        )?;
        writeln!(
            out,
            "      pid = {}",
            watcher.pid.load(std::sync::atomic::Ordering::Relaxed)
        )?;
        writeln!(
            out,
            "      priority = {}",
            watcher.priority.load(std::sync::atomic::Ordering::Relaxed)
        )?;
        writeln!(out, "    }}")?;
    }
    writeln!(out, "  }}")?;

    writeln!(out, "}}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::QueueConfig;
    use crate::sender::{SendMetadata, Sender};
    use crate::test_support::TestRegion;
    use std::time::Duration;

    fn test_config() -> QueueConfig {
        QueueConfig {
            num_watchers: 1,
            num_senders: 1,
            num_pinners: 1,
            queue_size: 2,
            message_data_size: 16,
        }
    }

    #[test]
    fn test_dump_fresh_region() {
        let region = TestRegion::new(test_config());
        let mut out = Vec::new();
        dump_memory(&region.mem, "/rtbus_test", &DumpOptions::default(), &mut out)
            .expect("dump failed");
        let text = String::from_utf8(out).expect("dump not utf-8");

        assert!(text.contains("channel /rtbus_test {"));
        assert!(text.contains("initialized = true"));
        assert!(text.contains("queue_size = 2"));
        assert!(text.contains("next_queue_index = (invalid)"));
        // No payload hex without dump_data.
        assert!(!text.contains("data = "));
    }

    #[test]
    fn test_dump_shows_published_message() {
        let region = TestRegion::new(test_config());
        let mut sender =
            Sender::attach_memory(region.mem, Duration::from_micros(1)).expect("attach");
        sender
            .send_bytes(b"\xde\xad", &SendMetadata::local())
            .expect("send failed");

        let mut out = Vec::new();
        let options = DumpOptions { dump_data: true };
        dump_memory(&region.mem, "/rtbus_test", &options, &mut out).expect("dump failed");
        let text = String::from_utf8(out).expect("dump not utf-8");

        assert!(text.contains("length = 2"));
        assert!(text.contains("data = dead"));
        assert!(!text.contains("CORRUPTED"));
    }

    #[test]
    fn test_dump_flags_corruption() {
        let region = TestRegion::new(test_config());
        let index = MessageIndex::new(QueueIndex::zero(2), 0);
        // SAFETY: one byte into the post redzone, still inside the stride.
        unsafe {
            *region
                .mem
                .message_data(index)
                .add(test_config().message_data_size) ^= 0xff;
        }

        let mut out = Vec::new();
        dump_memory(&region.mem, "/rtbus_test", &DumpOptions::default(), &mut out)
            .expect("dump failed");
        let text = String::from_utf8(out).expect("dump not utf-8");
        assert!(text.contains("*** DATA REDZONES ARE CORRUPTED ***"));
    }
}
