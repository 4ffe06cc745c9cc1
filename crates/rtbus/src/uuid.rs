// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Boot identity for published messages.
//!
//! Every message records the 16-byte UUID of the boot it was sent from, so a
//! log reader can tell two reboots of the same node apart. On Linux this is
//! the kernel's `/proc/sys/kernel/random/boot_id`.

use std::fmt;
use std::sync::OnceLock;

/// A 16-byte UUID carried in message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The all-zero UUID, used when the caller has no identity to pass.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 16])
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// UUID of the current boot, read once from the kernel and cached.
    /// Falls back to the zero UUID if the proc file is unavailable (non-Linux
    /// or heavily sandboxed environments).
    #[must_use]
    pub fn boot_uuid() -> Self {
        static BOOT: OnceLock<Uuid> = OnceLock::new();
        *BOOT.get_or_init(|| {
            std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
                .ok()
                .and_then(|s| Self::parse(s.trim()))
                .unwrap_or_else(Self::zero)
        })
    }

    /// Parse the canonical `8-4-4-4-12` hex form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 16];
        let mut nibbles = s.chars().filter(|c| *c != '-');
        for byte in &mut bytes {
            let hi = nibbles.next()?.to_digit(16)?;
            let lo = nibbles.next()?.to_digit(16)?;
            *byte = ((hi << 4) | lo) as u8;
        }
        if nibbles.next().is_some() {
            return None;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
