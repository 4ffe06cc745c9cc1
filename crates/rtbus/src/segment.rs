// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap`. Unlike a
//! single-owner transport segment, a channel region is created by *whichever
//! process gets there first*: `open_or_create` never unlinks an existing
//! segment and never fails because the segment already exists. The setup
//! mutex inside the region (not the filesystem) decides who initializes.
//!
//! A fresh segment is sized with `ftruncate` (POSIX guarantees the new bytes
//! read as zero); an existing one is only accepted if its file size matches
//! the expected region size exactly.
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`.
//! Example: `/rtbus_imu_raw`.

use crate::{BusError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped shared memory segment.
///
/// Automatically unmaps on drop. Does NOT automatically unlink the segment;
/// channel regions are expected to outlive any one process.
pub struct Segment {
    /// Pointer to mapped memory region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name (for unlink)
    name: String,
}

// SAFETY: The mapping is shared memory designed for concurrent access; all
// coordination happens through the atomics stored inside it.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Open the named segment, creating and sizing it if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the name is malformed, the segment exists with a different
    /// size, or any of the underlying syscalls fail.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| BusError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid null-terminated string. O_CREAT without
        // O_EXCL either creates the segment or opens the existing one; both
        // outcomes are wanted here. 0o600 keeps the region private to the
        // owning user (the uid policy assumes attachers share identity).
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(BusError::SegmentOpen(io::Error::last_os_error()));
        }

        let result = Self::size_and_map(fd, name, size);
        // SAFETY: fd is valid from the successful shm_open above; the mapping
        // (if any) holds its own reference, so closing is always safe here.
        unsafe { libc::close(fd) };
        result
    }

    /// Open an existing segment; never creates.
    ///
    /// # Errors
    ///
    /// Fails if the segment doesn't exist or its size doesn't match.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| BusError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid null-terminated string; without O_CREAT
        // the mode argument is ignored and no segment is ever created.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(BusError::NotFound(name.to_string()));
            }
            return Err(BusError::SegmentOpen(err));
        }

        let result = Self::size_and_map(fd, name, size);
        // SAFETY: as in open_or_create.
        unsafe { libc::close(fd) };
        result
    }

    fn size_and_map(fd: i32, name: &str, size: usize) -> Result<Self> {
        // SAFETY: zeroed stat buffer is a valid out-parameter; fd is a live
        // descriptor owned by the caller.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fstat writes only into the provided buffer.
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            return Err(BusError::SegmentOpen(io::Error::last_os_error()));
        }

        if stat.st_size == 0 {
            // Fresh segment: size it. Two creators racing both truncate to
            // the same value, so the race is benign.
            // SAFETY: fd is valid and size fits in off_t for any real region.
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
                return Err(BusError::SegmentOpen(io::Error::last_os_error()));
            }
        } else if stat.st_size as usize != size {
            // A region of the wrong shape means somebody initialized this
            // channel with a different configuration. Refusing is the only
            // safe option.
            return Err(BusError::SizeMismatch {
                name: name.to_string(),
                expected: size,
                actual: stat.st_size as usize,
            });
        }

        // SAFETY: null hint lets the kernel pick the address; the protection
        // and MAP_SHARED flags match how the region is used; fd is valid and
        // the file is at least `size` bytes after the check above. MAP_FAILED
        // is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(BusError::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Validate segment name follows POSIX rules
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(BusError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(BusError::InvalidName(format!(
                "segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(BusError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a segment by name. Existing mappings stay alive; the
    /// name disappears. Not-found is treated as success so cleanup paths can
    /// be idempotent.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| BusError::InvalidName(name.to_string()))?;

        // SAFETY: shm_unlink only touches the filesystem namespace; it is
        // safe for any name, existing or not.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(BusError::SegmentOpen(err));
            }
        }

        Ok(())
    }

    /// Get raw pointer to the mapped memory
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Get the size of the mapping
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the segment name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from the successful mmap in size_and_map and
        // have not been unmapped; Drop runs at most once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        // The name is not unlinked here; regions outlive processes.
    }
}
