//! Memory segments backing every shared region in the runtime.
//!
//! A [`Segment`] is a contiguous, zero-initialized byte region. Two backings
//! are supported:
//!
//! - **Anonymous**: a private mapping for a single-process worker pool. This
//!   is the default; all workers are threads sharing the same address space.
//! - **File**: a shared file mapping, so a second process can attach with
//!   [`SegmentRo::open`] and read the same bytes.
//!
//! The segment hands out raw pointers. Synchronization of the contents is
//! entirely the caller's protocol (headers, atomics, CAS loops); the segment
//! itself only guarantees the mapping stays valid for its lifetime.

use memmap2::{Mmap, MmapMut};
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// A writable byte region, anonymous or file-backed.
///
/// Cloneable handles are obtained by wrapping the segment in an `Arc`;
/// views into the region (bus readers, deque pools, signal tables) hold a
/// strong reference so they can never outlive the mapping.
pub struct Segment {
    /// File handle kept alive to maintain the map validity (file backing only).
    _file: Option<File>,
    /// The mapping itself. Never accessed directly after construction.
    _map: MmapMut,
    /// Base address, cached so `&self` access works across threads.
    base: *mut u8,
    len: usize,
}

/// A read-only attach to an existing file-backed segment.
pub struct SegmentRo {
    _file: File,
    _map: Mmap,
    base: *const u8,
    len: usize,
}

// SAFETY: the mapping is valid for the segment's lifetime and the base
// pointer is stable. Concurrent access to the bytes is governed by the
// protocols layered on top (atomic headers, seqlock-style slots, exclusive
// slabs); the segment never reads or writes its own contents.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}
unsafe impl Send for SegmentRo {}
unsafe impl Sync for SegmentRo {}

impl Segment {
    /// Create an anonymous zero-filled segment of `len` bytes.
    pub fn anon(len: usize) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(len)?;
        let base = map.as_mut_ptr();
        Ok(Self {
            _file: None,
            _map: map,
            base,
            len,
        })
    }

    /// Create a file of `len` bytes at `path` and map it read-write.
    /// Truncates any existing file, so the region starts zero-filled.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        Ok(Self {
            _file: Some(file),
            _map: map,
            base,
            len,
        })
    }

    /// Map an existing file read-write.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let len = map.len();
        Ok(Self {
            _file: Some(file),
            _map: map,
            base,
            len,
        })
    }

    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero a byte range of the region.
    ///
    /// Used between runs to wipe result slabs. The caller must guarantee no
    /// concurrent access to the range (the scheduler only wipes while all
    /// workers are parked between runs).
    pub fn zero_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "zero_range out of bounds"
        );
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe { std::ptr::write_bytes(self.base.add(offset), 0, len) };
    }
}

impl SegmentRo {
    /// Map an existing file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        let base = map.as_ptr();
        let len = map.len();
        Ok(Self {
            _file: file,
            _map: map,
            base,
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
