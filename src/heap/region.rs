/*!
 * Mapped Region
 * Shared file mapping with atomic word access and a persistence barrier
 */

use crate::config::SyncMode;
use crate::core::limits::PERSIST_PAGE;
use crate::core::{HeapError, HeapResult};
use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use tracing::{debug, warn};

/// A `MAP_SHARED` read/write mapping of a whole heap file
///
/// All durable state is read and written through this type. Word and byte
/// accesses are atomic so that a crash never exposes a torn 8-byte store.
pub struct MappedRegion {
    base: NonNull<c_void>,
    len: usize,
    sync: SyncMode,
}

// The mapping is plain shared memory; callers serialise mutation through the heap file lock
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `file` starting at offset 0
    pub fn map(file: &File, len: usize, sync: SyncMode) -> HeapResult<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| HeapError::InvalidArgument("cannot map an empty file".to_string()))?;

        // SAFETY: fresh mapping chosen by the kernel; the file outlives the call
        // and MAP_SHARED keeps the pages valid after the descriptor is closed.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        debug!(len, ?sync, "Mapped heap region");
        Ok(Self { base, len, sync })
    }

    #[inline]
    fn ptr_at(&self, offset: u64, width: usize) -> *mut u8 {
        let offset = offset as usize;
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.len),
            "region access {}+{} beyond mapping of {} bytes",
            offset,
            width,
            self.len
        );
        // SAFETY: bounds checked above
        unsafe { (self.base.as_ptr() as *mut u8).add(offset) }
    }

    #[inline]
    fn word(&self, offset: u64) -> &AtomicU64 {
        debug_assert_eq!(offset % 8, 0, "unaligned word access at {}", offset);
        // SAFETY: in bounds, 8-byte aligned (mapping is page aligned), lives as long as &self
        unsafe { &*(self.ptr_at(offset, 8) as *const AtomicU64) }
    }

    #[inline]
    fn byte(&self, offset: u64) -> &AtomicU8 {
        // SAFETY: in bounds, lives as long as &self
        unsafe { &*(self.ptr_at(offset, 1) as *const AtomicU8) }
    }

    #[inline]
    pub fn load_u64(&self, offset: u64) -> u64 {
        self.word(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u64(&self, offset: u64, value: u64) {
        self.word(offset).store(value, Ordering::Release);
    }

    #[inline]
    pub fn load_i64(&self, offset: u64) -> i64 {
        self.load_u64(offset) as i64
    }

    #[inline]
    pub fn store_i64(&self, offset: u64, value: i64) {
        self.store_u64(offset, value as u64);
    }

    #[inline]
    pub fn load_u8(&self, offset: u64) -> u8 {
        self.byte(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u8(&self, offset: u64, value: u8) {
        self.byte(offset).store(value, Ordering::Release);
    }

    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) {
        let src = self.ptr_at(offset, buf.len());
        // SAFETY: bounds checked; buf is a distinct allocation
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let dst = self.ptr_at(offset, data.len());
        // SAFETY: bounds checked; data is a distinct allocation
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    pub fn fill(&self, offset: u64, len: usize, value: u8) {
        let dst = self.ptr_at(offset, len);
        // SAFETY: bounds checked
        unsafe { std::ptr::write_bytes(dst, value, len) };
    }

    /// Make `[offset, offset + len)` durable before any later store
    pub fn persist(&self, offset: u64, len: usize) -> HeapResult<()> {
        fence(Ordering::SeqCst);
        if self.sync == SyncMode::Msync && len > 0 {
            let start = (offset as usize) & !(PERSIST_PAGE - 1);
            let end = (offset as usize + len).min(self.len);
            // SAFETY: page-aligned sub-range of our own mapping
            unsafe {
                let addr = NonNull::new_unchecked((self.base.as_ptr() as *mut u8).add(start))
                    .cast::<c_void>();
                msync(addr, end - start, MsFlags::MS_SYNC)?;
            }
        }
        Ok(())
    }

    /// Flush the whole mapping regardless of sync mode
    pub fn flush(&self) -> HeapResult<()> {
        fence(Ordering::SeqCst);
        // SAFETY: the whole mapping
        unsafe { msync(self.base, self.len, MsFlags::MS_SYNC)? };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: base/len came from mmap and no references outlive &mut self
        if let Err(err) = unsafe { munmap(self.base, self.len) } {
            warn!(error = %err, "munmap failed");
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.len)
            .field("sync", &self.sync)
            .finish()
    }
}
