//! Page-granular anonymous memory handed out by the support session.
//!
//! The memory is mapped with:
//! - `PROT_READ | PROT_WRITE | PROT_EXEC`: the privileged layer may place
//!   code in it
//! - `MAP_PRIVATE | MAP_ANONYMOUS`: not backed by any file
//!
//! A [`PageBlock`] owns its mapping and unmaps it when dropped. Unmap
//! failures never reach the caller.

use super::SupError;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Host page size in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s
    } else {
        // SAFETY: sysconf has no memory safety preconditions.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let s = if s > 0 { s as usize } else { 4096 };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s
    }
}

/// Outstanding page blocks of one session.
#[derive(Debug, Default)]
pub(super) struct PageStats {
    blocks: AtomicUsize,
    pages: AtomicUsize,
}

impl PageStats {
    pub(super) fn blocks(&self) -> usize {
        self.blocks.load(Ordering::Acquire)
    }

    pub(super) fn pages(&self) -> usize {
        self.pages.load(Ordering::Acquire)
    }
}

/// A contiguous run of locked, anonymous pages.
#[derive(Debug)]
pub struct PageBlock {
    base: NonNull<u8>,
    pages: usize,
    stats: Arc<PageStats>,
}

// SAFETY: the block exclusively owns its mapping; the pointer is never
// shared outside of borrows tied to the block.
unsafe impl Send for PageBlock {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for PageBlock {}

impl PageBlock {
    /// Map `pages` fresh pages.
    pub(super) fn map(pages: usize, stats: Arc<PageStats>) -> Result<Self, SupError> {
        if pages == 0 {
            return Err(SupError::InvalidParameter("page count must be non-zero"));
        }
        let len = pages
            .checked_mul(page_size())
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| {
                log::warn!("{} page(s) do not fit the address space", pages);
                SupError::OutOfMemory { pages }
            })?;

        // SAFETY: anonymous mapping at a kernel-chosen address cannot alias
        // any existing Rust object.
        let addr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|errno| {
            log::warn!("mmap of {} page(s) failed: {}", pages, errno);
            SupError::OutOfMemory { pages }
        })?;

        stats.blocks.fetch_add(1, Ordering::AcqRel);
        stats.pages.fetch_add(pages, Ordering::AcqRel);

        Ok(Self {
            base: addr.cast(),
            pages,
            stats,
        })
    }

    /// Number of pages in the block.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.pages * page_size()
    }

    /// Base address of the mapping (always page aligned).
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len()` bytes, readable, and lives as long
        // as `self`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len()) }
    }
}

impl Drop for PageBlock {
    fn drop(&mut self) {
        let len = self.len();
        // SAFETY: `base`/`len` describe exactly the mapping created in `map`,
        // and no borrow of it can outlive `self`.
        let result = unsafe { munmap(self.base.cast::<c_void>(), len) };
        if let Err(errno) = result {
            log::error!(
                "munmap of {} page(s) at {:p} failed: {}",
                self.pages,
                self.base,
                errno
            );
            debug_assert!(false, "munmap failed: {errno}");
        }
        self.stats.blocks.fetch_sub(1, Ordering::AcqRel);
        self.stats.pages.fetch_sub(self.pages, Ordering::AcqRel);
    }
}
