//! Validity and alignment checks for VM context references.
//!
//! These are the checks every external entry point performs before it
//! trusts a context it did not just create itself:
//!
//! 1. the pointer is non-null and outside the first page
//! 2. the pointer is page aligned (contexts always start a page block)
//! 3. the first four bytes hold [`UVM_MAGIC`]
//!
//! The magic is only read once 1 and 2 have passed.

use super::layout::header;
use super::{UvmError, UVM_MAGIC};

/// Whether `ptr` could point at a context base: non-null, not inside the
/// first page, and aligned to `page_size`.
pub fn is_valid_aligned_ptr(ptr: *const u8, page_size: usize) -> bool {
    debug_assert!(page_size.is_power_of_two());
    let addr = ptr as usize;
    addr >= page_size && addr & (page_size - 1) == 0
}

/// Check a sentinel value read from a context header.
pub fn check_magic(magic: u32) -> Result<(), UvmError> {
    if magic == UVM_MAGIC {
        Ok(())
    } else {
        Err(UvmError::InvalidHandle)
    }
}

/// Validate a raw context pointer received from outside the trusted
/// boundary.
///
/// # Safety
///
/// If `ptr` is non-null and page aligned, at least four bytes at `ptr`
/// must be readable.
pub unsafe fn validate_ptr(ptr: *const u8, page_size: usize) -> Result<(), UvmError> {
    if !is_valid_aligned_ptr(ptr, page_size) {
        log::debug!("Rejecting VM context pointer {:p}: null or misaligned", ptr);
        return Err(UvmError::InvalidHandle);
    }
    // SAFETY: caller guarantees readability; alignment was checked above.
    let magic = unsafe { ptr.add(header::MAGIC).cast::<u32>().read_volatile() };
    check_magic(magic).inspect_err(|_| {
        log::debug!("Rejecting VM context {:p}: magic {:#x}", ptr, magic);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sup::page_size;
    use crate::sup::open_fake_session;

    #[test]
    fn test_check_magic() {
        assert!(check_magic(UVM_MAGIC).is_ok());
        assert_eq!(check_magic(0), Err(UvmError::InvalidHandle));
    }

    #[test]
    fn test_null_is_invalid() {
        let result = unsafe { validate_ptr(std::ptr::null(), page_size()) };
        assert_eq!(result, Err(UvmError::InvalidHandle));
        assert!(!is_valid_aligned_ptr(0x10 as *const u8, 4096));
        assert!(is_valid_aligned_ptr(0x2000 as *const u8, 4096));
    }

    #[test]
    fn test_misaligned_is_invalid() {
        let (_file, session) = open_fake_session();
        let mut block = session.alloc_pages(1).unwrap();
        for offset in 0..4 {
            block.as_mut_slice()[offset..offset + 4].copy_from_slice(&UVM_MAGIC.to_ne_bytes());
            let ptr = unsafe { block.as_ptr().add(offset) };
            let result = unsafe { validate_ptr(ptr, page_size()) };
            if offset == 0 {
                assert!(result.is_ok());
            } else {
                assert_eq!(result, Err(UvmError::InvalidHandle));
            }
        }

        // 32-byte aligned is not enough.
        let ptr = unsafe { block.as_ptr().add(32) };
        assert!(unsafe { validate_ptr(ptr, page_size()) }.is_err());
        session.free_pages(block);
    }

    #[test]
    fn test_any_flipped_magic_bit_fails() {
        let (_file, session) = open_fake_session();
        let mut block = session.alloc_pages(1).unwrap();
        let base = block.as_ptr();

        for bit in 0..32 {
            block.as_mut_slice()[..4].copy_from_slice(&UVM_MAGIC.to_ne_bytes());
            assert!(unsafe { validate_ptr(base, page_size()) }.is_ok());

            let flipped = UVM_MAGIC ^ (1 << bit);
            block.as_mut_slice()[..4].copy_from_slice(&flipped.to_ne_bytes());
            assert_eq!(
                unsafe { validate_ptr(base, page_size()) },
                Err(UvmError::InvalidHandle),
                "bit {} flip went unnoticed",
                bit
            );
        }
        session.free_pages(block);
    }
}
