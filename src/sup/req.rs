//! Control request framing.
//!
//! Every request sent to the support driver is a fixed-layout structure that
//! starts with a common [`ReqHeader`]. The driver inspects the header before
//! touching the rest of the buffer, so user mode validates it the same way
//! before issuing the ioctl.
//!
//! ```text
//! offset  field            meaning
//! 0x00    cookie           driver cookie from the handshake
//! 0x04    session_cookie   per-session cookie from the handshake
//! 0x08    cb_in            bytes the driver may read
//! 0x0c    cb_out           bytes the driver may write back
//! 0x10    flags            REQ_FLAGS_MAGIC | extra flags
//! 0x14    rc               status written by the driver
//! ```

use super::SupError;
use std::mem::size_of;

/// Magic value that must be present in [`ReqHeader::flags`].
pub const REQ_FLAGS_MAGIC: u32 = 0x4200_0042;

/// Bits of [`ReqHeader::flags`] that carry the magic.
pub const REQ_FLAGS_MAGIC_MASK: u32 = 0xff00_00ff;

/// Ioctl function identifiers understood by the support driver.
///
/// Slow functions carry a request buffer; fast functions carry nothing and
/// are reserved for latency-sensitive paths such as entering the guest.
pub mod function {
    /// Ioctl type byte of the support driver.
    const SUP_IOC_TYPE: u32 = b'V' as u32;

    /// Flag marking a support driver function number.
    const SUP_IOCTL_FLAG: u32 = 128;

    /// `_IOWR('V', nr | SUP_IOCTL_FLAG, size)` on Linux-style hosts.
    pub const fn ctl_code(nr: u32, size: u32) -> u32 {
        const IOC_READ_WRITE: u32 = 3;
        (IOC_READ_WRITE << 30) | ((size & 0x3fff) << 16) | (SUP_IOC_TYPE << 8) | (nr | SUP_IOCTL_FLAG)
    }

    /// `_IO('V', nr | SUP_IOCTL_FLAG)` for payload-less requests.
    pub const fn ctl_code_fast(nr: u32) -> u32 {
        (SUP_IOC_TYPE << 8) | (nr | SUP_IOCTL_FLAG)
    }

    /// Handshake: negotiate the interface version and obtain cookies.
    pub const COOKIE: u32 = ctl_code(1, super::CookieReq::SIZE as u32);

    /// Query the number of ring-0 functions exported by the driver.
    pub const QUERY_FUNCS: u32 = ctl_code(2, super::ReqHeader::SIZE as u32);

    /// Enter the guest using raw-mode execution.
    pub const FAST_DO_RAW_RUN: u32 = ctl_code_fast(64);

    /// Enter the guest using hardware-assisted execution.
    pub const FAST_DO_HWACC_RUN: u32 = ctl_code_fast(65);

    /// Round-trip to the driver and back, for latency measurements.
    pub const FAST_DO_NOP: u32 = ctl_code_fast(66);

    /// Whether `function` may be issued through the fast path.
    pub fn is_fast(function: u32) -> bool {
        matches!(function, FAST_DO_RAW_RUN | FAST_DO_HWACC_RUN | FAST_DO_NOP)
    }
}

/// Common header at the start of every control request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqHeader {
    pub cookie: u32,
    pub session_cookie: u32,
    pub cb_in: u32,
    pub cb_out: u32,
    pub flags: u32,
    pub rc: i32,
}

impl ReqHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = size_of::<ReqHeader>();

    /// Build a header for a request that reads `cb_in` and writes `cb_out`
    /// bytes.
    pub fn new(cb_in: u32, cb_out: u32) -> Self {
        Self {
            cookie: 0,
            session_cookie: 0,
            cb_in,
            cb_out,
            flags: REQ_FLAGS_MAGIC,
            rc: 0,
        }
    }

    /// Check the header against the size of the request it heads.
    ///
    /// This is the same check the driver performs before acting on a
    /// request.
    pub fn validate(&self, function: u32, request_size: usize) -> Result<(), SupError> {
        let invalid = |reason| SupError::InvalidRequest { function, reason };

        if self.flags & REQ_FLAGS_MAGIC_MASK != REQ_FLAGS_MAGIC {
            return Err(invalid("bad header magic"));
        }
        let cb_in = self.cb_in as usize;
        let cb_out = self.cb_out as usize;
        if cb_in < Self::SIZE || cb_out < Self::SIZE {
            return Err(invalid("size smaller than the header"));
        }
        if cb_in > request_size || cb_out > request_size {
            return Err(invalid("size larger than the request buffer"));
        }
        Ok(())
    }
}

/// A fixed-layout control request.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a [`ReqHeader`] as their first
/// field, and must stay valid for any bytes the driver writes back within
/// `cb_out`.
pub unsafe trait SupRequest: Sized {
    fn header(&self) -> &ReqHeader;
    fn header_mut(&mut self) -> &mut ReqHeader;
}

// SAFETY: the header is trivially its own first field and is plain data.
unsafe impl SupRequest for ReqHeader {
    fn header(&self) -> &ReqHeader {
        self
    }

    fn header_mut(&mut self) -> &mut ReqHeader {
        self
    }
}

/// Magic string exchanged in the cookie handshake.
pub const COOKIE_MAGIC: [u8; 16] = *b"The Magic Word!\0";

/// Interface version requested by this library.
pub const SUPDRV_IOC_VERSION: u32 = 0x0007_0002;

/// Lowest interface version this library can work with.
pub const SUPDRV_IOC_MIN_VERSION: u32 = 0x0007_0000;

/// Cookie handshake request.
///
/// Input: magic and requested versions. Output: cookies and the version the
/// driver agreed to.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieReq {
    pub hdr: ReqHeader,
    pub magic: [u8; 16],
    pub req_version: u32,
    pub min_version: u32,
    pub out_cookie: u32,
    pub out_session_cookie: u32,
    pub out_session_version: u32,
    pub out_driver_version: u32,
}

impl CookieReq {
    /// Size of the request in bytes.
    pub const SIZE: usize = size_of::<CookieReq>();

    pub fn new() -> Self {
        Self {
            hdr: ReqHeader::new(Self::SIZE as u32, Self::SIZE as u32),
            magic: COOKIE_MAGIC,
            req_version: SUPDRV_IOC_VERSION,
            min_version: SUPDRV_IOC_MIN_VERSION,
            out_cookie: 0,
            out_session_cookie: 0,
            out_session_version: 0,
            out_driver_version: 0,
        }
    }
}

impl Default for CookieReq {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: repr(C) with the header first; every field is plain data.
unsafe impl SupRequest for CookieReq {
    fn header(&self) -> &ReqHeader {
        &self.hdr
    }

    fn header_mut(&mut self) -> &mut ReqHeader {
        &mut self.hdr
    }
}
