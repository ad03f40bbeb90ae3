//! The support session object.

use super::pages::{PageBlock, PageStats};
use super::req::{
    function, CookieReq, SupRequest, COOKIE_MAGIC, SUPDRV_IOC_MIN_VERSION, SUPDRV_IOC_VERSION,
};
use super::{SupError, DEFAULT_DEVICE_PATH};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

/// How to reach the support driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Path of the device node to open.
    pub device_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
        }
    }
}

/// Cookies handed out by the driver during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cookies {
    cookie: u32,
    session_cookie: u32,
}

/// An open (or not yet open) connection to the support driver.
///
/// `initialize` and `terminate` need `&mut self`, so setup and teardown are
/// serialized by whoever owns the session. Control requests and page
/// operations only need `&self` and may be issued from vCPU threads.
#[derive(Debug)]
pub struct SupSession {
    config: SessionConfig,
    /// The open device, `None` while uninitialized.
    device: Option<OwnedFd>,
    cookies: Cookies,
    stats: Arc<PageStats>,
}

impl SupSession {
    /// Create a session for `config`. Nothing is opened yet.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            device: None,
            cookies: Cookies::default(),
            stats: Arc::new(PageStats::default()),
        }
    }

    /// Path of the device node this session talks to.
    pub fn device_path(&self) -> &str {
        &self.config.device_path
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Raw descriptor of the open device, if any.
    pub fn raw_device(&self) -> Option<i32> {
        self.device.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Open the support driver.
    ///
    /// Calling this on an open session is a successful no-op. The handle is
    /// marked close-on-exec so it never leaks into a child image.
    ///
    /// # Arguments
    ///
    /// * `reserve_hint` - Bytes the caller expects to map later. Hosts that
    ///   can pre-reserve address space use it; this one does not.
    pub fn initialize(&mut self, reserve_hint: usize) -> Result<(), SupError> {
        if self.device.is_some() {
            return Ok(());
        }
        log::debug!(
            "Opening support driver {} (reserve hint {} bytes, ignored)",
            self.config.device_path,
            reserve_hint
        );

        let path = self.config.device_path.as_str();
        let raw = open(path, OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            let err = SupError::from_open_errno(path, errno);
            log::error!("Failed to open \"{}\": {} ({})", path, errno, err);
            err
        })?;
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        let device = unsafe { OwnedFd::from_raw_fd(raw) };

        if let Err(errno) = fcntl(device.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            log::error!("Setting FD_CLOEXEC on {} failed: {}", path, errno);
            // Dropping `device` closes it again.
            return Err(SupError::DriverOpenError {
                path: path.to_string(),
                errno,
            });
        }

        log::info!("Support driver {} opened", path);
        self.device = Some(device);
        Ok(())
    }

    /// Close the support driver.
    ///
    /// A session that was never opened terminates successfully. A failing
    /// close is logged and asserted in debug builds; the handle is
    /// considered gone either way.
    pub fn terminate(&mut self) -> Result<(), SupError> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        self.cookies = Cookies::default();

        if let Err(errno) = nix::unistd::close(device.into_raw_fd()) {
            log::error!(
                "Closing support driver {} failed: {}",
                self.config.device_path,
                errno
            );
            debug_assert!(false, "close of the support driver failed: {errno}");
        } else {
            log::info!("Support driver {} closed", self.config.device_path);
        }
        Ok(())
    }

    /// Descriptor of the open device, or `SessionNotOpen`.
    ///
    /// Using a session that is not open is a programming error, so debug
    /// builds assert here.
    fn device_fd(&self) -> Result<i32, SupError> {
        debug_assert!(self.device.is_some(), "support session not open");
        self.raw_device().ok_or(SupError::SessionNotOpen)
    }

    /// Issue a synchronous control request.
    ///
    /// The session cookies are stamped into the header, the header is
    /// validated against the request size, and the calling thread blocks
    /// until the driver returns.
    pub fn control_request<R: SupRequest>(&self, function: u32, req: &mut R) -> Result<(), SupError> {
        let fd = self.device_fd()?;

        let hdr = req.header_mut();
        hdr.cookie = self.cookies.cookie;
        hdr.session_cookie = self.cookies.session_cookie;
        hdr.validate(function, size_of::<R>())?;

        // SAFETY: `req` is a live, exclusively borrowed repr(C) request of at
        // least `cb_in`/`cb_out` bytes (checked by `validate`).
        let rc = unsafe { libc::ioctl(fd, function as _, req as *mut R) };
        Errno::result(rc).map_err(|errno| {
            log::debug!("Control request {:#x} failed: {}", function, errno);
            SupError::from_request_errno(function, errno)
        })?;
        Ok(())
    }

    /// Issue a payload-less fast control request.
    pub fn fast_control_request(&self, function: u32) -> Result<(), SupError> {
        let fd = self.device_fd()?;
        if !function::is_fast(function) {
            return Err(SupError::InvalidParameter("not a fast control function"));
        }

        // SAFETY: fast requests carry no buffer; the driver ignores the argument.
        let rc = unsafe { libc::ioctl(fd, function as _, std::ptr::null_mut::<libc::c_void>()) };
        Errno::result(rc).map_err(|errno| SupError::from_request_errno(function, errno))?;
        Ok(())
    }

    /// Perform the cookie handshake and remember the cookies for later
    /// requests.
    ///
    /// Returns the interface version the driver agreed to.
    pub fn handshake(&mut self) -> Result<u32, SupError> {
        let mut req = CookieReq::new();
        self.control_request(function::COOKIE, &mut req)?;
        self.accept_cookie_reply(&req)
    }

    /// Check a cookie reply and, if acceptable, stamp its cookies into every
    /// later request.
    fn accept_cookie_reply(&mut self, req: &CookieReq) -> Result<u32, SupError> {
        check_cookie_reply(req)?;
        self.cookies = Cookies {
            cookie: req.out_cookie,
            session_cookie: req.out_session_cookie,
        };
        log::info!(
            "Support driver handshake complete: session version {:#x}, driver version {:#x}",
            req.out_session_version,
            req.out_driver_version
        );
        Ok(req.out_session_version)
    }

    /// Allocate `count` pages of readable, writable, executable memory.
    pub fn alloc_pages(&self, count: usize) -> Result<PageBlock, SupError> {
        self.device_fd()?;
        if count == 0 {
            return Err(SupError::InvalidParameter("page count must be non-zero"));
        }
        let block = PageBlock::map(count, self.stats.clone())?;
        log::debug!("Allocated {} page(s) at {:p}", count, block.as_ptr());
        Ok(block)
    }

    /// Release a block obtained from [`alloc_pages`](Self::alloc_pages).
    ///
    /// Never fails from the caller's point of view; unmap problems are
    /// logged (and asserted in debug builds) by the block itself.
    pub fn free_pages(&self, block: PageBlock) {
        log::debug!("Freeing {} page(s) at {:p}", block.pages(), block.as_ptr());
        drop(block);
    }

    /// Page blocks currently outstanding.
    pub fn live_blocks(&self) -> usize {
        self.stats.blocks()
    }

    /// Pages currently outstanding.
    pub fn live_pages(&self) -> usize {
        self.stats.pages()
    }

    /// Install the support driver.
    pub fn install(&self) -> Result<(), SupError> {
        Err(SupError::NotSupported("driver installation"))
    }

    /// Uninstall the support driver.
    pub fn uninstall(&self) -> Result<(), SupError> {
        Err(SupError::NotSupported("driver removal"))
    }
}

/// Reject a cookie reply with the wrong magic or an interface version this
/// library cannot speak.
///
/// The major version (upper 16 bits) must match ours exactly and the full
/// version must be at least `SUPDRV_IOC_MIN_VERSION`.
fn check_cookie_reply(req: &CookieReq) -> Result<(), SupError> {
    let version = req.out_session_version;
    let reason = if req.magic != COOKIE_MAGIC {
        "bad magic in cookie reply"
    } else if version & 0xffff_0000 != SUPDRV_IOC_VERSION & 0xffff_0000 {
        "incompatible major interface version"
    } else if version < SUPDRV_IOC_MIN_VERSION {
        "interface version too old"
    } else {
        return Ok(());
    };

    log::error!(
        "Support driver handshake rejected: {} (driver {:#x}, need {:#x}..={:#x})",
        reason,
        version,
        SUPDRV_IOC_MIN_VERSION,
        SUPDRV_IOC_VERSION | 0xffff
    );
    Err(SupError::Request {
        function: function::COOKIE,
        errno: Errno::EPROTO,
    })
}

impl Drop for SupSession {
    fn drop(&mut self) {
        if self.device.is_some() {
            let _ = self.terminate();
        }
    }
}
