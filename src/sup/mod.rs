//! Support session: the user-mode side of the privileged driver channel.
//!
//! Every VM process needs exactly one trusted connection to the support
//! driver. Through it the process issues control requests (create the
//! shared VM structure, run a vCPU, ...) and obtains the page-backed memory
//! that holds its per-VM context.
//!
//! ```text
//! User Space (VMM process)                Kernel Space
//! ┌──────────────────────┐               ┌──────────────────┐
//! │  UvmRegistry         │               │  Support driver  │
//! │    │ alloc_pages     │               │                  │
//! │    ▼                 │   ioctl()     │  ┌────────────┐  │
//! │  SupSession ─────────┼──────────────►│  │ Session    │  │
//! │    │ fd (CLOEXEC)    │               │  └────────────┘  │
//! │    ▼                 │               │  ┌────────────┐  │
//! │  PageBlock (mmap)    │               │  │ Shared VM  │  │
//! └──────────────────────┘               │  └────────────┘  │
//!                                        └──────────────────┘
//! ```
//!
//! # Session lifecycle
//!
//! 1. `SupSession::new(config)` - nothing is opened yet
//! 2. `session.initialize(hint)` - opens the device (idempotent)
//! 3. `session.control_request(..)` / `session.alloc_pages(..)` - any number of times
//! 4. `session.terminate()` - closes the device (idempotent)
//!
//! The session is an explicit object owned by whoever bootstraps the
//! process. Components that need privileged access borrow it.
//!
//! # Example Usage
//!
//! ```ignore
//! let mut session = SupSession::new(SessionConfig::default());
//! session.initialize(0)?;
//!
//! let block = session.alloc_pages(4)?;
//! // ... place a VM context in `block` ...
//! session.free_pages(block);
//!
//! session.terminate()?;
//! ```

mod pages;
mod req;
mod session;

pub use pages::{page_size, PageBlock};
pub use req::{function, CookieReq, ReqHeader, SupRequest, REQ_FLAGS_MAGIC, REQ_FLAGS_MAGIC_MASK};
pub use session::{SessionConfig, SupSession};

#[cfg(test)]
pub(crate) use session::tests::open_fake_session;

use nix::errno::Errno;
use thiserror::Error;

/// Default path of the support driver's device node.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/vboxdrv";

/// Errors that can occur on the support session.
///
/// Each driver-open variant maps to a different fix: "not installed" needs
/// the driver installed, "not accessible" needs group membership.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupError {
    /// An operation was issued before `initialize` or after `terminate`.
    #[error("Support session is not open (call initialize first)")]
    SessionNotOpen,

    /// The device node exists but no driver is bound to it (`ENODEV`).
    #[error("Support driver is not loaded: {path} has no driver behind it")]
    DriverAbsent { path: String },

    /// The device node exists but the caller may not open it.
    ///
    /// This usually means the user is not in the group that owns the
    /// device node.
    #[error("Support driver is not accessible: permission denied opening {path}")]
    DriverNotAccessible { path: String },

    /// The device node does not exist at all.
    #[error("Support driver is not installed: {path} does not exist")]
    DriverNotInstalled { path: String },

    /// Any other failure while opening the device.
    #[error("Failed to open support driver {path}: {errno}")]
    DriverOpenError { path: String, errno: Errno },

    /// Page allocation failed.
    #[error("Out of memory allocating {pages} page(s)")]
    OutOfMemory { pages: usize },

    /// A parameter was out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The request header failed validation before reaching the driver.
    #[error("Malformed control request {function:#x}: {reason}")]
    InvalidRequest {
        function: u32,
        reason: &'static str,
    },

    /// The driver rejected a control request.
    #[error("Control request {function:#x} failed: {errno}")]
    Request { function: u32, errno: Errno },

    /// The operation has no implementation on this host.
    #[error("Operation not supported on this host: {0}")]
    NotSupported(&'static str),
}

impl SupError {
    /// Classify an `open(2)` failure on the device node.
    pub fn from_open_errno(path: &str, errno: Errno) -> Self {
        let path = path.to_string();
        match errno {
            Errno::ENODEV => SupError::DriverAbsent { path },
            Errno::EPERM | Errno::EACCES => SupError::DriverNotAccessible { path },
            Errno::ENOENT => SupError::DriverNotInstalled { path },
            _ => SupError::DriverOpenError { path, errno },
        }
    }

    /// Translate an `ioctl(2)` failure into the session taxonomy.
    pub fn from_request_errno(function: u32, errno: Errno) -> Self {
        match errno {
            Errno::EBADF => SupError::SessionNotOpen,
            Errno::ENOMEM => SupError::OutOfMemory { pages: 0 },
            Errno::EINVAL => SupError::InvalidParameter("rejected by the support driver"),
            _ => SupError::Request { function, errno },
        }
    }
}
