//! Per-process VM context ("UVM") and its per-vCPU slots.
//!
//! A VM process keeps everything it knows about one virtual machine in a
//! single page-backed block obtained from the support session. Subsystems
//! (the VM core, the memory manager, the device loader, the statistics
//! collector) each own a fixed-size, 32-byte aligned region inside that
//! block, and each vCPU owns a record in the tail array.
//!
//! ```text
//! base (page aligned)
//! 0x000 ┌────────────────────────────┐
//!       │ header                     │ magic, cpu_count, shared VM
//! 0x020 ├────────────────────────────┤
//!       │ VM region   (512 bytes)    │
//!       ├────────────────────────────┤
//!       │ MM region   (32 bytes)     │
//!       ├────────────────────────────┤
//!       │ PDM region  (128 bytes)    │
//!       ├────────────────────────────┤
//!       │ STAM region (256 bytes)    │
//!       ├────────────────────────────┤ ← 32-byte aligned
//!       │ vCPU 0 record              │ owner, shared VM/vCPU, cpu_id,
//!       │   VM region (512 bytes)    │ per-vCPU regions
//!       ├────────────────────────────┤
//!       │ vCPU 1 record              │
//!       │ ...                        │
//!       └────────────────────────────┘
//! ```
//!
//! Every public entry point goes through the [`UvmRegistry`], which hands
//! out generation-counted [`UvmHandle`]s. A destroyed handle is rejected by
//! its generation before any memory is touched; the in-block magic is
//! scrubbed as well so raw pointers to a dead context fail the
//! [`guard`] check.
//!
//! # Example Usage
//!
//! ```ignore
//! let mut registry = UvmRegistry::new();
//! let handle = registry.create(&session, 4, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)?;
//!
//! let vcpu = registry.vcpu(handle, 3)?;
//! assert_eq!(vcpu.cpu_id(), 3);
//!
//! registry.destroy(&session, handle)?;
//! assert!(registry.vcpu(handle, 0).is_err());
//! ```

mod context;
pub mod guard;
mod layout;
mod registry;
mod vcpu;

pub use context::UvmContext;
pub use layout::{
    ContextLayout, ExtensionSpec, Region, Subsystem, DEFAULT_CPU_EXTENSIONS,
    DEFAULT_VM_EXTENSIONS, MAX_CPU_COUNT, MAX_EXTENSION_SIZE, UVM_ALIGNMENT,
};
pub use registry::{UvmHandle, UvmRegistry};
pub use vcpu::{UvmCpu, UvmCpuMut};

use crate::sup::SupError;
use thiserror::Error;

/// The `magic` value of a live context.
pub const UVM_MAGIC: u32 = 0x1970_0823;

/// Errors that can occur on VM contexts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UvmError {
    /// The handle does not refer to a live context.
    ///
    /// The VM is gone (destroyed, or never existed); callers should treat it
    /// that way rather than retry.
    #[error("Invalid VM handle: the VM has been destroyed or never existed")]
    InvalidHandle,

    /// A parameter was out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The block backing a new context could not be allocated.
    #[error("Out of memory: cannot allocate {pages} page(s) for the VM context")]
    OutOfMemory { pages: usize },

    /// The support session failed underneath us.
    #[error("Support session error: {0}")]
    Sup(#[from] SupError),
}
