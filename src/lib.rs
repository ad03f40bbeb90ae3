//! VM process context and privileged support session.
//!
//! [`sup`] is the user-mode end of the support driver: one session per
//! process, control requests, and page-backed memory. [`uvm`] builds the
//! per-VM context on top of it: a single block holding the header,
//! subsystem extension regions, and one record per vCPU, handed out through
//! generation-checked handles.
//!
//! Only Unix hosts are supported.

#[cfg(unix)]
pub mod sup;
#[cfg(unix)]
pub mod uvm;
