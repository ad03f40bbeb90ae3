//! Process-wide registry of live VM contexts.
//!
//! Contexts sit in a slot arena. A [`UvmHandle`] names a slot and the
//! generation the slot had when the context was created; destroying the
//! context bumps the generation, so every copy of the old handle fails
//! validation without the registry ever reading freed memory.

use super::layout::{ContextLayout, ExtensionSpec};
use super::{UvmContext, UvmCpu, UvmCpuMut, UvmError};
use crate::sup::{page_size, SupError, SupSession};
use std::fmt;

/// Opaque reference to a VM context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UvmHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for UvmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    context: Option<UvmContext>,
}

/// All VM contexts of this process.
#[derive(Debug, Default)]
pub struct UvmRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl UvmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.context.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of all live contexts, in slot order.
    pub fn handles(&self) -> Vec<UvmHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.context.is_some())
            .map(|(index, s)| UvmHandle {
                index: index as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Create a VM context.
    ///
    /// Lays out the context, allocates one page block for it from
    /// `session`, writes the header, assigns vCPU ids `0..cpu_count` and
    /// registers it.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` for a zero CPU count or bad extension table
    /// - `OutOfMemory` if the block cannot be allocated
    /// - `Sup(..)` for other session failures
    pub fn create(
        &mut self,
        session: &SupSession,
        cpu_count: u32,
        vm_extensions: &[ExtensionSpec],
        cpu_extensions: &[ExtensionSpec],
    ) -> Result<UvmHandle, UvmError> {
        let layout = ContextLayout::compute(cpu_count, vm_extensions, cpu_extensions)?;
        let pages = layout.pages(page_size());

        let block = session
            .alloc_pages(pages)
            .map_err(|e| alloc_error(e, pages))?;
        let context = UvmContext::new(block, layout);

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.context = Some(context);
        let handle = UvmHandle {
            index,
            generation: slot.generation,
        };

        log::info!(
            "Created VM context {} with {} vCPU(s) ({} page(s))",
            handle,
            cpu_count,
            pages
        );
        Ok(handle)
    }

    /// The live context behind `handle`, without the in-block check.
    fn lookup(&self, handle: UvmHandle) -> Option<&UvmContext> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.context.as_ref())
    }

    /// Gatekeeping check for every entry point that receives a handle.
    ///
    /// A stale or foreign handle yields `InvalidHandle`. A live handle whose
    /// block no longer passes the guard means our own memory was corrupted,
    /// and that is not recoverable.
    pub fn validate_external(&self, handle: UvmHandle) -> Result<(), UvmError> {
        let context = self.lookup(handle).ok_or(UvmError::InvalidHandle)?;
        if context.check().is_err() {
            panic!(
                "VM context {} at {:p} is corrupt (magic {:#x})",
                handle,
                context.base(),
                context.magic()
            );
        }
        Ok(())
    }

    /// Validated shared access to a context.
    pub fn get(&self, handle: UvmHandle) -> Result<&UvmContext, UvmError> {
        self.validate_external(handle)?;
        self.lookup(handle).ok_or(UvmError::InvalidHandle)
    }

    /// Validated exclusive access to a context.
    pub fn get_mut(&mut self, handle: UvmHandle) -> Result<&mut UvmContext, UvmError> {
        self.validate_external(handle)?;
        self.slots[handle.index as usize]
            .context
            .as_mut()
            .ok_or(UvmError::InvalidHandle)
    }

    /// vCPU `index` of the VM behind `handle`.
    pub fn vcpu(&self, handle: UvmHandle, index: u32) -> Result<UvmCpu<'_>, UvmError> {
        self.get(handle)?.vcpu(index)
    }

    /// Mutable vCPU `index` of the VM behind `handle`.
    pub fn vcpu_mut(&mut self, handle: UvmHandle, index: u32) -> Result<UvmCpuMut<'_>, UvmError> {
        self.get_mut(handle)?.vcpu_mut(index)
    }

    /// Record the shared VM mapping for the VM behind `handle`.
    pub fn attach_shared_vm(&mut self, handle: UvmHandle, addr: u64) -> Result<(), UvmError> {
        self.get_mut(handle)?.attach_shared_vm(addr);
        Ok(())
    }

    /// Destroy the VM context behind `handle`.
    ///
    /// Unregisters the context, scrubs its magic and returns its block to
    /// `session`. All vCPU threads using the context must have been stopped
    /// before this is called. A second destroy of the same handle fails
    /// with `InvalidHandle`.
    pub fn destroy(&mut self, session: &SupSession, handle: UvmHandle) -> Result<(), UvmError> {
        self.validate_external(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        let context = slot.context.take().ok_or(UvmError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        let block = context.scrub();
        log::info!("Destroyed VM context {} ({} page(s))", handle, block.pages());
        session.free_pages(block);
        Ok(())
    }

    /// Destroy every live context, e.g. at process shutdown.
    ///
    /// Returns how many were destroyed.
    pub fn destroy_all(&mut self, session: &SupSession) -> usize {
        let handles = self.handles();
        handles
            .into_iter()
            .filter(|&h| self.destroy(session, h).is_ok())
            .count()
    }
}

/// A failed context allocation. Running out of memory is reported as a
/// context error of its own; everything else stays a session error.
fn alloc_error(err: SupError, pages: usize) -> UvmError {
    match err {
        SupError::OutOfMemory { .. } => UvmError::OutOfMemory { pages },
        other => UvmError::Sup(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sup::open_fake_session;
    use crate::uvm::{ExtensionSpec, Subsystem, DEFAULT_CPU_EXTENSIONS, DEFAULT_VM_EXTENSIONS};

    #[test]
    fn test_create_and_walk_vcpus() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        for cpus in [1u32, 2, 7, 64] {
            let handle = registry
                .create(&session, cpus, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)
                .unwrap();
            let mut seen = Vec::new();
            for i in 0..cpus {
                let vcpu = registry.vcpu(handle, i).unwrap();
                assert_eq!(vcpu.cpu_id(), i);
                let addr = vcpu.extension(Subsystem::Vm).unwrap().as_ptr();
                assert!(!seen.contains(&addr));
                seen.push(addr);
            }
            assert!(matches!(
                registry.vcpu(handle, cpus),
                Err(UvmError::InvalidParameter(_))
            ));
            registry.destroy(&session, handle).unwrap();
        }
        assert_eq!(session.live_blocks(), 0);
    }

    #[test]
    fn test_create_zero_cpus() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        assert!(matches!(
            registry.create(&session, 0, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS),
            Err(UvmError::InvalidParameter(_))
        ));
        assert!(registry.is_empty());
        assert_eq!(session.live_blocks(), 0);
    }

    #[test]
    fn test_create_oversized_extension() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let huge = [ExtensionSpec::new(Subsystem::Pdm, 1 << 20)];
        assert!(matches!(
            registry.create(&session, 1, &huge, &[]),
            Err(UvmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_alloc_error_keeps_out_of_memory_distinct() {
        let (_file, session) = open_fake_session();
        let pages = usize::MAX / page_size();
        let err = session.alloc_pages(pages).unwrap_err();
        assert_eq!(alloc_error(err, pages), UvmError::OutOfMemory { pages });
        assert_eq!(session.live_blocks(), 0);

        assert_eq!(
            alloc_error(SupError::SessionNotOpen, 1),
            UvmError::Sup(SupError::SessionNotOpen)
        );
        assert_ne!(
            UvmError::OutOfMemory { pages }.to_string(),
            UvmError::InvalidHandle.to_string()
        );
    }

    #[test]
    fn test_destroyed_handle_is_invalid() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let handle = registry
            .create(&session, 1, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)
            .unwrap();
        assert!(registry.validate_external(handle).is_ok());

        registry.destroy(&session, handle).unwrap();
        assert_eq!(registry.validate_external(handle), Err(UvmError::InvalidHandle));
        assert_eq!(registry.destroy(&session, handle), Err(UvmError::InvalidHandle));
        assert!(matches!(registry.get(handle), Err(UvmError::InvalidHandle)));
    }

    #[test]
    fn test_reused_slot_rejects_old_handle() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let old = registry
            .create(&session, 1, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)
            .unwrap();
        registry.destroy(&session, old).unwrap();

        let new = registry
            .create(&session, 2, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)
            .unwrap();
        assert_ne!(old, new);
        assert_eq!(registry.validate_external(old), Err(UvmError::InvalidHandle));
        assert_eq!(registry.get(new).unwrap().cpu_count(), 2);
    }

    #[test]
    fn test_scenario_four_cpus() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let extensions = [
            ExtensionSpec::new(Subsystem::Vm, 512),
            ExtensionSpec::new(Subsystem::Mm, 32),
            ExtensionSpec::new(Subsystem::Stam, 256),
            ExtensionSpec::new(Subsystem::Pdm, 128),
        ];
        let handle = registry
            .create(&session, 4, &extensions, &DEFAULT_CPU_EXTENSIONS)
            .unwrap();
        assert_eq!(registry.vcpu(handle, 3).unwrap().cpu_id(), 3);

        registry.destroy(&session, handle).unwrap();
        assert!(matches!(
            registry.vcpu(handle, 0),
            Err(UvmError::InvalidHandle)
        ));
    }

    #[test]
    fn test_enumerate_and_destroy_all() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let a = registry.create(&session, 1, &DEFAULT_VM_EXTENSIONS, &[]).unwrap();
        let b = registry.create(&session, 2, &DEFAULT_VM_EXTENSIONS, &[]).unwrap();
        let c = registry.create(&session, 3, &DEFAULT_VM_EXTENSIONS, &[]).unwrap();
        registry.destroy(&session, b).unwrap();

        assert_eq!(registry.handles(), vec![a, c]);
        assert_eq!(registry.len(), 2);
        assert_eq!(session.live_blocks(), 2);

        assert_eq!(registry.destroy_all(&session), 2);
        assert!(registry.is_empty());
        assert_eq!(session.live_blocks(), 0);
    }

    #[test]
    fn test_attach_shared_vm_through_registry() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let handle = registry
            .create(&session, 2, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)
            .unwrap();
        registry.attach_shared_vm(handle, 0xffff_a000_0000_0000).unwrap();
        assert_eq!(registry.get(handle).unwrap().shared_vm(), Some(0xffff_a000_0000_0000));
        assert_eq!(
            registry.vcpu(handle, 1).unwrap().shared_vm(),
            Some(0xffff_a000_0000_0000)
        );
        registry.destroy_all(&session);
    }

    #[test]
    #[should_panic(expected = "is corrupt")]
    fn test_corrupted_live_context_panics() {
        let (_file, session) = open_fake_session();
        let mut registry = UvmRegistry::new();
        let handle = registry
            .create(&session, 1, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS)
            .unwrap();

        // Simulate a stray write over the header.
        let base = registry.get(handle).unwrap().base() as *mut u32;
        unsafe { base.write_volatile(0) };

        let _ = registry.validate_external(handle);
    }
}
