//! The VM context block itself.

use super::layout::{cpu_header, field, header, ContextLayout, Region, Subsystem};
use super::vcpu::{UvmCpu, UvmCpuMut};
use super::{guard, UvmError, UVM_MAGIC};
use crate::sup::{page_size, PageBlock};
use std::ops::Range;

/// One VM's user-mode context, living in a single page block.
///
/// The header, all per-VM extension regions and the vCPU tail array share
/// the block, so tearing the VM down is a single free.
#[derive(Debug)]
pub struct UvmContext {
    block: PageBlock,
    layout: ContextLayout,
}

/// Bounds-checked sub-slice of an extension region.
fn sub_range(region: &Region, range: &Range<usize>) -> Result<Range<usize>, UvmError> {
    if range.start > range.end || range.end > region.size {
        return Err(UvmError::InvalidParameter("range outside the extension region"));
    }
    Ok(region.offset + range.start..region.offset + range.end)
}

impl UvmContext {
    /// Build a context inside `block`.
    ///
    /// Writes the header and every vCPU record, then the magic last, so
    /// a context is never observable as valid before it is complete.
    pub(super) fn new(mut block: PageBlock, layout: ContextLayout) -> Self {
        debug_assert!(block.len() >= layout.size());
        let base = block.as_ptr() as u64;
        let bytes = block.as_mut_slice();

        bytes[..layout.size()].fill(0);
        field::write_u32(bytes, header::CPU_COUNT, layout.cpu_count());
        field::write_u64(bytes, header::SHARED_VM, 0);

        for id in 0..layout.cpu_count() {
            let record = layout.vcpu_offset(id).unwrap_or_default();
            field::write_u64(bytes, record + cpu_header::OWNER, base);
            field::write_u32(bytes, record + cpu_header::CPU_ID, id);
        }

        field::write_u32(bytes, header::MAGIC, UVM_MAGIC);
        Self { block, layout }
    }

    /// Base address of the context (page aligned).
    pub fn base(&self) -> *const u8 {
        self.block.as_ptr()
    }

    pub fn layout(&self) -> &ContextLayout {
        &self.layout
    }

    /// Current value of the magic field.
    pub fn magic(&self) -> u32 {
        field::read_u32(self.block.as_slice(), header::MAGIC)
    }

    /// Run the validity guard on this context's own block.
    pub fn check(&self) -> Result<(), UvmError> {
        // SAFETY: the block is mapped and at least one page long.
        unsafe { guard::validate_ptr(self.base(), page_size()) }
    }

    pub fn cpu_count(&self) -> u32 {
        field::read_u32(self.block.as_slice(), header::CPU_COUNT)
    }

    /// Address of the shared VM structure, once attached.
    pub fn shared_vm(&self) -> Option<u64> {
        match field::read_u64(self.block.as_slice(), header::SHARED_VM) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Record where the privileged layer mapped the shared VM structure.
    ///
    /// The reference is not owned; the privileged layer frees it. Every vCPU
    /// record is updated as well.
    pub fn attach_shared_vm(&mut self, addr: u64) {
        let bytes = self.block.as_mut_slice();
        field::write_u64(bytes, header::SHARED_VM, addr);
        for id in 0..self.layout.cpu_count() {
            let record = self.layout.vcpu_offset(id).unwrap_or_default();
            field::write_u64(bytes, record + cpu_header::SHARED_VM, addr);
        }
    }

    fn vm_region(&self, subsystem: Subsystem) -> Result<&Region, UvmError> {
        self.layout
            .vm_region(subsystem)
            .ok_or(UvmError::InvalidParameter("subsystem has no region in this context"))
    }

    /// The whole per-VM region of `subsystem`.
    pub fn extension(&self, subsystem: Subsystem) -> Result<&[u8], UvmError> {
        self.extension_range(subsystem, 0..self.vm_region(subsystem)?.size)
    }

    /// Bytes `range` of the per-VM region of `subsystem`.
    pub fn extension_range(&self, subsystem: Subsystem, range: Range<usize>) -> Result<&[u8], UvmError> {
        let abs = sub_range(self.vm_region(subsystem)?, &range)?;
        Ok(&self.block.as_slice()[abs])
    }

    /// Mutable access to the per-VM region of `subsystem`.
    ///
    /// Only the owning subsystem should write here; its locking is its own
    /// business.
    pub fn extension_mut(&mut self, subsystem: Subsystem) -> Result<&mut [u8], UvmError> {
        let region = *self.vm_region(subsystem)?;
        let abs = sub_range(&region, &(0..region.size))?;
        Ok(&mut self.block.as_mut_slice()[abs])
    }

    /// Byte range of the record of vCPU `index`.
    fn vcpu_record(&self, index: u32) -> Result<Range<usize>, UvmError> {
        let start = self
            .layout
            .vcpu_offset(index)
            .ok_or(UvmError::InvalidParameter("vcpu index out of range"))?;
        Ok(start..start + self.layout.vcpu_stride())
    }

    /// Read access to vCPU `index`.
    pub fn vcpu(&self, index: u32) -> Result<UvmCpu<'_>, UvmError> {
        let record = self.vcpu_record(index)?;
        Ok(UvmCpu::new(
            self,
            &self.block.as_slice()[record],
            self.layout.cpu_regions(),
        ))
    }

    /// Write access to vCPU `index`.
    pub fn vcpu_mut(&mut self, index: u32) -> Result<UvmCpuMut<'_>, UvmError> {
        let record = self.vcpu_record(index)?;
        Ok(UvmCpuMut::new(
            &mut self.block.as_mut_slice()[record],
            self.layout.cpu_regions(),
        ))
    }

    /// All vCPUs in id order.
    pub fn vcpus(&self) -> impl Iterator<Item = UvmCpu<'_>> + '_ {
        (0..self.layout.cpu_count()).filter_map(move |id| self.vcpu(id).ok())
    }

    /// Overwrite the magic so stale raw pointers fail validation, and give
    /// the block back.
    pub(super) fn scrub(mut self) -> PageBlock {
        let bytes = self.block.as_mut_slice();
        field::write_u32(bytes, header::MAGIC, !UVM_MAGIC);
        self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sup::open_fake_session;
    use crate::uvm::{ExtensionSpec, DEFAULT_CPU_EXTENSIONS, DEFAULT_VM_EXTENSIONS, UVM_ALIGNMENT};

    fn build(
        session: &crate::sup::SupSession,
        cpus: u32,
        vm: &[ExtensionSpec],
        cpu: &[ExtensionSpec],
    ) -> UvmContext {
        let layout = ContextLayout::compute(cpus, vm, cpu).unwrap();
        let block = session.alloc_pages(layout.pages(page_size())).unwrap();
        UvmContext::new(block, layout)
    }

    #[test]
    fn test_new_context_header() {
        let (_file, session) = open_fake_session();
        let ctx = build(&session, 2, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS);
        assert_eq!(ctx.magic(), UVM_MAGIC);
        assert_eq!(ctx.cpu_count(), 2);
        assert_eq!(ctx.shared_vm(), None);
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_vcpus_have_sequential_ids() {
        let (_file, session) = open_fake_session();
        let ctx = build(&session, 8, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS);
        let ids: Vec<u32> = ctx.vcpus().map(|v| v.cpu_id()).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        for vcpu in ctx.vcpus() {
            assert_eq!(vcpu.owner_addr(), ctx.base() as u64);
            assert!(std::ptr::eq(vcpu.owner(), &ctx));
        }
        assert!(matches!(ctx.vcpu(8), Err(UvmError::InvalidParameter(_))));
    }

    #[test]
    fn test_extension_regions_are_aligned() {
        let (_file, session) = open_fake_session();
        let vm = [
            ExtensionSpec::new(Subsystem::Vm, 1),
            ExtensionSpec::new(Subsystem::Mm, 31),
            ExtensionSpec::new(Subsystem::Stam, 512),
        ];
        let ctx = build(&session, 3, &vm, &vm);
        for spec in &vm {
            let region = ctx.extension(spec.subsystem).unwrap();
            assert_eq!(region.len(), spec.size);
            assert_eq!(region.as_ptr() as usize % UVM_ALIGNMENT, 0);
            for vcpu in ctx.vcpus() {
                let region = vcpu.extension(spec.subsystem).unwrap();
                assert_eq!(region.as_ptr() as usize % UVM_ALIGNMENT, 0);
            }
        }
        assert!(matches!(
            ctx.extension(Subsystem::Pdm),
            Err(UvmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_extension_writes_stay_in_region() {
        let (_file, session) = open_fake_session();
        let mut ctx = build(&session, 1, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS);
        ctx.extension_mut(Subsystem::Mm).unwrap().fill(0xff);

        assert!(ctx.extension(Subsystem::Mm).unwrap().iter().all(|&b| b == 0xff));
        assert!(ctx.extension(Subsystem::Vm).unwrap().iter().all(|&b| b == 0));
        assert!(ctx.extension(Subsystem::Pdm).unwrap().iter().all(|&b| b == 0));
        assert_eq!(ctx.magic(), UVM_MAGIC);

        assert_eq!(ctx.extension_range(Subsystem::Mm, 4..8).unwrap(), &[0xff; 4]);
        assert!(ctx.extension_range(Subsystem::Mm, 0..33).is_err());
    }

    #[test]
    fn test_attach_shared_vm() {
        let (_file, session) = open_fake_session();
        let mut ctx = build(&session, 2, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS);
        ctx.attach_shared_vm(0xffff_8000_1234_0000);
        assert_eq!(ctx.shared_vm(), Some(0xffff_8000_1234_0000));
        for vcpu in ctx.vcpus() {
            assert_eq!(vcpu.shared_vm(), Some(0xffff_8000_1234_0000));
        }
    }

    #[test]
    fn test_scrub_fails_validation() {
        let (_file, session) = open_fake_session();
        let ctx = build(&session, 1, &DEFAULT_VM_EXTENSIONS, &DEFAULT_CPU_EXTENSIONS);
        let block = ctx.scrub();
        assert_eq!(
            unsafe { guard::validate_ptr(block.as_ptr(), page_size()) },
            Err(UvmError::InvalidHandle)
        );
        session.free_pages(block);
        assert_eq!(session.live_blocks(), 0);
    }
}
