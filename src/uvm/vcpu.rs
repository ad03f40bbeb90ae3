//! Per-vCPU records in the context's tail array.
//!
//! A vCPU record has no lifecycle of its own: it exists exactly as long as
//! the owning [`UvmContext`]. The accessors below borrow from the context,
//! so a record can never outlive it.

use super::layout::{cpu_header, field, Region, Subsystem};
use super::{UvmContext, UvmError};
use std::ops::Range;

fn find_region(regions: &[Region], subsystem: Subsystem, range: Range<usize>) -> Result<Range<usize>, UvmError> {
    let region = regions
        .iter()
        .find(|r| r.subsystem == subsystem)
        .ok_or(UvmError::InvalidParameter("subsystem has no per-vcpu region"))?;
    if range.start > range.end || range.end > region.size {
        return Err(UvmError::InvalidParameter("range outside the per-vcpu region"));
    }
    Ok(region.offset + range.start..region.offset + range.end)
}

fn region_size(regions: &[Region], subsystem: Subsystem) -> usize {
    regions
        .iter()
        .find(|r| r.subsystem == subsystem)
        .map_or(0, |r| r.size)
}

/// Read-only view of one vCPU.
#[derive(Debug, Clone, Copy)]
pub struct UvmCpu<'a> {
    owner: &'a UvmContext,
    record: &'a [u8],
    regions: &'a [Region],
}

impl<'a> UvmCpu<'a> {
    pub(super) fn new(owner: &'a UvmContext, record: &'a [u8], regions: &'a [Region]) -> Self {
        Self {
            owner,
            record,
            regions,
        }
    }

    /// Virtual CPU ordinal, unique within the VM.
    pub fn cpu_id(&self) -> u32 {
        field::read_u32(self.record, cpu_header::CPU_ID)
    }

    /// The owning context.
    pub fn owner(&self) -> &'a UvmContext {
        self.owner
    }

    /// Owner base address as recorded in the block.
    pub fn owner_addr(&self) -> u64 {
        field::read_u64(self.record, cpu_header::OWNER)
    }

    /// Address of the shared VM structure, once attached.
    pub fn shared_vm(&self) -> Option<u64> {
        Some(field::read_u64(self.record, cpu_header::SHARED_VM)).filter(|&a| a != 0)
    }

    /// Address of the shared per-vCPU structure, once attached.
    pub fn shared_vcpu(&self) -> Option<u64> {
        Some(field::read_u64(self.record, cpu_header::SHARED_VCPU)).filter(|&a| a != 0)
    }

    /// The whole per-vCPU region of `subsystem`.
    pub fn extension(&self, subsystem: Subsystem) -> Result<&'a [u8], UvmError> {
        self.extension_range(subsystem, 0..region_size(self.regions, subsystem))
    }

    /// Bytes `range` of the per-vCPU region of `subsystem`.
    pub fn extension_range(&self, subsystem: Subsystem, range: Range<usize>) -> Result<&'a [u8], UvmError> {
        let abs = find_region(self.regions, subsystem, range)?;
        Ok(&self.record[abs])
    }
}

/// Mutable view of one vCPU, for the subsystem that owns its state.
#[derive(Debug)]
pub struct UvmCpuMut<'a> {
    record: &'a mut [u8],
    regions: &'a [Region],
}

impl<'a> UvmCpuMut<'a> {
    pub(super) fn new(record: &'a mut [u8], regions: &'a [Region]) -> Self {
        Self { record, regions }
    }

    pub fn cpu_id(&self) -> u32 {
        field::read_u32(self.record, cpu_header::CPU_ID)
    }

    /// Record where the privileged layer mapped this vCPU's shared
    /// structure. Not owned.
    pub fn attach_shared_vcpu(&mut self, addr: u64) {
        field::write_u64(self.record, cpu_header::SHARED_VCPU, addr);
    }

    pub fn extension_mut(&mut self, subsystem: Subsystem) -> Result<&mut [u8], UvmError> {
        let abs = find_region(self.regions, subsystem, 0..region_size(self.regions, subsystem))?;
        Ok(&mut self.record[abs])
    }
}
