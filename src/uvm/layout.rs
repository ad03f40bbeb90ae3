//! Byte layout of a VM context block.
//!
//! The layout is computed once per context from the CPU count and the
//! extension tables, and every later access goes through the resulting
//! [`Region`] descriptors instead of raw offset arithmetic.

use super::UvmError;

/// Alignment of every extension region, every vCPU record and the tail
/// array, relative to the (page aligned) block base.
pub const UVM_ALIGNMENT: usize = 32;

/// Largest extension region a subsystem may declare.
pub const MAX_EXTENSION_SIZE: usize = 64 * 1024;

/// Largest supported number of vCPUs in one VM.
pub const MAX_CPU_COUNT: u32 = 1024;

/// Largest alignment a region may ask for.
const MAX_EXTENSION_ALIGN: usize = 4096;

/// Offsets within the context header.
pub(super) mod header {
    pub const MAGIC: usize = 0x00;
    pub const CPU_COUNT: usize = 0x04;
    pub const SHARED_VM: usize = 0x08;
    /// Header size, padded so the first region starts 32-byte aligned.
    pub const SIZE: usize = 0x20;
}

/// Offsets within each vCPU record header.
pub(super) mod cpu_header {
    /// Base address of the owning context.
    pub const OWNER: usize = 0x00;
    pub const SHARED_VM: usize = 0x08;
    pub const SHARED_VCPU: usize = 0x10;
    pub const CPU_ID: usize = 0x18;
    /// Record header size, padded to 32 bytes.
    pub const SIZE: usize = 0x20;
}

/// Owner of an extension region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subsystem {
    /// VM core (EMT bootstrap, at-reset/at-state callbacks).
    Vm,
    /// Process memory manager.
    Mm,
    /// Device-model loader.
    Pdm,
    /// Statistics collector.
    Stam,
}

/// A region a subsystem asks to have embedded in the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub subsystem: Subsystem,
    /// Size in bytes (1..=MAX_EXTENSION_SIZE).
    pub size: usize,
    /// Alignment in bytes: a power of two, at least [`UVM_ALIGNMENT`].
    pub align: usize,
}

impl ExtensionSpec {
    /// A region of `size` bytes at the default 32-byte alignment.
    pub const fn new(subsystem: Subsystem, size: usize) -> Self {
        Self {
            subsystem,
            size,
            align: UVM_ALIGNMENT,
        }
    }

    /// Same region with a stricter alignment.
    pub const fn with_align(self, align: usize) -> Self {
        Self { align, ..self }
    }

    fn check(&self) -> Result<(), UvmError> {
        if self.size == 0 {
            return Err(UvmError::InvalidParameter("extension region size is zero"));
        }
        if self.size > MAX_EXTENSION_SIZE {
            return Err(UvmError::InvalidParameter("extension region is oversized"));
        }
        if !self.align.is_power_of_two()
            || self.align < UVM_ALIGNMENT
            || self.align > MAX_EXTENSION_ALIGN
        {
            return Err(UvmError::InvalidParameter(
                "extension region alignment must be a power of two in 32..=4096",
            ));
        }
        Ok(())
    }
}

/// Per-VM regions of a stock VM process.
pub const DEFAULT_VM_EXTENSIONS: [ExtensionSpec; 4] = [
    ExtensionSpec::new(Subsystem::Vm, 512),
    ExtensionSpec::new(Subsystem::Mm, 32),
    ExtensionSpec::new(Subsystem::Pdm, 128),
    ExtensionSpec::new(Subsystem::Stam, 256),
];

/// Per-vCPU regions of a stock VM process.
pub const DEFAULT_CPU_EXTENSIONS: [ExtensionSpec; 1] = [ExtensionSpec::new(Subsystem::Vm, 512)];

/// A placed extension region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub subsystem: Subsystem,
    /// Offset from the block base (per-VM regions) or from the vCPU record
    /// start (per-vCPU regions).
    pub offset: usize,
    pub size: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Complete placement of one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLayout {
    cpu_count: u32,
    vm_regions: Vec<Region>,
    cpu_regions: Vec<Region>,
    vcpu_array: usize,
    vcpu_stride: usize,
    size: usize,
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Place `specs` one after another starting at `start`.
///
/// Returns the regions and the first free offset behind them.
fn place(start: usize, specs: &[ExtensionSpec]) -> Result<(Vec<Region>, usize), UvmError> {
    let mut regions: Vec<Region> = Vec::with_capacity(specs.len());
    let mut cursor = start;
    for spec in specs {
        spec.check()?;
        if regions.iter().any(|r| r.subsystem == spec.subsystem) {
            return Err(UvmError::InvalidParameter("subsystem declared twice"));
        }
        let offset = align_up(cursor, spec.align)
            .ok_or(UvmError::InvalidParameter("context layout overflows"))?;
        regions.push(Region {
            subsystem: spec.subsystem,
            offset,
            size: spec.size,
        });
        cursor = offset + spec.size;
    }
    Ok((regions, cursor))
}

impl ContextLayout {
    /// Lay out a context for `cpu_count` vCPUs.
    ///
    /// # Arguments
    ///
    /// * `cpu_count` - Number of vCPUs (1..=MAX_CPU_COUNT)
    /// * `vm_extensions` - Per-VM regions, placed after the header
    /// * `cpu_extensions` - Per-vCPU regions, placed after each record header
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a zero or excessive CPU count, a bad extension
    /// size or alignment, or a subsystem declared twice in one table.
    pub fn compute(
        cpu_count: u32,
        vm_extensions: &[ExtensionSpec],
        cpu_extensions: &[ExtensionSpec],
    ) -> Result<Self, UvmError> {
        if cpu_count == 0 {
            return Err(UvmError::InvalidParameter("cpu count must be at least 1"));
        }
        if cpu_count > MAX_CPU_COUNT {
            return Err(UvmError::InvalidParameter("cpu count exceeds the maximum"));
        }

        let (vm_regions, vm_end) = place(header::SIZE, vm_extensions)?;
        let (cpu_regions, cpu_end) = place(cpu_header::SIZE, cpu_extensions)?;

        // Records must keep every per-vCPU region aligned, so the array and
        // the stride use the strictest alignment any of them asks for.
        let record_align = cpu_extensions
            .iter()
            .map(|s| s.align)
            .fold(UVM_ALIGNMENT, usize::max);
        let overflow = || UvmError::InvalidParameter("context layout overflows");

        let vcpu_array = align_up(vm_end, record_align).ok_or_else(overflow)?;
        let vcpu_stride = align_up(cpu_end, record_align).ok_or_else(overflow)?;
        let size = vcpu_stride
            .checked_mul(cpu_count as usize)
            .and_then(|tail| tail.checked_add(vcpu_array))
            .ok_or_else(overflow)?;

        Ok(Self {
            cpu_count,
            vm_regions,
            cpu_regions,
            vcpu_array,
            vcpu_stride,
            size,
        })
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// Total bytes the context occupies.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pages needed to hold the context.
    pub fn pages(&self, page_size: usize) -> usize {
        self.size.div_ceil(page_size)
    }

    /// Offset of the vCPU tail array.
    pub fn vcpu_array(&self) -> usize {
        self.vcpu_array
    }

    /// Bytes between consecutive vCPU records.
    pub fn vcpu_stride(&self) -> usize {
        self.vcpu_stride
    }

    /// Offset of the record of vCPU `index`, if it exists.
    pub fn vcpu_offset(&self, index: u32) -> Option<usize> {
        (index < self.cpu_count).then(|| self.vcpu_array + index as usize * self.vcpu_stride)
    }

    pub fn vm_regions(&self) -> &[Region] {
        &self.vm_regions
    }

    pub fn cpu_regions(&self) -> &[Region] {
        &self.cpu_regions
    }

    pub fn vm_region(&self, subsystem: Subsystem) -> Option<&Region> {
        self.vm_regions.iter().find(|r| r.subsystem == subsystem)
    }

    pub fn cpu_region(&self, subsystem: Subsystem) -> Option<&Region> {
        self.cpu_regions.iter().find(|r| r.subsystem == subsystem)
    }
}

/// Native-endian field access on a context block.
pub(super) mod field {
    pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_ne_bytes(raw)
    }

    pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    }

    pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
        bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }
}
