//! Interrupt line identities and firmware descriptor resolution
//!
//! Lines are addressed as a (domain kind, dense index) pair. Firmware
//! hands out three-cell specifiers `{kind, index, sense flags}`; the
//! controller resolves them against the discovered line counts.

use bitflags::bitflags;

/// Number of FIQ causes with a line identity (the four timers).
pub const NR_FIQ: usize = 4;
/// Number of virtual IPI lines multiplexed on the physical "other" IPI.
pub const NR_SWIPI: usize = 32;
/// Capacity of the hardware line table; the register banks cover up to
/// 32 mask words.
pub const MAX_HW_IRQS: usize = 1024;

/// FIQ index of the hypervisor physical timer.
pub const TMR_HV_PHYS: u32 = 0;
/// FIQ index of the hypervisor virtual timer.
pub const TMR_HV_VIRT: u32 = 1;
/// FIQ index of the guest physical timer.
pub const TMR_GUEST_PHYS: u32 = 2;
/// FIQ index of the guest virtual timer.
pub const TMR_GUEST_VIRT: u32 = 3;

/// Domain kinds addressable by a firmware specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    /// Hardware-numbered level-triggered line.
    Hw,
    /// CPU-local fast-interrupt cause.
    Fiq,
    /// Virtual inter-processor interrupt line.
    Ipi,
}

bitflags! {
    /// Sense/trigger flags carried by the third specifier cell.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SenseFlags: u32 {
        const EDGE_RISING = 1 << 0;
        const EDGE_FALLING = 1 << 1;
        const LEVEL_HIGH = 1 << 2;
        const LEVEL_LOW = 1 << 3;
    }
}

/// A firmware-provided interrupt specifier, pre-parsed into its three
/// cells.
#[derive(Debug, Clone, Copy)]
pub struct IrqSpec {
    /// Domain kind cell.
    pub kind: IrqKind,
    /// Index within the domain.
    pub index: u32,
    /// Sense/trigger cell.
    pub flags: SenseFlags,
}

/// A resolved interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineId {
    kind: IrqKind,
    index: u32,
}

impl LineId {
    pub(crate) const fn new(kind: IrqKind, index: u32) -> Self {
        Self { kind, index }
    }

    pub(crate) const fn hw(index: u32) -> Self {
        Self::new(IrqKind::Hw, index)
    }

    pub(crate) const fn fiq(index: u32) -> Self {
        Self::new(IrqKind::Fiq, index)
    }

    pub(crate) const fn ipi(index: u32) -> Self {
        Self::new(IrqKind::Ipi, index)
    }

    /// Domain kind of this line.
    pub const fn kind(&self) -> IrqKind {
        self.kind
    }

    /// Dense index within the domain.
    pub const fn index(&self) -> u32 {
        self.index
    }
}

/// A registered interrupt handler.
///
/// Handlers run in trap context on the CPU that took the event and must
/// do bounded work.
pub trait IrqHandler: Sync {
    fn handle(&self, line: LineId);
}

/// A set of CPUs, one bit per CPU id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask(u32);

impl CpuMask {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A set holding a single CPU.
    pub const fn single(cpu: usize) -> Self {
        Self(1 << cpu)
    }

    /// A set from a raw bitmask.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bitmask of the set.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Whether the set contains `cpu`.
    pub const fn contains(&self, cpu: usize) -> bool {
        cpu < 32 && self.0 & (1 << cpu) != 0
    }

    /// Whether the set is empty.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Add a CPU to the set.
    pub fn set(&mut self, cpu: usize) {
        self.0 |= 1 << cpu;
    }

    /// Lowest-numbered CPU in the set, if any.
    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Intersection with another set.
    pub const fn and(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    /// Iterate over the CPUs in the set, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..32).filter(move |cpu| bits & (1 << cpu) != 0)
    }
}
