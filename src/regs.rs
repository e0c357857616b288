//! AIC register map and access primitives
//!
//! This module provides the memory-mapped register interface of the Apple
//! Interrupt Controller:
//! - Register offsets and field layouts
//! - Relaxed read/write accessors over the MMIO window
//! - The ordered event read used by the dispatch loop
//!
//! Reference: Apple AIC as found on the M1 (t8103) SoC family.

use core::sync::atomic::{fence, Ordering};

/// Controller information register; bits 15:0 hold the implemented
/// hardware line count.
pub const AIC_INFO: u32 = 0x0004;
/// Hardware line count field of `AIC_INFO`.
pub const AIC_INFO_NR_HW: u32 = 0xffff;

/// Controller configuration register.
pub const AIC_CONFIG: u32 = 0x0010;

/// Per-CPU "who am I" register; returns the reading CPU's AIC id.
pub const AIC_WHOAMI: u32 = 0x2000;
/// Combined event register: {type:16, number:16}. Reading it acknowledges
/// and auto-masks the reported event.
pub const AIC_EVENT: u32 = 0x2004;

/// `AIC_EVENT` type code for a hardware line event.
pub const AIC_EVENT_TYPE_HW: u32 = 1;
/// `AIC_EVENT` type code for an IPI event.
pub const AIC_EVENT_TYPE_IPI: u32 = 4;
/// IPI event number for the "other CPU" line.
pub const AIC_EVENT_IPI_OTHER: u32 = 1;
/// IPI event number for the "self" line (unused by this driver).
pub const AIC_EVENT_IPI_SELF: u32 = 2;

/// IPI send register: one bit per destination CPU.
pub const AIC_IPI_SEND: u32 = 0x2008;
/// IPI acknowledge register.
pub const AIC_IPI_ACK: u32 = 0x200c;
/// IPI mask-set register.
pub const AIC_IPI_MASK_SET: u32 = 0x2024;
/// IPI mask-clear register.
pub const AIC_IPI_MASK_CLR: u32 = 0x2028;

/// "Other CPU" selector bit for the IPI ack/mask registers.
pub const AIC_IPI_OTHER: u32 = 1 << 0;
/// "Self" selector bit for the IPI ack/mask registers.
pub const AIC_IPI_SELF: u32 = 1 << 31;

/// Base of the per-line affinity registers (one-hot CPU selector each).
pub const AIC_TARGET_CPU: u32 = 0x3000;
/// Base of the software-set bank (ORed with the hardware line state).
pub const AIC_SW_SET: u32 = 0x4000;
/// Base of the software-clear bank.
pub const AIC_SW_CLR: u32 = 0x4080;
/// Base of the per-line mask-set bank, 32 lines per register.
pub const AIC_MASK_SET: u32 = 0x4100;
/// Base of the per-line mask-clear bank.
pub const AIC_MASK_CLR: u32 = 0x4180;

/// Max 31 bits in the IPI send register (the top bit selects self).
/// Chips with 32 or more cores need code changes anyway.
pub const AIC_MAX_CPUS: usize = 31;

/// Explicit per-CPU view of the IPI set register.
pub const fn cpu_ipi_set(cpu: usize) -> u32 {
    0x5008 + ((cpu as u32) << 7)
}

/// Explicit per-CPU view of the IPI clear register.
pub const fn cpu_ipi_clr(cpu: usize) -> u32 {
    0x500c + ((cpu as u32) << 7)
}

/// Explicit per-CPU view of the IPI mask-set register.
pub const fn cpu_ipi_mask_set(cpu: usize) -> u32 {
    0x5024 + ((cpu as u32) << 7)
}

/// Explicit per-CPU view of the IPI mask-clear register.
pub const fn cpu_ipi_mask_clr(cpu: usize) -> u32 {
    0x5028 + ((cpu as u32) << 7)
}

/// Event type field of an `AIC_EVENT` value.
pub const fn event_type(event: u32) -> u32 {
    event >> 16
}

/// Event number field of an `AIC_EVENT` value.
pub const fn event_num(event: u32) -> u32 {
    event & 0xffff
}

/// Register offset within a per-32-line bank for a line index.
pub const fn mask_reg(index: u32) -> u32 {
    4 * (index >> 5)
}

/// Bit within a per-32-line bank register for a line index.
pub const fn mask_bit(index: u32) -> u32 {
    1 << (index & 0x1f)
}

/// Number of 32-bit bank registers covering `nr` lines.
pub const fn mask_words(nr: usize) -> usize {
    (nr + 31) / 32
}

/// Send register bit selecting a destination CPU.
pub const fn ipi_send_cpu(cpu: usize) -> u32 {
    1 << cpu
}

/// Access contract for the AIC register window.
///
/// `read`/`write` are relaxed: ordering against other memory traffic does
/// not matter for mask and target pokes. `read_event` is the one ordered
/// access; see its documentation.
pub trait AicRegs: Sync {
    /// Relaxed 32-bit register read.
    fn read(&self, reg: u32) -> u32;

    /// Relaxed 32-bit register write.
    fn write(&self, reg: u32, val: u32);

    /// Ordered read of `AIC_EVENT`.
    ///
    /// This cannot be a relaxed read: device DMA has to be ordered with
    /// respect to the IRQ firing, so the handler unblocked by this read
    /// must observe the device's memory writes.
    fn read_event(&self) -> u32 {
        let event = self.read(AIC_EVENT);
        fence(Ordering::SeqCst);
        event
    }
}

impl<T: AicRegs> AicRegs for &T {
    fn read(&self, reg: u32) -> u32 {
        (*self).read(reg)
    }

    fn write(&self, reg: u32, val: u32) {
        (*self).write(reg, val)
    }

    fn read_event(&self) -> u32 {
        (*self).read_event()
    }
}

/// The real MMIO register window.
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Create an accessor over a mapped AIC register window.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a device mapping of the AIC
    /// register block, valid for the lifetime of the accessor, and must
    /// not alias ordinary memory.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

// The register window is shared by every core by design; all accesses go
// through volatile reads/writes of device memory.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl AicRegs for Mmio {
    #[inline]
    fn read(&self, reg: u32) -> u32 {
        unsafe { ((self.base + reg as usize) as *const u32).read_volatile() }
    }

    #[inline]
    fn write(&self, reg: u32, val: u32) {
        unsafe { ((self.base + reg as usize) as *mut u32).write_volatile(val) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x0001_0005, 1, 5; "hw event")]
    #[test_case(0x0004_0001, 4, 1; "ipi other event")]
    #[test_case(0, 0, 0; "empty event")]
    fn test_event_fields(event: u32, ty: u32, num: u32) {
        assert_eq!(event_type(event), ty);
        assert_eq!(event_num(event), num);
    }

    #[test_case(0, 0, 1; "line 0")]
    #[test_case(31, 0, 0x8000_0000; "line 31")]
    #[test_case(32, 4, 1; "line 32")]
    #[test_case(95, 8, 0x8000_0000; "line 95")]
    fn test_mask_bank_layout(index: u32, reg: u32, bit: u32) {
        assert_eq!(mask_reg(index), reg);
        assert_eq!(mask_bit(index), bit);
    }

    #[test]
    fn test_mask_words() {
        assert_eq!(mask_words(1), 1);
        assert_eq!(mask_words(32), 1);
        assert_eq!(mask_words(33), 2);
        assert_eq!(mask_words(896), 28);
    }

    #[test]
    fn test_cpu_ipi_views() {
        assert_eq!(cpu_ipi_set(0), 0x5008);
        assert_eq!(cpu_ipi_clr(0), 0x500c);
        assert_eq!(cpu_ipi_mask_set(1), 0x50a4);
        assert_eq!(cpu_ipi_mask_clr(2), 0x5128);
    }

    #[test]
    fn test_mmio_accessor() {
        // A plain buffer stands in for the device mapping.
        let mut buf = [0u32; 16];
        let mmio = unsafe { Mmio::new(buf.as_mut_ptr() as usize) };

        mmio.write(AIC_INFO, 0x1234);
        assert_eq!(mmio.read(AIC_INFO), 0x1234);

        mmio.write(0x0, 0xdead_beef);
        assert_eq!(mmio.read(0x0), 0xdead_beef);
        assert_eq!(mmio.read(AIC_INFO), 0x1234);
    }
}
