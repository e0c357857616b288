//! FIQ domain
//!
//! FIQ causes are CPU-local and share one trap vector with no status
//! register enumerating which cause fired, so every configured cause is
//! polled on each FIQ trap. The dispatchable causes are the four timers;
//! fast IPIs and the per-core/uncore performance counters are detected
//! and silenced until they grow real support, because leaving any firing
//! cause armed produces a FIQ storm.
//!
//! Only the guest timers have real mask bits; the other causes are
//! "masked" by quieting the cause itself.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::RwLock;

use crate::line::{IrqHandler, LineId, NR_FIQ, TMR_GUEST_PHYS, TMR_GUEST_VIRT};
use crate::{Error, Result};

/// Architectural timer control bits (CNT*_CTL_EL*).
pub const TIMER_CTL_ENABLE: u64 = 1 << 0;
pub const TIMER_CTL_IMASK: u64 = 1 << 1;
pub const TIMER_CTL_ISTATUS: u64 = 1 << 2;

/// A timer is firing when it is enabled, unmasked, and its interrupt
/// status is set.
pub const fn timer_ctl_firing(ctl: u64) -> bool {
    ctl & (TIMER_CTL_ENABLE | TIMER_CTL_IMASK | TIMER_CTL_ISTATUS)
        == (TIMER_CTL_ENABLE | TIMER_CTL_ISTATUS)
}

bitflags! {
    /// The FIQ causes polled on every trap. Hardware generations expose
    /// different subsets, so the set is a construction parameter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiqCauses: u32 {
        /// The four CNT timers (HV and guest, physical and virtual).
        const TIMERS = 1 << 0;
        /// The fast IPI status register.
        const FAST_IPI = 1 << 1;
        /// Per-core performance counters.
        const PMC = 1 << 2;
        /// Per-cluster uncore performance counters.
        const UNCORE_PMC = 1 << 3;
    }
}

/// System-register access used by the FIQ domain and per-CPU bring-up.
///
/// All registers behind this trait are CPU-local; implementations read
/// and write the registers of the calling CPU.
pub trait FiqSysRegs: Sync {
    /// Control value of the timer behind FIQ index `timer`.
    fn timer_ctl(&self, timer: u32) -> u64;

    /// Set or clear the IMASK bit of the timer behind FIQ index `timer`.
    fn set_timer_masked(&self, timer: u32, masked: bool);

    /// Flip a guest timer's FIQ delivery bit (the only causes with a
    /// real mask); `enabled` set means delivery is allowed.
    fn set_guest_timer_enabled(&self, virt: bool, enabled: bool);

    /// Whether a fast IPI is pending on this CPU.
    fn fast_ipi_pending(&self) -> bool;

    /// Acknowledge a pending fast IPI.
    fn ack_fast_ipi(&self);

    /// Whether the core performance counters fired a FIQ.
    fn pmc_firing(&self) -> bool;

    /// Turn the core performance counter interrupt off at the source.
    fn silence_pmc(&self);

    /// Whether the uncore performance counters fired a FIQ.
    fn uncore_pmc_firing(&self) -> bool;

    /// Turn the uncore performance counter interrupt off at the source.
    fn silence_uncore_pmc(&self);

    /// Whether the vGIC maintenance interrupt is enabled and pending.
    fn vgic_maintenance_firing(&self) -> bool;

    /// Disable the vGIC maintenance interrupt.
    fn disable_vgic_maintenance(&self);
}

impl<T: FiqSysRegs> FiqSysRegs for &T {
    fn timer_ctl(&self, timer: u32) -> u64 {
        (*self).timer_ctl(timer)
    }
    fn set_timer_masked(&self, timer: u32, masked: bool) {
        (*self).set_timer_masked(timer, masked)
    }
    fn set_guest_timer_enabled(&self, virt: bool, enabled: bool) {
        (*self).set_guest_timer_enabled(virt, enabled)
    }
    fn fast_ipi_pending(&self) -> bool {
        (*self).fast_ipi_pending()
    }
    fn ack_fast_ipi(&self) {
        (*self).ack_fast_ipi()
    }
    fn pmc_firing(&self) -> bool {
        (*self).pmc_firing()
    }
    fn silence_pmc(&self) {
        (*self).silence_pmc()
    }
    fn uncore_pmc_firing(&self) -> bool {
        (*self).uncore_pmc_firing()
    }
    fn silence_uncore_pmc(&self) {
        (*self).silence_uncore_pmc()
    }
    fn vgic_maintenance_firing(&self) -> bool {
        (*self).vgic_maintenance_firing()
    }
    fn disable_vgic_maintenance(&self) {
        (*self).disable_vgic_maintenance()
    }
}

/// The fast-path cause domain.
pub(crate) struct FiqDomain {
    handlers: RwLock<[Option<&'static dyn IrqHandler>; NR_FIQ]>,
    disabled: AtomicU32,
    masked: AtomicU32,
    polled: FiqCauses,
}

impl FiqDomain {
    pub(crate) fn new(polled: FiqCauses) -> Self {
        Self {
            handlers: RwLock::new([None; NR_FIQ]),
            disabled: AtomicU32::new(0),
            masked: AtomicU32::new(0),
            polled,
        }
    }

    fn check(&self, index: u32) -> Result<()> {
        if (index as usize) < NR_FIQ {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    pub(crate) fn bind(&self, index: u32, handler: &'static dyn IrqHandler) -> Result<()> {
        self.check(index)?;
        self.handlers.write()[index as usize] = Some(handler);
        Ok(())
    }

    pub(crate) fn mask<S: FiqSysRegs>(&self, sys: &S, index: u32) -> Result<()> {
        self.check(index)?;
        self.masked.fetch_or(1 << index, Ordering::Relaxed);
        // Only the guest timers have real mask bits, unfortunately.
        match index {
            TMR_GUEST_PHYS => sys.set_guest_timer_enabled(false, false),
            TMR_GUEST_VIRT => sys.set_guest_timer_enabled(true, false),
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn unmask<S: FiqSysRegs>(&self, sys: &S, index: u32) -> Result<()> {
        self.check(index)?;
        self.masked.fetch_and(!(1 << index), Ordering::Relaxed);
        match index {
            TMR_GUEST_PHYS => sys.set_guest_timer_enabled(false, true),
            TMR_GUEST_VIRT => sys.set_guest_timer_enabled(true, true),
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn enable<S: FiqSysRegs>(&self, sys: &S, index: u32) -> Result<()> {
        self.check(index)?;
        self.disabled.fetch_and(!(1 << index), Ordering::Relaxed);
        self.unmask(sys, index)
    }

    pub(crate) fn disable<S: FiqSysRegs>(&self, sys: &S, index: u32) -> Result<()> {
        self.check(index)?;
        self.disabled.fetch_or(1 << index, Ordering::Relaxed);
        self.mask(sys, index)
    }

    /// We mask to ack (where we can), so we need to unmask at EOI.
    pub(crate) fn eoi<S: FiqSysRegs>(&self, sys: &S, index: u32) -> Result<()> {
        self.check(index)?;
        let bit = 1 << index;
        if self.disabled.load(Ordering::Relaxed) & bit == 0
            && self.masked.load(Ordering::Relaxed) & bit == 0
        {
            match index {
                TMR_GUEST_PHYS => sys.set_guest_timer_enabled(false, true),
                TMR_GUEST_VIRT => sys.set_guest_timer_enabled(true, true),
                _ => {}
            }
        }
        Ok(())
    }

    /// Poll every configured cause and dispatch or silence it.
    ///
    /// There is no status register enumerating FIQ sources, so each
    /// potential cause is checked on every trap. A firing cause with no
    /// handler must be quieted at the source or it re-traps forever.
    pub(crate) fn handle<S: FiqSysRegs>(&self, sys: &S) {
        if self.polled.contains(FiqCauses::FAST_IPI) && sys.fast_ipi_pending() {
            log::warn!("fast IPI fired, acking");
            sys.ack_fast_ipi();
        }

        if self.polled.contains(FiqCauses::TIMERS) {
            for timer in 0..NR_FIQ as u32 {
                if timer_ctl_firing(sys.timer_ctl(timer)) {
                    self.deliver_timer(sys, timer);
                }
            }
        }

        if self.polled.contains(FiqCauses::PMC) && sys.pmc_firing() {
            log::warn!("PMC FIQ fired, masking");
            sys.silence_pmc();
        }

        if self.polled.contains(FiqCauses::UNCORE_PMC) && sys.uncore_pmc_firing() {
            log::warn!("uncore PMC FIQ fired, masking");
            sys.silence_uncore_pmc();
        }
    }

    fn deliver_timer<S: FiqSysRegs>(&self, sys: &S, timer: u32) {
        let handler = self.handlers.read()[timer as usize];
        match handler {
            Some(handler) => {
                // Ack by masking where a real mask bit exists. Soft
                // state stays untouched so EOI restores the line.
                match timer {
                    TMR_GUEST_PHYS => sys.set_guest_timer_enabled(false, false),
                    TMR_GUEST_VIRT => sys.set_guest_timer_enabled(true, false),
                    _ => {}
                }
                handler.handle(LineId::fiq(timer));
                let _ = self.eoi(sys, timer);
            }
            None => {
                log::warn!("FIQ timer {} fired with no handler, masking", timer);
                sys.set_timer_masked(timer, true);
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        use aarch64_cpu::registers::{CNTP_CTL_EL0, CNTV_CTL_EL0};
        use tock_registers::interfaces::{Readable, Writeable};

        macro_rules! read_apple_sysreg {
            ($name:literal) => {{
                let val: u64;
                unsafe {
                    core::arch::asm!(
                        concat!("mrs {val}, ", $name),
                        val = out(reg) val,
                        options(nomem, nostack),
                    );
                }
                val
            }};
        }

        macro_rules! write_apple_sysreg {
            ($name:literal, $val:expr) => {{
                let val: u64 = $val;
                unsafe {
                    core::arch::asm!(
                        concat!("msr ", $name, ", {val}"),
                        val = in(reg) val,
                        options(nomem, nostack),
                    );
                }
            }};
        }

        // Apple vendor-defined and EL2-view system registers, by encoding.
        const IPI_SR_PENDING: u64 = 1 << 0;
        const VM_TMR_MASK_V: u64 = 1 << 0;
        const VM_TMR_MASK_P: u64 = 1 << 1;
        const PMCR0_IMODE: u64 = 0x7 << 8;
        const PMCR0_IMODE_OFF: u64 = 0 << 8;
        const PMCR0_IMODE_FIQ: u64 = 4 << 8;
        const PMCR0_IACT: u64 = 1 << 11;
        const UPMCR0_IMODE: u64 = 0x7 << 16;
        const UPMCR0_IMODE_OFF: u64 = 0 << 16;
        const UPMCR0_IMODE_FIQ: u64 = 4 << 16;
        const UPMSR_IACT: u64 = 1 << 0;
        const ICH_HCR_EN: u64 = 1 << 0;

        /// The real CPU-local register backend for Apple SoCs.
        pub struct AppleSysRegs;

        impl FiqSysRegs for AppleSysRegs {
            fn timer_ctl(&self, timer: u32) -> u64 {
                match timer {
                    crate::line::TMR_HV_PHYS => CNTP_CTL_EL0.get(),
                    crate::line::TMR_HV_VIRT => CNTV_CTL_EL0.get(),
                    crate::line::TMR_GUEST_PHYS => read_apple_sysreg!("S3_5_C14_C2_1"),
                    crate::line::TMR_GUEST_VIRT => read_apple_sysreg!("S3_5_C14_C3_1"),
                    _ => 0,
                }
            }

            fn set_timer_masked(&self, timer: u32, masked: bool) {
                let update = |ctl: u64| if masked {
                    ctl | TIMER_CTL_IMASK
                } else {
                    ctl & !TIMER_CTL_IMASK
                };
                match timer {
                    crate::line::TMR_HV_PHYS => CNTP_CTL_EL0.set(update(CNTP_CTL_EL0.get())),
                    crate::line::TMR_HV_VIRT => CNTV_CTL_EL0.set(update(CNTV_CTL_EL0.get())),
                    crate::line::TMR_GUEST_PHYS => {
                        write_apple_sysreg!("S3_5_C14_C2_1", update(read_apple_sysreg!("S3_5_C14_C2_1")));
                    }
                    crate::line::TMR_GUEST_VIRT => {
                        write_apple_sysreg!("S3_5_C14_C3_1", update(read_apple_sysreg!("S3_5_C14_C3_1")));
                    }
                    _ => {}
                }
            }

            fn set_guest_timer_enabled(&self, virt: bool, enabled: bool) {
                let bit = if virt { VM_TMR_MASK_V } else { VM_TMR_MASK_P };
                let cur = read_apple_sysreg!("S3_5_C15_C1_3");
                let new = if enabled { cur | bit } else { cur & !bit };
                write_apple_sysreg!("S3_5_C15_C1_3", new);
            }

            fn fast_ipi_pending(&self) -> bool {
                read_apple_sysreg!("S3_5_C15_C1_1") & IPI_SR_PENDING != 0
            }

            fn ack_fast_ipi(&self) {
                write_apple_sysreg!("S3_5_C15_C1_1", IPI_SR_PENDING);
            }

            fn pmc_firing(&self) -> bool {
                read_apple_sysreg!("S3_1_C15_C0_0") & (PMCR0_IMODE | PMCR0_IACT)
                    == (PMCR0_IMODE_FIQ | PMCR0_IACT)
            }

            fn silence_pmc(&self) {
                let cur = read_apple_sysreg!("S3_1_C15_C0_0");
                write_apple_sysreg!(
                    "S3_1_C15_C0_0",
                    (cur & !(PMCR0_IMODE | PMCR0_IACT)) | PMCR0_IMODE_OFF
                );
            }

            fn uncore_pmc_firing(&self) -> bool {
                read_apple_sysreg!("S3_7_C15_C0_4") & UPMCR0_IMODE == UPMCR0_IMODE_FIQ
                    && read_apple_sysreg!("S3_7_C15_C6_4") & UPMSR_IACT != 0
            }

            fn silence_uncore_pmc(&self) {
                let cur = read_apple_sysreg!("S3_7_C15_C0_4");
                write_apple_sysreg!("S3_7_C15_C0_4", (cur & !UPMCR0_IMODE) | UPMCR0_IMODE_OFF);
            }

            fn vgic_maintenance_firing(&self) -> bool {
                read_apple_sysreg!("ICH_HCR_EL2") & ICH_HCR_EN != 0
                    && read_apple_sysreg!("ICH_MISR_EL2") != 0
            }

            fn disable_vgic_maintenance(&self) {
                let cur = read_apple_sysreg!("ICH_HCR_EL2");
                write_apple_sysreg!("ICH_HCR_EL2", cur & !ICH_HCR_EN);
            }
        }
    }
}
