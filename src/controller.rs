//! AIC controller: discovery, per-CPU bring-up, and the dispatch
//! front-end
//!
//! One controller instance owns the register window and the three
//! domains (hardware lines, FIQ causes, virtual IPIs). It is built once
//! at discovery time, before the trap vector is pointed at
//! [`AicController::handle_trap`], and lives for the machine's
//! lifetime. The platform's trap glue passes the trapping CPU's id and
//! the trap classification bits in; everything else happens here.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::fiq::{FiqCauses, FiqDomain, FiqSysRegs};
use crate::hw::HwDomain;
use crate::line::{CpuMask, IrqHandler, IrqKind, IrqSpec, LineId, MAX_HW_IRQS, NR_FIQ, NR_SWIPI};
use crate::regs::{self, AicRegs, AIC_MAX_CPUS};
use crate::vipi::VipiDomain;
use crate::{Error, Result};

bitflags! {
    /// Trap classification bits, laid out like the PSTATE interrupt
    /// mask bits the exception entry reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrapFlags: u64 {
        const FIQ = 1 << 6;
        const IRQ = 1 << 7;
    }
}

/// Controller construction parameters.
#[derive(Debug, Clone)]
pub struct AicConfig {
    /// FIQ causes polled on every FIQ trap. Different hardware
    /// generations expose different subsets.
    pub polled_fiqs: FiqCauses,
}

impl Default for AicConfig {
    fn default() -> Self {
        Self {
            // Anything left unchecked that fires results in a FIQ
            // storm, so poll everything unless told otherwise.
            polled_fiqs: FiqCauses::all(),
        }
    }
}

/// The Apple Interrupt Controller.
pub struct AicController<R: AicRegs, S: FiqSysRegs> {
    aic: R,
    sys: S,
    nr_hw: usize,
    hw: HwDomain,
    fiq: FiqDomain,
    vipi: VipiDomain,
    online: AtomicU32,
}

impl<R: AicRegs, S: FiqSysRegs> AicController<R, S> {
    /// Discover and initialize the controller.
    ///
    /// Masks every hardware line, clears every software-set latch, and
    /// routes all lines to CPU 0 by default. Must run before the trap
    /// vector is armed.
    pub fn new(aic: R, sys: S, config: AicConfig) -> Result<Self> {
        let info = aic.read(regs::AIC_INFO);
        let nr_hw = (info & regs::AIC_INFO_NR_HW) as usize;

        if nr_hw == 0 || nr_hw > MAX_HW_IRQS {
            log::error!("AIC reports unusable hardware line count {}", nr_hw);
            return Err(Error::ResourceUnavailable);
        }

        let irqc = Self {
            hw: HwDomain::new(nr_hw),
            fiq: FiqDomain::new(config.polled_fiqs),
            vipi: VipiDomain::new(),
            nr_hw,
            aic,
            sys,
            online: AtomicU32::new(0),
        };

        for i in 0..regs::mask_words(nr_hw) {
            irqc.aic.write(regs::AIC_MASK_SET + i as u32 * 4, !0);
        }
        for i in 0..regs::mask_words(nr_hw) {
            irqc.aic.write(regs::AIC_SW_CLR + i as u32 * 4, !0);
        }
        for i in 0..nr_hw {
            irqc.aic.write(regs::AIC_TARGET_CPU + i as u32 * 4, 1);
        }

        log::info!(
            "AIC: initialized with {} IRQs, {} FIQs, {} vIPIs",
            nr_hw,
            NR_FIQ,
            NR_SWIPI
        );

        Ok(irqc)
    }

    /// Number of implemented hardware lines.
    pub fn nr_hw(&self) -> usize {
        self.nr_hw
    }

    /// CPUs that have completed [`Self::cpu_init`].
    pub fn online(&self) -> CpuMask {
        CpuMask::from_bits(self.online.load(Ordering::Relaxed))
    }

    /// Resolve a firmware interrupt specifier against the discovered
    /// line counts.
    pub fn resolve(&self, spec: &IrqSpec) -> Result<LineId> {
        let in_range = match spec.kind {
            IrqKind::Hw => (spec.index as usize) < self.nr_hw,
            IrqKind::Fiq => (spec.index as usize) < NR_FIQ,
            IrqKind::Ipi => (spec.index as usize) < NR_SWIPI,
        };
        if in_range {
            Ok(LineId::new(spec.kind, spec.index))
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Register the handler dispatched when `line` fires. Lines keep
    /// their handler for the lifetime of the controller.
    pub fn bind(&self, line: LineId, handler: &'static dyn IrqHandler) -> Result<()> {
        match line.kind() {
            IrqKind::Hw => self.hw.bind(line.index(), handler),
            IrqKind::Fiq => self.fiq.bind(line.index(), handler),
            IrqKind::Ipi => self.vipi.bind(line.index(), handler),
        }
    }

    /// Enable `line`. For virtual IPIs this is per-CPU state and
    /// applies to the calling CPU.
    pub fn enable(&self, cpu: usize, line: LineId) -> Result<()> {
        match line.kind() {
            IrqKind::Hw => self.hw.enable(&self.aic, line.index()),
            IrqKind::Fiq => self.fiq.enable(&self.sys, line.index()),
            IrqKind::Ipi => self.vipi.unmask(&self.aic, cpu, line.index()),
        }
    }

    /// Disable `line`; no handler fires for it until it is enabled
    /// again.
    pub fn disable(&self, cpu: usize, line: LineId) -> Result<()> {
        match line.kind() {
            IrqKind::Hw => self.hw.disable(&self.aic, line.index()),
            IrqKind::Fiq => self.fiq.disable(&self.sys, line.index()),
            IrqKind::Ipi => self.vipi.mask(&self.aic, cpu, line.index()),
        }
    }

    /// Signal end of interrupt for `line`, restoring it to the state
    /// its owner asked for. The dispatch loop does this itself; the
    /// operation is exposed for flows that finish an interrupt out of
    /// band.
    pub fn end_of_interrupt(&self, line: LineId) -> Result<()> {
        match line.kind() {
            IrqKind::Hw => self.hw.eoi(&self.aic, line.index()),
            IrqKind::Fiq => self.fiq.eoi(&self.sys, line.index()),
            // Virtual IPIs are cleared by the receive drain.
            IrqKind::Ipi => Ok(()),
        }
    }

    /// Route a hardware line to one CPU of `mask`. Returns the CPU
    /// actually selected, or fails with the previous routing unchanged
    /// when no requested CPU is online.
    pub fn set_affinity(&self, line: LineId, mask: CpuMask) -> Result<usize> {
        self.affinity(line, mask, false)
    }

    /// Like [`Self::set_affinity`] but picks the first requested CPU
    /// even if it is not online.
    pub fn set_affinity_force(&self, line: LineId, mask: CpuMask) -> Result<usize> {
        self.affinity(line, mask, true)
    }

    fn affinity(&self, line: LineId, mask: CpuMask, force: bool) -> Result<usize> {
        match line.kind() {
            IrqKind::Hw => self
                .hw
                .set_affinity(&self.aic, self.online(), line.index(), mask, force),
            // FIQ causes and virtual IPIs are inherently per-CPU.
            IrqKind::Fiq | IrqKind::Ipi => Err(Error::InvalidArgument),
        }
    }

    /// Send a virtual IPI to every destination CPU that has it enabled.
    pub fn send_ipi(&self, line: LineId, dest: CpuMask) -> Result<()> {
        match line.kind() {
            IrqKind::Ipi => self.vipi.send(&self.aic, line.index(), dest),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Trigger a hardware line from software; the latch is ORed with
    /// the line's hardware state.
    pub fn sw_trigger(&self, line: LineId) -> Result<()> {
        match line.kind() {
            IrqKind::Hw => self.hw.sw_trigger(&self.aic, line.index()),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Per-CPU bring-up hook; run on every CPU as it comes online,
    /// before it can take AIC traps.
    pub fn cpu_init(&self, cpu: usize) -> Result<()> {
        if cpu >= AIC_MAX_CPUS {
            return Err(Error::InvalidArgument);
        }

        // Mask all hard-wired per-CPU IRQ/FIQ sources. The physical
        // IPIs stay masked until a virtual line is enabled.
        self.aic.write(
            regs::AIC_IPI_ACK,
            regs::AIC_IPI_SELF | regs::AIC_IPI_OTHER,
        );
        self.aic.write(
            regs::AIC_IPI_MASK_SET,
            regs::AIC_IPI_SELF | regs::AIC_IPI_OTHER,
        );
        self.sys.disable_vgic_maintenance();
        self.sys.ack_fast_ipi();
        for timer in 0..NR_FIQ as u32 {
            self.sys.set_timer_masked(timer, true);
        }
        self.sys.silence_pmc();
        self.sys.silence_uncore_pmc();

        self.online.fetch_or(1 << cpu, Ordering::Relaxed);

        // The kernel's idea of logical CPU order has to match the
        // AIC's. A machine where it doesn't needs a mapping table like
        // other interrupt controller drivers carry.
        let whoami = self.aic.read(regs::AIC_WHOAMI) as usize;
        if whoami != cpu {
            log::error!(
                "AIC reports CPU id {} but this CPU is numbered {}",
                whoami,
                cpu
            );
        }

        Ok(())
    }

    /// Trap entry point; `cpu` is the trapping CPU and `trap` carries
    /// the interrupt-class bits the exception vector observed.
    pub fn handle_trap(&self, cpu: usize, trap: TrapFlags) {
        // FIQ causes arrive on their own classification bit and are
        // polled regardless of hardware-line state.
        if trap.contains(TrapFlags::FIQ) {
            self.fiq.handle(&self.sys);
        }

        if trap.contains(TrapFlags::IRQ) {
            self.handle_irq(cpu);
        }
    }

    /// Drain the event register until it reads empty. One poll may
    /// coalesce several pending causes, so a single-shot read is not
    /// enough.
    fn handle_irq(&self, cpu: usize) {
        loop {
            let event = self.aic.read_event();
            let ty = regs::event_type(event);
            let num = regs::event_num(event);

            if ty == regs::AIC_EVENT_TYPE_HW {
                // The event read acknowledged and auto-masked the line.
                // EOI after the handler restores it; an unhandled line
                // stays masked so it cannot re-trap forever.
                if self.hw.dispatch(num) {
                    let _ = self.hw.eoi(&self.aic, num);
                }
            } else if ty == regs::AIC_EVENT_TYPE_IPI && num == regs::AIC_EVENT_IPI_OTHER {
                self.vipi.receive(&self.aic, cpu);
            } else if event != 0 {
                log::error!("unknown IRQ event {}, {}", ty, num);
            }

            if event == 0 {
                break;
            }
        }

        // vGIC maintenance interrupts end up here too. Report and
        // disable the source until it is handled properly.
        if self.sys.vgic_maintenance_firing() {
            log::error!("vGIC IRQ fired, disabling");
            self.sys.disable_vgic_maintenance();
        }
    }
}
