//! Hardware IRQ domain
//!
//! Owns the fixed set of hardware-numbered level-triggered lines:
//! masking through the per-32-line register banks, per-line affinity
//! routing, and dispatch to the registered handlers.
//!
//! The controller auto-masks a line the moment it is reported in
//! `AIC_EVENT`, so end-of-interrupt restores the line to the state it
//! should be in rather than unconditionally unmasking.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, RwLock};

use crate::line::{CpuMask, IrqHandler, LineId, MAX_HW_IRQS};
use crate::regs::{self, AicRegs};
use crate::{Error, Result};

const MASK_WORDS: usize = MAX_HW_IRQS / 32;

fn set_bit(map: &[AtomicU32], index: u32) {
    map[(index >> 5) as usize].fetch_or(1 << (index & 0x1f), Ordering::Relaxed);
}

fn clear_bit(map: &[AtomicU32], index: u32) {
    map[(index >> 5) as usize].fetch_and(!(1 << (index & 0x1f)), Ordering::Relaxed);
}

fn test_bit(map: &[AtomicU32], index: u32) -> bool {
    map[(index >> 5) as usize].load(Ordering::Relaxed) & (1 << (index & 0x1f)) != 0
}

/// The hardware line domain.
pub(crate) struct HwDomain {
    nr_hw: usize,
    handlers: RwLock<heapless::Vec<Option<&'static dyn IrqHandler>, MAX_HW_IRQS>>,
    /// Lines explicitly disabled by their owner.
    disabled: [AtomicU32; MASK_WORDS],
    /// Lines masked by their owner (hardware auto-masking is transient
    /// and not tracked here).
    masked: [AtomicU32; MASK_WORDS],
    /// Serializes affinity updates; the register write is not atomic
    /// with the CPU selection that precedes it.
    affinity_lock: Mutex<()>,
}

impl HwDomain {
    pub(crate) fn new(nr_hw: usize) -> Self {
        let mut handlers = heapless::Vec::new();
        for _ in 0..nr_hw {
            // Capacity is MAX_HW_IRQS and nr_hw was validated against it.
            let _ = handlers.push(None);
        }
        Self {
            nr_hw,
            handlers: RwLock::new(handlers),
            disabled: core::array::from_fn(|_| AtomicU32::new(0)),
            masked: core::array::from_fn(|_| AtomicU32::new(0)),
            affinity_lock: Mutex::new(()),
        }
    }

    fn check(&self, index: u32) -> Result<()> {
        if (index as usize) < self.nr_hw {
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

    pub(crate) fn mask<R: AicRegs>(&self, aic: &R, index: u32) -> Result<()> {
        self.check(index)?;
        set_bit(&self.masked, index);
        aic.write(
            regs::AIC_MASK_SET + regs::mask_reg(index),
            regs::mask_bit(index),
        );
        Ok(())
    }

    pub(crate) fn unmask<R: AicRegs>(&self, aic: &R, index: u32) -> Result<()> {
        self.check(index)?;
        clear_bit(&self.masked, index);
        aic.write(
            regs::AIC_MASK_CLR + regs::mask_reg(index),
            regs::mask_bit(index),
        );
        Ok(())
    }

    pub(crate) fn enable<R: AicRegs>(&self, aic: &R, index: u32) -> Result<()> {
        self.check(index)?;
        clear_bit(&self.disabled, index);
        self.unmask(aic, index)
    }

    pub(crate) fn disable<R: AicRegs>(&self, aic: &R, index: u32) -> Result<()> {
        self.check(index)?;
        set_bit(&self.disabled, index);
        self.mask(aic, index)
    }

    /// End of interrupt. Reading the event register acknowledged and
    /// masked the line already, so just unmask it here if needed.
    pub(crate) fn eoi<R: AicRegs>(&self, aic: &R, index: u32) -> Result<()> {
        self.check(index)?;
        if !test_bit(&self.disabled, index) && !test_bit(&self.masked, index) {
            aic.write(
                regs::AIC_MASK_CLR + regs::mask_reg(index),
                regs::mask_bit(index),
            );
        }
        Ok(())
    }

    /// Route `index` to one CPU out of `mask`. Picks the first online
    /// requested CPU, or with `force` the first requested CPU regardless
    /// of online state. Returns the resolved CPU.
    pub(crate) fn set_affinity<R: AicRegs>(
        &self,
        aic: &R,
        online: CpuMask,
        index: u32,
        mask: CpuMask,
        force: bool,
    ) -> Result<usize> {
        self.check(index)?;

        let _guard = self.affinity_lock.lock();

        let cpu = if force {
            mask.first()
        } else {
            mask.and(online).first()
        }
        .ok_or(Error::NoOnlineCpu)?;

        aic.write(regs::AIC_TARGET_CPU + index * 4, 1 << cpu);
        Ok(cpu)
    }

    /// Trigger `index` in software; the software latch is ORed with the
    /// hardware line state.
    pub(crate) fn sw_trigger<R: AicRegs>(&self, aic: &R, index: u32) -> Result<()> {
        self.check(index)?;
        aic.write(
            regs::AIC_SW_SET + regs::mask_reg(index),
            regs::mask_bit(index),
        );
        Ok(())
    }

    /// Invoke the handler for a delivered event. Returns false when the
    /// line has no handler; the caller then leaves it auto-masked so a
    /// stuck level line cannot re-trap forever.
    pub(crate) fn dispatch(&self, index: u32) -> bool {
        let handler = self
            .handlers
            .read()
            .get(index as usize)
            .copied()
            .flatten();
        match handler {
            Some(handler) => {
                handler.handle(LineId::hw(index));
                true
            }
            None => {
                log::warn!("hardware IRQ {} fired with no handler bound", index);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_masked(&self, index: u32) -> bool {
        test_bit(&self.masked, index)
    }
}
