//! Virtual IPI domain
//!
//! The hardware offers exactly one "other CPU" IPI line per direction
//! (plus an unused "self" line), but the system needs many independent
//! software IPIs. This domain multiplexes `NR_SWIPI` virtual lines onto
//! the single physical line with two per-CPU atomic words:
//!
//! - `pending`: virtual lines signaled but not yet delivered to the CPU
//! - `enabled`: virtual lines the CPU currently accepts
//!
//! Sends to a destination with the line masked are dropped, never
//! queued. Multiple sends to one (CPU, line) pair before the receiver
//! drains coalesce into a single delivery, which is fine for
//! edge-style "go do work" signals.
//!
//! Other CPUs only ever touch a peer's `pending` word through single
//! atomic OR operations; everything else is CPU-local. The two fence
//! pairs below are the sole cross-core ordering contract.

use core::sync::atomic::{fence, AtomicU32, Ordering};

use spin::RwLock;

use crate::line::{CpuMask, IrqHandler, LineId, NR_SWIPI};
use crate::regs::{self, AicRegs, AIC_MAX_CPUS};
use crate::{Error, Result};

/// The virtual IPI domain.
pub(crate) struct VipiDomain {
    pending: [AtomicU32; AIC_MAX_CPUS],
    enabled: [AtomicU32; AIC_MAX_CPUS],
    handlers: RwLock<[Option<&'static dyn IrqHandler>; NR_SWIPI]>,
}

impl VipiDomain {
    pub(crate) fn new() -> Self {
        Self {
            pending: core::array::from_fn(|_| AtomicU32::new(0)),
            enabled: core::array::from_fn(|_| AtomicU32::new(0)),
            handlers: RwLock::new([None; NR_SWIPI]),
        }
    }

    fn check(&self, index: u32) -> Result<()> {
        if (index as usize) < NR_SWIPI {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu < AIC_MAX_CPUS {
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

    /// Mask a virtual line on `cpu`. When nothing is left enabled there
    /// is no possible work to receive, so the physical line is masked
    /// too.
    pub(crate) fn mask<R: AicRegs>(&self, aic: &R, cpu: usize, index: u32) -> Result<()> {
        self.check(index)?;
        self.check_cpu(cpu)?;

        self.enabled[cpu].fetch_and(!(1 << index), Ordering::Relaxed);

        if self.enabled[cpu].load(Ordering::Relaxed) == 0 {
            aic.write(regs::AIC_IPI_MASK_SET, regs::AIC_IPI_OTHER);
        }
        Ok(())
    }

    /// Unmask a virtual line on `cpu`. Re-arming the physical line
    /// unconditionally is cheaper than tracking whether it already is.
    pub(crate) fn unmask<R: AicRegs>(&self, aic: &R, cpu: usize, index: u32) -> Result<()> {
        self.check(index)?;
        self.check_cpu(cpu)?;

        self.enabled[cpu].fetch_or(1 << index, Ordering::Relaxed);
        aic.write(regs::AIC_IPI_MASK_CLR, regs::AIC_IPI_OTHER);
        Ok(())
    }

    /// Signal a virtual line on every destination that currently has it
    /// enabled, then kick the destinations with one physical IPI write.
    pub(crate) fn send<R: AicRegs>(&self, aic: &R, index: u32, dest: CpuMask) -> Result<()> {
        self.check(index)?;

        let bit = 1 << index;
        let mut send = 0;

        // Make the sender's prior ordinary stores visible before any
        // receiver can observe the pending bit; this pairs with the
        // fence after the exchange in `receive`.
        fence(Ordering::SeqCst);

        for cpu in dest.iter() {
            if cpu >= AIC_MAX_CPUS {
                continue;
            }
            if self.enabled[cpu].load(Ordering::Relaxed) & bit != 0 {
                self.pending[cpu].fetch_or(bit, Ordering::Relaxed);
                send |= regs::ipi_send_cpu(cpu);
            }
        }

        if send != 0 {
            // The pending stores must complete before the physical IPI
            // goes out; pairs with the fence after the ack in `receive`.
            fence(Ordering::SeqCst);
            aic.write(regs::AIC_IPI_SEND, send);
        }
        Ok(())
    }

    /// Drain and dispatch the virtual lines pending on `cpu` after the
    /// physical "other" IPI fired.
    pub(crate) fn receive<R: AicRegs>(&self, aic: &R, cpu: usize) {
        if cpu >= AIC_MAX_CPUS {
            log::error!("IPI delivered to out-of-range CPU {}", cpu);
            return;
        }

        aic.write(regs::AIC_IPI_ACK, regs::AIC_IPI_OTHER);

        // The IPI must be received and acked before the pending word is
        // loaded; pairs with the second fence in `send`.
        fence(Ordering::SeqCst);

        let firing = self.pending[cpu].swap(0, Ordering::Relaxed);

        // The exchange must complete before any handler runs, so
        // handlers observe the sender's stores; pairs with the first
        // fence in `send`.
        fence(Ordering::Acquire);

        if firing != 0 {
            let handlers = self.handlers.read();
            for index in 0..NR_SWIPI as u32 {
                if firing & (1 << index) == 0 {
                    continue;
                }
                match handlers[index as usize] {
                    Some(handler) => handler.handle(LineId::ipi(index)),
                    None => log::warn!("virtual IPI {} fired with no handler bound", index),
                }
            }
        }

        // Delivery auto-masked the physical line; re-arm it only after
        // the pending set drained, or a re-firing line traps forever.
        aic.write(regs::AIC_IPI_MASK_CLR, regs::AIC_IPI_OTHER);
    }

    #[cfg(test)]
    pub(crate) fn pending_on(&self, cpu: usize) -> u32 {
        self.pending[cpu].load(Ordering::Relaxed)
    }
}
