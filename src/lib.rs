//! Driver for the Apple Interrupt Controller (AIC) found on Apple
//! Silicon SoCs.
//!
//! The AIC is a single-die interrupt controller with three kinds of
//! inputs, each managed by its own domain:
//!
//! - hardware-numbered level-triggered lines ([`line::IrqKind::Hw`])
//! - CPU-local FIQ causes with no status register ([`line::IrqKind::Fiq`])
//! - virtual inter-processor interrupts multiplexed onto the single
//!   physical IPI line ([`line::IrqKind::Ipi`])
//!
//! [`AicController`] ties the domains together behind one dispatch
//! front-end driven from the trap vector. Hardware access goes through
//! the [`regs::AicRegs`] and [`fiq::FiqSysRegs`] traits; on real
//! hardware these are [`regs::Mmio`] and the aarch64 system-register
//! backend.

#![cfg_attr(not(test), no_std)]

pub mod controller;
pub mod fiq;
pub mod line;
pub mod regs;

mod hw;
mod vipi;

#[cfg(test)]
pub(crate) mod fake;

pub use controller::{AicConfig, AicController, TrapFlags};
pub use fiq::FiqCauses;
pub use line::{CpuMask, IrqHandler, IrqKind, IrqSpec, LineId, SenseFlags};

use core::fmt;

/// Errors reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument was out of range or of the wrong kind for the
    /// operation.
    InvalidArgument,
    /// The hardware reported a configuration the driver cannot use.
    ResourceUnavailable,
    /// An affinity request named no online CPU.
    NoOnlineCpu,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::ResourceUnavailable => write!(f, "resource unavailable"),
            Error::NoOnlineCpu => write!(f, "no online CPU in requested set"),
        }
    }
}

/// Driver-wide result type.
pub type Result<T> = core::result::Result<T, Error>;
