//! Behavioral register models used by the unit tests.
//!
//! `FakeAic` models the controller state machine behind the register
//! window: line latches, mask banks, per-line affinity, the IPI
//! registers, and the acknowledge-and-auto-mask semantics of the event
//! register. `FakeSysRegs` models the CPU-local cause registers. Both
//! are shared-reference friendly so the code under test can hold them
//! the same way it would hold a device mapping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::fiq::{FiqSysRegs, TIMER_CTL_ENABLE, TIMER_CTL_IMASK, TIMER_CTL_ISTATUS};
use crate::line::{IrqHandler, LineId, MAX_HW_IRQS, NR_FIQ};
use crate::regs::{self, AicRegs};

const BANK_WORDS: usize = MAX_HW_IRQS / 32;

#[derive(Default)]
struct AicState {
    hw_pending: [u32; BANK_WORDS],
    sw_pending: [u32; BANK_WORDS],
    masked: [u32; BANK_WORDS],
    target: Vec<u32>,
    ipi_pending: u32,
    ipi_masked: u32,
    last_ipi_send: Option<u32>,
    /// Values injected ahead of the modeled event stream.
    raw_events: VecDeque<u32>,
}

/// In-memory model of the AIC register window.
pub(crate) struct FakeAic {
    nr_hw: usize,
    current_cpu: AtomicUsize,
    state: Mutex<AicState>,
}

impl FakeAic {
    pub(crate) fn new(nr_hw: usize) -> Self {
        Self {
            nr_hw,
            current_cpu: AtomicUsize::new(0),
            state: Mutex::new(AicState {
                target: vec![0; MAX_HW_IRQS],
                ..AicState::default()
            }),
        }
    }

    /// Set the CPU subsequent per-CPU register accesses act as.
    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.current_cpu.store(cpu, Ordering::Relaxed);
    }

    /// Assert a hardware line, as a device would.
    pub(crate) fn trigger_hw(&self, index: u32) {
        let mut state = self.state.lock();
        state.hw_pending[(index >> 5) as usize] |= 1 << (index & 0x1f);
    }

    /// Mask a line directly, as event delivery does.
    pub(crate) fn force_hw_mask(&self, index: u32) {
        let mut state = self.state.lock();
        state.masked[(index >> 5) as usize] |= 1 << (index & 0x1f);
    }

    pub(crate) fn hw_masked(&self, index: u32) -> bool {
        self.state.lock().masked[(index >> 5) as usize] & (1 << (index & 0x1f)) != 0
    }

    pub(crate) fn hw_pending(&self, index: u32) -> bool {
        let state = self.state.lock();
        let word = (index >> 5) as usize;
        (state.hw_pending[word] | state.sw_pending[word]) & (1 << (index & 0x1f)) != 0
    }

    pub(crate) fn ipi_masked(&self, cpu: usize) -> bool {
        self.state.lock().ipi_masked & (1 << cpu) != 0
    }

    /// Last value written to the IPI send register, if any.
    pub(crate) fn last_ipi_send(&self) -> Option<u32> {
        self.state.lock().last_ipi_send
    }

    /// Queue a raw event value ahead of the modeled event stream.
    pub(crate) fn push_raw_event(&self, event: u32) {
        self.state.lock().raw_events.push_back(event);
    }

    pub(crate) fn read_reg(&self, reg: u32) -> u32 {
        self.read(reg)
    }

    fn read_event_value(&self) -> u32 {
        let cpu = self.current_cpu.load(Ordering::Relaxed);
        let mut state = self.state.lock();

        if let Some(event) = state.raw_events.pop_front() {
            return event;
        }

        for index in 0..self.nr_hw as u32 {
            let word = (index >> 5) as usize;
            let bit = 1 << (index & 0x1f);
            let pending = (state.hw_pending[word] | state.sw_pending[word]) & !state.masked[word];
            if pending & bit != 0 && state.target[index as usize] & (1 << cpu) != 0 {
                // Reading the event acknowledges and auto-masks it.
                state.masked[word] |= bit;
                state.hw_pending[word] &= !bit;
                state.sw_pending[word] &= !bit;
                return (regs::AIC_EVENT_TYPE_HW << 16) | index;
            }
        }

        let cpu_bit = 1 << cpu;
        if state.ipi_pending & cpu_bit != 0 && state.ipi_masked & cpu_bit == 0 {
            state.ipi_masked |= cpu_bit;
            state.ipi_pending &= !cpu_bit;
            return (regs::AIC_EVENT_TYPE_IPI << 16) | regs::AIC_EVENT_IPI_OTHER;
        }

        0
    }
}

impl AicRegs for FakeAic {
    fn read(&self, reg: u32) -> u32 {
        match reg {
            regs::AIC_INFO => (self.nr_hw as u32) & regs::AIC_INFO_NR_HW,
            regs::AIC_WHOAMI => self.current_cpu.load(Ordering::Relaxed) as u32,
            regs::AIC_EVENT => self.read_event_value(),
            r if (regs::AIC_TARGET_CPU..regs::AIC_SW_SET).contains(&r) => {
                let index = ((r - regs::AIC_TARGET_CPU) / 4) as usize;
                self.state.lock().target[index]
            }
            r if (regs::AIC_MASK_SET..regs::AIC_MASK_CLR).contains(&r) => {
                let word = ((r - regs::AIC_MASK_SET) / 4) as usize;
                self.state.lock().masked[word]
            }
            _ => 0,
        }
    }

    fn write(&self, reg: u32, val: u32) {
        let cpu_bit = 1 << self.current_cpu.load(Ordering::Relaxed);
        let mut state = self.state.lock();
        match reg {
            regs::AIC_IPI_SEND => {
                state.ipi_pending |= val;
                state.last_ipi_send = Some(val);
            }
            regs::AIC_IPI_ACK => {
                if val & regs::AIC_IPI_OTHER != 0 {
                    state.ipi_pending &= !cpu_bit;
                }
            }
            regs::AIC_IPI_MASK_SET => {
                if val & regs::AIC_IPI_OTHER != 0 {
                    state.ipi_masked |= cpu_bit;
                }
            }
            regs::AIC_IPI_MASK_CLR => {
                if val & regs::AIC_IPI_OTHER != 0 {
                    state.ipi_masked &= !cpu_bit;
                }
            }
            r if (regs::AIC_TARGET_CPU..regs::AIC_SW_SET).contains(&r) => {
                let index = ((r - regs::AIC_TARGET_CPU) / 4) as usize;
                state.target[index] = val;
            }
            r if (regs::AIC_SW_SET..regs::AIC_SW_CLR).contains(&r) => {
                let word = ((r - regs::AIC_SW_SET) / 4) as usize;
                state.sw_pending[word] |= val;
            }
            r if (regs::AIC_SW_CLR..regs::AIC_MASK_SET).contains(&r) => {
                let word = ((r - regs::AIC_SW_CLR) / 4) as usize;
                state.sw_pending[word] &= !val;
            }
            r if (regs::AIC_MASK_SET..regs::AIC_MASK_CLR).contains(&r) => {
                let word = ((r - regs::AIC_MASK_SET) / 4) as usize;
                state.masked[word] |= val;
            }
            r if (regs::AIC_MASK_CLR..regs::AIC_MASK_CLR + 0x80).contains(&r) => {
                let word = ((r - regs::AIC_MASK_CLR) / 4) as usize;
                state.masked[word] &= !val;
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct SysState {
    timer_ctl: [u64; NR_FIQ],
    guest_phys_enabled: bool,
    guest_virt_enabled: bool,
    fast_ipi: bool,
    pmc: bool,
    uncore_pmc: bool,
    vgic: bool,
}

/// In-memory model of the CPU-local cause registers.
pub(crate) struct FakeSysRegs {
    state: Mutex<SysState>,
}

impl FakeSysRegs {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SysState::default()),
        }
    }

    /// Make a timer fire: enabled, unmasked, interrupt status set.
    pub(crate) fn fire_timer(&self, timer: u32) {
        self.state.lock().timer_ctl[timer as usize] = TIMER_CTL_ENABLE | TIMER_CTL_ISTATUS;
    }

    pub(crate) fn fire_fast_ipi(&self) {
        self.state.lock().fast_ipi = true;
    }

    pub(crate) fn fire_pmc(&self) {
        self.state.lock().pmc = true;
    }

    pub(crate) fn fire_uncore_pmc(&self) {
        self.state.lock().uncore_pmc = true;
    }

    pub(crate) fn fire_vgic_maintenance(&self) {
        self.state.lock().vgic = true;
    }

    pub(crate) fn guest_timer_enabled(&self, virt: bool) -> bool {
        let state = self.state.lock();
        if virt {
            state.guest_virt_enabled
        } else {
            state.guest_phys_enabled
        }
    }
}

impl FiqSysRegs for FakeSysRegs {
    fn timer_ctl(&self, timer: u32) -> u64 {
        self.state.lock().timer_ctl[timer as usize]
    }

    fn set_timer_masked(&self, timer: u32, masked: bool) {
        let mut state = self.state.lock();
        if masked {
            state.timer_ctl[timer as usize] |= TIMER_CTL_IMASK;
        } else {
            state.timer_ctl[timer as usize] &= !TIMER_CTL_IMASK;
        }
    }

    fn set_guest_timer_enabled(&self, virt: bool, enabled: bool) {
        let mut state = self.state.lock();
        if virt {
            state.guest_virt_enabled = enabled;
        } else {
            state.guest_phys_enabled = enabled;
        }
    }

    fn fast_ipi_pending(&self) -> bool {
        self.state.lock().fast_ipi
    }

    fn ack_fast_ipi(&self) {
        self.state.lock().fast_ipi = false;
    }

    fn pmc_firing(&self) -> bool {
        self.state.lock().pmc
    }

    fn silence_pmc(&self) {
        self.state.lock().pmc = false;
    }

    fn uncore_pmc_firing(&self) -> bool {
        self.state.lock().uncore_pmc
    }

    fn silence_uncore_pmc(&self) {
        self.state.lock().uncore_pmc = false;
    }

    fn vgic_maintenance_firing(&self) -> bool {
        self.state.lock().vgic
    }

    fn disable_vgic_maintenance(&self) {
        self.state.lock().vgic = false;
    }
}

/// Handler that counts invocations and records the last line seen.
pub(crate) struct Counting {
    hits: AtomicUsize,
    last: Mutex<Option<LineId>>,
}

impl Counting {
    pub(crate) const fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn last(&self) -> Option<LineId> {
        *self.last.lock()
    }
}

impl IrqHandler for Counting {
    fn handle(&self, line: LineId) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some(line);
    }
}
