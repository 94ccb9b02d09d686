//! Emulation loop: drives the Z80 core against an emulated system.
//!
//! Per instruction the loop checks the PC intercept table, executes the
//! instruction, adds the wait states the system requested, notifies the
//! system of the elapsed T-states and services maskable interrupts through
//! the system's daisy chain.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use z80emu::host::TsCounter;
use z80emu::{Clock, Cpu, CpuDebug, CpuFlags, Io, Memory, Reg8, StkReg16, Z80NMOS};

type TsClock = TsCounter<i32>;

/// T-states charged for an intercepted routine (the RET it replaces).
const INTERCEPT_TSTATES: u32 = 10;

/// Emulated time between two real-time synchronisations, in milliseconds.
const SYNC_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    PowerOn,
    Cold,
    Warm,
}

/// An emulated computer as seen by the CPU: memory, I/O ports, peripheral
/// timing and interrupts.
pub trait Machine {
    /// Memory read by the CPU; may have side effects (bus listeners).
    fn read_mem(&mut self, addr: u16) -> u8;

    /// Memory content without side effects.
    fn debug_mem(&self, addr: u16) -> u8;

    fn write_mem(&mut self, addr: u16, value: u8);

    fn read_io(&mut self, port: u16) -> u8;

    fn write_io(&mut self, port: u16, value: u8);

    /// T-states elapsed since the last call, wait states included.
    fn tick(&mut self, _tstates: u32) {}

    /// Wait states collected during the last instruction.
    fn take_wait_states(&mut self) -> u32 {
        0
    }

    /// New CPU clock in kHz, reported once per change.
    fn take_speed_request(&mut self) -> Option<u32> {
        None
    }

    fn interrupt_pending(&self) -> bool {
        false
    }

    /// Interrupt acknowledge; returns the byte put on the data bus.
    fn interrupt_ack(&mut self) -> u8 {
        0xFF
    }

    /// RETI executed.
    fn reti(&mut self) {}

    fn reset(&mut self, level: ResetLevel);

    fn reset_start_address(&self) -> u16 {
        0
    }

    fn default_speed_khz(&self) -> u32;

    fn pc_intercepts(&self) -> PcIntercepts<Self>
    where
        Self: Sized;
}

/// Register access for intercept handlers.
pub struct CpuAccess<'a> {
    cpu: &'a mut Z80NMOS,
}

impl CpuAccess<'_> {
    pub fn reg8(&self, reg: Reg8) -> u8 {
        self.cpu.get_reg(reg, None)
    }

    pub fn set_reg8(&mut self, reg: Reg8, value: u8) {
        self.cpu.set_reg(reg, None, value);
    }

    pub fn a(&self) -> u8 {
        self.cpu.get_acc()
    }

    pub fn set_a(&mut self, value: u8) {
        self.cpu.set_acc(value);
    }

    pub fn reg16(&self, reg: StkReg16) -> u16 {
        self.cpu.get_reg16(reg)
    }

    pub fn set_reg16(&mut self, reg: StkReg16, value: u16) {
        self.cpu.set_reg16(reg, value);
    }

    pub fn set_flag(&mut self, flag: CpuFlags, on: bool) {
        let mut flags = self.cpu.get_flags();
        flags.set(flag, on);
        self.cpu.set_flags(flags);
    }

    pub fn flag(&self, flag: CpuFlags) -> bool {
        self.cpu.get_flags().contains(flag)
    }

    pub fn pc(&self) -> u16 {
        self.cpu.get_pc()
    }

    pub fn sp(&self) -> u16 {
        self.cpu.get_sp()
    }
}

/// Handler for a PC intercept. Returns `true` if it replaced the routine;
/// the loop then returns to the caller by popping the return address.
pub type PcHandler<M> = Arc<dyn Fn(&mut M, &mut CpuAccess<'_>) -> bool + Send + Sync>;

/// Breakpoint table PC -> handler, shared between a system (which
/// registers its handlers on settings changes) and the emulation loop.
pub struct PcIntercepts<M> {
    table: Arc<RwLock<BTreeMap<u16, PcHandler<M>>>>,
}

impl<M> Clone for PcIntercepts<M> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<M> Default for PcIntercepts<M> {
    fn default() -> Self {
        Self {
            table: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<M> PcIntercepts<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table in one step.
    pub fn replace(&self, entries: Vec<(u16, PcHandler<M>)>) {
        match self.table.write() {
            Ok(mut table) => {
                table.clear();
                table.extend(entries);
                log::debug!("PC intercepts: {:04X?}", table.keys().collect::<Vec<_>>());
            }
            Err(_) => log::error!("PC intercept table poisoned"),
        }
    }

    pub fn insert(&self, pc: u16, handler: PcHandler<M>) {
        if let Ok(mut table) = self.table.write() {
            table.insert(pc, handler);
        }
    }

    pub fn get(&self, pc: u16) -> Option<PcHandler<M>> {
        self.table.read().ok()?.get(&pc).cloned()
    }

    pub fn addresses(&self) -> Vec<u16> {
        self.table
            .read()
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// Detach every handler.
    pub fn clear(&self) {
        if let Ok(mut table) = self.table.write() {
            table.clear();
        }
    }
}

/// CPU bus over a machine.
struct Bus<'a, M: Machine> {
    machine: RefCell<&'a mut M>,
}

impl<M: Machine> Memory for Bus<'_, M> {
    type Timestamp = i32;

    fn read_debug(&self, addr: u16) -> u8 {
        self.machine.borrow().debug_mem(addr)
    }

    fn read_mem(&self, addr: u16, _ts: Self::Timestamp) -> u8 {
        self.machine.borrow_mut().read_mem(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8, _ts: Self::Timestamp) {
        self.machine.get_mut().write_mem(addr, value);
    }
}

impl<M: Machine> Io for Bus<'_, M> {
    type Timestamp = i32;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, port: u16, _ts: Self::Timestamp) -> (u8, Option<NonZeroU16>) {
        (self.machine.get_mut().read_io(port), None)
    }

    fn write_io(
        &mut self,
        port: u16,
        value: u8,
        _ts: Self::Timestamp,
    ) -> (Option<Self::WrIoBreak>, Option<NonZeroU16>) {
        self.machine.get_mut().write_io(port, value);
        (None, None)
    }

    fn irq_data(&mut self, _pc: u16, _ts: Self::Timestamp) -> (u8, Option<NonZeroU16>) {
        (self.machine.get_mut().interrupt_ack(), None)
    }

    fn reti(&mut self, _addr: u16, _ts: Self::Timestamp) -> Option<Self::RetiBreak> {
        self.machine.get_mut().reti();
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop flag raised.
    Stopped,
    /// Requested number of T-states executed.
    Limit,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub reason: ExitReason,
    pub tstates: u64,
    pub pc: u16,
}

pub struct Emulator<M: Machine> {
    cpu: Z80NMOS,
    clock: TsClock,
    machine: M,
    intercepts: PcIntercepts<M>,
    total_tstates: u64,
    speed_khz: u32,
    /// Run as fast as possible.
    pub max_speed: bool,
    stop: Arc<AtomicBool>,
    sync_start: Instant,
    sync_tstates: u64,
}

impl<M: Machine> Emulator<M> {
    pub fn new(machine: M) -> Self {
        let intercepts = machine.pc_intercepts();
        let speed_khz = machine.default_speed_khz();
        let mut emu = Self {
            cpu: Z80NMOS::default(),
            clock: TsClock::default(),
            machine,
            intercepts,
            total_tstates: 0,
            speed_khz,
            max_speed: false,
            stop: Arc::new(AtomicBool::new(false)),
            sync_start: Instant::now(),
            sync_tstates: 0,
        };
        emu.reset(ResetLevel::PowerOn);
        emu
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn into_machine(self) -> M {
        self.machine
    }

    pub fn cpu(&self) -> &Z80NMOS {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Z80NMOS {
        &mut self.cpu
    }

    pub fn tstates(&self) -> u64 {
        self.total_tstates
    }

    pub fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    /// Flag that ends [`Emulator::run`] when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn power_on(&mut self) {
        self.reset(ResetLevel::PowerOn);
    }

    pub fn reset(&mut self, level: ResetLevel) {
        self.machine.reset(level);
        self.cpu.reset();
        self.cpu.set_pc(self.machine.reset_start_address());
        if level == ResetLevel::PowerOn {
            self.speed_khz = self.machine.default_speed_khz();
        }
        // speed changes caused by the reset itself
        if let Some(khz) = self.machine.take_speed_request() {
            self.speed_khz = khz;
        }
        self.sync_start = Instant::now();
        self.sync_tstates = self.total_tstates;
    }

    /// Non-maskable interrupt.
    pub fn nmi(&mut self) {
        let start = self.clock.as_timestamp();
        let mut bus = Bus {
            machine: RefCell::new(&mut self.machine),
        };
        if self.cpu.nmi(&mut bus, &mut self.clock) {
            let used = self.clock.as_timestamp().wrapping_sub(start) as u32;
            self.machine.tick(used);
            self.total_tstates += used as u64;
        }
    }

    /// Detach the system: clears all PC intercepts.
    pub fn die(&mut self) {
        self.intercepts.clear();
        self.stop.store(true, Ordering::SeqCst);
    }

    fn pop16(&mut self) -> u16 {
        let sp = self.cpu.get_sp();
        let lo = self.machine.debug_mem(sp);
        let hi = self.machine.debug_mem(sp.wrapping_add(1));
        self.cpu.set_sp(sp.wrapping_add(2));
        u16::from_le_bytes([lo, hi])
    }

    /// Execute one instruction (or one intercepted routine); returns the
    /// T-states used.
    pub fn step(&mut self) -> u32 {
        let pc = self.cpu.get_pc();
        let mut used = 0;

        // intercepts run before the instruction at that address
        let handled = match self.intercepts.get(pc) {
            Some(handler) => {
                let mut access = CpuAccess { cpu: &mut self.cpu };
                handler(&mut self.machine, &mut access)
            }
            None => false,
        };
        if handled {
            let ret_addr = self.pop16();
            self.cpu.set_pc(ret_addr);
            used += INTERCEPT_TSTATES;
        } else {
            let start = self.clock.as_timestamp();
            let mut bus = Bus {
                machine: RefCell::new(&mut self.machine),
            };
            let _ = self
                .cpu
                .execute_next(&mut bus, &mut self.clock, None::<fn(CpuDebug)>);
            used += self.clock.as_timestamp().wrapping_sub(start) as u32;
        }

        used += self.machine.take_wait_states();
        self.machine.tick(used);

        if let Some(khz) = self.machine.take_speed_request() {
            log::debug!("CPU clock {} kHz -> {} kHz", self.speed_khz, khz);
            self.speed_khz = khz;
        }

        if self.machine.interrupt_pending() {
            let start = self.clock.as_timestamp();
            let mut bus = Bus {
                machine: RefCell::new(&mut self.machine),
            };
            if self
                .cpu
                .irq(&mut bus, &mut self.clock, None::<fn(CpuDebug)>)
                .is_some()
            {
                let irq_used = self.clock.as_timestamp().wrapping_sub(start) as u32;
                self.machine.tick(irq_used);
                used += irq_used;
            }
        }

        self.total_tstates += used as u64;
        used
    }

    /// Execute at least `tstates` T-states.
    pub fn run_for(&mut self, tstates: u64) -> ExitInfo {
        let end = self.total_tstates + tstates;
        while self.total_tstates < end {
            if self.stop.load(Ordering::Relaxed) {
                return self.exit(ExitReason::Stopped);
            }
            self.step();
            self.throttle();
        }
        self.exit(ExitReason::Limit)
    }

    /// Run until the stop flag is set.
    pub fn run(&mut self) -> ExitInfo {
        self.sync_start = Instant::now();
        self.sync_tstates = self.total_tstates;
        while !self.stop.load(Ordering::Relaxed) {
            self.step();
            self.throttle();
        }
        self.exit(ExitReason::Stopped)
    }

    fn exit(&self, reason: ExitReason) -> ExitInfo {
        ExitInfo {
            reason,
            tstates: self.total_tstates,
            pc: self.cpu.get_pc(),
        }
    }

    /// Sleep to keep the emulated clock at `speed_khz`.
    fn throttle(&mut self) {
        if self.max_speed || self.speed_khz == 0 {
            return;
        }
        let emulated = self.total_tstates - self.sync_tstates;
        if emulated < self.speed_khz as u64 * SYNC_INTERVAL_MS {
            return;
        }
        let target = Duration::from_micros(emulated * 1000 / self.speed_khz as u64);
        let elapsed = self.sync_start.elapsed();
        if target > elapsed {
            std::thread::sleep(target - elapsed);
        }
        self.sync_start = Instant::now();
        self.sync_tstates = self.total_tstates;
    }
}
