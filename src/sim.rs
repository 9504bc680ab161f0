//! Simulated hardware for exercising the protocol without a target.
//!
//! Each type here stands in for one hardware seam: a serial port, a delay
//! provider, the flash controller registers, the watchdog, the jump into
//! user code, and the debug port of a halted CC1110.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::serial::{Read, Write};
use embedded_hal::watchdog::{Watchdog, WatchdogEnable};

use crate::debug::{DebugPins, DebugStatus};
use crate::flash::{DmaDescriptor, FlashRegisters, FlashStatus, DMA_TRIGGER_FLASH, FWDATA_ADDR};
use crate::protocol::{ERASED, FLASH_SIZE, PAGE_SIZE};
use crate::remote::{MICROPROGRAM, MICROPROGRAM_ADDR_OFFSET, SCRATCH_ADDR};
use crate::resident::Handoff;
use crate::SerialPort;

/// Error returned by a disconnected [`SimSerial`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Disconnected;

/// Serial port backed by in-memory queues
#[derive(Debug, Default)]
pub struct SimSerial {
    /// Bytes waiting to be read
    pub rx: VecDeque<u8>,
    /// Bytes written so far
    pub tx: Vec<u8>,
    /// RTS and DTR levels in the order they were set
    pub lines: Vec<(&'static str, bool)>,
    disconnected: bool,
}

impl SimSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port with bytes already waiting to be read
    pub fn with_rx(rx: &[u8]) -> Self {
        Self { rx: rx.iter().copied().collect(), ..Self::default() }
    }

    pub fn push_rx(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    /// Fail every following operation
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }
}

impl Read<u8> for SimSerial {
    type Error = Disconnected;

    fn read(&mut self) -> nb::Result<u8, Disconnected> {
        if self.disconnected {
            return Err(nb::Error::Other(Disconnected));
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for SimSerial {
    type Error = Disconnected;

    fn write(&mut self, word: u8) -> nb::Result<(), Disconnected> {
        if self.disconnected {
            return Err(nb::Error::Other(Disconnected));
        }
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Disconnected> {
        Ok(())
    }
}

impl SerialPort<Disconnected> for SimSerial {
    fn set_rts(&mut self, level: bool) -> Result<(), Disconnected> {
        self.lines.push(("rts", level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Disconnected> {
        self.lines.push(("dtr", level));
        Ok(())
    }
}

/// Delay that only counts the time it was asked to wait
#[derive(Debug, Default, Clone, Copy)]
pub struct SimDelay {
    pub elapsed_us: u64,
}

impl SimDelay {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_us / 1000
    }
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_us += ms as u64 * 1000;
    }
}

impl DelayUs<u32> for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.elapsed_us += us as u64;
    }
}

/// Flash controller registers over an in-memory flash array.
///
/// Erase sets a page to 0xFF, a DMA transfer ANDs data into flash the way
/// NOR cells only clear bits, and the controller reports busy for a
/// configurable number of status reads after each operation.
#[derive(Debug)]
pub struct SimFlashRegisters {
    flash: Vec<u8>,
    busy_cycles: u32,
    busy_left: u32,
    stuck: bool,
    fwt: u8,
    faddr: u16,
    dma: Option<(DmaDescriptor, Vec<u8>)>,
    armed: bool,
    dma_done: bool,
    status_reads: u32,
    erase_count: u32,
    write_count: u32,
}

impl Default for SimFlashRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFlashRegisters {
    pub fn new() -> Self {
        Self {
            flash: vec![ERASED; FLASH_SIZE],
            busy_cycles: 0,
            busy_left: 0,
            stuck: false,
            fwt: 0,
            faddr: 0,
            dma: None,
            armed: false,
            dma_done: false,
            status_reads: 0,
            erase_count: 0,
            write_count: 0,
        }
    }

    /// Report busy for `n` status reads after each erase or write
    pub fn with_busy_cycles(mut self, n: u32) -> Self {
        self.busy_cycles = n;
        self
    }

    /// Report busy forever
    pub fn with_stuck_busy(mut self) -> Self {
        self.stuck = true;
        self
    }

    /// Preload flash contents
    pub fn with_contents(mut self, address: usize, data: &[u8]) -> Self {
        self.flash[address..address + data.len()].copy_from_slice(data);
        self
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn timing(&self) -> u8 {
        self.fwt
    }

    pub fn status_reads(&self) -> u32 {
        self.status_reads
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    /// True while a transfer is armed or its completion flag is uncleared
    pub fn dma_pending(&self) -> bool {
        self.armed || self.dma_done
    }

    fn busy(&self) -> bool {
        self.stuck || self.busy_left > 0
    }

    fn byte_address(&self) -> usize {
        self.faddr as usize * 2
    }
}

impl FlashRegisters for SimFlashRegisters {
    fn status(&mut self) -> FlashStatus {
        self.status_reads += 1;

        if self.stuck {
            return FlashStatus::BUSY;
        }
        if self.busy_left > 0 {
            self.busy_left -= 1;
            return FlashStatus::BUSY;
        }
        FlashStatus::empty()
    }

    fn set_timing(&mut self, fwt: u8) {
        self.fwt = fwt;
    }

    fn set_address(&mut self, high: u8, low: u8) {
        self.faddr = (high as u16) << 8 | low as u16;
    }

    fn start_erase(&mut self) {
        if self.busy() || self.fwt == 0 {
            return;
        }

        let start = self.byte_address() & !(PAGE_SIZE - 1);
        if let Some(page) = self.flash.get_mut(start..start + PAGE_SIZE) {
            page.iter_mut().for_each(|b| *b = ERASED);
            self.erase_count += 1;
            self.busy_left = self.busy_cycles;
        }
    }

    fn load_dma(&mut self, descriptor: &DmaDescriptor, source: &[u8]) {
        self.dma = Some((*descriptor, source.to_vec()));
    }

    fn arm_dma(&mut self) {
        self.armed = true;
    }

    fn trigger_write(&mut self) {
        if !self.armed || self.busy() || self.fwt == 0 {
            return;
        }

        let (descriptor, source) = match &self.dma {
            Some(d) => d,
            None => return,
        };

        if descriptor.dst != FWDATA_ADDR
            || descriptor.trigger() != DMA_TRIGGER_FLASH
            || descriptor.len() != source.len()
        {
            return;
        }

        let start = self.byte_address();
        if let Some(region) = self.flash.get_mut(start..start + source.len()) {
            for (f, s) in region.iter_mut().zip(source.iter()) {
                *f &= *s;
            }
        }

        self.armed = false;
        self.dma_done = true;
        self.write_count += 1;
        self.busy_left = self.busy_cycles;
    }

    fn dma_done(&mut self) -> bool {
        self.dma_done
    }

    fn clear_dma_done(&mut self) {
        self.dma_done = false;
    }

    fn read_code(&mut self, address: u16) -> u8 {
        self.flash.get(address as usize).copied().unwrap_or(ERASED)
    }
}

/// Watchdog that records how it was used
#[derive(Debug, Default)]
pub struct SimWatchdog {
    pub period_ms: Option<u32>,
    pub feeds: u32,
}

impl WatchdogEnable for SimWatchdog {
    type Time = u32;

    fn start<T>(&mut self, period: T)
    where
        T: Into<u32>,
    {
        self.period_ms = Some(period.into());
    }
}

impl Watchdog for SimWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}

/// Records the jump into user code instead of performing it
#[derive(Debug, Default)]
pub struct SimHandoff {
    pub interrupts_disabled: bool,
    pub jumped_to: Option<u16>,
}

impl Handoff for SimHandoff {
    fn disable_interrupts(&mut self) {
        self.interrupts_disabled = true;
    }

    fn jump(&mut self, entry: u16) {
        self.jumped_to = Some(entry);
    }
}

const XDATA_SIZE: usize = 0x10000;
const MEMCTR: u8 = 0xC7;

#[derive(Debug)]
enum Decode {
    Idle,
    Operands { want: usize, ops: Vec<u8> },
}

/// Bit-level model of a CC1110 debug port.
///
/// Bytes are shifted in and out MSB first on rising clock edges, decoded
/// into debug commands, and the handful of 8051 instructions the writer
/// uses are executed against xdata and code memory. Resuming the CPU at a
/// valid flash microprogram performs its page erase and write.
#[derive(Debug)]
pub struct SimDebugTarget {
    flash: Vec<u8>,
    xdata: Vec<u8>,

    reset_high: bool,
    clock_high: bool,
    drive: Option<bool>,
    edges_in_reset: u8,
    debug_mode: bool,

    shift_in: u8,
    bits_in: u8,
    response: u8,
    bits_out: u8,
    out_bit: bool,
    decode: Decode,

    a: u8,
    dptr: u16,
    pc: u16,
    memctr: u8,
    halted: bool,

    erase_done: bool,
    erase_left: Option<u32>,
    erase_polls: u32,
    erase_stuck: bool,

    halt_left: Option<u32>,
    halt_polls: u32,
    hang: bool,

    status_reads: u32,
    instructions: u32,
    programs_run: u32,
    elapsed_ms: u32,
}

impl Default for SimDebugTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDebugTarget {
    pub fn new() -> Self {
        Self {
            flash: vec![ERASED; FLASH_SIZE],
            xdata: vec![0; XDATA_SIZE],
            reset_high: true,
            clock_high: false,
            drive: None,
            edges_in_reset: 0,
            debug_mode: false,
            shift_in: 0,
            bits_in: 0,
            response: 0,
            bits_out: 0,
            out_bit: false,
            decode: Decode::Idle,
            a: 0,
            dptr: 0,
            pc: 0,
            memctr: 0,
            halted: false,
            erase_done: false,
            erase_left: None,
            erase_polls: 1,
            erase_stuck: false,
            halt_left: None,
            halt_polls: 1,
            hang: false,
            status_reads: 0,
            instructions: 0,
            programs_run: 0,
            elapsed_ms: 0,
        }
    }

    /// Chip erase reports done on the `n`th status read
    pub fn with_erase_polls(mut self, n: u32) -> Self {
        self.erase_polls = n;
        self
    }

    /// Chip erase never reports done
    pub fn with_stuck_erase(mut self) -> Self {
        self.erase_stuck = true;
        self
    }

    /// The CPU reports halted on the `n`th status read after resuming
    pub fn with_halt_polls(mut self, n: u32) -> Self {
        self.halt_polls = n;
        self
    }

    /// The CPU never halts after resuming
    pub fn with_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn with_contents(mut self, address: usize, data: &[u8]) -> Self {
        self.flash[address..address + data.len()].copy_from_slice(data);
        self
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn xdata(&self) -> &[u8] {
        &self.xdata
    }

    pub fn in_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn memctr(&self) -> u8 {
        self.memctr
    }

    pub fn status_reads(&self) -> u32 {
        self.status_reads
    }

    pub fn instructions(&self) -> u32 {
        self.instructions
    }

    pub fn programs_run(&self) -> u32 {
        self.programs_run
    }

    pub fn elapsed_ms(&self) -> u32 {
        self.elapsed_ms
    }

    fn status(&self) -> u8 {
        let mut s = DebugStatus::OSCILLATOR_STABLE;
        if self.erase_done {
            s |= DebugStatus::CHIP_ERASE_DONE;
        }
        if self.halted {
            s |= DebugStatus::CPU_HALTED | DebugStatus::HALT_STATUS;
        }
        s.bits()
    }

    fn read_status(&mut self) -> u8 {
        self.status_reads += 1;

        if let Some(left) = self.erase_left {
            if left <= 1 && !self.erase_stuck {
                self.erase_done = true;
                self.erase_left = None;
            } else {
                self.erase_left = Some(left.saturating_sub(1));
            }
        }

        if let Some(left) = self.halt_left {
            if left <= 1 && !self.hang {
                self.halted = true;
                self.halt_left = None;
            } else {
                self.halt_left = Some(left.saturating_sub(1));
            }
        }

        self.status()
    }

    fn chip_erase(&mut self) -> u8 {
        let s = self.status();
        self.flash.iter_mut().for_each(|b| *b = ERASED);
        self.erase_done = false;
        self.erase_left = Some(self.erase_polls);
        s
    }

    fn resume(&mut self) -> u8 {
        let s = self.status();
        self.halted = false;

        if self.run_microprogram() {
            self.programs_run += 1;
            self.halt_left = Some(self.halt_polls);
        }
        s
    }

    /// Execute the flash write routine at PC, if that is what PC points to
    fn run_microprogram(&mut self) -> bool {
        let pc = self.pc as usize;
        let code = match self.xdata.get(pc..pc + MICROPROGRAM.len()) {
            Some(c) => c,
            None => return false,
        };

        let matches = code
            .iter()
            .zip(MICROPROGRAM.iter())
            .enumerate()
            .all(|(i, (a, b))| i == MICROPROGRAM_ADDR_OFFSET || a == b);
        if !matches {
            return false;
        }

        // FADDRH holds the high byte of a word address
        let start = (code[MICROPROGRAM_ADDR_OFFSET] as usize) << 9;
        let src = SCRATCH_ADDR as usize;

        if let Some(page) = self.flash.get_mut(start..start + PAGE_SIZE) {
            for (i, f) in page.iter_mut().enumerate() {
                *f = ERASED & self.xdata[src + i];
            }
        }
        true
    }

    fn code_read(&self, address: u16) -> u8 {
        let addr = if address < 0x8000 {
            address as usize
        } else {
            let bank = ((self.memctr >> 4) & 0x07) as usize;
            (address as usize & 0x7FFF) + bank * 0x8000
        };
        self.flash.get(addr).copied().unwrap_or(ERASED)
    }

    fn execute(&mut self, ops: &[u8]) -> u8 {
        self.instructions += 1;

        match ops {
            [0x90, hi, lo] => self.dptr = (*hi as u16) << 8 | *lo as u16,
            [0x02, hi, lo] => self.pc = (*hi as u16) << 8 | *lo as u16,
            [0x75, dir, val] if *dir == MEMCTR => self.memctr = *val,
            [0x75, _, _] => (),
            [0x74, imm] => self.a = *imm,
            [0xF0] => self.xdata[self.dptr as usize] = self.a,
            [0xA3] => self.dptr = self.dptr.wrapping_add(1),
            [0xE4] => self.a = 0,
            [0x93] => self.a = self.code_read(self.dptr.wrapping_add(self.a as u16)),
            _ => (),
        }

        self.a
    }

    fn on_byte(&mut self, byte: u8) {
        let decode = std::mem::replace(&mut self.decode, Decode::Idle);

        let response = match decode {
            Decode::Idle => match byte {
                0x34 => Some(self.read_status()),
                0x14 => Some(self.chip_erase()),
                0x4C => Some(self.resume()),
                0x55..=0x57 => {
                    let want = (byte - 0x54) as usize;
                    self.decode = Decode::Operands { want, ops: Vec::with_capacity(want) };
                    None
                }
                _ => Some(0),
            },
            Decode::Operands { want, mut ops } => {
                ops.push(byte);
                if ops.len() == want {
                    Some(self.execute(&ops))
                } else {
                    self.decode = Decode::Operands { want, ops };
                    None
                }
            }
        };

        if let Some(r) = response {
            self.response = r;
            self.bits_out = 0;
        }
    }

    fn rising_edge(&mut self) {
        if !self.reset_high {
            self.edges_in_reset = self.edges_in_reset.saturating_add(1);
            return;
        }
        if !self.debug_mode {
            return;
        }

        match self.drive {
            Some(bit) => {
                self.shift_in = (self.shift_in << 1) | bit as u8;
                self.bits_in += 1;
                if self.bits_in == 8 {
                    let byte = self.shift_in;
                    self.shift_in = 0;
                    self.bits_in = 0;
                    self.on_byte(byte);
                }
            }
            None => {
                let shift = 7u8.saturating_sub(self.bits_out);
                self.out_bit = (self.response >> shift) & 1 != 0;
                self.bits_out = self.bits_out.saturating_add(1);
            }
        }
    }
}

impl DebugPins for SimDebugTarget {
    type Error = Infallible;

    fn set_reset(&mut self, high: bool) -> Result<(), Infallible> {
        if high && !self.reset_high {
            // Two clock edges while held in reset enter debug mode halted
            self.debug_mode = self.edges_in_reset >= 2;
            self.halted = self.debug_mode;
            self.shift_in = 0;
            self.bits_in = 0;
            self.decode = Decode::Idle;
        }
        if !high {
            self.edges_in_reset = 0;
            self.debug_mode = false;
        }
        self.reset_high = high;
        Ok(())
    }

    fn set_clock(&mut self, high: bool) -> Result<(), Infallible> {
        if high && !self.clock_high {
            self.rising_edge();
        }
        self.clock_high = high;
        Ok(())
    }

    fn drive_data(&mut self, high: bool) -> Result<(), Infallible> {
        self.drive = Some(high);
        Ok(())
    }

    fn release_data(&mut self) -> Result<(), Infallible> {
        self.drive = None;
        Ok(())
    }

    fn read_data(&mut self) -> Result<bool, Infallible> {
        Ok(match self.drive {
            Some(level) => level,
            None => self.out_bit,
        })
    }

    fn settle(&mut self) {}

    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms;
    }
}
