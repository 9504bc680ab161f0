//! CC1110 debug port codec.
//!
//! The debug port is a two wire interface: DC is a clock driven by the
//! programmer, DD a bidirectional data line. Bytes are clocked MSB first
//! and every command returns a single byte. The CPU instructions used to
//! access memory are wrapped in the 1/2/3 byte debug-instruction forms.

use core::fmt::Debug;

use bitflags::bitflags;
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::digital::v2::OutputPin;

/// Execute a 1 byte CPU instruction
pub const DEBUG_INSTR_1: u8 = 0x55;
/// Execute a 2 byte CPU instruction
pub const DEBUG_INSTR_2: u8 = 0x56;
/// Execute a 3 byte CPU instruction
pub const DEBUG_INSTR_3: u8 = 0x57;
/// Read the debug status register
pub const READ_STATUS: u8 = 0x34;
/// Erase the whole flash
pub const CHIP_ERASE: u8 = 0x14;
/// Resume CPU execution
pub const RESUME: u8 = 0x4C;

/// 8051 opcodes issued through the debug instruction forms
pub mod op {
    /// LJMP addr16
    pub const LJMP: u8 = 0x02;
    /// MOV DPTR, #data16
    pub const MOV_DPTR: u8 = 0x90;
    /// MOV A, #data
    pub const MOV_A: u8 = 0x74;
    /// MOVX @DPTR, A
    pub const MOVX_DPTR_A: u8 = 0xF0;
    /// INC DPTR
    pub const INC_DPTR: u8 = 0xA3;
    /// CLR A
    pub const CLR_A: u8 = 0xE4;
    /// MOVC A, @A+DPTR
    pub const MOVC_A_DPTR: u8 = 0x93;
    /// MOV direct, #data
    pub const MOV_DIRECT: u8 = 0x75;
}

/// Memory arbiter control SFR
pub const MEMCTR: u8 = 0xC7;

bitflags! {
    /// Debug status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugStatus: u8 {
        const CHIP_ERASE_DONE = 0x80;
        const PCON_IDLE = 0x40;
        const CPU_HALTED = 0x20;
        const POWER_MODE_0 = 0x10;
        const HALT_STATUS = 0x08;
        const DEBUG_LOCKED = 0x04;
        const OSCILLATOR_STABLE = 0x02;
        const STACK_OVERFLOW = 0x01;
    }
}

/// Pin level access to the debug port
pub trait DebugPins {
    type Error: Debug;

    /// Drive the target reset line
    fn set_reset(&mut self, high: bool) -> Result<(), Self::Error>;

    /// Drive the DC clock line
    fn set_clock(&mut self, high: bool) -> Result<(), Self::Error>;

    /// Switch DD to an output and drive it
    fn drive_data(&mut self, high: bool) -> Result<(), Self::Error>;

    /// Switch DD to an input so the target can drive it
    fn release_data(&mut self) -> Result<(), Self::Error>;

    /// Sample DD
    fn read_data(&mut self) -> Result<bool, Self::Error>;

    /// Inter-bit settle time
    fn settle(&mut self);

    fn delay_ms(&mut self, ms: u32);
}

/// A GPIO that can switch between driving and sampling
pub trait DataLine {
    type Error: Debug;

    fn drive(&mut self, high: bool) -> Result<(), Self::Error>;

    fn release(&mut self) -> Result<(), Self::Error>;

    fn sample(&mut self) -> Result<bool, Self::Error>;
}

/// Debug port on plain GPIOs
pub struct GpioDebugPins<DC, DD, RST, D> {
    dc: DC,
    dd: DD,
    rst: RST,
    delay: D,
    settle_us: u32,
}

impl<DC, DD, RST, D, E> GpioDebugPins<DC, DD, RST, D>
where
    DC: OutputPin<Error = E>,
    DD: DataLine<Error = E>,
    RST: OutputPin<Error = E>,
    D: DelayMs<u32> + DelayUs<u32>,
    E: Debug,
{
    pub fn new(dc: DC, dd: DD, rst: RST, delay: D, settle_us: u32) -> Self {
        Self { dc, dd, rst, delay, settle_us }
    }

    pub fn release(self) -> (DC, DD, RST, D) {
        (self.dc, self.dd, self.rst, self.delay)
    }
}

impl<DC, DD, RST, D, E> DebugPins for GpioDebugPins<DC, DD, RST, D>
where
    DC: OutputPin<Error = E>,
    DD: DataLine<Error = E>,
    RST: OutputPin<Error = E>,
    D: DelayMs<u32> + DelayUs<u32>,
    E: Debug,
{
    type Error = E;

    fn set_reset(&mut self, high: bool) -> Result<(), E> {
        if high {
            self.rst.set_high()
        } else {
            self.rst.set_low()
        }
    }

    fn set_clock(&mut self, high: bool) -> Result<(), E> {
        if high {
            self.dc.set_high()
        } else {
            self.dc.set_low()
        }
    }

    fn drive_data(&mut self, high: bool) -> Result<(), E> {
        self.dd.drive(high)
    }

    fn release_data(&mut self) -> Result<(), E> {
        self.dd.release()
    }

    fn read_data(&mut self) -> Result<bool, E> {
        self.dd.sample()
    }

    fn settle(&mut self) {
        if self.settle_us > 0 {
            self.delay.delay_us(self.settle_us);
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}

/// Byte and instruction level access to a halted target
pub struct DebugCodec<P> {
    pins: P,
}

impl<P> DebugCodec<P>
where
    P: DebugPins,
{
    pub fn new(pins: P) -> Self {
        Self { pins }
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn into_inner(self) -> P {
        self.pins
    }

    /// Enter debug mode: two DC pulses while reset is held low
    pub fn enter(&mut self) -> Result<(), P::Error> {
        debug!("Entering debug mode");

        self.pins.drive_data(false)?;

        self.pins.set_reset(false)?;
        self.pins.delay_ms(1);
        for _ in 0..2 {
            self.pins.set_clock(false)?;
            self.pins.delay_ms(1);
            self.pins.set_clock(true)?;
            self.pins.delay_ms(1);
        }
        self.pins.set_clock(false)?;
        self.pins.delay_ms(1);
        self.pins.set_reset(true)?;
        self.pins.delay_ms(1);

        Ok(())
    }

    /// Pulse reset to leave debug mode and boot the target
    pub fn reset(&mut self) -> Result<(), P::Error> {
        debug!("Resetting target");

        self.pins.set_reset(false)?;
        self.pins.delay_ms(100);
        self.pins.set_reset(true)
    }

    pub fn send_byte(&mut self, b: u8) -> Result<(), P::Error> {
        for i in (0..8).rev() {
            self.pins.drive_data(b & (1 << i) != 0)?;
            self.pins.set_clock(true)?;
            self.pins.settle();
            self.pins.set_clock(false)?;
            self.pins.settle();
        }
        Ok(())
    }

    pub fn recv_byte(&mut self) -> Result<u8, P::Error> {
        let mut b = 0u8;

        self.pins.release_data()?;
        for i in (0..8).rev() {
            self.pins.set_clock(true)?;
            self.pins.settle();
            if self.pins.read_data()? {
                b |= 1 << i;
            }
            self.pins.set_clock(false)?;
        }

        trace!("Debug rx: 0x{:02x}", b);
        Ok(b)
    }

    /// Send a bare debug command and return its response byte
    pub fn command(&mut self, cmd: u8) -> Result<u8, P::Error> {
        self.send_byte(cmd)?;
        self.recv_byte()
    }

    pub fn instr_1(&mut self, in0: u8) -> Result<u8, P::Error> {
        self.send_byte(DEBUG_INSTR_1)?;
        self.send_byte(in0)?;
        self.recv_byte()
    }

    pub fn instr_2(&mut self, in0: u8, in1: u8) -> Result<u8, P::Error> {
        self.send_byte(DEBUG_INSTR_2)?;
        self.send_byte(in0)?;
        self.send_byte(in1)?;
        self.recv_byte()
    }

    pub fn instr_3(&mut self, in0: u8, in1: u8, in2: u8) -> Result<u8, P::Error> {
        self.send_byte(DEBUG_INSTR_3)?;
        self.send_byte(in0)?;
        self.send_byte(in1)?;
        self.send_byte(in2)?;
        self.recv_byte()
    }

    pub fn read_status(&mut self) -> Result<DebugStatus, P::Error> {
        self.command(READ_STATUS).map(DebugStatus::from_bits_retain)
    }

    /// Start a chip erase, completion shows up in the status register
    pub fn chip_erase(&mut self) -> Result<(), P::Error> {
        self.command(CHIP_ERASE).map(|_| ())
    }

    pub fn resume(&mut self) -> Result<(), P::Error> {
        self.command(RESUME).map(|_| ())
    }

    pub fn set_pc(&mut self, address: u16) -> Result<(), P::Error> {
        self.instr_3(op::LJMP, (address >> 8) as u8, address as u8).map(|_| ())
    }

    pub fn set_dptr(&mut self, address: u16) -> Result<(), P::Error> {
        self.instr_3(op::MOV_DPTR, (address >> 8) as u8, address as u8).map(|_| ())
    }

    /// Write an SFR in direct address space
    pub fn write_sfr(&mut self, sfr: u8, value: u8) -> Result<(), P::Error> {
        self.instr_3(op::MOV_DIRECT, sfr, value).map(|_| ())
    }

    /// Write a block of xdata memory
    pub fn write_xdata(&mut self, address: u16, data: &[u8]) -> Result<(), P::Error> {
        self.set_dptr(address)?;
        for b in data {
            self.instr_2(op::MOV_A, *b)?;
            self.instr_1(op::MOVX_DPTR_A)?;
            self.instr_1(op::INC_DPTR)?;
        }
        Ok(())
    }

    /// Read a block of code memory, `bank` selects the 32KB window mapped
    /// at 0x8000
    pub fn read_code(&mut self, address: u16, bank: u8, out: &mut [u8]) -> Result<(), P::Error> {
        let address = if address >= 0x8000 {
            (address & 0x7FFF).wrapping_add((bank as u16).wrapping_mul(0x8000))
        } else {
            address
        };

        self.write_sfr(MEMCTR, bank.wrapping_mul(16) + 1)?;
        self.set_dptr(address)?;
        for b in out.iter_mut() {
            self.instr_1(op::CLR_A)?;
            *b = self.instr_1(op::MOVC_A_DPTR)?;
            self.instr_1(op::INC_DPTR)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ERASED;
    use crate::sim::SimDebugTarget;

    /// Records the DD level at every rising DC edge
    #[derive(Default)]
    struct EdgeRecorder {
        clock: bool,
        dd: Option<bool>,
        sampled: Vec<bool>,
        reply: Vec<bool>,
    }

    impl DebugPins for EdgeRecorder {
        type Error = ();

        fn set_reset(&mut self, _high: bool) -> Result<(), ()> {
            Ok(())
        }

        fn set_clock(&mut self, high: bool) -> Result<(), ()> {
            if high && !self.clock {
                if let Some(level) = self.dd {
                    self.sampled.push(level);
                }
            }
            self.clock = high;
            Ok(())
        }

        fn drive_data(&mut self, high: bool) -> Result<(), ()> {
            self.dd = Some(high);
            Ok(())
        }

        fn release_data(&mut self) -> Result<(), ()> {
            self.dd = None;
            Ok(())
        }

        fn read_data(&mut self) -> Result<bool, ()> {
            Ok(self.reply.remove(0))
        }

        fn settle(&mut self) {}

        fn delay_ms(&mut self, _ms: u32) {}
    }

    #[test]
    fn bytes_are_msb_first() {
        let mut codec = DebugCodec::new(EdgeRecorder::default());
        codec.send_byte(0xA1).unwrap();

        let bits = &codec.pins().sampled;
        assert_eq!(bits, &[true, false, true, false, false, false, false, true]);

        codec.pins_mut().reply = vec![false, true, false, false, false, false, true, true];
        assert_eq!(codec.recv_byte().unwrap(), 0x43);
    }

    #[test]
    fn instruction_shapes() {
        let mut codec = DebugCodec::new(EdgeRecorder::default());
        codec.pins_mut().reply = vec![false; 24];

        codec.instr_1(0xA3).unwrap();
        assert_eq!(codec.pins().sampled.len(), 16);
        codec.instr_2(0x74, 0x12).unwrap();
        assert_eq!(codec.pins().sampled.len(), 16 + 24);
        codec.instr_3(0x90, 0xF0, 0x00).unwrap();
        assert_eq!(codec.pins().sampled.len(), 16 + 24 + 32);

        let first: u8 = codec.pins().sampled[..8]
            .iter()
            .fold(0, |acc, b| (acc << 1) | *b as u8);
        assert_eq!(first, DEBUG_INSTR_1);
    }

    #[test]
    fn enter_requires_clock_pulses_in_reset() {
        let mut codec = DebugCodec::new(SimDebugTarget::new());
        assert!(!codec.pins().in_debug_mode());

        codec.enter().unwrap();
        assert!(codec.pins().in_debug_mode());
        assert_eq!(codec.pins().elapsed_ms(), 7);

        let status = codec.read_status().unwrap();
        assert!(status.contains(DebugStatus::CPU_HALTED));
    }

    #[test]
    fn xdata_write_and_code_read() {
        let target = SimDebugTarget::new().with_contents(0x400, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut codec = DebugCodec::new(target);
        codec.enter().unwrap();

        codec.write_xdata(0xF000, &[1, 2, 3]).unwrap();
        assert_eq!(&codec.pins().xdata()[0xF000..0xF004], &[1, 2, 3, 0]);

        let mut out = [0u8; 4];
        codec.read_code(0x400, 0, &mut out).unwrap();
        assert_eq!(out, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn banked_code_read() {
        let target = SimDebugTarget::new().with_contents(0x400, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut codec = DebugCodec::new(target);
        codec.enter().unwrap();

        // Bank 0 mirrors the low 32KB at 0x8000
        let mut out = [0u8; 4];
        codec.read_code(0x8400, 0, &mut out).unwrap();
        assert_eq!(out, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(codec.pins().memctr(), 0x01);

        // Bank 1 lies past the end of a 32KB part
        let before = codec.pins().instructions();
        codec.read_code(0x8400, 1, &mut out).unwrap();
        assert_eq!(out, [ERASED; 4]);
        assert_eq!(codec.pins().memctr(), 0x11);

        // MEMCTR, DPTR, then three instructions per byte
        assert_eq!(codec.pins().instructions() - before, 2 + 3 * 4);
    }

    #[test]
    fn set_pc_loads_program_counter() {
        let mut codec = DebugCodec::new(SimDebugTarget::new());
        codec.enter().unwrap();
        codec.set_pc(0xF400).unwrap();
        assert_eq!(codec.pins().pc(), 0xF400);
    }
}
