//! Flash erase/program sequencing for the CC1110 flash controller.
//!
//! [`FlashController`] is the page-level interface shared by the resident
//! bootloader and the debug-port writer. [`Cc1110Flash`] implements it on
//! top of [`FlashRegisters`], the narrow register interface a firmware build
//! provides and [`crate::sim::SimFlashRegisters`] fakes for tests.

use core::fmt::Debug;

use bitflags::bitflags;

use crate::poll::{poll, Bound, Timeout};
use crate::protocol::{Page, PAGE_SIZE};

/// Page level flash access
pub trait FlashController {
    type Error: Debug;

    /// Erase a single page to 0xFF
    fn erase(&mut self, page: Page) -> Result<(), Self::Error>;

    /// Program a full page, which must have been erased first
    fn program(&mut self, page: Page, data: &[u8; PAGE_SIZE]) -> Result<(), Self::Error>;

    /// Read flash starting at a byte address
    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// Flash write timing for a 26MHz crystal, FWT = 21000 * FCLK / (16 * 10^9)
pub const FLASH_FWT: u8 = 0x11;

/// Address of the flash write data register (FWDATA) in xdata space
pub const FWDATA_ADDR: u16 = 0xDFAF;

bitflags! {
    /// Flash control register (FCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlashStatus: u8 {
        const BUSY = 0x80;
        const SWBSY = 0x40;
        const CONTRD = 0x10;
        const WRITE = 0x02;
        const ERASE = 0x01;
    }
}

/// DMA trigger number of the flash controller
pub const DMA_TRIGGER_FLASH: u8 = 18;

pub const DMA_CFG0_WORDSIZE_8: u8 = 0 << 7;
pub const DMA_CFG0_TMODE_SINGLE: u8 = 0 << 5;
pub const DMA_CFG1_SRCINC_1: u8 = 1 << 6;
pub const DMA_CFG1_DESTINC_0: u8 = 0 << 4;
pub const DMA_CFG1_PRIORITY_HIGH: u8 = 2;
pub const DMA_LEN_HIGH_VLEN_LEN: u8 = 0 << 5;
pub const DMA_LEN_HIGH_MASK: u8 = 0x1F;

/// DMA channel descriptor in the layout the DMA controller reads from xdata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub src: u16,
    pub dst: u16,
    pub len_high: u8,
    pub len_low: u8,
    pub cfg0: u8,
    pub cfg1: u8,
}

impl DmaDescriptor {
    /// Descriptor moving one page from `src` into the flash write data
    /// register, one byte per flash trigger
    pub fn flash_write(src: u16) -> Self {
        Self {
            src,
            dst: FWDATA_ADDR,
            len_high: DMA_LEN_HIGH_VLEN_LEN | ((PAGE_SIZE >> 8) as u8 & DMA_LEN_HIGH_MASK),
            len_low: (PAGE_SIZE & 0xFF) as u8,
            cfg0: DMA_CFG0_WORDSIZE_8 | DMA_CFG0_TMODE_SINGLE | DMA_TRIGGER_FLASH,
            cfg1: DMA_CFG1_SRCINC_1 | DMA_CFG1_DESTINC_0 | DMA_CFG1_PRIORITY_HIGH,
        }
    }

    /// Transfer length in bytes
    pub fn len(&self) -> usize {
        (((self.len_high & DMA_LEN_HIGH_MASK) as usize) << 8) | self.len_low as usize
    }

    pub fn trigger(&self) -> u8 {
        self.cfg0 & 0x1F
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        [
            (self.src >> 8) as u8,
            self.src as u8,
            (self.dst >> 8) as u8,
            self.dst as u8,
            self.len_high,
            self.len_low,
            self.cfg0,
            self.cfg1,
        ]
    }
}

/// Registers touched by the flash sequences
pub trait FlashRegisters {
    /// Read FCTL
    fn status(&mut self) -> FlashStatus;

    /// Write FWT
    fn set_timing(&mut self, fwt: u8);

    /// Write FADDRH and FADDRL, a word (2 byte) address
    fn set_address(&mut self, high: u8, low: u8);

    /// Set FCTL.ERASE
    fn start_erase(&mut self);

    /// Point DMA channel 0 at `descriptor`, which transfers from `source`
    fn load_dma(&mut self, descriptor: &DmaDescriptor, source: &[u8]);

    /// Set DMAARM.DMAARM0
    fn arm_dma(&mut self);

    /// Set FCTL.WRITE followed by exactly one no-op cycle, with interrupts
    /// disabled and nothing scheduled between the two. The controller
    /// generates the first DMA trigger from this pair.
    fn trigger_write(&mut self);

    /// DMAIRQ.DMAIF0
    fn dma_done(&mut self) -> bool;

    /// Clear DMAIRQ.DMAIF0
    fn clear_dma_done(&mut self);

    /// Read a byte of code memory
    fn read_code(&mut self, address: u16) -> u8;
}

/// Flash controller driven directly through its registers
pub struct Cc1110Flash<R> {
    regs: R,
    fwt: u8,
    bound: Bound,
}

impl<R> Cc1110Flash<R>
where
    R: FlashRegisters,
{
    /// Create a controller that busy-waits without limit
    pub fn new(regs: R) -> Self {
        Self { regs, fwt: FLASH_FWT, bound: Bound::Forever }
    }

    /// Override the write timing value, for other crystal frequencies
    pub fn with_timing(mut self, fwt: u8) -> Self {
        self.fwt = fwt;
        self
    }

    /// Limit every busy wait to a number of register reads
    pub fn with_bound(mut self, bound: Bound) -> Self {
        self.bound = bound;
        self
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    fn wait_not(&mut self, flags: FlashStatus) -> Result<(), Timeout> {
        let regs = &mut self.regs;
        poll(self.bound, || !regs.status().intersects(flags)).map(|_| ())
    }

    fn select(&mut self, page: Page) {
        self.regs.set_timing(self.fwt);
        self.regs.set_address((page.index() << 1) & 0x3F, 0x00);
    }
}

impl<R> FlashController for Cc1110Flash<R>
where
    R: FlashRegisters,
{
    type Error = Timeout;

    fn erase(&mut self, page: Page) -> Result<(), Timeout> {
        self.wait_not(FlashStatus::BUSY)?;

        self.select(page);
        self.regs.start_erase();

        self.wait_not(FlashStatus::BUSY)
    }

    fn program(&mut self, page: Page, data: &[u8; PAGE_SIZE]) -> Result<(), Timeout> {
        // The descriptor holds the xdata address of the staging buffer,
        // only the low 16 bits are meaningful on target
        let descriptor = DmaDescriptor::flash_write(data.as_ptr() as usize as u16);
        self.regs.load_dma(&descriptor, &data[..]);

        self.wait_not(FlashStatus::BUSY)?;

        self.select(page);
        self.regs.arm_dma();
        self.regs.trigger_write();

        let regs = &mut self.regs;
        poll(self.bound, || regs.dma_done())?;

        self.wait_not(FlashStatus::BUSY | FlashStatus::SWBSY)?;

        self.regs.clear_dma_done();
        Ok(())
    }

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Timeout> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.regs.read_code(address.wrapping_add(i as u16));
        }
        Ok(())
    }
}
