//! Flash programming through the debug port.
//!
//! With the target halted, a page is written into xdata scratch RAM
//! together with a small routine that erases the destination page and
//! feeds the page into the flash controller. The CPU is then pointed at
//! the routine and resumed; the routine halts itself when done.

use crate::debug::{DebugCodec, DebugPins, DebugStatus, MEMCTR};
use crate::flash::FlashController;
use crate::poll::{try_poll, Bound};
use crate::protocol::{is_blank, Image, Page, ERASED, PAGE_SIZE};
use crate::Error;

/// Number of status reads before a debug-port wait is abandoned
pub const NUM_ATTEMPTS: u32 = 100;

/// Flash word size in bytes
pub const FLASH_WORD_SIZE: usize = 2;

pub const WORDS_PER_FLASH_PAGE: usize = PAGE_SIZE / FLASH_WORD_SIZE;

/// Xdata address the page buffer is staged at
pub const SCRATCH_ADDR: u16 = 0xF000;

/// Xdata address of the flash write routine, directly after the page buffer
pub const MICROPROGRAM_ADDR: u16 = SCRATCH_ADDR + PAGE_SIZE as u16;

/// Offset of the FADDRH operand in [`MICROPROGRAM`]
pub const MICROPROGRAM_ADDR_OFFSET: usize = 2;

/// MEMCTR value used while the routine runs
pub const MEMCTR_FLASH_WRITE: u8 = 0x51;

/// Erase the page at FADDRH, then write 512 words from xdata 0xF000
/// through FWDATA and halt
pub const MICROPROGRAM: [u8; 46] = [
    0x75, 0xAD, 0x00, // MOV FADDRH, #page (patched)
    0x75, 0xAC, 0x00, // MOV FADDRL, #0
    0x75, 0xAB, 0x23, // MOV FWT, #0x23
    0x00, // NOP
    0x75, 0xAE, 0x01, // MOV FCTL, #ERASE
    0xE5, 0xAE, // MOV A, FCTL
    0x20, 0xE7, 0xFB, // JB ACC.7, -5
    0x90, 0xF0, 0x00, // MOV DPTR, #0xF000
    0x7F, (WORDS_PER_FLASH_PAGE >> 8) as u8, // MOV R7, #high(words)
    0x7E, (WORDS_PER_FLASH_PAGE & 0xFF) as u8, // MOV R6, #low(words)
    0x75, 0xAE, 0x02, // MOV FCTL, #WRITE
    0x7D, FLASH_WORD_SIZE as u8, // MOV R5, #2
    0xE0, // MOVX A, @DPTR
    0xA3, // INC DPTR
    0xF5, 0xAF, // MOV FWDATA, A
    0xDD, 0xFA, // DJNZ R5, -6
    0xE5, 0xAE, // MOV A, FCTL
    0x20, 0xE6, 0xFB, // JB ACC.6, -5
    0xDE, 0xF1, // DJNZ R6, -15
    0xDF, 0xEF, // DJNZ R7, -17
    0xA5, // halt
];

/// FADDRH value for the page starting at a byte address
pub fn microprogram_address(address: u32) -> u8 {
    (((address >> 8) / FLASH_WORD_SIZE as u32) & 0x7E) as u8
}

/// The flash write routine patched for a single page
pub fn microprogram(page: Page) -> [u8; 46] {
    let mut p = MICROPROGRAM;
    p[MICROPROGRAM_ADDR_OFFSET] = microprogram_address(page.address() as u32);
    p
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct DebugOptions {
    /// Status reads before a chip erase or page write is abandoned
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub attempts: u32,

    /// Skip the chip erase before programming an image
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_erase: bool,

    /// Do not reset the target once programming completes
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self { attempts: NUM_ATTEMPTS, no_erase: false, no_reset: false }
    }
}

/// What happened to a page while programming an image over the debug port
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum RemoteAction {
    Skipped,
    Written,
}

/// Page writer driving a halted target through its debug port
pub struct RemoteFlashWriter<P> {
    codec: DebugCodec<P>,
    options: DebugOptions,
}

impl<P> RemoteFlashWriter<P>
where
    P: DebugPins,
{
    pub fn new(pins: P, options: DebugOptions) -> Self {
        Self { codec: DebugCodec::new(pins), options }
    }

    pub fn codec(&mut self) -> &mut DebugCodec<P> {
        &mut self.codec
    }

    pub fn into_inner(self) -> P {
        self.codec.into_inner()
    }

    /// Halt the target in debug mode
    pub fn init(&mut self) -> Result<(), Error<P::Error>> {
        self.codec.enter().map_err(Error::transport)
    }

    /// Reboot the target into whatever is now in flash
    pub fn reset(&mut self) -> Result<(), Error<P::Error>> {
        self.codec.reset().map_err(Error::transport)
    }

    /// Poll the status register until `flag` is set
    fn wait_status(&mut self, flag: DebugStatus) -> Result<u32, Result<u32, P::Error>> {
        let codec = &mut self.codec;
        try_poll(Bound::Attempts(self.options.attempts), || {
            codec.read_status().map(|s| s.contains(flag))
        })
        .map_err(|e| e.map(|t| t.attempts))
    }

    /// Erase the whole flash, including the bootloader
    pub fn mass_erase(&mut self) -> Result<(), Error<P::Error>> {
        debug!("Starting chip erase");
        self.codec.chip_erase().map_err(Error::transport)?;

        match self.wait_status(DebugStatus::CHIP_ERASE_DONE) {
            Ok(n) => {
                debug!("Chip erase done after {} status reads", n);
                Ok(())
            }
            Err(Ok(attempts)) => {
                error!("Chip erase not done after {} status reads", attempts);
                Err(Error::EraseTimeout { attempts })
            }
            Err(Err(e)) => Err(Error::transport(e)),
        }
    }

    /// Erase and write a single page
    pub fn write_page(&mut self, page: Page, data: &[u8; PAGE_SIZE]) -> Result<(), Error<P::Error>> {
        debug!("Writing page {} through the debug port", page);

        let program = microprogram(page);
        let page_err = |e| Error::Transport { command: None, page: Some(page.index()), error: e };

        self.codec.write_xdata(SCRATCH_ADDR, &data[..]).map_err(page_err)?;
        self.codec.write_xdata(MICROPROGRAM_ADDR, &program).map_err(page_err)?;
        self.codec.write_sfr(MEMCTR, MEMCTR_FLASH_WRITE).map_err(page_err)?;
        self.codec.set_pc(MICROPROGRAM_ADDR).map_err(page_err)?;
        self.codec.resume().map_err(page_err)?;

        match self.wait_status(DebugStatus::CPU_HALTED) {
            Ok(_) => Ok(()),
            Err(Ok(attempts)) => {
                error!("Target did not halt after writing page {}", page);
                Err(Error::WriteTimeout { page: page.index(), attempts })
            }
            Err(Err(e)) => Err(page_err(e)),
        }
    }

    /// Read a page of code memory
    pub fn read_page(&mut self, page: Page) -> Result<[u8; PAGE_SIZE], Error<P::Error>> {
        let mut buf = [0u8; PAGE_SIZE];
        self.read(page.address(), &mut buf)?;
        Ok(buf)
    }

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error<P::Error>> {
        let bank = ((address as u32 >> 15) & 0x03) as u8;
        self.codec.read_code(address, bank, buf).map_err(Error::transport)
    }

    /// Write a page and read it back
    pub fn program_verify_page(&mut self, page: Page, data: &[u8; PAGE_SIZE]) -> Result<(), Error<P::Error>> {
        self.write_page(page, data)?;

        let actual = self.read_page(page)?;
        Error::check_verify(page, &data[..], &actual[..])
    }

    /// Write every non-blank page of an image, erasing the chip first.
    ///
    /// Stops at the first page that fails to write or verify.
    pub fn program_image<F>(&mut self, image: &Image, mut on_page: F) -> Result<(), Error<P::Error>>
    where
        F: FnMut(Page, RemoteAction),
    {
        if !self.options.no_erase {
            self.mass_erase()?;
        }

        for (page, data) in image.pages() {
            if is_blank(&data[..]) {
                debug!("Skipping blank page {}", page);
                on_page(page, RemoteAction::Skipped);
                continue;
            }

            info!("Programming and verifying page {}", page);
            self.program_verify_page(page, data)?;
            on_page(page, RemoteAction::Written);
        }

        if !self.options.no_reset {
            self.reset()?;
        }

        Ok(())
    }
}

impl<P> FlashController for RemoteFlashWriter<P>
where
    P: DebugPins,
{
    type Error = Error<P::Error>;

    /// The write routine always erases first, so writing a blank page
    /// leaves the page erased
    fn erase(&mut self, page: Page) -> Result<(), Self::Error> {
        self.write_page(page, &[ERASED; PAGE_SIZE])
    }

    fn program(&mut self, page: Page, data: &[u8; PAGE_SIZE]) -> Result<(), Self::Error> {
        self.write_page(page, data)
    }

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Self::Error> {
        RemoteFlashWriter::read(self, address, buf)
    }
}
