//! Wire constants and data model shared by the host and resident sides

use core::fmt;

use thiserror::Error;

/// Size of a flash page, the erase and program granularity
pub const PAGE_SIZE: usize = 1024;

/// Number of pages in the flash address space
pub const PAGE_COUNT: usize = 32;

/// Total flash size
pub const FLASH_SIZE: usize = PAGE_SIZE * PAGE_COUNT;

/// Value of an erased flash byte
pub const ERASED: u8 = 0xFF;

/// Entry point of user code, the first byte after the bootloader page
pub const USER_ENTRY: u16 = 0x0400;

/// Acknowledgement byte sent after every completed command
pub const ACK: u8 = 0x00;

/// Beacon emitted by the bootloader while its boot window is open
pub const BEACON: u8 = b'B';

/// Sequence sent by the host before looking for beacons
pub const WAKE: &[u8] = b"+++";

/// Byte sent by the host to close the boot window
pub const SYNC_REPLY: u8 = 0x00;

/// Banner sent by the bootloader on reset
pub const BANNER: &[u8] = b"\r\nCCTL\r\n";

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Erases page N
    Erase = b'e',

    /// Programs page N from the staging buffer
    Program = b'p',

    /// Streams the 1024 bytes of page N followed by an ack
    Read = b'r',

    /// Fills the staging buffer with the following 1024 bytes
    Load = b'l',

    /// Leaves the bootloader and runs user code, no ack
    Jump = b'j',
}

impl Command {
    /// Decode a command byte, returning None for anything else
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'e' => Some(Command::Erase),
            b'p' => Some(Command::Program),
            b'r' => Some(Command::Read),
            b'l' => Some(Command::Load),
            b'j' => Some(Command::Jump),
            _ => None,
        }
    }

    /// Whether the opcode is followed by a page index
    pub fn takes_page(&self) -> bool {
        matches!(self, Command::Erase | Command::Program | Command::Read)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Erase => "ERASE",
            Command::Program => "PROGRAM",
            Command::Read => "READ",
            Command::Load => "LOAD",
            Command::Jump => "JUMP",
        };
        f.write_str(name)
    }
}

/// Index of a 1KB flash page
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Page(u8);

impl Page {
    /// Page holding the bootloader itself
    pub const BOOTLOADER: Page = Page(0);

    /// First page available to user code
    pub const FIRST_USER: Page = Page(1);

    pub fn new(index: u8) -> Option<Self> {
        if (index as usize) < PAGE_COUNT {
            Some(Page(index))
        } else {
            None
        }
    }

    /// Page from a wire byte, wrapping into the flash the way the
    /// controller's address register does
    pub fn from_wire(b: u8) -> Self {
        Page(b & (PAGE_COUNT as u8 - 1))
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// Byte address of the first byte of the page
    pub fn address(&self) -> u16 {
        self.0 as u16 * PAGE_SIZE as u16
    }

    pub fn is_reserved(&self) -> bool {
        *self == Page::BOOTLOADER
    }

    /// All pages in ascending order
    pub fn all() -> impl Iterator<Item = Page> {
        (0..PAGE_COUNT as u8).map(Page)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns true if every byte of the slice is erased flash
pub fn is_blank(data: &[u8]) -> bool {
    data.iter().all(|b| *b == ERASED)
}

#[derive(Debug, Error, PartialEq)]
pub enum ImageError {
    #[error("image of {len} bytes at offset 0x{offset:04x} does not fit in {} bytes of flash", FLASH_SIZE)]
    TooLarge { offset: usize, len: usize },
}

/// Flat image of the whole flash, erased bytes where nothing is placed
#[derive(Clone, PartialEq)]
pub struct Image {
    pages: Vec<[u8; PAGE_SIZE]>,
}

impl Image {
    pub fn blank() -> Self {
        Self { pages: vec![[ERASED; PAGE_SIZE]; PAGE_COUNT] }
    }

    /// Build an image from a raw binary placed at `offset`
    pub fn from_binary(offset: usize, bin: &[u8]) -> Result<Self, ImageError> {
        let mut image = Self::blank();
        image.place(offset, bin)?;
        Ok(image)
    }

    /// Copy `bin` into the image at `offset`
    pub fn place(&mut self, offset: usize, bin: &[u8]) -> Result<(), ImageError> {
        match offset.checked_add(bin.len()) {
            Some(end) if end <= FLASH_SIZE => (),
            _ => return Err(ImageError::TooLarge { offset, len: bin.len() }),
        }

        for (i, b) in bin.iter().enumerate() {
            let addr = offset + i;
            self.pages[addr / PAGE_SIZE][addr % PAGE_SIZE] = *b;
        }
        Ok(())
    }

    /// Contents of a single page
    pub fn page(&self, page: Page) -> &[u8; PAGE_SIZE] {
        &self.pages[page.index() as usize]
    }

    pub fn page_mut(&mut self, page: Page) -> &mut [u8; PAGE_SIZE] {
        &mut self.pages[page.index() as usize]
    }

    /// Pages paired with their contents, in ascending order
    pub fn pages(&self) -> impl Iterator<Item = (Page, &[u8; PAGE_SIZE])> {
        Page::all().zip(self.pages.iter())
    }

    /// Number of pages that hold anything other than erased flash
    pub fn used_pages(&self) -> usize {
        self.pages.iter().filter(|d| !is_blank(&d[..])).count()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("used_pages", &self.used_pages())
            .finish()
    }
}
