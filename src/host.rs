//! Host side of the serial bootloader protocol.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{
    is_blank, Command, Image, Page, ACK, BEACON, PAGE_SIZE, SYNC_REPLY, WAKE,
};
use crate::{Error, SerialPort};

/// Maximum number of stray bytes discarded after the sync reply
pub const DRAIN_LIMIT: usize = 64;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Syncing,
    Ready,
    Erasing,
    Programming,
    Reading,
    Loading,
    Jumped,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Pulse DTR/RTS to reset the device before syncing
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset: bool,

    /// Time to wait for a bootloader beacon pair
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10000"))]
    pub sync_timeout_ms: u32,

    /// Timeout to wait for each response byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value="2000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Period to wait after reset before syncing
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reset: false,
            sync_timeout_ms: 10_000,
            response_timeout_ms: 2_000,
            poll_delay_ms: 1,
            init_delay_ms: 1,
        }
    }
}

/// What was done to a page while programming an image
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PageAction {
    /// Blank in the image, erased only
    Erased,
    /// Loaded, erased, programmed and verified
    Programmed,
}

/// Session with the resident bootloader over a serial port
pub struct HostSession<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    command: Option<Command>,
    page: Option<u8>,
    _err: PhantomData<E>,
}

impl<P, D, E> HostSession<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new session
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            port,
            delay,
            command: None,
            page: None,
            _err: PhantomData,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    fn transport(&self, error: E) -> Error<E> {
        Error::Transport { command: self.command, page: self.page, error }
    }

    /// Run one command exchange from `Ready`.
    ///
    /// Any failure drops the session back to `Disconnected`, a new sync is
    /// needed before the next command.
    fn exchange<T, F>(
        &mut self,
        command: Command,
        page: Option<u8>,
        state: State,
        f: F,
    ) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Self) -> Result<T, Error<E>>,
    {
        if self.state != State::Ready {
            warn!("Refusing {} in state {:?}", command, self.state);
            return Err(Error::NotReady { command });
        }

        self.command = Some(command);
        self.page = page;
        self.state = state;

        let res = f(self);

        self.command = None;
        self.page = None;
        self.state = match (&res, state) {
            (Err(_), _) => State::Disconnected,
            (Ok(_), State::Jumped) => State::Jumped,
            (Ok(_), _) => State::Ready,
        };

        res
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            if let Err(e) = nb::block!(self.port.write(*b)) {
                return Err(self.transport(e));
            }
        }
        Ok(())
    }

    /// Read one byte, polling until `timeout_ms` has elapsed
    fn read_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        let mut t = 0;

        loop {
            match self.port.read() {
                Ok(v) => return Ok(Some(v)),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(self.transport(e)),
            }

            if t >= timeout_ms {
                return Ok(None);
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);
        }
    }

    /// Read a response byte for the current command
    fn read_response(&mut self) -> Result<u8, Error<E>> {
        match self.read_byte(self.options.response_timeout_ms)? {
            Some(v) => Ok(v),
            None => {
                let command = self.command.unwrap_or(Command::Jump);
                error!("Receive timeout during {}", command);
                Err(Error::ResponseTimeout { command, page: self.page })
            }
        }
    }

    fn await_ack(&mut self) -> Result<(), Error<E>> {
        let response = self.read_response()?;
        let command = self.command.unwrap_or(Command::Jump);

        if response == ACK {
            trace!("Received ack for {}", command);
            Ok(())
        } else {
            debug!("Received unexpected value: 0x{:02x}", response);
            Err(Error::Nack { command, page: self.page, response })
        }
    }

    /// Reset the device through the modem control lines
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true).map_err(Error::transport)?;
        self.port.set_rts(true).map_err(Error::transport)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false).map_err(Error::transport)?;
        self.port.set_rts(false).map_err(Error::transport)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Find the bootloader and hold it in its command loop.
    ///
    /// Sends the wake sequence, waits for two consecutive beacons and
    /// answers with a single zero byte.
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        self.state = State::Syncing;
        self.command = None;
        self.page = None;

        match self.handshake() {
            Ok(()) => {
                self.state = State::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = State::Disconnected;
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<(), Error<E>> {
        // Anything arriving inside the boot window ends the beacons, so the
        // wake sequence goes out before the board is reset
        debug!("Sending wake sequence");
        self.write(WAKE)?;

        if self.options.reset {
            self.reset()?;
        }

        info!("Waiting {} ms for bootloader, reset board now", self.options.sync_timeout_ms);

        let timeout_ms = self.options.sync_timeout_ms;
        let mut prev = None;
        let mut t = 0;

        loop {
            match self.port.read() {
                Ok(v) => {
                    trace!("Sync rx: 0x{:02x}", v);
                    if v == BEACON && prev == Some(BEACON) {
                        break;
                    }
                    prev = Some(v);
                }
                Err(nb::Error::WouldBlock) => self.delay.delay_ms(self.options.poll_delay_ms),
                Err(nb::Error::Other(e)) => return Err(self.transport(e)),
            }

            // Received bytes are charged too, a chattering port still times out
            t += self.options.poll_delay_ms.max(1);
            if t >= timeout_ms {
                error!("No bootloader detected");
                return Err(Error::NoBootloader { timeout_ms });
            }
        }

        debug!("Bootloader beacon detected");
        self.write(&[SYNC_REPLY])?;

        // Beacons sent before the reply landed are not acks
        for _ in 0..DRAIN_LIMIT {
            match self.port.read() {
                Ok(v) => trace!("Discarding 0x{:02x}", v),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(self.transport(e)),
            }
        }

        Ok(())
    }

    fn check_page(page: Page) -> Result<(), Error<E>> {
        if page.is_reserved() {
            warn!("Refusing to modify page {}", page);
            return Err(Error::ReservedPage(page.index()));
        }
        Ok(())
    }

    /// Erase a single page
    pub fn erase_page(&mut self, page: Page) -> Result<(), Error<E>> {
        Self::check_page(page)?;

        debug!("Erasing page {}", page);
        self.exchange(Command::Erase, Some(page.index()), State::Erasing, |s| {
            s.write(&[Command::Erase as u8, page.index()])?;
            s.await_ack()
        })
    }

    /// Fill the bootloader's staging buffer
    pub fn load(&mut self, data: &[u8; PAGE_SIZE]) -> Result<(), Error<E>> {
        debug!("Loading staging buffer");
        self.exchange(Command::Load, None, State::Loading, |s| {
            s.write(&[Command::Load as u8])?;
            s.write(&data[..])?;
            s.await_ack()
        })
    }

    /// Program a page from the staging buffer
    pub fn program_page(&mut self, page: Page) -> Result<(), Error<E>> {
        Self::check_page(page)?;

        debug!("Programming page {}", page);
        self.exchange(Command::Program, Some(page.index()), State::Programming, |s| {
            s.write(&[Command::Program as u8, page.index()])?;
            s.await_ack()
        })
    }

    /// Read a page back from flash
    pub fn read_page(&mut self, page: Page) -> Result<[u8; PAGE_SIZE], Error<E>> {
        debug!("Reading page {}", page);
        self.exchange(Command::Read, Some(page.index()), State::Reading, |s| {
            s.write(&[Command::Read as u8, page.index()])?;

            let mut data = [0u8; PAGE_SIZE];
            for b in data.iter_mut() {
                *b = s.read_response()?;
            }
            s.await_ack()?;

            Ok(data)
        })
    }

    /// Leave the bootloader and start user code, no ack is sent back
    pub fn jump(&mut self) -> Result<(), Error<E>> {
        debug!("Jumping to user code");
        self.exchange(Command::Jump, None, State::Jumped, |s| s.write(&[Command::Jump as u8]))
    }

    /// Load, erase, program and read back a page
    pub fn erase_program_verify(&mut self, page: Page, data: &[u8; PAGE_SIZE]) -> Result<(), Error<E>> {
        Self::check_page(page)?;

        self.load(data)?;
        self.erase_page(page)?;
        self.program_page(page)?;

        let actual = self.read_page(page)?;
        Error::check_verify(page, &data[..], &actual[..]).map_err(|e| {
            self.state = State::Disconnected;
            e
        })
    }

    /// Write a whole image and start it.
    ///
    /// Blank pages are only erased, every other page is written and
    /// verified. The first failure stops the run before later pages are
    /// touched and before the jump.
    pub fn program_image<F>(&mut self, image: &Image, mut on_page: F) -> Result<(), Error<E>>
    where
        F: FnMut(Page, PageAction),
    {
        for (page, data) in image.pages().filter(|(p, _)| !p.is_reserved()) {
            if is_blank(&data[..]) {
                debug!("Erasing page {}", page);
                self.erase_page(page)?;
                on_page(page, PageAction::Erased);
            } else {
                info!("Erasing, programming and verifying page {}", page);
                self.erase_program_verify(page, data)?;
                on_page(page, PageAction::Programmed);
            }
        }

        self.jump()
    }

    /// Sync with the bootloader, program an image and start it
    pub fn run(&mut self, image: &Image) -> Result<(), Error<E>> {
        self.sync()?;
        self.program_image(image, |_, _| ())
    }
}
