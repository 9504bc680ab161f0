//! Resident bootloader command loop.
//!
//! The [`Dispatcher`] is a non-blocking state machine over an embedded-hal
//! serial port, a [`FlashController`], a watchdog and a [`Handoff`] into
//! user code. Received bytes are expected to arrive through an interrupt
//! fed [`RxFifo`], which [`BufferedSerial`] exposes as a serial port.

use core::fmt::Debug;

use embedded_hal::serial::{Read, Write};
use embedded_hal::watchdog::{Watchdog, WatchdogEnable};
use heapless::spsc::{Consumer, Producer, Queue};
use thiserror::Error;

use crate::flash::FlashController;
use crate::protocol::{Command, Page, ACK, BANNER, BEACON, ERASED, PAGE_SIZE, USER_ENTRY};

/// Receive FIFO depth, one slot is lost to the queue implementation
pub const RX_FIFO_SIZE: usize = 2048;

/// Interrupt fed receive buffer
pub type RxFifo = Queue<u8, RX_FIFO_SIZE>;

/// Transfer of control out of the bootloader
pub trait Handoff {
    /// Mask every interrupt source
    fn disable_interrupts(&mut self);

    /// Jump to `entry`, does not return on hardware
    fn jump(&mut self, entry: u16);
}

/// RAM staging buffer for one flash page
pub struct PageStore([u8; PAGE_SIZE]);

impl Default for PageStore {
    fn default() -> Self {
        Self([0u8; PAGE_SIZE])
    }
}

impl PageStore {
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn set(&mut self, offset: usize, b: u8) {
        self.0[offset % PAGE_SIZE] = b;
    }
}

/// Receive interrupt side of the FIFO
pub struct RxInterrupt<'a> {
    producer: Producer<'a, u8, RX_FIFO_SIZE>,
    overruns: u32,
}

impl<'a> RxInterrupt<'a> {
    /// Store a received byte, dropping it when the FIFO is full
    pub fn on_receive(&mut self, b: u8) {
        if self.producer.enqueue(b).is_err() {
            self.overruns = self.overruns.saturating_add(1);
        }
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }
}

/// Serial port reading from the FIFO and writing straight to the UART
pub struct BufferedSerial<'a, TX> {
    rx: Consumer<'a, u8, RX_FIFO_SIZE>,
    tx: TX,
}

/// Split a FIFO into the interrupt producer and a buffered serial port
pub fn buffered<TX>(fifo: &mut RxFifo, tx: TX) -> (RxInterrupt<'_>, BufferedSerial<'_, TX>) {
    let (producer, consumer) = fifo.split();
    (
        RxInterrupt { producer, overruns: 0 },
        BufferedSerial { rx: consumer, tx },
    )
}

impl<'a, TX> BufferedSerial<'a, TX> {
    pub fn tx(&self) -> &TX {
        &self.tx
    }

    pub fn tx_mut(&mut self) -> &mut TX {
        &mut self.tx
    }
}

impl<'a, TX> Read<u8> for BufferedSerial<'a, TX>
where
    TX: Write<u8>,
{
    type Error = TX::Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.dequeue().ok_or(nb::Error::WouldBlock)
    }
}

impl<'a, TX> Write<u8> for BufferedSerial<'a, TX>
where
    TX: Write<u8>,
{
    type Error = TX::Error;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.tx.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.tx.flush()
    }
}

/// Boot window timing
#[derive(Clone, PartialEq, Debug)]
pub struct ResidentConfig {
    /// Empty receive polls between beacons
    pub polls_per_beacon: u32,
    /// Beacons sent before the window closes
    pub beacons: u8,
}

impl Default for ResidentConfig {
    fn default() -> Self {
        Self { polls_per_beacon: 65536, beacons: 8 }
    }
}

#[derive(Debug, PartialEq, Error)]
pub enum Error<SE: Debug, FE: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SE),

    #[error("flash error: {0:?}")]
    Flash(FE),
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Banner not sent yet
    Boot,
    /// Beaconing and waiting for any byte
    AwaitSync { polls: u32, beacons: u8 },
    AwaitOpcode,
    AwaitPageArg(Command),
    Executing(Command, Page),
    Ack(Command, Option<Page>),
    Loading { offset: usize },
    /// Control left the bootloader
    Jumped,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Event {
    /// A beacon went out during the boot window
    Beacon,
    /// A byte arrived during the boot window, the loop is entered
    Synced,
    /// The window closed with no user code, the loop is entered
    WindowClosed,
    /// A byte that is not a command was dropped
    Ignored(u8),
    /// A command finished and was acknowledged
    Completed { command: Command, page: Option<Page> },
    /// JUMP with no user code present
    JumpRefused,
    Jumped,
}

/// Resident bootloader state machine
pub struct Dispatcher<S, F, W, H>
where
    W: WatchdogEnable,
{
    serial: S,
    flash: F,
    watchdog: W,
    watchdog_period: Option<W::Time>,
    handoff: H,
    store: PageStore,
    config: ResidentConfig,
    state: State,
}

impl<S, F, W, H, SE> Dispatcher<S, F, W, H>
where
    S: Read<u8, Error = SE> + Write<u8, Error = SE>,
    SE: Debug,
    F: FlashController,
    W: Watchdog + WatchdogEnable,
    H: Handoff,
{
    /// Create a dispatcher, the watchdog is started with `watchdog_period`
    /// once the command loop is entered
    pub fn new(
        serial: S,
        flash: F,
        watchdog: W,
        watchdog_period: W::Time,
        handoff: H,
        config: ResidentConfig,
    ) -> Self {
        Self {
            serial,
            flash,
            watchdog,
            watchdog_period: Some(watchdog_period),
            handoff,
            store: PageStore::default(),
            config,
            state: State::Boot,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn serial(&self) -> &S {
        &self.serial
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    pub fn handoff(&self) -> &H {
        &self.handoff
    }

    fn put(&mut self, b: u8) -> Result<(), Error<SE, F::Error>> {
        nb::block!(self.serial.write(b)).map_err(Error::Serial)
    }

    /// Send the banner and open the boot window
    pub fn start(&mut self) -> Result<(), Error<SE, F::Error>> {
        for b in BANNER {
            self.put(*b)?;
        }

        self.state = State::AwaitSync {
            polls: self.config.polls_per_beacon,
            beacons: self.config.beacons,
        };
        Ok(())
    }

    /// True when the user code entry holds something other than erased flash
    pub fn user_code_present(&mut self) -> Result<bool, Error<SE, F::Error>> {
        let mut b = [ERASED];
        self.flash.read(USER_ENTRY, &mut b).map_err(Error::Flash)?;
        Ok(b[0] != ERASED)
    }

    /// Hand over to user code if there is any
    fn jump_to_user(&mut self) -> Result<bool, Error<SE, F::Error>> {
        if !self.user_code_present()? {
            return Ok(false);
        }

        debug!("Jumping to 0x{:04x}", USER_ENTRY);

        self.handoff.disable_interrupts();
        self.state = State::Jumped;
        self.handoff.jump(USER_ENTRY);

        Ok(true)
    }

    fn enter_loop(&mut self) {
        if let Some(period) = self.watchdog_period.take() {
            self.watchdog.start(period);
        }
        self.state = State::AwaitOpcode;
    }

    fn execute(&mut self, command: Command, page: Page) -> Result<(), Error<SE, F::Error>> {
        match command {
            Command::Erase | Command::Program if page.is_reserved() => {
                warn!("Ignoring {} of bootloader page", command);
            }
            Command::Erase => {
                self.flash.erase(page).map_err(Error::Flash)?;
            }
            Command::Program => {
                self.flash.program(page, &self.store.0).map_err(Error::Flash)?;
            }
            Command::Read => {
                let mut b = [0u8];
                for i in 0..PAGE_SIZE as u16 {
                    self.flash.read(page.address() + i, &mut b).map_err(Error::Flash)?;
                    self.put(b[0])?;
                }
            }
            Command::Load | Command::Jump => (),
        }
        Ok(())
    }

    /// Advance the state machine.
    ///
    /// Returns `WouldBlock` while waiting for input, otherwise the event
    /// that was reached.
    pub fn poll(&mut self) -> nb::Result<Event, Error<SE, F::Error>> {
        loop {
            match self.state {
                State::Boot => self.start()?,

                State::AwaitSync { polls, beacons } => {
                    match self.serial.read() {
                        Ok(b) => {
                            trace!("Sync byte 0x{:02x}", b);
                            self.enter_loop();
                            return Ok(Event::Synced);
                        }
                        Err(nb::Error::WouldBlock) => (),
                        Err(nb::Error::Other(e)) => return Err(nb::Error::Other(Error::Serial(e))),
                    }

                    if polls > 1 {
                        self.state = State::AwaitSync { polls: polls - 1, beacons };
                        return Err(nb::Error::WouldBlock);
                    }

                    self.put(BEACON)?;

                    let beacons = beacons.saturating_sub(1);
                    if beacons > 0 {
                        self.state = State::AwaitSync { polls: self.config.polls_per_beacon, beacons };
                        return Ok(Event::Beacon);
                    }

                    if self.jump_to_user()? {
                        return Ok(Event::Jumped);
                    }

                    debug!("Boot window closed, no user code");
                    self.enter_loop();
                    return Ok(Event::WindowClosed);
                }

                State::AwaitOpcode => {
                    let b = self.serial.read().map_err(|e| e.map(Error::Serial))?;

                    // Every command starts by patting the watchdog
                    self.watchdog.feed();

                    match Command::from_byte(b) {
                        Some(Command::Jump) => {
                            if self.jump_to_user()? {
                                return Ok(Event::Jumped);
                            }
                            warn!("No user code, staying in bootloader");
                            return Ok(Event::JumpRefused);
                        }
                        Some(Command::Load) => {
                            self.state = State::Loading { offset: 0 };
                        }
                        Some(command) => {
                            self.state = State::AwaitPageArg(command);
                        }
                        None => {
                            trace!("Ignoring 0x{:02x}", b);
                            return Ok(Event::Ignored(b));
                        }
                    }
                }

                State::AwaitPageArg(command) => {
                    let b = self.serial.read().map_err(|e| e.map(Error::Serial))?;
                    self.state = State::Executing(command, Page::from_wire(b));
                }

                State::Executing(command, page) => {
                    debug!("{} page {}", command, page);
                    self.execute(command, page)?;
                    self.state = State::Ack(command, Some(page));
                }

                State::Loading { offset } => {
                    let b = self.serial.read().map_err(|e| e.map(Error::Serial))?;
                    self.store.set(offset, b);

                    self.state = if offset + 1 == PAGE_SIZE {
                        State::Ack(Command::Load, None)
                    } else {
                        State::Loading { offset: offset + 1 }
                    };
                }

                State::Ack(command, page) => {
                    self.put(ACK)?;
                    self.state = State::AwaitOpcode;
                    return Ok(Event::Completed { command, page });
                }

                State::Jumped => return Ok(Event::Jumped),
            }
        }
    }

    /// Run the bootloader until control passes to user code
    pub fn run(&mut self) -> Result<(), Error<SE, F::Error>> {
        loop {
            match self.poll() {
                Ok(Event::Jumped) => return Ok(()),
                Ok(_) | Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::Cc1110Flash;
    use crate::poll::Bound;
    use crate::sim::{SimFlashRegisters, SimHandoff, SimSerial, SimWatchdog};

    type Sim = Dispatcher<SimSerial, Cc1110Flash<SimFlashRegisters>, SimWatchdog, SimHandoff>;

    fn dispatcher(rx: &[u8], regs: SimFlashRegisters) -> Sim {
        let config = ResidentConfig { polls_per_beacon: 4, beacons: 8 };
        let flash = Cc1110Flash::new(regs).with_bound(Bound::Attempts(100));
        Dispatcher::new(SimSerial::with_rx(rx), flash, SimWatchdog::default(), 1000, SimHandoff::default(), config)
    }

    /// Poll until the input runs dry in the command loop
    fn drain(d: &mut Sim) -> Vec<Event> {
        let mut events = vec![];
        for _ in 0..100_000 {
            match d.poll() {
                Ok(Event::Jumped) => {
                    events.push(Event::Jumped);
                    break;
                }
                Ok(e) => events.push(e),
                Err(nb::Error::WouldBlock) => {
                    if d.serial().rx.is_empty() && d.state() == State::AwaitOpcode {
                        break;
                    }
                }
                Err(nb::Error::Other(e)) => panic!("dispatcher error: {:?}", e),
            }
        }
        events
    }

    fn synced(rx: &[u8], regs: SimFlashRegisters) -> Sim {
        let mut d = dispatcher(&[0x00], regs);
        assert_eq!(d.poll(), Ok(Event::Synced));
        d.serial_mut().tx.clear();
        d.serial_mut().push_rx(rx);
        d
    }

    fn page(n: u8) -> Page {
        Page::new(n).unwrap()
    }

    #[test]
    fn window_closes_into_command_loop_without_user_code() {
        let mut d = dispatcher(&[], SimFlashRegisters::new());
        let events = drain(&mut d);

        assert_eq!(events.iter().filter(|e| **e == Event::Beacon).count(), 7);
        assert_eq!(events.last(), Some(&Event::WindowClosed));

        let mut expected = BANNER.to_vec();
        expected.extend_from_slice(b"BBBBBBBB");
        assert_eq!(d.serial().tx, expected);

        assert_eq!(d.watchdog().period_ms, Some(1000));
        assert_eq!(d.handoff().jumped_to, None);
    }

    #[test]
    fn window_closes_into_user_code() {
        let regs = SimFlashRegisters::new().with_contents(USER_ENTRY as usize, &[0x02, 0x04, 0x10]);
        let mut d = dispatcher(&[], regs);
        let events = drain(&mut d);

        assert_eq!(events.last(), Some(&Event::Jumped));
        assert_eq!(d.state(), State::Jumped);
        assert!(d.handoff().interrupts_disabled);
        assert_eq!(d.handoff().jumped_to, Some(USER_ENTRY));
        // The watchdog is only armed for the command loop
        assert_eq!(d.watchdog().period_ms, None);
    }

    #[test]
    fn any_byte_holds_the_bootloader() {
        let regs = SimFlashRegisters::new().with_contents(USER_ENTRY as usize, &[0x02]);
        let mut d = dispatcher(b"+", regs);

        assert_eq!(d.poll(), Ok(Event::Synced));
        assert_eq!(d.state(), State::AwaitOpcode);
        assert_eq!(d.serial().tx, BANNER.to_vec());
        assert_eq!(d.poll(), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn load_erase_program_read() {
        let data: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7) as u8).collect();

        let mut rx = vec![b'l'];
        rx.extend_from_slice(&data);
        rx.extend_from_slice(&[b'e', 3, b'p', 3, b'r', 3]);

        let mut d = synced(&rx, SimFlashRegisters::new().with_busy_cycles(3));
        let events = drain(&mut d);

        assert_eq!(
            events,
            vec![
                Event::Completed { command: Command::Load, page: None },
                Event::Completed { command: Command::Erase, page: Some(page(3)) },
                Event::Completed { command: Command::Program, page: Some(page(3)) },
                Event::Completed { command: Command::Read, page: Some(page(3)) },
            ]
        );

        let flash = d.flash().registers().flash();
        assert_eq!(&flash[3 * PAGE_SIZE..4 * PAGE_SIZE], &data[..]);

        // Three acks, then the page, then the read ack
        let tx = &d.serial().tx;
        assert_eq!(tx.len(), 3 + PAGE_SIZE + 1);
        assert_eq!(&tx[..3], &[0, 0, 0]);
        assert_eq!(&tx[3..3 + PAGE_SIZE], &data[..]);
        assert_eq!(tx[3 + PAGE_SIZE], 0);
    }

    #[test]
    fn load_leaves_flash_alone() {
        let regs = SimFlashRegisters::new().with_contents(2 * PAGE_SIZE, &[0x12; PAGE_SIZE]);
        let mut rx = vec![b'l'];
        rx.extend_from_slice(&[0x00; PAGE_SIZE]);
        rx.extend_from_slice(&[b'r', 2]);

        let mut d = synced(&rx, regs);
        drain(&mut d);

        assert_eq!(d.store().as_bytes(), &[0x00; PAGE_SIZE]);
        assert_eq!(d.flash().registers().erase_count(), 0);
        assert_eq!(d.flash().registers().write_count(), 0);

        let tx = &d.serial().tx;
        assert!(tx[1..1 + PAGE_SIZE].iter().all(|b| *b == 0x12));
    }

    #[test]
    fn erase_then_read_is_blank() {
        let regs = SimFlashRegisters::new().with_contents(5 * PAGE_SIZE, &[0x00; PAGE_SIZE]);
        let mut d = synced(&[b'e', 5, b'r', 5], regs);
        drain(&mut d);

        let tx = &d.serial().tx;
        assert_eq!(tx[0], ACK);
        assert!(tx[1..1 + PAGE_SIZE].iter().all(|b| *b == ERASED));
    }

    #[test]
    fn bootloader_page_is_acked_but_untouched() {
        let regs = SimFlashRegisters::new().with_contents(0, &[0x75; 16]);
        let mut d = synced(&[b'e', 0, b'p', 0x20], regs);
        let events = drain(&mut d);

        assert_eq!(events.len(), 2);
        assert_eq!(d.serial().tx, vec![ACK, ACK]);
        assert_eq!(&d.flash().registers().flash()[..16], &[0x75; 16]);
        assert_eq!(d.flash().registers().erase_count(), 0);
    }

    #[test]
    fn wire_page_is_masked() {
        let mut d = synced(&[b'e', 0x23], SimFlashRegisters::new());
        let events = drain(&mut d);
        assert_eq!(events, vec![Event::Completed { command: Command::Erase, page: Some(page(3)) }]);
    }

    #[test]
    fn stray_bytes_are_ignored() {
        let mut d = synced(&[b'B', 0x00, b'e', 1], SimFlashRegisters::new());
        let events = drain(&mut d);

        assert_eq!(
            events,
            vec![
                Event::Ignored(b'B'),
                Event::Ignored(0x00),
                Event::Completed { command: Command::Erase, page: Some(page(1)) },
            ]
        );
        // Fed once per received opcode byte
        assert_eq!(d.watchdog().feeds, 3);
    }

    #[test]
    fn jump_without_user_code_is_refused() {
        let mut d = synced(b"j", SimFlashRegisters::new());
        assert_eq!(drain(&mut d), vec![Event::JumpRefused]);
        assert_eq!(d.state(), State::AwaitOpcode);
        assert!(d.serial().tx.is_empty());
        assert_eq!(d.handoff().jumped_to, None);
    }

    #[test]
    fn jump_into_programmed_code() {
        let mut rx = vec![b'l'];
        rx.extend_from_slice(&[0x80; PAGE_SIZE]);
        rx.extend_from_slice(&[b'e', 1, b'p', 1, b'j']);

        let mut d = synced(&rx, SimFlashRegisters::new());
        let events = drain(&mut d);

        assert_eq!(events.last(), Some(&Event::Jumped));
        assert_eq!(d.handoff().jumped_to, Some(USER_ENTRY));
        // Acks for load, erase and program only
        assert_eq!(d.serial().tx, vec![ACK, ACK, ACK]);
    }

    #[test]
    fn run_returns_on_jump() {
        let regs = SimFlashRegisters::new().with_contents(USER_ENTRY as usize, &[0x02]);
        let mut d = dispatcher(&[], regs);
        d.run().unwrap();
        assert_eq!(d.handoff().jumped_to, Some(USER_ENTRY));
    }

    #[test]
    fn stuck_flash_surfaces_when_bounded() {
        let mut d = synced(&[b'e', 4], SimFlashRegisters::new().with_stuck_busy());
        match d.run() {
            Err(Error::Flash(t)) => assert_eq!(t.attempts, 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn buffered_serial_reads_from_fifo() {
        let mut fifo = RxFifo::new();
        let (mut isr, mut serial) = buffered(&mut fifo, SimSerial::new());

        assert_eq!(serial.read(), Err(nb::Error::WouldBlock));

        isr.on_receive(b'e');
        isr.on_receive(7);
        assert_eq!(serial.read(), Ok(b'e'));
        assert_eq!(serial.read(), Ok(7));

        serial.write(0x00).unwrap();
        assert_eq!(serial.tx().tx, vec![0x00]);
        assert_eq!(isr.overruns(), 0);
    }

    #[test]
    fn fifo_overrun_drops_bytes() {
        let mut fifo = RxFifo::new();
        let (mut isr, _serial) = buffered(&mut fifo, SimSerial::new());

        for _ in 0..RX_FIFO_SIZE + 4 {
            isr.on_receive(0xAA);
        }
        assert_eq!(isr.overruns(), 5);
    }
}
