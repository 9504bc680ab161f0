//! Linux bindings, serial ports for the bootloader and sysfs GPIOs for the
//! debug port.

use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::sysfs_gpio::{Direction, Error as GpioError};
use linux_embedded_hal::{Delay, Serial, SysfsPin};

use crate::debug::{DataLine, GpioDebugPins};
use crate::remote::{DebugOptions, RemoteFlashWriter};
use crate::{HostSession, Options, SerialPort};

/// Read timeout of the underlying port, each expiry is one poll
const READ_TIMEOUT: Duration = Duration::from_millis(1);

fn kind(e: SerialError) -> IoErrorKind {
    IoError::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(kind)
    }
}

/// Open a serial port at `baud`, 8N1 with no flow control
pub fn open_serial<P: AsRef<Path>>(port: P, baud: usize) -> Result<Serial, SerialError> {
    let mut port = Serial::open(port.as_ref())?;

    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(READ_TIMEOUT)?;

    Ok(port)
}

impl HostSession<Serial, Delay, IoErrorKind> {
    /// Create a session on a linux serial port
    pub fn linux<P: AsRef<Path>>(port: P, baud: usize, options: Options) -> Result<Self, SerialError> {
        let port = open_serial(port, baud)?;
        Ok(Self::new(port, Delay {}, options))
    }
}

impl DataLine for SysfsPin {
    type Error = GpioError;

    fn drive(&mut self, high: bool) -> Result<(), GpioError> {
        self.0.set_direction(Direction::Out)?;
        self.0.set_value(high as u8)
    }

    fn release(&mut self) -> Result<(), GpioError> {
        self.0.set_direction(Direction::In)
    }

    fn sample(&mut self) -> Result<bool, GpioError> {
        Ok(self.0.get_value()? != 0)
    }
}

/// Debug port wired to three sysfs GPIOs
pub type SysfsDebugPins = GpioDebugPins<SysfsPin, SysfsPin, SysfsPin, Delay>;

fn export(n: u64, direction: Direction) -> Result<SysfsPin, GpioError> {
    let pin = SysfsPin::new(n);
    pin.0.export()?;
    pin.0.set_direction(direction)?;
    Ok(pin)
}

/// Export and configure the debug clock, data and reset lines
pub fn debug_pins(dc: u64, dd: u64, rst: u64, settle_us: u32) -> Result<SysfsDebugPins, GpioError> {
    debug!("Exporting GPIOs dc: {} dd: {} rst: {}", dc, dd, rst);

    let dc = export(dc, Direction::Low)?;
    let dd = export(dd, Direction::In)?;
    let rst = export(rst, Direction::High)?;

    Ok(GpioDebugPins::new(dc, dd, rst, Delay {}, settle_us))
}

impl RemoteFlashWriter<SysfsDebugPins> {
    /// Create a debug port writer on sysfs GPIOs
    pub fn linux(dc: u64, dd: u64, rst: u64, settle_us: u32, options: DebugOptions) -> Result<Self, GpioError> {
        let pins = debug_pins(dc, dd, rst, settle_us)?;
        Ok(Self::new(pins, options))
    }
}
