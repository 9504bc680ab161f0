//! CCTL, ChipCon Tiny Loader.
//!
//! Programs the 32KB flash of a CC1110/CC1111 either through the 1KB
//! resident serial bootloader or directly through the chip's debug port.
//!
//! - [`host::HostSession`] talks to the resident bootloader over a serial port
//! - [`resident::Dispatcher`] is the bootloader's command loop
//! - [`remote::RemoteFlashWriter`] programs a halted target over the debug port
//! - [`sim`] provides simulated hardware for all of the above

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
extern crate serial_core;

#[cfg(feature = "linux")]
pub mod linux;

pub mod debug;
pub mod flash;
pub mod host;
pub mod poll;
pub mod protocol;
pub mod remote;
pub mod resident;
pub mod sim;

pub use host::{HostSession, Options, PageAction, State};
pub use protocol::{Command, Image, Page, FLASH_SIZE, PAGE_COUNT, PAGE_SIZE};
pub use remote::{DebugOptions, RemoteFlashWriter};

use core::fmt::Debug;

use thiserror::Error;

/// Serial port the host uses to reach the bootloader
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Programming errors, generic over the transport error
#[derive(Debug, Error)]
pub enum Error<E: Debug> {
    /// The transport failed to read or write
    #[error("transport error (command {command:?}, page {page:?}): {error:?}")]
    Transport { command: Option<Command>, page: Option<u8>, error: E },

    /// A response byte did not arrive in time
    #[error("no response to {command} (page {page:?})")]
    ResponseTimeout { command: Command, page: Option<u8> },

    /// The bootloader answered with something other than an ack
    #[error("{command} not acknowledged (page {page:?}, response 0x{response:02x})")]
    Nack { command: Command, page: Option<u8>, response: u8 },

    /// No beacon pair seen before the sync timeout
    #[error("no bootloader detected within {timeout_ms} ms")]
    NoBootloader { timeout_ms: u32 },

    /// Read back data differs from what was written
    #[error("verify failed on page {page} at offset 0x{offset:03x}")]
    Verify { page: u8, offset: usize, expected: Vec<u8>, actual: Vec<u8> },

    /// A command was issued without a synced session
    #[error("{command} refused, session not synced")]
    NotReady { command: Command },

    /// Page 0 holds the bootloader and is never erased or programmed over serial
    #[error("page {0} is reserved for the bootloader")]
    ReservedPage(u8),

    /// Chip erase did not report done
    #[error("chip erase not done after {attempts} status reads")]
    EraseTimeout { attempts: u32 },

    /// The flash write routine did not halt the CPU
    #[error("page {page} write did not complete after {attempts} status reads")]
    WriteTimeout { page: u8, attempts: u32 },
}

impl<E: Debug> Error<E> {
    /// Transport error outside of any command
    pub fn transport(error: E) -> Self {
        Error::Transport { command: None, page: None, error }
    }

    /// No response, short read or write failure
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::ResponseTimeout { .. })
    }

    /// A device was reached but did not behave
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Nack { .. }
                | Error::NoBootloader { .. }
                | Error::NotReady { .. }
                | Error::ReservedPage(_)
        )
    }

    pub fn is_verification(&self) -> bool {
        matches!(self, Error::Verify { .. })
    }

    /// A bounded debug port poll ran out
    pub fn is_hardware_timing(&self) -> bool {
        matches!(self, Error::EraseTimeout { .. } | Error::WriteTimeout { .. })
    }

    /// Page the failure is attributed to, if any
    pub fn page(&self) -> Option<u8> {
        match self {
            Error::Transport { page, .. }
            | Error::ResponseTimeout { page, .. }
            | Error::Nack { page, .. } => *page,
            Error::Verify { page, .. } | Error::WriteTimeout { page, .. } => Some(*page),
            Error::ReservedPage(page) => Some(*page),
            Error::NoBootloader { .. } | Error::NotReady { .. } | Error::EraseTimeout { .. } => {
                None
            }
        }
    }

    /// Compare read back data against what was written
    pub fn check_verify(page: Page, expected: &[u8], actual: &[u8]) -> Result<(), Self> {
        match expected.iter().zip(actual.iter()).position(|(e, a)| e != a) {
            None if expected.len() == actual.len() => Ok(()),
            offset => {
                let offset = offset.unwrap_or_else(|| expected.len().min(actual.len()));
                error!("Verify failed on page {} at offset 0x{:03x}", page, offset);

                Err(Error::Verify {
                    page: page.index(),
                    offset,
                    expected: expected.to_vec(),
                    actual: actual.to_vec(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_reports_first_mismatch() {
        let page = Page::new(3).unwrap();
        let expected = [1u8, 2, 3, 4];

        assert!(Error::<()>::check_verify(page, &expected, &[1, 2, 3, 4]).is_ok());

        match Error::<()>::check_verify(page, &expected, &[1, 2, 9, 4]) {
            Err(e @ Error::Verify { .. }) => {
                assert!(e.is_verification());
                assert_eq!(e.page(), Some(3));
                if let Error::Verify { offset, actual, .. } = e {
                    assert_eq!(offset, 2);
                    assert_eq!(actual, vec![1, 2, 9, 4]);
                }
            }
            other => panic!("unexpected {:?}", other),
        }

        match Error::<()>::check_verify(page, &expected, &[1, 2]) {
            Err(Error::Verify { offset, .. }) => assert_eq!(offset, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_classes_are_distinct() {
        let errors: Vec<Error<()>> = vec![
            Error::transport(()),
            Error::ResponseTimeout { command: Command::Erase, page: Some(1) },
            Error::Nack { command: Command::Erase, page: Some(1), response: 1 },
            Error::NoBootloader { timeout_ms: 10 },
            Error::NotReady { command: Command::Read },
            Error::EraseTimeout { attempts: 100 },
        ];

        let classes: Vec<(bool, bool, bool, bool)> = errors
            .iter()
            .map(|e| (e.is_transport(), e.is_protocol(), e.is_verification(), e.is_hardware_timing()))
            .collect();

        assert_eq!(
            classes,
            vec![
                (true, false, false, false),
                (true, false, false, false),
                (false, true, false, false),
                (false, true, false, false),
                (false, true, false, false),
                (false, false, false, true),
            ]
        );

        let nack = Error::<()>::Nack { command: Command::Program, page: Some(4), response: 0x01 };
        assert_eq!(nack.to_string(), "PROGRAM not acknowledged (page Some(4), response 0x01)");
    }
}
