//! The register level controller and the debug port writer behave the same
//! behind `FlashController`.

use cctl::flash::{Cc1110Flash, FlashController};
use cctl::poll::Bound;
use cctl::protocol::{ERASED, USER_ENTRY};
use cctl::remote::RemoteAction;
use cctl::resident::{Dispatcher, Event, ResidentConfig};
use cctl::sim::{SimDebugTarget, SimFlashRegisters, SimHandoff, SimSerial, SimWatchdog};
use cctl::{DebugOptions, Image, Page, RemoteFlashWriter, PAGE_SIZE};

fn page(n: u8) -> Page {
    Page::new(n).unwrap()
}

fn pattern(seed: u8) -> [u8; PAGE_SIZE] {
    let mut data = [0u8; PAGE_SIZE];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_add(seed).rotate_left(3);
    }
    data
}

fn read_page<F: FlashController>(flash: &mut F, p: Page) -> [u8; PAGE_SIZE] {
    let mut buf = [0u8; PAGE_SIZE];
    flash.read(p.address(), &mut buf).unwrap();
    buf
}

/// Erase, program and read back through any controller
fn exercise<F: FlashController>(flash: &mut F) {
    let a = pattern(1);
    let b = pattern(2);

    flash.erase(page(4)).unwrap();
    flash.program(page(4), &a).unwrap();
    flash.erase(page(5)).unwrap();
    flash.program(page(5), &b).unwrap();

    assert_eq!(&read_page(flash, page(4))[..], &a[..]);
    assert_eq!(&read_page(flash, page(5))[..], &b[..]);

    // Erasing one page leaves its neighbours alone
    flash.erase(page(4)).unwrap();
    assert!(read_page(flash, page(4)).iter().all(|v| *v == ERASED));
    assert_eq!(&read_page(flash, page(5))[..], &b[..]);
}

#[test]
fn register_controller() {
    let mut flash = Cc1110Flash::new(SimFlashRegisters::new().with_busy_cycles(4)).with_bound(Bound::Attempts(50));
    exercise(&mut flash);
    assert_eq!(flash.registers().erase_count(), 3);
    assert!(!flash.registers().dma_pending());
}

#[test]
fn debug_port_writer() {
    let mut writer = RemoteFlashWriter::new(SimDebugTarget::new().with_halt_polls(2), DebugOptions::default());
    writer.init().unwrap();
    exercise(&mut writer);
}

#[test]
fn installed_bootloader_starts_installed_user_code() {
    // Bootloader in page 0 and an application at the user entry point
    let mut image = Image::blank();
    image.place(0, &[0x02, 0x00, 0x30]).unwrap();
    image.place(USER_ENTRY as usize, &[0x02, 0x04, 0x20, 0x75, 0x81, 0x30]).unwrap();

    let mut writer = RemoteFlashWriter::new(SimDebugTarget::new(), DebugOptions::default());
    writer.init().unwrap();

    let mut written = vec![];
    writer
        .program_image(&image, |p, a| {
            if a == RemoteAction::Written {
                written.push(p.index())
            }
        })
        .unwrap();
    assert_eq!(written, vec![0, 1]);

    let target = writer.into_inner();

    // Boot the resident loop on the result with nobody talking to it
    let regs = SimFlashRegisters::new().with_contents(0, target.flash());
    let mut bootloader = Dispatcher::new(
        SimSerial::new(),
        Cc1110Flash::new(regs),
        SimWatchdog::default(),
        1000,
        SimHandoff::default(),
        ResidentConfig { polls_per_beacon: 1, beacons: 8 },
    );

    bootloader.run().unwrap();
    assert_eq!(bootloader.handoff().jumped_to, Some(USER_ENTRY));
    assert_eq!(bootloader.serial().tx.iter().filter(|b| **b == b'B').count(), 8);
}

#[test]
fn resident_loop_over_debug_port_flash() {
    let data = pattern(9);

    let mut rx = vec![0x00, b'l'];
    rx.extend_from_slice(&data);
    rx.extend_from_slice(&[b'e', 6, b'p', 6]);

    let mut writer = RemoteFlashWriter::new(SimDebugTarget::new(), DebugOptions::default());
    writer.init().unwrap();

    let mut d = Dispatcher::new(
        SimSerial::with_rx(&rx),
        writer,
        SimWatchdog::default(),
        1000,
        SimHandoff::default(),
        ResidentConfig::default(),
    );

    let mut completed = 0;
    while completed < 3 {
        match d.poll() {
            Ok(Event::Completed { .. }) => completed += 1,
            Ok(_) | Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(e)) => panic!("dispatcher error: {:?}", e),
        }
    }

    assert_eq!(&read_page(d.flash_mut(), page(6))[..], &data[..]);
}
