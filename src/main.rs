#[macro_use]
extern crate log;

use std::fmt::Debug;
use std::num::ParseIntError;
use std::path::PathBuf;

use anyhow::Context;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use cctl::remote::RemoteAction;
use cctl::{DebugOptions, Error, HostSession, Image, Options, PageAction, RemoteFlashWriter, PAGE_COUNT};

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "cctl-prog", about = "Program CC1110/CC1111 flash")]
pub struct Args {
    #[structopt(subcommand)]
    operation: Operation,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub struct ImageArgs {
    /// Raw binary image to write
    file: PathBuf,

    /// Flash address the image starts at
    #[structopt(long, default_value = "0", parse(try_from_str = parse_hex))]
    offset: usize,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Program through the resident serial bootloader
    Serial {
        /// Serial port to connect to
        #[structopt(long, default_value = "/dev/ttyUSB0")]
        port: String,

        /// Serial port baud rate
        #[structopt(long, default_value = "115200")]
        baud: usize,

        #[structopt(flatten)]
        image: ImageArgs,

        #[structopt(flatten)]
        options: Options,
    },
    /// Program through the debug port on sysfs GPIOs
    Debug {
        /// Debug clock GPIO
        #[structopt(long)]
        dc: u64,

        /// Debug data GPIO
        #[structopt(long)]
        dd: u64,

        /// Reset GPIO
        #[structopt(long)]
        rst: u64,

        /// Settle time between clock edges
        #[structopt(long, default_value = "1")]
        settle_us: u32,

        #[structopt(flatten)]
        image: ImageArgs,

        #[structopt(flatten)]
        options: DebugOptions,
    },
}

fn parse_hex(s: &str) -> Result<usize, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => usize::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn load_image(args: &ImageArgs) -> anyhow::Result<Image> {
    let data = std::fs::read(&args.file)
        .with_context(|| format!("reading image {}", args.file.display()))?;

    info!(
        "Loaded {} ({}) at 0x{:04x}",
        args.file.display(),
        bytefmt::format(data.len() as u64),
        args.offset
    );

    let image = Image::from_binary(args.offset, &data)?;
    debug!("{:?}", image);

    Ok(image)
}

fn progress(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:24} [{bar:40}] {pos}/{len} pages")
            .progress_chars("=> "),
    );
    pb
}

/// Print the neighbourhood of a verify mismatch
fn report<E: Debug>(e: &Error<E>) {
    if let Error::Verify { page, offset, expected, actual } = e {
        let start = offset & !0x0F;
        let end = (start + 16).min(expected.len()).min(actual.len());

        error!("Verify failed on page {} at 0x{:03x}", page, offset);
        error!("expected {:03x}: {}", start, hex::encode(&expected[start..end]));
        error!("actual   {:03x}: {}", start, hex::encode(&actual[start..end]));
    }
}

fn serial_flash(port: &str, baud: usize, image: &Image, options: Options) -> anyhow::Result<()> {
    info!("Connecting to serial port");

    let mut session = HostSession::linux(port, baud, options)
        .with_context(|| format!("opening serial port {}", port))?;

    info!("Connecting to bootloader");
    session.sync()?;
    info!("Bootloader connected!");

    let pb = progress(PAGE_COUNT as u64 - 1);

    let res = session.program_image(image, |page, action| {
        let msg = match action {
            PageAction::Erased => format!("Erased page {}", page),
            PageAction::Programmed => format!("Programmed page {}", page),
        };
        pb.set_message(&msg);
        pb.inc(1);
    });

    if let Err(e) = &res {
        pb.abandon();
        report(e);
    }
    res?;

    pb.finish_with_message("Done, running user code");
    Ok(())
}

fn debug_flash(dc: u64, dd: u64, rst: u64, settle_us: u32, image: &Image, options: DebugOptions) -> anyhow::Result<()> {
    let mut writer = RemoteFlashWriter::linux(dc, dd, rst, settle_us, options)
        .context("configuring debug port GPIOs")?;

    info!("Entering debug mode");
    writer.init()?;

    let pb = progress(PAGE_COUNT as u64);

    let res = writer.program_image(image, |page, action| {
        let msg = match action {
            RemoteAction::Skipped => format!("Skipped page {}", page),
            RemoteAction::Written => format!("Wrote page {}", page),
        };
        pb.set_message(&msg);
        pb.inc(1);
    });

    if let Err(e) = &res {
        pb.abandon();
        report(e);
    }
    res?;

    pb.finish_with_message("Done");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    match o.operation {
        Operation::Serial { port, baud, image, options } => {
            let image = load_image(&image)?;
            serial_flash(&port, baud, &image, options)
        }
        Operation::Debug { dc, dd, rst, settle_us, image, options } => {
            let image = load_image(&image)?;
            debug_flash(dc, dd, rst, settle_us, &image, options)
        }
    }
}
