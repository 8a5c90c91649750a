//! Flash a firmware image onto a VESC.
//!
//! The image is streamed in 384 byte chunks and the device reboots
//! into its bootloader at the end, so the connection drops when the
//! upload succeeds. With `--lzo` the image file must already contain
//! LZO compressed chunks; this tool does not compress.
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use rustvesc::controller::{Controller, ControllerParams};
use rustvesc::firmware::{ImageFirmware, UploadEvent};
use rustvesc::session::Session;
use rustvesc::transport::TcpTransport;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// TCP address of the serial bridge, host:port.
    #[arg(long)]
    connect: String,

    #[arg(short, default_value = "0")]
    verbose: usize,

    /// Firmware image file.
    image: std::path::PathBuf,

    /// Send chunks under the LZO command id.
    #[arg(long)]
    lzo: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("rustvesc")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let transport = TcpTransport::connect(&opt.connect)?;
    let session = Session::new(transport, Arc::new(rustvesc::messages::standard_registry()));
    let mut vesc = Controller::with_params(session, ControllerParams::default())?;
    info!("connected, firmware {}", vesc.get_firmware_version()?);

    let mut fw = ImageFirmware::from_file(&opt.image)?;
    let ok = vesc.update_firmware(&mut fw, opt.lzo, |event| match event {
        UploadEvent::Erasing => println!("Erasing..."),
        UploadEvent::Progress { offset, percent } => {
            println!("Progress: {percent:.2}%, {offset} bytes")
        }
        UploadEvent::EraseFailed => println!("Erase Failed"),
        UploadEvent::FlashingFailed => println!("Flashing Failed"),
        UploadEvent::Rebooting => println!("Done, rebooting into bootloader"),
    })?;
    if !ok {
        anyhow::bail!("firmware update failed");
    }
    Ok(())
}
