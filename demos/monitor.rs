//! Live measurement monitor.
//!
//! Polls a VESC for measurements and prints them, either as a one
//! line summary or as JSON for piping into other tools.
//!
//! The VESC is reached over a TCP-to-serial bridge, e.g.:
//!
//! `socat TCP-LISTEN:65102,reuseaddr /dev/ttyACM0,raw,b115200`
//!
//! then: `monitor --connect localhost:65102`
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use rustvesc::controller::{Controller, ControllerParams};
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

    /// CAN id of the target VESC, for one behind the bus.
    #[arg(long)]
    can_id: Option<u8>,

    /// Print JSON instead of a summary line.
    #[arg(long)]
    json: bool,

    /// Polling interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
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
    let mut vesc = Controller::with_params(
        session,
        ControllerParams {
            can_id: opt.can_id,
            ..ControllerParams::default()
        },
    )?;
    println!("firmware {}", vesc.get_firmware_version()?);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("Received Ctrl+C!");
        r.store(false, Ordering::Relaxed);
    })?;

    while running.load(Ordering::Relaxed) {
        let m = vesc.get_measurements()?;
        if opt.json {
            println!("{}", serde_json::to_string(&m)?);
        } else {
            println!(
                "rpm {:>6}  duty {:>6.3}  vin {:>5.1} V  imot {:>6.2} A  fault {:?}",
                m.rpm, m.duty_cycle_now, m.v_in, m.avg_motor_current, m.mc_fault_code
            );
        }
        std::thread::sleep(Duration::from_millis(opt.interval_ms));
    }
    vesc.close();
    Ok(())
}
