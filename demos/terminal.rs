//! Send a terminal command to the VESC and print the reply.
//!
//! Try `terminal --connect localhost:65102 faults`, or `help` for the
//! firmware's own command list.
use std::sync::Arc;

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

    /// The terminal command to run.
    cmd: Vec<String>,
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
            // No motor is being driven here.
            start_heartbeat: false,
            ..ControllerParams::default()
        },
    )?;
    print!("{}", vesc.terminal_cmd(&opt.cmd.join(" "))?);
    vesc.close();
    Ok(())
}
