use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use rdt::{Error, Sender, MSS};

/// Reliably sends a file through the UDP link emulator.
#[derive(Debug, Parser)]
#[command(name = "sender")]
struct Args {
    /// File to send.
    file: PathBuf,

    /// IP address of the link emulator.
    udpl_addr: IpAddr,

    /// Port of the link emulator.
    udpl_port: u16,

    /// Send window size in bytes; must be a positive multiple of MSS=512.
    window_size: u32,

    /// Local UDP port on which to receive ACKs.
    ack_port: u16,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "transfer failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    if args.window_size == 0 || args.window_size as usize % MSS != 0 {
        return Err(Error::WindowSize(args.window_size));
    }
    let window_segments = args.window_size as usize / MSS;

    // Fails fast when the file does not exist.
    let mut file = File::open(&args.file)?;

    let dst = SocketAddr::new(args.udpl_addr, args.udpl_port);
    let sender = Sender::connect(dst, window_segments, args.ack_port)?;
    sender.transfer(&mut file)
}
