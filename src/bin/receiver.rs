use std::fs::OpenOptions;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use rdt::{Error, Receiver};

/// Reliably receives a file and writes it to disk.
#[derive(Debug, Parser)]
#[command(name = "receiver")]
struct Args {
    /// Output file to write to.
    file: PathBuf,

    /// Port to listen on for data segments.
    lstn_port: u16,

    /// IP address the sender receives ACKs on.
    ack_addr: IpAddr,

    /// Port the sender receives ACKs on.
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
            error!(%e, "receiver failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    // An existing output file starts over from empty.
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.file)?;

    let peer = SocketAddr::new(args.ack_addr, args.ack_port);
    let mut receiver = Receiver::bind(args.lstn_port, peer)?;
    receiver.serve_forever(&mut file)
}
