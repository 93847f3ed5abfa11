//! Entry point for `tftpc`, a TFTP client compliant with RFC 1350.
//!
//! Parses CLI arguments and dispatches a single download or upload. All
//! protocol work lives in the library modules; this file owns only process
//! setup (argument parsing, logging) and the exit status.

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use std::path::Path;

use tftpc::client::{ClientSession, Direction};
use tftpc::tftp::FileMode;

/// Download or upload one file against a TFTP server.
#[derive(Parser, Debug)]
#[command(version, about, disable_help_flag = true)]
struct Args {
    /// Server host name or address.
    #[arg(short = 'h', long, default_value = "localhost")]
    host: String,

    /// Server UDP port.
    #[arg(short = 'p', long, default_value_t = 69)]
    port: u16,

    /// Download: read the remote file.
    #[arg(short = 'r', long)]
    read: bool,

    /// Upload: write to the remote file.
    #[arg(short = 'w', long)]
    write: bool,

    /// Verbose diagnostics on stderr.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// File to transfer. With a single name this is both the remote and the
    /// local name.
    file: String,

    /// Second name: the local destination for a download, the remote name
    /// for an upload.
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG still overrides the -v default.
    let default_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if args.read == args.write {
        bail!("exactly one of -r (download) and -w (upload) must be given");
    }
    let direction = if args.read { Direction::Read } else { Direction::Write };

    let (remote_name, local_name) = match (direction, &args.target) {
        (_, None) => (args.file.clone(), args.file.clone()),
        (Direction::Read, Some(target)) => (args.file.clone(), target.clone()),
        (Direction::Write, Some(target)) => (target.clone(), args.file.clone()),
    };

    log::info!(
        "{} {remote_name} on {}:{} (local file {local_name})",
        match direction {
            Direction::Read => "downloading",
            Direction::Write => "uploading",
        },
        args.host,
        args.port,
    );

    let mut session = ClientSession::connect(
        &args.host,
        args.port,
        direction,
        &remote_name,
        Path::new(&local_name),
        FileMode::Octet,
    )
    .await?;
    session.run().await?;

    Ok(())
}
