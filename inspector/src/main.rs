//! The page inspector daemon binary.

use clap::Parser;
use hybmem_common::{logger::init_stderr_logger, TierLayout, DEFAULT_INSPECTOR_SOCKET};
use inspector::{config, host::ProcfsHost, server::Inspector};
use log::{error, info};
use std::{fs, os::unix::net::UnixDatagram, path::PathBuf, process::ExitCode};

#[derive(Parser)]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path of the datagram socket to serve controller requests on
    #[arg(long, default_value = DEFAULT_INSPECTOR_SOCKET)]
    socket: PathBuf,

    /// JSON file overriding the compiled-in DRAM/NVRAM node lists
    #[arg(long)]
    nodes: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_stderr_logger(config::LOGGING_LEVEL);
    let cli = Cli::parse();

    let layout = match cli.nodes {
        Some(path) => match TierLayout::from_file(&path) {
            Ok(layout) => layout,
            Err(err) => {
                error!("invalid tier layout: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => TierLayout::default(),
    };

    let host = match ProcfsHost::new() {
        Ok(host) => host,
        Err(err) => {
            error!("cannot probe host interfaces: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _ = fs::remove_file(&cli.socket);
    let socket = match UnixDatagram::bind(&cli.socket) {
        Ok(socket) => socket,
        Err(err) => {
            error!("cannot bind {}: {err}", cli.socket.display());
            return ExitCode::FAILURE;
        }
    };
    info!("inspector listening on {}", cli.socket.display());

    let mut inspector = Inspector::new(host, layout);
    let result = inspector.serve(&socket);
    let _ = fs::remove_file(&cli.socket);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("request channel lost: {err}");
            ExitCode::FAILURE
        }
    }
}
