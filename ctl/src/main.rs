//! The placement controller daemon binary.

use clap::Parser;
use ctl::{
    channel::Channel, config, console, numa::SysNuma, shared::Shared, socket, switcher, threshold,
};
use hybmem_common::{logger::init_stderr_logger, TierLayout, DEFAULT_INSPECTOR_SOCKET};
use log::{error, warn};
use std::{path::PathBuf, process::ExitCode, sync::Arc, thread};

#[derive(Parser)]
#[command(author, about, long_about = None)]
struct Cli {
    /// Datagram socket the inspector listens on
    #[arg(long, default_value = DEFAULT_INSPECTOR_SOCKET)]
    inspector: PathBuf,

    /// Local datagram socket bound for inspector replies
    #[arg(long, default_value = config::CTL_SOCKET)]
    local: PathBuf,

    /// Stream socket accepting external bind/unbind requests
    #[arg(long, default_value = config::CONTROL_SOCKET)]
    control: PathBuf,

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

    let channel = match Channel::connect(&cli.inspector, &cli.local) {
        Ok(channel) => channel,
        Err(err) => {
            error!(
                "cannot reach the inspector at {}: {err}; is it running?",
                cli.inspector.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let shared = Arc::new(Shared::new(channel, Box::new(SysNuma::new()), layout));

    {
        let shared = Arc::clone(&shared);
        if let Err(err) = ctrlc::set_handler(move || shared.request_exit()) {
            warn!("cannot install the interrupt handler: {err}");
        }
    }

    let socket_thread = {
        let shared = Arc::clone(&shared);
        let path = cli.control.clone();
        thread::Builder::new()
            .name("socket".into())
            .spawn(move || socket::run(&shared, &path))
            .expect("spawning the socket thread")
    };
    let threshold_thread = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("threshold".into())
            .spawn(move || threshold::run(&shared))
            .expect("spawning the threshold thread")
    };
    let switch_thread = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("switch".into())
            .spawn(move || switcher::run(&shared))
            .expect("spawning the switch thread")
    };

    // The console owns the main thread; returning from it begins shutdown.
    console::run(&shared);
    println!("Exiting ctl...");

    socket_thread.join().expect("joining the socket thread");
    threshold_thread.join().expect("joining the threshold thread");
    switch_thread.join().expect("joining the switch thread");
    let _ = std::fs::remove_file(&cli.local);
    ExitCode::SUCCESS
}
