//! The module containing the interactive administration console.

use crate::shared::Shared;
use hybmem_common::{FindMode, Tier};
use log::error;
use std::io::{BufRead, Write};

const USAGE: &str = "Available commands:\n\
                     \tbind <pid>\n\
                     \tunbind <pid>\n\
                     \tDEBUG: send <n> {dram|nvram}\n\
                     \tDEBUG: switch <n>\n\
                     \tDEBUG: toggle {switch|thresh|all}\n\
                     \tDEBUG: clear\n\
                     \texit";

/// One parsed console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Manage a process.
    Bind(i32),
    /// Stop managing a process.
    Unbind(i32),
    /// Debug: move up to `n` pages into `to`.
    Send {
        /// Page count.
        n: usize,
        /// Destination tier.
        to: Tier,
    },
    /// Debug: run one exchange of up to `n` pairs.
    Switch(usize),
    /// Flip a controller on or off.
    Toggle(Toggle),
    /// Wipe the terminal.
    Clear,
    /// Shut the controller down.
    Exit,
}

/// Which controller a toggle addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// The switch controller.
    Switch,
    /// The threshold controller.
    Thresh,
    /// Both.
    All,
}

/// Why a console line did not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The command word is not known.
    Unknown,
    /// The named command got a missing or malformed argument.
    BadArg(&'static str),
}

impl Command {
    /// Parses one console line; `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(None);
        };
        let parsed = match command {
            "bind" => Self::Bind(pid_arg(words.next(), "bind")?),
            "unbind" => Self::Unbind(pid_arg(words.next(), "unbind")?),
            "send" => {
                let n = count_arg(words.next(), "send")?;
                let to = match words.next() {
                    Some("dram") => Tier::Dram,
                    Some("nvram") => Tier::Nvram,
                    _ => return Err(ParseError::BadArg("send")),
                };
                Self::Send { n, to }
            }
            "switch" => Self::Switch(count_arg(words.next(), "switch")?),
            "toggle" => match words.next() {
                Some("switch") => Self::Toggle(Toggle::Switch),
                Some("thresh") => Self::Toggle(Toggle::Thresh),
                Some("all") => Self::Toggle(Toggle::All),
                _ => return Err(ParseError::BadArg("toggle")),
            },
            "clear" | "clr" => Self::Clear,
            "exit" => Self::Exit,
            _ => return Err(ParseError::Unknown),
        };
        Ok(Some(parsed))
    }
}

fn pid_arg(word: Option<&str>, command: &'static str) -> Result<i32, ParseError> {
    word.and_then(|word| word.parse::<i64>().ok())
        .filter(|&pid| pid > 0 && pid <= i64::from(i32::MAX))
        .map(|pid| pid as i32)
        .ok_or(ParseError::BadArg(command))
}

fn count_arg(word: Option<&str>, command: &'static str) -> Result<usize, ParseError> {
    word.and_then(|word| word.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .ok_or(ParseError::BadArg(command))
}

/// The loop body of the console thread; returning flags shutdown.
pub fn run(shared: &Shared) {
    println!("{USAGE}");
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match Command::parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Exit)) => break,
            Ok(Some(command)) => execute(shared, command),
            Err(ParseError::BadArg(command)) => {
                eprintln!("Invalid argument for {command} command.");
            }
            Err(ParseError::Unknown) => {
                eprintln!("Unknown command.");
                println!("{USAGE}");
            }
        }
        if shared.exiting() {
            break;
        }
    }
    shared.request_exit();
}

fn execute(shared: &Shared, command: Command) {
    match command {
        Command::Bind(pid) => {
            if shared.bind(pid) {
                println!("Bind request success (pid={pid}).");
            } else {
                eprintln!("Bind request failed (pid={pid}).");
            }
        }
        Command::Unbind(pid) => {
            if shared.unbind(pid) {
                println!("Unbind request success (pid={pid}).");
            } else {
                eprintln!("Unbind request failed (pid={pid}).");
            }
        }
        Command::Send { n, to } => {
            // Filling a tier means draining the other one, so the find mode
            // is the opposite of the destination.
            let mode = match to {
                Tier::Dram => FindMode::Nvram,
                Tier::Nvram => FindMode::Dram,
            };
            match shared.find_and_migrate(n, mode) {
                Ok(moved) if moved > 0 => println!("Migrated {moved} out of {n} pages."),
                Ok(_) => {}
                Err(err) => {
                    error!("send failed: {err}");
                    shared.request_exit();
                }
            }
        }
        Command::Switch(n) => match shared.find_and_migrate(n, FindMode::Switch) {
            Ok(moved) if moved > 0 => {
                println!("DRAM<->NVRAM: Switched {moved} out of {} pages.", n * 2);
            }
            Ok(_) => {}
            Err(err) => {
                error!("switch failed: {err}");
                shared.request_exit();
            }
        },
        Command::Toggle(which) => {
            match which {
                Toggle::Switch => report_toggle("Switch", shared.toggle_switch()),
                Toggle::Thresh => report_toggle("Threshold", shared.toggle_thresh()),
                Toggle::All => {
                    report_toggle("Switch", shared.toggle_switch());
                    report_toggle("Threshold", shared.toggle_thresh());
                }
            };
        }
        Command::Clear => {
            print!("\x1b[2J\x1b[1;1H");
            let _ = std::io::stdout().flush();
        }
        Command::Exit => unreachable!("handled by the caller"),
    }
}

fn report_toggle(name: &str, on: bool) {
    if on {
        println!("{name} component turned ON");
    } else {
        println!("{name} component turned OFF");
    }
}
