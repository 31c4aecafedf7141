//! Interactive command shell.
//!
//! Each input line is parsed as a multicall command line: the first word
//! names the command, the rest are its arguments.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::app::Session;
use crate::error::Result;
use crate::traits::CameraDevice;

/// Prompt printed before each command.
pub const PROMPT: &str = "cam:~$ ";

#[derive(Debug, Parser)]
#[command(multicall = true)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

/// Commands understood by the shell.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum ShellCommand {
    /// ls dir
    Lsdir {
        /// Directory relative to the card root
        path: Option<PathBuf>,
    },
    /// umount dir
    Umount,
    /// Capture a frame and save it as frame NUM
    Capture {
        /// Frame number used in the file name
        num: u32,
    },
    /// Leave the shell
    #[command(alias = "quit")]
    Exit,
}

/// Whether the shell keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next command.
    Continue,
    /// Leave the shell.
    Exit,
}

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> std::result::Result<Option<ShellCommand>, clap::Error> {
    let args: Vec<&str> = line.split_whitespace().collect();
    if args.is_empty() {
        return Ok(None);
    }
    ShellLine::try_parse_from(args).map(|parsed| Some(parsed.command))
}

/// Run one command against the session.
///
/// Command failures are reported and logged; only output errors propagate.
pub fn execute<D: CameraDevice, W: Write>(
    session: &mut Session<D>,
    command: ShellCommand,
    out: &mut W,
) -> Result<Flow> {
    match command {
        ShellCommand::Lsdir { path } => {
            let volume = session.volume();
            let shown = path
                .as_deref()
                .map_or_else(|| volume.mount_point().to_path_buf(), |p| volume.mount_point().join(p));
            match volume.list_dir(path.as_deref()) {
                Ok(entries) => {
                    writeln!(out, "\nListing dir {} ...", shown.display())?;
                    for entry in &entries {
                        writeln!(out, "{entry}")?;
                    }
                    writeln!(out, "{} entries", entries.len())?;
                }
                Err(err) => {
                    writeln!(out, "Error opening dir {} [{err}]", shown.display())?;
                    error!("Error showing dir's content");
                }
            }
        }
        ShellCommand::Umount => match session.volume_mut().unmount() {
            Ok(()) => info!("umount done"),
            Err(err) => {
                writeln!(out, "umount failed: {err}")?;
            }
        },
        ShellCommand::Capture { num } => match session.capture(num) {
            Ok(path) => writeln!(out, "saved {}", path.display())?,
            Err(err) => {
                error!("Cannot grab and save");
                writeln!(out, "capture failed: {err}")?;
            }
        },
        ShellCommand::Exit => return Ok(Flow::Exit),
    }
    Ok(Flow::Continue)
}

/// Read commands from `input` until `exit` or end of input.
pub fn run_shell<D, R, W>(session: &mut Session<D>, mut input: R, mut output: W) -> Result<()>
where
    D: CameraDevice,
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(());
        }

        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(command)) => {
                if execute(session, command, &mut output)? == Flow::Exit {
                    return Ok(());
                }
            }
            Err(err) => write!(output, "{}", err.render())?,
        }
    }
}
