//! cam-sdcard binary: capture a frame to the SD card, then run the shell.

use std::io;
use std::path::PathBuf;

use cam_sdcard::mock::MockDevice;
use cam_sdcard::{app, AppConfig, V4L2Device};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cam-sdcard")]
#[command(about = "Capture camera frames onto a FAT-formatted SD card")]
#[command(version)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// V4L2 device index (0 for /dev/video0)
    #[arg(short, long)]
    device: Option<u32>,

    /// Directory the SD card is mounted on
    #[arg(short, long, value_name = "DIR")]
    mount_point: Option<PathBuf>,

    /// Block device name of the SD card
    #[arg(long)]
    drive: Option<String>,

    /// Number of the first saved frame
    #[arg(long, value_name = "NUM")]
    frame: Option<u32>,

    /// Number of frames saved at startup
    #[arg(long)]
    count: Option<u32>,

    /// Frames to drop before saving
    #[arg(long)]
    skip: Option<u32>,

    /// Use the synthetic camera instead of a V4L2 device
    #[arg(long)]
    mock: bool,

    /// Exit after the startup capture instead of starting the shell
    #[arg(long)]
    no_shell: bool,

    /// Print the effective configuration in TOML format and exit
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(device) = self.device {
            config.camera.device_index = device;
        }
        if let Some(mount_point) = &self.mount_point {
            config.storage.mount_point.clone_from(mount_point);
        }
        if let Some(drive) = &self.drive {
            config.storage.drive.clone_from(drive);
        }
        if let Some(frame) = self.frame {
            config.capture.first_frame = frame;
        }
        if let Some(count) = self.count {
            config.capture.frame_count = count;
        }
        if let Some(skip) = self.skip {
            config.capture.skip_frames = skip;
        }
        if self.no_shell {
            config.capture.shell = false;
        }
    }

    const fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_level());

    if let Err(err) = run(&args) {
        error!("{err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> cam_sdcard::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("cam-sdcard v{}", env!("CARGO_PKG_VERSION"));
    let stdin = io::stdin();
    if args.mock {
        app::run(&config, MockDevice::new(), stdin.lock(), io::stdout())
    } else {
        let device = V4L2Device::open(config.camera.device_index)?;
        app::run(&config, device, stdin.lock(), io::stdout())
    }
}
