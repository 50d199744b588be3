//! serterm - serial terminal viewer
//!
//! Feeds a capture file, a serial device node or stdin through a terminal
//! session and prints the resulting screen, or the hex view of the traffic.
//!
//! # Quick Start
//!
//! ```text
//! serterm capture.bin            # Print the terminal screen
//! serterm --hex capture.bin      # Print a timestamped hex dump
//! serterm /dev/ttyUSB0           # Read a device until EOF, answering DSR requests
//! cat log | serterm -            # Read stdin
//! ```

mod dump;

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use serterm::config::Config;
use serterm::core::session::{Host, Session};
use serterm::core::store::Direction;

/// Command line options
#[derive(Default)]
struct Args {
    /// Input path, `-` or absent for stdin
    input: Option<String>,
    hex: bool,
    width: Option<u16>,
    height: Option<u16>,
    config: Option<PathBuf>,
    /// Print only the visible window instead of the whole scrollback
    visible_only: bool,
    no_color: bool,
    /// Write the effective configuration and exit
    save_config: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("serterm {}", VERSION);
}

fn print_help() {
    eprintln!("serterm {} - serial terminal viewer", VERSION);
    eprintln!();
    eprintln!("Usage: serterm [OPTIONS] [INPUT]");
    eprintln!();
    eprintln!("INPUT is a capture file, a serial device node or - for stdin (default).");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -x, --hex             Print the hex view instead of the screen");
    eprintln!("  -W, --width <N>       Screen width (default from config, 80)");
    eprintln!("  -H, --height <N>      Screen height (default from config, 24)");
    eprintln!("  -c, --config <PATH>   Use this config file instead of ~/.serterm/config.toml");
    eprintln!("  -s, --screen-only     Print only the visible window");
    eprintln!("      --no-color        Do not emit color escape sequences");
    eprintln!("      --save-config     Write the effective configuration and exit");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Log file: ~/.serterm/serterm.log (level from SERTERM_LOG, default info)");
}

fn parse_number(args: &[String], i: usize, name: &str) -> Result<u16, String> {
    let value = args
        .get(i)
        .ok_or_else(|| format!("Missing value for {}", name))?;
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", name, value))
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-x" | "--hex" => parsed.hex = true,
            "-s" | "--screen-only" => parsed.visible_only = true,
            "--no-color" => parsed.no_color = true,
            "--save-config" => parsed.save_config = true,
            "-W" | "--width" => {
                i += 1;
                parsed.width = Some(parse_number(&args, i, "--width")?);
            }
            "-H" | "--height" => {
                i += 1;
                parsed.height = Some(parse_number(&args, i, "--height")?);
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing config path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            arg if arg.starts_with('-') && arg != "-" => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            arg => {
                if parsed.input.is_some() {
                    return Err(format!("Unexpected extra input: {}", arg));
                }
                parsed.input = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn init_logging() {
    let log_path = serterm::config::Config::config_path()
        .and_then(|path| path.parent().map(|dir| dir.join("serterm.log")))
        .unwrap_or_else(|| PathBuf::from("serterm.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("SERTERM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Writes device status replies back to the serial device
struct DeviceHost {
    device: Option<Mutex<File>>,
}

impl Host for DeviceHost {
    fn send_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        match &self.device {
            Some(device) => {
                let mut device = device
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "device lock poisoned"))?;
                device.write_all(bytes)?;
                device.flush()
            }
            None => Ok(()),
        }
    }

    fn beep(&self) -> io::Result<()> {
        let mut stderr = io::stderr();
        stderr.write_all(b"\x07")?;
        stderr.flush()
    }
}

/// Open the input. Device nodes are opened read-write so replies can be sent.
fn open_input(input: Option<&str>) -> anyhow::Result<(Box<dyn Read>, DeviceHost)> {
    let path = match input {
        None | Some("-") => {
            return Ok((Box::new(io::stdin()), DeviceHost { device: None }));
        }
        Some(path) => path,
    };

    let metadata = std::fs::metadata(path).with_context(|| format!("Cannot access {}", path))?;
    if metadata.is_file() {
        let file = File::open(path).with_context(|| format!("Cannot open {}", path))?;
        return Ok((Box::new(file), DeviceHost { device: None }));
    }

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Cannot open device {}", path))?;
    let writer = device.try_clone()?;
    info!("Opened device {}", path);
    Ok((
        Box::new(device),
        DeviceHost {
            device: Some(Mutex::new(writer)),
        },
    ))
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) if args.save_config && !path.exists() => Config::default(),
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load(),
    };
    if let Some(width) = args.width {
        config.screen.width = width;
    }
    if let Some(height) = args.height {
        config.screen.height = height;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("serterm {} starting...", VERSION);

    let config = load_config(&args)?;
    if args.save_config {
        match &args.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
        eprintln!("Configuration saved");
        return Ok(());
    }

    let (mut input, host) = open_input(args.input.as_deref())?;
    let mut session = Session::new(&config, host);

    let mut buffer = vec![0u8; 4096];
    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Read failed: {}", e);
                break;
            }
        };
        session.append(&buffer[..n], Direction::In);
        session.input_idle();
    }

    session.sync();
    let (bytes_in, bytes_out) = session.totals();
    info!("Input finished: {} bytes in, {} bytes out", bytes_in, bytes_out);

    let color = !args.no_color;
    let mut stdout = io::stdout().lock();
    if args.hex {
        dump::print_hex(&mut stdout, &session.hex_blocks(), color)?;
    } else {
        dump::print_screen(&mut stdout, &session.snapshot(), args.visible_only, color)?;
    }

    session.stop();
    Ok(())
}
