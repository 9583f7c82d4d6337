//! picflash CLI - flash firmware to 16-bit Microchip devices.
//!
//! Talks to the serial bootloader generated by the MPLAB Code Configurator
//! for PIC24 and dsPIC33 devices:
//!
//! - Flash raw binary files to program memory
//! - Erase program memory
//! - Show bootloader attributes
//!
//! Firmware is supplied as raw binaries with load addresses
//! (`--bin file:address`); convert other image formats with external tools
//! such as `objcopy -O binary`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use picflash::{NativePort, Port as _, SerialConfig};
use std::path::PathBuf;
use std::time::Duration;

mod commands;

/// picflash - flash firmware to Microchip devices running the MCC serial
/// bootloader.
///
/// Environment variables:
///   PICFLASH_PORT - Default serial port
///   PICFLASH_BAUD - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "picflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port connected to the device you want to flash.
    #[arg(short, long, global = true, env = "PICFLASH_PORT")]
    port: Option<String>,

    /// Symbol rate of the device's serial bus.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "PICFLASH_BAUD"
    )]
    baud: u32,

    /// Seconds to wait for a bootloader response before giving up.
    /// Erasing large memory areas can take a while.
    #[arg(long, global = true, default_value = "5.0")]
    timeout: f64,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash firmware to the device.
    Flash {
        /// Binary file to flash (format: file:address, can be repeated).
        #[arg(long = "bin", value_parser = parse_bin_arg, required = true)]
        bins: Vec<(PathBuf, u32)>,

        /// Verify flashed data by checksumming after each write.
        #[arg(long)]
        checksum: bool,

        /// Reset the device after flashing is complete.
        #[arg(long)]
        reset: bool,
    },

    /// Show bootloader attributes of a connected device.
    Info {
        /// Output attributes as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase the program memory area.
    Erase {
        /// Erase the entire program memory range (required confirmation).
        #[arg(long)]
        all: bool,
    },
}

/// Parse binary argument in format "file:address".
fn parse_bin_arg(s: &str) -> Result<(PathBuf, u32), String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err(format!(
            "Invalid format: '{s}'. Expected 'file:address' (e.g., 'firmware.bin:0x2000')"
        ));
    }

    let path = PathBuf::from(parts[0]);
    let addr = parse_hex_u32(parts[1])?;

    Ok((path, addr))
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x00_80_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "picflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match &cli.command {
        Commands::Flash {
            bins,
            checksum,
            reset,
        } => commands::flash::run(&cli, bins, *checksum, *reset),
        Commands::Info { json } => commands::info::run(&cli, *json),
        Commands::Erase { all } => commands::erase::run(&cli, *all),
    }
}

/// Open the serial port named on the command line.
fn open_port(cli: &Cli) -> Result<NativePort> {
    let name = cli
        .port
        .as_deref()
        .context("no serial port specified; use --port or PICFLASH_PORT")?;

    if !cli.timeout.is_finite() || cli.timeout < 0.0 {
        anyhow::bail!("invalid timeout: {}", cli.timeout);
    }

    let config = SerialConfig::new(name, cli.baud)
        .with_timeout(Duration::from_secs_f64(cli.timeout));
    let mut port =
        NativePort::open(&config).with_context(|| format!("failed to open port {name}"))?;
    port.clear_buffers()
        .context("failed to clear port buffers")?;

    Ok(port)
}
