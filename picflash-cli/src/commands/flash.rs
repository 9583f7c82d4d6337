//! `flash` subcommand: write firmware segments to the device.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use picflash::{FlashOptions, FlashSession, Segment, chunked};
use std::path::PathBuf;

use crate::{Cli, open_port};

pub(crate) fn run(cli: &Cli, bins: &[(PathBuf, u32)], checksum: bool, reset: bool) -> Result<()> {
    let segments = load_segments(bins)?;

    let port = open_port(cli)?;
    if !cli.quiet {
        eprintln!(
            "{} Connecting to bootloader on {}...",
            style("⏳").yellow(),
            cli.port.as_deref().unwrap_or_default()
        );
    }

    let mut session = FlashSession::discover(port).context("could not connect to bootloader")?;
    let attrs = *session.attrs();
    if !cli.quiet {
        eprintln!(
            "{} Connected: bootloader v{}.{}, program memory {:#010x}:{:#010x}",
            style("✓").green(),
            attrs.version >> 8,
            attrs.version & 0xFF,
            attrs.memory_range.0,
            attrs.memory_range.1
        );
    }

    let (total_bytes, chunks) = chunked(&segments, &attrs)?;
    debug!("Flash plan: {} bytes in {} chunks", total_bytes, chunks.len());

    let pb = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(total_bytes as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                     {bytes}/{total_bytes} {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let options = FlashOptions {
        verify_checksum: checksum,
        reset_after: reset,
    };

    let result = session.flash(&segments, &options, |done, _total| {
        pb.set_position(done as u64);
    });

    if let Err(e) = result {
        pb.abandon();
        return Err(e).with_context(|| {
            format!(
                "flashing failed after {} of {} bytes",
                session.bytes_written(),
                total_bytes
            )
        });
    }

    pb.finish_with_message("complete");

    if !cli.quiet {
        eprintln!("{} Flashing completed", style("✓").green().bold());
    }

    Ok(())
}

/// Read each `file:address` argument into a firmware segment.
fn load_segments(bins: &[(PathBuf, u32)]) -> Result<Vec<Segment>> {
    let mut segments = Vec::with_capacity(bins.len());

    for (path, addr) in bins {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read binary {}", path.display()))?;
        debug!(
            "Loaded {} ({} bytes) for {:#010x}",
            path.display(),
            data.len(),
            addr
        );
        segments.push(Segment::new(*addr, data));
    }

    Ok(segments)
}
