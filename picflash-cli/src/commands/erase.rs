//! `erase` subcommand: erase the program memory area.

use anyhow::{Context, Result};
use console::style;
use log::error;
use picflash::FlashSession;

use crate::{Cli, open_port};

pub(crate) fn run(cli: &Cli, all: bool) -> Result<()> {
    if !all {
        error!("erase requires the --all flag");
        if !cli.quiet {
            eprintln!(
                "{} This erases the entire program memory range; pass --all to confirm.",
                style("⚠").yellow()
            );
        }
        std::process::exit(2);
    }

    let port = open_port(cli)?;
    let mut session = FlashSession::discover(port).context("could not connect to bootloader")?;

    if !cli.quiet {
        let (start, end) = session.attrs().memory_range;
        eprintln!(
            "{} Erasing program memory {:#010x}:{:#010x}...",
            style("🗑").red(),
            start,
            end
        );
    }

    session.erase()?;
    session.confirm_erase()?;

    if !cli.quiet {
        eprintln!("{} Erase completed", style("✓").green().bold());
    }

    Ok(())
}
