//! `info` subcommand: show bootloader attributes.

use anyhow::{Context, Result};
use console::style;
use picflash::get_boot_attrs;

use crate::{Cli, open_port};

pub(crate) fn run(cli: &Cli, json: bool) -> Result<()> {
    let mut port = open_port(cli)?;
    let attrs = get_boot_attrs(&mut port).context("could not read bootloader attributes")?;

    if json {
        let info = serde_json::json!({
            "version": format!("{}.{}", attrs.version >> 8, attrs.version & 0xFF),
            "device_id": format!("0x{:04X}", attrs.device_id),
            "max_packet_length": attrs.max_packet_length,
            "erase_size": attrs.erase_size,
            "write_size": attrs.write_size,
            "memory_range": {
                "start": format!("0x{:08X}", attrs.memory_range.0),
                "end": format!("0x{:08X}", attrs.memory_range.1),
            },
            "has_checksum": attrs.has_checksum,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Bootloader Attributes").bold().underlined());
    eprintln!(
        "  Version:           {}.{}",
        attrs.version >> 8,
        attrs.version & 0xFF
    );
    eprintln!("  Device ID:         0x{:04X}", attrs.device_id);
    eprintln!("  Max packet length: {} bytes", attrs.max_packet_length);
    eprintln!("  Erase page size:   {} bytes", attrs.erase_size);
    eprintln!("  Write block size:  {} bytes", attrs.write_size);
    eprintln!(
        "  Program memory:    {:#010x}:{:#010x}",
        attrs.memory_range.0, attrs.memory_range.1
    );
    eprintln!(
        "  Checksum support:  {}",
        if attrs.has_checksum { "yes" } else { "no" }
    );

    Ok(())
}
