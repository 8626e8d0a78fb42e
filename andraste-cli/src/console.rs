use andraste_core::header::pe::MACHINE_TYPE_I386;
use andraste_core::{Binary, LogLine, LogStream};
use anyhow::Result;
use colored::Colorize;
use crossterm::terminal::SetTitle;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Mirrors the payload's logs: output to stdout, errors to stderr.
pub fn relay(line: LogLine) {
    match line.stream {
        LogStream::Output => println!("{}", line.text),
        LogStream::Error => eprintln!("{}", line.text.red()),
    }
}

pub fn attached_title(pid: u32) -> String {
    format!("Andraste Console Launcher - Attached to PID {pid}")
}

pub fn set_title(title: &str) {
    if let Err(e) = crossterm::execute!(std::io::stdout(), SetTitle(title)) {
        log::debug!("Could not set the console title: {e}");
    }
}

#[derive(Tabled)]
struct SectionRow {
    #[tabled(rename = "Section")]
    name: String,
    #[tabled(rename = "VMA")]
    vma: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "Flags")]
    flags: String,
}

pub fn print_binary(binary: &Binary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(binary)?);
        return Ok(());
    }

    let arch = match binary.machine {
        MACHINE_TYPE_I386 => "i386",
        0x8664 => "x86-64",
        0xAA64 => "arm64",
        _ => "other",
    };
    println!("File:            {}", binary.path);
    println!("Format:          {}{}", binary.format, if binary.is_64 { "32+" } else { "32" });
    println!("Machine:         {:#06x} ({arch})", binary.machine);
    println!("Characteristics: {:#06x}", binary.characteristics);
    println!("Entry point:     0x{:x}", binary.entry);
    println!(
        "Large address aware: {}{}",
        if binary.large_address_aware { "yes".green() } else { "no".yellow() },
        if binary.patchable { "" } else { " (not patchable)" }
    );

    if binary.sections.is_empty() {
        println!("No sections found.");
        return Ok(());
    }

    let rows: Vec<SectionRow> = binary
        .sections
        .iter()
        .map(|s| SectionRow {
            name: s.name.clone(),
            vma: format!("0x{:x}", s.vma),
            size: format!("{:x}", s.size),
            offset: format!("{:x}", s.file_offset),
            flags: format!("{:x}", s.flags),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::psql()));
    Ok(())
}
