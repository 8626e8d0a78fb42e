use crate::error::Result;
use crate::header::pe::{CoffHeader, PeHeaderPatcher};
use crate::header::Header;
use anyhow::anyhow;
use fs2::FileExt;
use goblin::Object;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

/// Opens `path` exclusively and toggles the large-address-aware bit.
///
/// The file is flushed and synced before the lock is released, so a loader
/// opening the same path afterwards sees the patched header. Returns whether
/// the header was written (non-i386 images are left alone).
pub fn patch_large_address_aware<P: AsRef<Path>>(path: P, enable: bool) -> Result<bool> {
    let path = path.as_ref();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    file.lock_exclusive()?;

    let patched = apply_patch(&file, enable);
    let unlocked = FileExt::unlock(&file);

    let written = patched?;
    unlocked?;
    if written {
        log::info!(
            "{} large address awareness on {}",
            if enable { "Enabled" } else { "Disabled" },
            path.display()
        );
    } else {
        log::info!("{} is not an i386 image, not patching", path.display());
    }
    Ok(written)
}

fn apply_patch(file: &std::fs::File, enable: bool) -> Result<bool> {
    let mut patcher = PeHeaderPatcher::new(file);
    let written = patcher.set_large_address_aware(enable)?;
    if written {
        patcher.flush()?;
        file.sync_all()?;
    }
    Ok(written)
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub name: String,
    pub vma: u64,
    pub size: u64,
    pub file_offset: u64,
    pub flags: u64,
}

/// Read-only overview of an executable, used by the `inspect` command.
#[derive(Debug, Clone, Serialize)]
pub struct Binary {
    pub path: String,
    pub format: &'static str,
    pub machine: u16,
    pub characteristics: u16,
    pub is_64: bool,
    pub entry: u64,
    pub large_address_aware: bool,
    pub patchable: bool,
    pub sections: Vec<SectionSummary>,
}

impl Binary {
    pub fn inspect<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let pe = match Object::parse(&buf)? {
            Object::PE(pe) => pe,
            Object::Elf(_) => return Err(anyhow!("ELF binaries cannot be launched with a PE payload")),
            Object::Mach(_) => return Err(anyhow!("Mach-O binaries cannot be launched with a PE payload")),
            _ => return Err(anyhow!("Malformed binary")),
        };

        // goblin validated the layout already; re-read through the patcher so
        // the reported values are exactly what a patch would see.
        let header: CoffHeader = PeHeaderPatcher::new(std::io::Cursor::new(&buf)).read_header()?;

        let sections = pe
            .sections
            .iter()
            .map(|s| SectionSummary {
                name: s.name().unwrap_or("").to_string(),
                vma: s.virtual_address as u64,
                size: s.virtual_size as u64,
                file_offset: s.pointer_to_raw_data as u64,
                flags: s.characteristics as u64,
            })
            .collect();

        log::debug!(
            "{}: machine {:#06x}, characteristics {:#06x}",
            path.as_ref().display(),
            header.machine(),
            header.characteristics()
        );

        Ok(Self {
            path: path.as_ref().display().to_string(),
            format: header.format_name(),
            machine: header.machine(),
            characteristics: header.characteristics(),
            is_64: pe.is_64,
            entry: pe.entry as u64,
            large_address_aware: header.is_large_address_aware(),
            patchable: header.is_patchable(),
            sections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::pe::{IMAGE_FILE_LARGE_ADDRESS_AWARE, MACHINE_TYPE_I386};
    use byteorder::{ByteOrder, LE};
    use std::fs;

    fn write_image(dir: &Path, machine: u16, characteristics: u16) -> std::path::PathBuf {
        let mut buf = vec![0u8; 0x100];
        buf[0] = b'M';
        buf[1] = b'Z';
        LE::write_u32(&mut buf[0x3C..], 0x40);
        buf[0x40..0x44].copy_from_slice(b"PE\0\0");
        LE::write_u16(&mut buf[0x44..], machine);
        LE::write_u16(&mut buf[0x56..], characteristics);
        let path = dir.join("Game.exe");
        fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn patches_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), MACHINE_TYPE_I386, 0x0102);

        assert!(patch_large_address_aware(&path, true).unwrap());
        let bytes = fs::read(&path).unwrap();
        assert_eq!(LE::read_u16(&bytes[0x56..]), 0x0102 | IMAGE_FILE_LARGE_ADDRESS_AWARE);

        // The lock is gone once the call returns.
        let reopened = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        reopened.try_lock_exclusive().unwrap();
    }

    #[test]
    fn leaves_amd64_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), 0x8664, 0x0022);
        let before = fs::read(&path).unwrap();

        assert!(!patch_large_address_aware(&path, false).unwrap());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = patch_large_address_aware(dir.path().join("nope.exe"), true).unwrap_err();
        assert!(matches!(err, crate::HostError::Io(_)));
    }
}
