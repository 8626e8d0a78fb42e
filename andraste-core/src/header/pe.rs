use crate::error::{HostError, Result};
use crate::header::Header;
use byteorder::{ByteOrder, WriteBytesExt, LE};
use goblin::pe::{characteristic, header as pe_header};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Offset of the `e_lfanew` field in the DOS stub, pointing at the PE signature.
pub const COFF_HEADER_POINTER: u64 = pe_header::PE_POINTER_OFFSET as u64;

/// `PE\0\0` as it appears on disk.
pub const PE_MAGIC: [u8; 4] = pe_header::PE_MAGIC.to_le_bytes();

/// Field offsets relative to the PE signature.
const COFF_OFFSET_MACHINE: u64 = 4;
const COFF_OFFSET_CHARACTERISTICS: u64 = 22;

pub const MACHINE_TYPE_I386: u16 = pe_header::COFF_MACHINE_X86;
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = characteristic::IMAGE_FILE_LARGE_ADDRESS_AWARE;

/// Logical view of the COFF file header, limited to the fields the launcher touches.
///
/// Layout after the signature (all little-endian):
///
/// ```text
/// +0   Signature        "PE\0\0"
/// +4   Machine          u16
/// +6   NumberOfSections u16
/// +8   TimeDateStamp    u32
/// +12  PointerToSymbolTable u32
/// +16  NumberOfSymbols  u32
/// +20  SizeOfOptionalHeader u16
/// +22  Characteristics  u16
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoffHeader {
    /// Byte offset of the PE signature within the file.
    pub coff_header_offset: u32,

    /// Target architecture, e.g. `0x14C` for i386 or `0x8664` for x86-64.
    pub machine: u16,

    /// Capability flags, see `goblin::pe::characteristic`.
    pub characteristics: u16,
}

impl Header for CoffHeader {
    fn machine(&self) -> u16 {
        self.machine
    }

    fn characteristics(&self) -> u16 {
        self.characteristics
    }

    fn format_name(&self) -> &'static str {
        "PE"
    }

    fn is_large_address_aware(&self) -> bool {
        self.characteristics & IMAGE_FILE_LARGE_ADDRESS_AWARE != 0
    }

    fn is_patchable(&self) -> bool {
        self.machine == MACHINE_TYPE_I386
    }
}

/// Reads and patches the COFF header of an executable in place.
///
/// Every accessor seeks from the start of the stream, so the patcher never
/// depends on where a previous call left the cursor. Only the header offset
/// is cached; field values are always read from the stream.
#[derive(Debug)]
pub struct PeHeaderPatcher<S> {
    stream: S,
    coff_header_offset: Option<u32>,
}

impl<S> PeHeaderPatcher<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            coff_header_offset: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Seek> PeHeaderPatcher<S> {
    /// Follows the pointer at `0x3C` and validates the PE signature found there.
    pub fn locate_header(&mut self) -> Result<u32> {
        if let Some(offset) = self.coff_header_offset {
            return Ok(offset);
        }

        self.stream.seek(SeekFrom::Start(COFF_HEADER_POINTER))?;
        let offset = LE::read_u32(&self.read_array::<4>()?);

        self.stream.seek(SeekFrom::Start(offset as u64))?;
        let magic = self.read_array::<4>()?;
        if magic != PE_MAGIC {
            return Err(HostError::InvalidFormat);
        }

        self.coff_header_offset = Some(offset);
        Ok(offset)
    }

    pub fn is_target_architecture(&mut self) -> Result<bool> {
        Ok(self.read_machine()? == MACHINE_TYPE_I386)
    }

    pub fn read_machine(&mut self) -> Result<u16> {
        self.seek_field(COFF_OFFSET_MACHINE)?;
        Ok(LE::read_u16(&self.read_array::<2>()?))
    }

    pub fn read_characteristics(&mut self) -> Result<u16> {
        self.seek_field(COFF_OFFSET_CHARACTERISTICS)?;
        Ok(LE::read_u16(&self.read_array::<2>()?))
    }

    pub fn read_header(&mut self) -> Result<CoffHeader> {
        Ok(CoffHeader {
            coff_header_offset: self.locate_header()?,
            machine: self.read_machine()?,
            characteristics: self.read_characteristics()?,
        })
    }

    fn seek_field(&mut self, field_offset: u64) -> Result<()> {
        let base = self.locate_header()? as u64;
        self.stream.seek(SeekFrom::Start(base + field_offset))?;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        read_exact_or_eof(&mut self.stream, &mut buf)?;
        Ok(buf)
    }
}

impl<S: Read + Write + Seek> PeHeaderPatcher<S> {
    pub fn write_characteristics(&mut self, characteristics: u16) -> Result<()> {
        self.seek_field(COFF_OFFSET_CHARACTERISTICS)?;
        self.stream.write_u16::<LE>(characteristics)?;
        Ok(())
    }

    /// Sets or clears `IMAGE_FILE_LARGE_ADDRESS_AWARE`.
    ///
    /// Only i386 images are touched; for any other machine type this returns
    /// `Ok(false)` without writing. Returns `Ok(true)` when the field was written.
    pub fn set_large_address_aware(&mut self, enable: bool) -> Result<bool> {
        if !self.is_target_architecture()? {
            log::debug!("Machine type is not i386, leaving characteristics untouched");
            return Ok(false);
        }

        let current = self.read_characteristics()?;
        let updated = if enable {
            current | IMAGE_FILE_LARGE_ADDRESS_AWARE
        } else {
            current & !IMAGE_FILE_LARGE_ADDRESS_AWARE
        };

        log::debug!("Characteristics {current:#06x} -> {updated:#06x}");
        self.write_characteristics(updated)?;
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }
}

/// Fills `buf` completely, looping over short reads.
///
/// Running out of input before the buffer is full is `UnexpectedEndOfFile`.
pub fn read_exact_or_eof<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(HostError::UnexpectedEndOfFile),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
