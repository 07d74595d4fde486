//! PE-COFF file support, the executable format of Windows. Secondary to
//! the ELF path: the headers and the section table are parsed, symbol
//! tables and image building are deferred. All details are in the
//! Microsoft PE format documentation:
//! https://docs.microsoft.com/en-us/windows/win32/debug/pe-format
use crate::base::{AddressKind, Buffer, Cursor, Encoding, FileData};
use crate::binary::{FileKind, SegmentView};
use crate::error::{Error, Result};
use memmap2::Mmap;
use std::cell::OnceCell;
use std::fs::File;
use std::path::{Path, PathBuf};

/// File offset of the dword that locates the PE signature.
const MSDOS_OFFSET: usize = 0x3c;
const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];

pub const MZ_MAGIC: [u8; 2] = [b'M', b'Z'];

const PE32: u16 = 0x10b;
const PE32P: u16 = 0x20b;

const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_DLL: u16 = 0x2000;

const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// The COFF file header.
#[derive(Debug)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// The optional-header fields shared by PE32 and PE32+.
#[derive(Debug)]
pub struct OptionalHeader {
    pub magic: u16,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub number_of_rva_and_sizes: u32,
}

/// One entry of the section table.
#[derive(Debug)]
pub struct PeSection {
    name: String,
    virtual_size: u32,
    virtual_address: u32,
    raw_size: u32,
    raw_pointer: u32,
    characteristics: u32,
    content: OnceCell<Vec<u8>>,
}

impl PeSection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn virtual_address(&self) -> u64 {
        self.virtual_address as u64
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size as u64
    }

    pub fn characteristics(&self) -> u32 {
        self.characteristics
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }

    pub fn is_readable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_READ != 0
    }

    pub fn has_content(&self) -> bool {
        self.raw_size > 0
    }
}

/// An open PE-COFF file.
#[derive(Debug)]
pub struct PeFile {
    path: PathBuf,
    data: FileData,
    header: CoffHeader,
    optional: OptionalHeader,
    data_directories: Vec<(u32, u32)>,
    sections: Vec<PeSection>,
}

impl PeFile {
    /// Map the file at `path` and parse its headers. PE-COFF files are
    /// always little-endian.
    pub fn open(path: impl AsRef<Path>) -> Result<PeFile> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file) }?;
        PeFile::parse(path.to_path_buf(), FileData::Mapped(map))
    }

    /// Parse a PE-COFF image already in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<PeFile> {
        PeFile::parse(path.into(), FileData::Owned(bytes))
    }

    fn parse(path: PathBuf, data: FileData) -> Result<PeFile> {
        let buf = Buffer::new(Encoding::Little, data.bytes());
        if buf.slice(0, 2)? != MZ_MAGIC {
            return Err(Error::BadMagic("not a PE-COFF file"));
        }

        // the MS-DOS stub stores the offset of the PE signature at 0x3c
        let pe_offset = buf.get_u32(MSDOS_OFFSET)? as usize;
        if buf.slice(pe_offset, 4)? != PE_SIGNATURE {
            return Err(Error::BadMagic("not a PE-COFF file"));
        }

        let mut c = Cursor::new(buf);
        c.move_to(pe_offset + 4)?;
        let header = CoffHeader {
            machine: c.read_u16()?,
            number_of_sections: c.read_u16()?,
            time_date_stamp: c.read_u32()?,
            pointer_to_symbol_table: c.read_u32()?,
            number_of_symbols: c.read_u32()?,
            size_of_optional_header: c.read_u16()?,
            characteristics: c.read_u16()?,
        };

        let optional_start = c.offset();
        let magic = c.read_u16()?;
        if magic != PE32 && magic != PE32P {
            return Err(Error::Unsupported(format!("unknown PE type {magic:#x}")));
        }
        let _linker_version = c.read_u16()?;
        let size_of_code = c.read_u32()?;
        let size_of_initialized_data = c.read_u32()?;
        let size_of_uninitialized_data = c.read_u32()?;
        let address_of_entry_point = c.read_u32()?;
        let base_of_code = c.read_u32()?;
        if magic == PE32 {
            let _base_of_data = c.read_u32()?;
        }

        let image_base = if magic == PE32 {
            c.read_u32()? as u64
        } else {
            c.read_u64()?
        };
        let section_alignment = c.read_u32()?;
        let file_alignment = c.read_u32()?;
        let _os_version = (c.read_u16()?, c.read_u16()?);
        let _image_version = (c.read_u16()?, c.read_u16()?);
        let _subsystem_version = (c.read_u16()?, c.read_u16()?);
        let _win32_version = c.read_u32()?;
        let _size_of_image = c.read_u32()?;
        let _size_of_headers = c.read_u32()?;
        let _checksum = c.read_u32()?;
        let subsystem = c.read_u16()?;
        let dll_characteristics = c.read_u16()?;
        if magic == PE32 {
            let _stack_and_heap = (c.read_u32()?, c.read_u32()?, c.read_u32()?, c.read_u32()?);
        } else {
            let _stack_and_heap = (c.read_u64()?, c.read_u64()?, c.read_u64()?, c.read_u64()?);
        }
        let _loader_flags = c.read_u32()?;
        let number_of_rva_and_sizes = c.read_u32()?;

        // the directory table fills the rest of the optional header
        let consumed = c.offset() - optional_start;
        let rva_bytes = (header.size_of_optional_header as usize)
            .checked_sub(consumed)
            .ok_or_else(|| Error::Malformed("optional header too small".into()))?;
        if rva_bytes / 8 != number_of_rva_and_sizes as usize {
            return Err(Error::Malformed("inconsistency in RVA size".into()));
        }
        let mut data_directories = Vec::with_capacity(number_of_rva_and_sizes as usize);
        for _ in 0..number_of_rva_and_sizes {
            data_directories.push((c.read_u32()?, c.read_u32()?));
        }

        let mut sections = Vec::with_capacity(header.number_of_sections as usize);
        for _ in 0..header.number_of_sections {
            let raw_name = c.read_slice(8)?;
            let end = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
            let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
            let virtual_size = c.read_u32()?;
            let virtual_address = c.read_u32()?;
            let raw_size = c.read_u32()?;
            let raw_pointer = c.read_u32()?;
            let _relocations = (c.read_u32()?, c.read_u32()?);
            let _counts = (c.read_u16()?, c.read_u16()?);
            let characteristics = c.read_u32()?;
            sections.push(PeSection {
                name,
                virtual_size,
                virtual_address,
                raw_size,
                raw_pointer,
                characteristics,
                content: OnceCell::new(),
            });
        }

        Ok(PeFile {
            path,
            data,
            header,
            optional: OptionalHeader {
                magic,
                size_of_code,
                size_of_initialized_data,
                size_of_uninitialized_data,
                address_of_entry_point,
                base_of_code,
                image_base,
                section_alignment,
                file_alignment,
                subsystem,
                dll_characteristics,
                number_of_rva_and_sizes,
            },
            data_directories,
            sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &CoffHeader {
        &self.header
    }

    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional
    }

    /// The data directories as `(rva, size)` pairs.
    pub fn data_directories(&self) -> &[(u32, u32)] {
        &self.data_directories
    }

    pub fn sections(&self) -> &[PeSection] {
        &self.sections
    }

    pub fn kind(&self) -> FileKind {
        if self.header.characteristics & IMAGE_FILE_EXECUTABLE_IMAGE != 0 {
            FileKind::Program
        } else if self.header.characteristics & IMAGE_FILE_DLL != 0 {
            FileKind::Library
        } else {
            FileKind::None
        }
    }

    pub fn address_kind(&self) -> AddressKind {
        if self.optional.magic == PE32P {
            AddressKind::A64
        } else {
            AddressKind::A32
        }
    }

    /// Entry point as a virtual address relative to the image base.
    pub fn entry(&self) -> u64 {
        self.optional.address_of_entry_point as u64
    }

    pub fn machine(&self) -> String {
        match machine_name(self.header.machine) {
            Some(name) => name.to_string(),
            None => format!("unknown ({})", self.header.machine),
        }
    }

    pub fn os(&self) -> String {
        "Windows".to_string()
    }

    /// The sections as loadable segments.
    pub fn segment_views(&self) -> Vec<SegmentView> {
        self.sections
            .iter()
            .map(|s| SegmentView {
                name: s.name.clone(),
                base_address: s.virtual_address(),
                load_address: s.virtual_address(),
                size: s.virtual_size(),
                alignment: self.optional.section_alignment as u64,
                executable: s.is_executable(),
                writable: s.is_writable(),
                has_content: s.has_content(),
            })
            .collect()
    }

    /// Bytes of the `i`-th section, zero-filled to its virtual size.
    pub fn section_content(&self, i: usize) -> Result<Buffer<'_>> {
        let section = self
            .sections
            .get(i)
            .ok_or_else(|| Error::Malformed(format!("section index {i} out of range")))?;
        if let Some(bytes) = section.content.get() {
            return Ok(Buffer::new(Encoding::Little, bytes));
        }
        let mut bytes = vec![0u8; section.virtual_size as usize];
        if section.raw_size > 0 {
            let raw = Buffer::new(Encoding::Little, self.data.bytes()).slice(
                section.raw_pointer as usize,
                section.raw_size.min(section.virtual_size) as usize,
            )?;
            bytes[..raw.len()].copy_from_slice(raw);
        }
        let bytes = section.content.get_or_init(|| bytes);
        Ok(Buffer::new(Encoding::Little, bytes))
    }
}

/// Well-known PE machine types.
pub fn machine_name(code: u16) -> Option<&'static str> {
    Some(match code {
        0x0 => "unknown",
        0x14c => "386",
        0x166 => "mips r4k",
        0x1c0 => "arm",
        0x1c2 => "thumb",
        0x1c4 => "armnt",
        0x1f0 => "ppc",
        0x200 => "ia-64",
        0x8664 => "x86-64",
        0xaa64 => "aarch64",
        _ => return None,
    })
}
