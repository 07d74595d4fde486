//! The ELF header and the file object tying the lazy tables together.
use crate::base::{AddressKind, Buffer, Cursor, Encoding, FileData};
use crate::binary::FileKind;
use crate::dwarf::DebugLine;
use crate::elf::dynamic::{Dyn, DynIter};
use crate::elf::notes::NoteIter;
use crate::elf::sections::{Section, SectionKind};
use crate::elf::segments::{LoadSegment, ProgramHeader, SegmentKind};
use crate::elf::symbols::SymbolTable;
use crate::error::{Error, Result};
use memmap2::Mmap;
use std::cell::OnceCell;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;
pub const EI_NIDENT: usize = 16;

pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const ET_NONE: u16 = 0;
pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

/// Word width of the file, set by `EI_CLASS`. The 32- and 64-bit layouts
/// only differ in field widths and ordering, so a single parser branches
/// on this everywhere a structure is read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Class {
    Elf32,
    Elf64,
}

impl Class {
    pub fn addr_size(self) -> usize {
        match self {
            Class::Elf32 => 4,
            Class::Elf64 => 8,
        }
    }

    pub fn address_kind(self) -> AddressKind {
        match self {
            Class::Elf32 => AddressKind::A32,
            Class::Elf64 => AddressKind::A64,
        }
    }
}

/// An open ELF file. Owns the mapped bytes and every table derived from
/// them; the tables are parsed on first access and cached, so repeated
/// calls hand back the same data.
#[derive(Debug)]
pub struct ElfFile {
    path: PathBuf,
    data: FileData,
    class: Class,
    enc: Encoding,
    ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
    sections: OnceCell<Vec<Section>>,
    headers: OnceCell<Vec<ProgramHeader>>,
    segments: OnceCell<Vec<LoadSegment>>,
    symbols: OnceCell<SymbolTable>,
    debug_lines: OnceCell<DebugLine>,
}

impl ElfFile {
    /// Map the file at `path` and parse its header.
    pub fn open(path: impl AsRef<Path>) -> Result<ElfFile> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // The mapping is read-only; the undefined behavior window of a file
        // mutated while mapped is accepted the same way every mmap-based
        // reader accepts it.
        let map = unsafe { Mmap::map(&file) }?;
        ElfFile::parse(path.to_path_buf(), FileData::Mapped(map))
    }

    /// Parse an ELF image already in memory. `path` only labels
    /// diagnostics.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<ElfFile> {
        ElfFile::parse(path.into(), FileData::Owned(bytes))
    }

    fn parse(path: PathBuf, data: FileData) -> Result<ElfFile> {
        let bytes = data.bytes();
        if bytes.len() < EI_NIDENT {
            return Err(Error::BadMagic("not an ELF file"));
        }
        let mut ident = [0u8; EI_NIDENT];
        ident.copy_from_slice(&bytes[..EI_NIDENT]);
        if ident[..4] != ELF_MAGIC {
            return Err(Error::BadMagic("not an ELF file"));
        }
        let class = match ident[EI_CLASS] {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            c => return Err(Error::Unsupported(format!("unknown ELF class: {c:#x}"))),
        };
        let enc = match ident[EI_DATA] {
            ELFDATA2LSB => Encoding::Little,
            ELFDATA2MSB => Encoding::Big,
            d => return Err(Error::Unsupported(format!("unknown ELF encoding: {d:#x}"))),
        };

        let buf = Buffer::new(enc, bytes);
        let mut c = Cursor::new(buf);
        c.move_to(EI_NIDENT)?;
        let e_type = c.read_u16()?;
        let e_machine = c.read_u16()?;
        let e_version = c.read_u32()?;
        let (e_entry, e_phoff, e_shoff) = match class {
            Class::Elf32 => (
                c.read_u32()? as u64,
                c.read_u32()? as u64,
                c.read_u32()? as u64,
            ),
            Class::Elf64 => (c.read_u64()?, c.read_u64()?, c.read_u64()?),
        };
        let e_flags = c.read_u32()?;
        let _e_ehsize = c.read_u16()?;
        let e_phentsize = c.read_u16()?;
        let e_phnum = c.read_u16()?;
        let e_shentsize = c.read_u16()?;
        let e_shnum = c.read_u16()?;
        let e_shstrndx = c.read_u16()?;

        // Index 0 with no sections at all means "no string table", which
        // is fine; anything else must point inside the section table.
        if (e_shnum != 0 || e_shstrndx != 0) && e_shstrndx >= e_shnum {
            return Err(Error::Malformed(format!(
                "section string table index {e_shstrndx} out of range ({e_shnum} sections)"
            )));
        }

        Ok(ElfFile {
            path,
            data,
            class,
            enc,
            ident,
            e_type,
            e_machine,
            e_version,
            e_entry,
            e_phoff,
            e_shoff,
            e_flags,
            e_phentsize,
            e_phnum,
            e_shentsize,
            e_shnum,
            e_shstrndx,
            sections: OnceCell::new(),
            headers: OnceCell::new(),
            segments: OnceCell::new(),
            symbols: OnceCell::new(),
            debug_lines: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn encoding(&self) -> Encoding {
        self.enc
    }

    pub fn is_big_endian(&self) -> bool {
        self.enc.is_big()
    }

    pub fn address_kind(&self) -> AddressKind {
        self.class.address_kind()
    }

    pub fn ident(&self) -> &[u8; EI_NIDENT] {
        &self.ident
    }

    pub fn elf_type(&self) -> u16 {
        self.e_type
    }

    pub fn machine_code(&self) -> u16 {
        self.e_machine
    }

    pub fn version(&self) -> u32 {
        self.e_version
    }

    pub fn flags(&self) -> u32 {
        self.e_flags
    }

    pub fn entry(&self) -> u64 {
        self.e_entry
    }

    pub fn kind(&self) -> FileKind {
        match self.e_type {
            ET_EXEC | ET_CORE => FileKind::Program,
            ET_DYN => FileKind::Library,
            _ => FileKind::None,
        }
    }

    /// The whole file as a typed buffer.
    pub fn buffer(&self) -> Buffer<'_> {
        Buffer::new(self.enc, self.data.bytes())
    }

    /// The section table, parsed once.
    pub fn sections(&self) -> Result<&[Section]> {
        if let Some(s) = self.sections.get() {
            return Ok(s);
        }
        let loaded = self.load_sections()?;
        Ok(self.sections.get_or_init(|| loaded))
    }

    pub fn section_count(&self) -> usize {
        self.e_shnum as usize
    }

    pub fn section_at(&self, index: usize) -> Result<&Section> {
        self.sections()?.get(index).ok_or_else(|| {
            Error::Malformed(format!("section index {index} out of range"))
        })
    }

    /// Look a section up by name, e.g. `.debug_line`.
    pub fn find_section(&self, name: &str) -> Result<Option<&Section>> {
        for section in self.sections()? {
            if self.section_name(section)? == name {
                return Ok(Some(section));
            }
        }
        Ok(None)
    }

    pub fn section_name(&self, section: &Section) -> Result<&str> {
        self.string_at(section.name_offset() as u64)
    }

    /// Content of a section as a view into the file. `SHT_NOBITS` sections
    /// occupy no file bytes and yield an empty buffer.
    pub fn section_content(&self, section: &Section) -> Result<Buffer<'_>> {
        if section.kind() == SectionKind::NoBits {
            return Ok(Buffer::new(self.enc, &[]));
        }
        self.buffer()
            .sub(section.offset() as usize, section.size() as usize)
    }

    /// A string from the section-name string table (`e_shstrndx`).
    pub fn string_at(&self, offset: u64) -> Result<&str> {
        self.string_at_in(offset, self.e_shstrndx as usize)
    }

    /// A string from an arbitrary string-table section. The offset may
    /// point into the middle of a stored string.
    pub fn string_at_in(&self, offset: u64, section: usize) -> Result<&str> {
        if section >= self.sections()?.len() {
            return Err(Error::Malformed(format!(
                "string table index {section} out of range"
            )));
        }
        let content = self.section_content(&self.sections()?[section])?;
        content.cstr(offset as usize)
    }

    /// The program header table, parsed once.
    pub fn program_headers(&self) -> Result<&[ProgramHeader]> {
        if let Some(h) = self.headers.get() {
            return Ok(h);
        }
        let loaded = self.load_program_headers()?;
        Ok(self.headers.get_or_init(|| loaded))
    }

    pub fn header_at(&self, index: usize) -> Result<&ProgramHeader> {
        self.program_headers()?.get(index).ok_or_else(|| {
            Error::Malformed(format!("program header index {index} out of range"))
        })
    }

    /// The loadable segments, derived from the `PT_LOAD` program headers
    /// and named after their access class.
    pub fn segments(&self) -> Result<&[LoadSegment]> {
        if let Some(s) = self.segments.get() {
            return Ok(s);
        }
        let mut segs = Vec::new();
        for (i, ph) in self.program_headers()?.iter().enumerate() {
            if ph.kind() == SegmentKind::Load {
                segs.push(LoadSegment::new(i, ph));
            }
        }
        Ok(self.segments.get_or_init(|| segs))
    }

    /// The symbol map, built once from every `SHT_SYMTAB` and
    /// `SHT_DYNSYM` section. Re-used names keep the last definition.
    pub fn symbols(&self) -> Result<&SymbolTable> {
        if let Some(t) = self.symbols.get() {
            return Ok(t);
        }
        let mut table = SymbolTable::new();
        for section in self.sections()? {
            if matches!(section.kind(), SectionKind::SymbolTable | SectionKind::DynamicSymbolTable) {
                self.fill_symbol_table(&mut table, section)?;
            }
        }
        Ok(self.symbols.get_or_init(|| table))
    }

    /// Source-line debug information, decoded once from `.debug_line`.
    /// A file without the section gets an empty table.
    pub fn debug_lines(&self) -> Result<&DebugLine> {
        if let Some(d) = self.debug_lines.get() {
            return Ok(d);
        }
        let decoded = DebugLine::from_elf(self)?;
        Ok(self.debug_lines.get_or_init(|| decoded))
    }

    /// Iterate the entries of the first `SHT_DYNAMIC` section, if any.
    pub fn dyn_entries(&self) -> Result<Option<DynIter<'_>>> {
        for section in self.sections()? {
            if section.kind() == SectionKind::Dynamic {
                let content = self.section_content(section)?;
                return Ok(Some(DynIter::new(content, self.class)));
            }
        }
        Ok(None)
    }

    /// All dynamic entries collected into a vector.
    pub fn dyns(&self) -> Result<Vec<Dyn>> {
        match self.dyn_entries()? {
            Some(iter) => iter.collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Iterate the notes of a `PT_NOTE` program header.
    pub fn notes<'a>(&'a self, ph: &'a ProgramHeader) -> Result<NoteIter<'a>> {
        Ok(NoteIter::new(ph.content(self)?))
    }

    pub(crate) fn load_sections(&self) -> Result<Vec<Section>> {
        let entsize = self.e_shentsize as usize;
        let min = match self.class {
            Class::Elf32 => 40,
            Class::Elf64 => 64,
        };
        if self.e_shnum != 0 && entsize < min {
            return Err(Error::Malformed(format!(
                "section entry size {entsize} below the {min} bytes of the format"
            )));
        }
        // One read covers the whole table; entries are decoded in place.
        let table = self
            .buffer()
            .sub(self.e_shoff as usize, entsize * self.e_shnum as usize)?;
        let mut sections = Vec::with_capacity(self.e_shnum as usize);
        for i in 0..self.e_shnum as usize {
            let mut c = Cursor::new(table.sub(i * entsize, entsize)?);
            sections.push(Section::read(&mut c, i, self.class)?);
        }
        Ok(sections)
    }

    fn load_program_headers(&self) -> Result<Vec<ProgramHeader>> {
        let entsize = self.e_phentsize as usize;
        let min = match self.class {
            Class::Elf32 => 32,
            Class::Elf64 => 56,
        };
        if self.e_phnum != 0 && entsize < min {
            return Err(Error::Malformed(format!(
                "program header entry size {entsize} below the {min} bytes of the format"
            )));
        }
        let table = self
            .buffer()
            .sub(self.e_phoff as usize, entsize * self.e_phnum as usize)?;
        let mut headers = Vec::with_capacity(self.e_phnum as usize);
        for i in 0..self.e_phnum as usize {
            let mut c = Cursor::new(table.sub(i * entsize, entsize)?);
            headers.push(ProgramHeader::read(&mut c, i, self.class)?);
        }
        Ok(headers)
    }

    /// Human name of `e_machine`.
    pub fn machine(&self) -> String {
        match machine_name(self.e_machine) {
            Some(name) => name.to_string(),
            None => format!("unknown ({})", self.e_machine),
        }
    }

    /// Human name of the OS ABI byte.
    pub fn os(&self) -> String {
        match os_name(self.ident[EI_OSABI]) {
            Some(name) => name.to_string(),
            None => format!("unknown ({})", self.ident[EI_OSABI]),
        }
    }
}

/// Well-known `e_machine` values. Codes missing here display numerically.
pub fn machine_name(code: u16) -> Option<&'static str> {
    Some(match code {
        0 => "no machine",
        1 => "we32100",
        2 => "sparc",
        3 => "386",
        4 => "m68k",
        5 => "m88k",
        7 => "860",
        8 => "mips r3k",
        10 => "mips r4k",
        15 => "pa-risc",
        17 => "vpp500",
        18 => "sparc32+",
        19 => "960",
        20 => "ppc",
        21 => "ppc64",
        36 => "v800",
        37 => "fr20",
        38 => "rh32",
        39 => "rce",
        40 => "arm",
        41 => "alpha",
        42 => "sh",
        43 => "sparcv9",
        44 => "tricore",
        45 => "arc",
        46 => "h8/300",
        47 => "h8/300h",
        48 => "h8s",
        49 => "h8/500",
        50 => "ia-64",
        51 => "mips-x",
        52 => "coldfire",
        53 => "68hc12",
        54 => "mma",
        55 => "pcp",
        56 => "ncpu",
        57 => "ndr1",
        58 => "starcore",
        59 => "me16",
        60 => "st100",
        61 => "tinyj",
        62 => "x86-64",
        66 => "fx66",
        67 => "st9+",
        68 => "st7",
        69 => "68hc16",
        70 => "68hc11",
        71 => "68hc08",
        72 => "68hc05",
        73 => "svx",
        74 => "st19",
        75 => "vax",
        76 => "cris",
        77 => "javelin",
        78 => "firepath",
        79 => "zsp",
        80 => "mmix",
        81 => "huany",
        82 => "prism",
        183 => "aarch64",
        243 => "riscv",
        _ => return None,
    })
}

/// Well-known `EI_OSABI` values.
pub fn os_name(code: u8) -> Option<&'static str> {
    Some(match code {
        0 => "SysV",
        1 => "HPUX",
        2 => "NetBSD",
        3 => "Linux",
        6 => "Solaris",
        97 => "ARM",
        255 => "standalone",
        _ => return None,
    })
}
