//! Program headers and the loadable segments derived from them. This is
//! the run-time loader's view of the file; also see sections.
use crate::base::{Buffer, Cursor};
use crate::elf::file::{Class, ElfFile};
use crate::error::{Error, Result};
use std::cell::OnceCell;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_SHLIB: u32 = 5;
pub const PT_PHDR: u32 = 6;
pub const PT_TLS: u32 = 7;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

/// Program header type, with unrecognized values carried through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    Null,
    Load,
    Dynamic,
    Interpreter,
    Note,
    Shlib,
    Phdr,
    Tls,
    Unknown(u32),
}

impl SegmentKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            PT_NULL => SegmentKind::Null,
            PT_LOAD => SegmentKind::Load,
            PT_DYNAMIC => SegmentKind::Dynamic,
            PT_INTERP => SegmentKind::Interpreter,
            PT_NOTE => SegmentKind::Note,
            PT_SHLIB => SegmentKind::Shlib,
            PT_PHDR => SegmentKind::Phdr,
            PT_TLS => SegmentKind::Tls,
            other => SegmentKind::Unknown(other),
        }
    }

    pub fn name(self) -> String {
        match self {
            SegmentKind::Null => "NULL".into(),
            SegmentKind::Load => "LOAD".into(),
            SegmentKind::Dynamic => "DYNAMIC".into(),
            SegmentKind::Interpreter => "INTERP".into(),
            SegmentKind::Note => "NOTE".into(),
            SegmentKind::Shlib => "SHLIB".into(),
            SegmentKind::Phdr => "PHDR".into(),
            SegmentKind::Tls => "TLS".into(),
            SegmentKind::Unknown(v) => format!("{v:#x}"),
        }
    }
}

/// One program header, widened to 64-bit fields. Content is read from the
/// file on first request, with the tail past `p_filesz` zero-filled up to
/// `p_memsz` (the BSS part).
#[derive(Debug)]
pub struct ProgramHeader {
    index: usize,
    kind: SegmentKind,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
    content: OnceCell<Vec<u8>>,
}

impl ProgramHeader {
    pub(crate) fn read(c: &mut Cursor, index: usize, class: Class) -> Result<ProgramHeader> {
        match class {
            Class::Elf32 => {
                let kind = SegmentKind::from_u32(c.read_u32()?);
                let offset = c.read_u32()? as u64;
                let vaddr = c.read_u32()? as u64;
                let paddr = c.read_u32()? as u64;
                let filesz = c.read_u32()? as u64;
                let memsz = c.read_u32()? as u64;
                let flags = c.read_u32()?;
                let align = c.read_u32()? as u64;
                Ok(ProgramHeader { index, kind, flags, offset, vaddr, paddr, filesz, memsz, align, content: OnceCell::new() })
            }
            Class::Elf64 => {
                let kind = SegmentKind::from_u32(c.read_u32()?);
                let flags = c.read_u32()?;
                let offset = c.read_u64()?;
                let vaddr = c.read_u64()?;
                let paddr = c.read_u64()?;
                let filesz = c.read_u64()?;
                let memsz = c.read_u64()?;
                let align = c.read_u64()?;
                Ok(ProgramHeader { index, kind, flags, offset, vaddr, paddr, filesz, memsz, align, content: OnceCell::new() })
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn filesz(&self) -> u64 {
        self.filesz
    }

    pub fn memsz(&self) -> u64 {
        self.memsz
    }

    pub fn align(&self) -> u64 {
        self.align
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn is_readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.vaddr <= addr && addr < self.vaddr + self.memsz
    }

    /// `rwx`-style rendering of the permission bits.
    pub fn flags_string(&self) -> String {
        let mut out = String::new();
        out.push(if self.is_readable() { 'r' } else { '-' });
        out.push(if self.is_writable() { 'w' } else { '-' });
        out.push(if self.is_executable() { 'x' } else { '-' });
        out
    }

    /// The in-memory image of the segment: `p_filesz` bytes from the file
    /// followed by zeroes up to `p_memsz`. Loaded once and cached.
    pub fn content<'a>(&'a self, file: &'a ElfFile) -> Result<Buffer<'a>> {
        if let Some(bytes) = self.content.get() {
            return Ok(Buffer::new(file.encoding(), bytes));
        }
        if self.filesz > self.memsz {
            return Err(Error::Malformed(format!(
                "program header {}: file size {:#x} exceeds memory size {:#x}",
                self.index, self.filesz, self.memsz
            )));
        }
        let mut bytes = vec![0u8; self.memsz as usize];
        if self.filesz > 0 {
            let raw = file
                .buffer()
                .slice(self.offset as usize, self.filesz as usize)?;
            bytes[..raw.len()].copy_from_slice(raw);
        }
        let bytes = self.content.get_or_init(|| bytes);
        Ok(Buffer::new(file.encoding(), bytes))
    }
}

/// A loadable region, derived from a `PT_LOAD` header and named by its
/// access class: `code` when executable, `data` when writable, `rodata`
/// when only readable.
#[derive(Clone, Debug)]
pub struct LoadSegment {
    name: &'static str,
    ph: usize,
    base: u64,
    load: u64,
    size: u64,
    align: u64,
    executable: bool,
    writable: bool,
}

impl LoadSegment {
    pub(crate) fn new(ph_index: usize, ph: &ProgramHeader) -> LoadSegment {
        let name = if ph.is_executable() {
            "code"
        } else if ph.is_writable() {
            "data"
        } else if ph.is_readable() {
            "rodata"
        } else {
            "unknown"
        };
        LoadSegment {
            name,
            ph: ph_index,
            base: ph.vaddr(),
            load: ph.paddr(),
            size: ph.memsz(),
            align: ph.align(),
            executable: ph.is_executable(),
            writable: ph.is_writable(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Index of the program header the segment was derived from.
    pub fn header_index(&self) -> usize {
        self.ph
    }

    /// Run-time (virtual) address.
    pub fn base_address(&self) -> u64 {
        self.base
    }

    /// Load-time (physical) address; differs from the base for segments
    /// staged in ROM and copied to RAM before use.
    pub fn load_address(&self) -> u64 {
        self.load
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.align
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn has_content(&self) -> bool {
        true
    }

    pub fn content<'a>(&self, file: &'a ElfFile) -> Result<Buffer<'a>> {
        file.header_at(self.ph)?.content(file)
    }
}
