//! The format-agnostic view over an opened executable: a sum type with
//! the accessors every format provides, and an explicit way down to the
//! ELF-specific facilities.
use crate::base::{AddressKind, Buffer};
use crate::dwarf::DebugLine;
use crate::elf::{ElfFile, SymbolTable};
use crate::error::{Error, Result};
use crate::image::{Image, Parameter, SimpleBuilder, UnixBuilder};
use crate::pecoff::PeFile;
use std::fmt;
use std::path::Path;

/// Role of the file in a link: a runnable program, a shared library, or
/// neither (relocatable objects, unclassified files).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileKind {
    None,
    Program,
    Library,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            FileKind::None => "no_type",
            FileKind::Program => "program",
            FileKind::Library => "library",
        };
        write!(f, "{label}")
    }
}

/// A format-independent description of one loadable region.
#[derive(Clone, Debug)]
pub struct SegmentView {
    pub name: String,
    pub base_address: u64,
    pub load_address: u64,
    pub size: u64,
    pub alignment: u64,
    pub executable: bool,
    pub writable: bool,
    pub has_content: bool,
}

/// An opened executable file of any supported format.
#[derive(Debug)]
pub enum Binary {
    Elf(ElfFile),
    PeCoff(PeFile),
}

impl Binary {
    pub fn path(&self) -> &Path {
        match self {
            Binary::Elf(f) => f.path(),
            Binary::PeCoff(f) => f.path(),
        }
    }

    pub fn kind(&self) -> FileKind {
        match self {
            Binary::Elf(f) => f.kind(),
            Binary::PeCoff(f) => f.kind(),
        }
    }

    pub fn is_big_endian(&self) -> bool {
        match self {
            Binary::Elf(f) => f.is_big_endian(),
            Binary::PeCoff(_) => false,
        }
    }

    pub fn address_kind(&self) -> AddressKind {
        match self {
            Binary::Elf(f) => f.address_kind(),
            Binary::PeCoff(f) => f.address_kind(),
        }
    }

    /// Format an address at the width of this file.
    pub fn format_addr(&self, addr: u64) -> String {
        self.address_kind().format(addr)
    }

    pub fn entry(&self) -> u64 {
        match self {
            Binary::Elf(f) => f.entry(),
            Binary::PeCoff(f) => f.entry(),
        }
    }

    pub fn machine(&self) -> String {
        match self {
            Binary::Elf(f) => f.machine(),
            Binary::PeCoff(f) => f.machine(),
        }
    }

    pub fn os(&self) -> String {
        match self {
            Binary::Elf(f) => f.os(),
            Binary::PeCoff(f) => f.os(),
        }
    }

    /// The loadable segments in a format-independent shape.
    pub fn segment_views(&self) -> Result<Vec<SegmentView>> {
        match self {
            Binary::Elf(f) => Ok(f
                .segments()?
                .iter()
                .map(|s| SegmentView {
                    name: s.name().to_string(),
                    base_address: s.base_address(),
                    load_address: s.load_address(),
                    size: s.size(),
                    alignment: s.alignment(),
                    executable: s.is_executable(),
                    writable: s.is_writable(),
                    has_content: s.has_content(),
                })
                .collect()),
            Binary::PeCoff(f) => Ok(f.segment_views()),
        }
    }

    /// Bytes of the `i`-th loadable segment, zero-filled to its in-memory
    /// size.
    pub fn segment_content(&self, i: usize) -> Result<Buffer<'_>> {
        match self {
            Binary::Elf(f) => {
                let segment = f.segments()?.get(i).ok_or_else(|| {
                    Error::Malformed(format!("segment index {i} out of range"))
                })?;
                segment.content(f)
            }
            Binary::PeCoff(f) => f.section_content(i),
        }
    }

    /// The symbol table. Deferred for PE-COFF.
    pub fn symbols(&self) -> Result<&SymbolTable> {
        match self {
            Binary::Elf(f) => f.symbols(),
            Binary::PeCoff(_) => Err(Error::Unsupported(
                "PE-COFF symbol tables are not supported".into(),
            )),
        }
    }

    /// Source-line debug information. Deferred for PE-COFF.
    pub fn debug_lines(&self) -> Result<&DebugLine> {
        match self {
            Binary::Elf(f) => f.debug_lines(),
            Binary::PeCoff(_) => Err(Error::Unsupported(
                "PE-COFF debug line information is not supported".into(),
            )),
        }
    }

    /// The ELF facilities (program headers, dynamic entries, notes), when
    /// this is an ELF file.
    pub fn as_elf(&self) -> Option<&ElfFile> {
        match self {
            Binary::Elf(f) => Some(f),
            _ => None,
        }
    }

    /// Build a runnable memory image of this file as a program, with
    /// dynamic-library resolution and an initial stack.
    pub fn make(&self, params: &Parameter) -> Result<Image> {
        match self {
            Binary::Elf(f) => {
                if f.kind() != FileKind::Program {
                    return Err(Error::Unsupported(
                        "image building needs a program file".into(),
                    ));
                }
                UnixBuilder::new(f, params).build()
            }
            Binary::PeCoff(_) => Err(Error::Unsupported(
                "PE-COFF image building is not supported".into(),
            )),
        }
    }

    /// Build the trivial image: segments copied to their own load
    /// addresses, nothing resolved, no stack.
    pub fn make_simple(&self) -> Result<Image> {
        SimpleBuilder::new(self).build()
    }
}
