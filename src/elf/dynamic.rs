//! Dynamic-linking entries (`SHT_DYNAMIC` / `PT_DYNAMIC` content) and the
//! registry of architecture-specific tag decoders.
use crate::base::{AddressKind, Buffer, Cursor};
use crate::elf::file::Class;
use crate::error::Result;

pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 1;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_PLTGOT: i64 = 3;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_RELAENT: i64 = 9;
pub const DT_STRSZ: i64 = 10;
pub const DT_SYMENT: i64 = 11;
pub const DT_INIT: i64 = 12;
pub const DT_FINI: i64 = 13;
pub const DT_SONAME: i64 = 14;
pub const DT_RPATH: i64 = 15;
pub const DT_SYMBOLIC: i64 = 16;
pub const DT_REL: i64 = 17;
pub const DT_RELSZ: i64 = 18;
pub const DT_RELENT: i64 = 19;
pub const DT_PLTREL: i64 = 20;
pub const DT_DEBUG: i64 = 21;
pub const DT_TEXTREL: i64 = 22;
pub const DT_JMPREL: i64 = 23;
pub const DT_BIND_NOW: i64 = 24;
pub const DT_INIT_ARRAY: i64 = 25;
pub const DT_FINI_ARRAY: i64 = 26;
pub const DT_INIT_ARRAYSZ: i64 = 27;
pub const DT_FINI_ARRAYSZ: i64 = 28;
pub const DT_RUNPATH: i64 = 29;
pub const DT_FLAGS: i64 = 30;

/// One dynamic entry. The value is an address or an integer depending on
/// the tag; the reader does not interpret it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Dyn {
    pub tag: i64,
    pub value: u64,
}

/// Iterator over the entries of a dynamic section or segment. Stops at
/// the first `DT_NULL` without yielding it.
pub struct DynIter<'a> {
    cursor: Cursor<'a>,
    class: Class,
    done: bool,
}

impl<'a> DynIter<'a> {
    pub fn new(content: Buffer<'a>, class: Class) -> DynIter<'a> {
        DynIter { cursor: Cursor::new(content), class, done: false }
    }

    fn entry_size(&self) -> usize {
        match self.class {
            Class::Elf32 => 8,
            Class::Elf64 => 16,
        }
    }
}

impl Iterator for DynIter<'_> {
    type Item = Result<Dyn>;

    fn next(&mut self) -> Option<Result<Dyn>> {
        if self.done || !self.cursor.avail(self.entry_size()) {
            return None;
        }
        let entry = match self.class {
            Class::Elf32 => {
                let tag = match self.cursor.read_i32() {
                    Ok(v) => v as i64,
                    Err(e) => return Some(Err(e)),
                };
                let value = match self.cursor.read_u32() {
                    Ok(v) => v as u64,
                    Err(e) => return Some(Err(e)),
                };
                Dyn { tag, value }
            }
            Class::Elf64 => {
                let tag = match self.cursor.read_i64() {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                let value = match self.cursor.read_u64() {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                Dyn { tag, value }
            }
        };
        if entry.tag == DT_NULL {
            self.done = true;
            return None;
        }
        Some(Ok(entry))
    }
}

/// Name of a standard dynamic tag.
pub fn tag_name(tag: i64) -> Option<&'static str> {
    Some(match tag {
        DT_NULL => "DT_NULL",
        DT_NEEDED => "DT_NEEDED",
        DT_PLTRELSZ => "DT_PLTRELSZ",
        DT_PLTGOT => "DT_PLTGOT",
        DT_HASH => "DT_HASH",
        DT_STRTAB => "DT_STRTAB",
        DT_SYMTAB => "DT_SYMTAB",
        DT_RELA => "DT_RELA",
        DT_RELASZ => "DT_RELASZ",
        DT_RELAENT => "DT_RELAENT",
        DT_STRSZ => "DT_STRSZ",
        DT_SYMENT => "DT_SYMENT",
        DT_INIT => "DT_INIT",
        DT_FINI => "DT_FINI",
        DT_SONAME => "DT_SONAME",
        DT_RPATH => "DT_RPATH",
        DT_SYMBOLIC => "DT_SYMBOLIC",
        DT_REL => "DT_REL",
        DT_RELSZ => "DT_RELSZ",
        DT_RELENT => "DT_RELENT",
        DT_PLTREL => "DT_PLTREL",
        DT_DEBUG => "DT_DEBUG",
        DT_TEXTREL => "DT_TEXTREL",
        DT_JMPREL => "DT_JMPREL",
        DT_BIND_NOW => "DT_BIND_NOW",
        DT_INIT_ARRAY => "DT_INIT_ARRAY",
        DT_FINI_ARRAY => "DT_FINI_ARRAY",
        DT_INIT_ARRAYSZ => "DT_INIT_ARRAYSZ",
        DT_FINI_ARRAYSZ => "DT_FINI_ARRAYSZ",
        DT_RUNPATH => "DT_RUNPATH",
        DT_FLAGS => "DT_FLAGS",
        _ => return None,
    })
}

/// Whether a standard tag's value is an address (as opposed to a size,
/// count or string-table offset).
pub fn tag_is_address(tag: i64) -> bool {
    matches!(
        tag,
        DT_PLTGOT
            | DT_HASH
            | DT_STRTAB
            | DT_SYMTAB
            | DT_RELA
            | DT_INIT
            | DT_FINI
            | DT_REL
            | DT_DEBUG
            | DT_JMPREL
            | DT_INIT_ARRAY
            | DT_FINI_ARRAY
    )
}

/// Decoder for the processor-specific dynamic-tag range, selected by
/// `e_machine`. Implementations live in this crate and are registered at
/// compile time.
pub trait ArchDyn: Sync {
    /// Machine code the decoder applies to.
    fn machine(&self) -> u16;

    /// Name of an architecture-specific tag, if known.
    fn tag_name(&self, tag: i64) -> Option<&'static str>;

    /// Render an architecture-specific value, if the tag carries one.
    fn format_value(&self, tag: i64, value: u64) -> Option<String>;
}

/// Find the decoder registered for a machine code.
pub fn arch_dyn(machine: u16) -> Option<&'static dyn ArchDyn> {
    ARCH_DECODERS.iter().copied().find(|d| d.machine() == machine)
}

static ARCH_DECODERS: &[&dyn ArchDyn] = &[&ArmDyn];

const EM_ARM: u16 = 40;

const DT_ARM_RESERVED1: i64 = 0x70000000;
const DT_ARM_SYMTABSZ: i64 = 0x70000001;
const DT_ARM_PREEMPTMAP: i64 = 0x70000002;
const DT_ARM_RESERVED2: i64 = 0x70000003;

/// ARM EABI dynamic tags.
struct ArmDyn;

impl ArchDyn for ArmDyn {
    fn machine(&self) -> u16 {
        EM_ARM
    }

    fn tag_name(&self, tag: i64) -> Option<&'static str> {
        Some(match tag {
            DT_ARM_RESERVED1 => "DT_ARM_RESERVED1",
            DT_ARM_SYMTABSZ => "DT_ARM_SYMTABSZ",
            DT_ARM_PREEMPTMAP => "DT_ARM_PREEMPTMAP",
            DT_ARM_RESERVED2 => "DT_ARM_RESERVED2",
            _ => return None,
        })
    }

    fn format_value(&self, tag: i64, value: u64) -> Option<String> {
        match tag {
            DT_ARM_SYMTABSZ => Some(value.to_string()),
            DT_ARM_PREEMPTMAP => Some(AddressKind::A32.format(value)),
            DT_ARM_RESERVED1 | DT_ARM_RESERVED2 => Some(String::new()),
            _ => None,
        }
    }
}
