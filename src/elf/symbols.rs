//! Symbols and the symbol table synthesized from the `SHT_SYMTAB` and
//! `SHT_DYNSYM` sections.
use crate::base::Cursor;
use crate::elf::file::{Class, ElfFile};
use crate::elf::sections::Section;
use crate::error::{Error, Result};
use std::collections::HashMap;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolKind {
    None,
    Other,
    Func,
    Data,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolBind {
    None,
    Other,
    Local,
    Global,
    Weak,
}

/// Where a symbol is defined: a literal section index or one of the
/// reserved pseudo-sections.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SectionRef {
    Undef,
    Abs,
    Common,
    Index(u16),
}

impl SectionRef {
    fn from_u16(shndx: u16) -> SectionRef {
        match shndx {
            SHN_UNDEF => SectionRef::Undef,
            SHN_ABS => SectionRef::Abs,
            SHN_COMMON => SectionRef::Common,
            n => SectionRef::Index(n),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub bind: SymbolBind,
    pub section: SectionRef,
}

impl Symbol {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SymbolKind::None => "none",
            SymbolKind::Other => "other",
            SymbolKind::Func => "func",
            SymbolKind::Data => "data",
        }
    }

    pub fn bind_name(&self) -> &'static str {
        match self.bind {
            SymbolBind::None => "none",
            SymbolBind::Other => "other",
            SymbolBind::Local => "local",
            SymbolBind::Global => "global",
            SymbolBind::Weak => "weak",
        }
    }
}

/// All symbols of a file keyed by name. Names repeated across sections
/// keep the definition seen last.
#[derive(Default, Debug)]
pub struct SymbolTable {
    map: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub(crate) fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Symbol)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Symbols sorted by name, for stable listings.
    pub fn sorted(&self) -> Vec<&Symbol> {
        let mut all: Vec<&Symbol> = self.map.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub(crate) fn put(&mut self, symbol: Symbol) {
        self.map.insert(symbol.name.clone(), symbol);
    }
}

impl ElfFile {
    /// Decode every entry of one symbol section into `table`. Names come
    /// from the string table the section links to.
    pub(crate) fn fill_symbol_table(&self, table: &mut SymbolTable, section: &Section) -> Result<()> {
        let entsize = section.entsize();
        if entsize == 0 {
            return Err(Error::Malformed(format!(
                "symbol table {} has zero entry size",
                self.section_name(section)?
            )));
        }
        if (section.size() / entsize) * entsize != section.size() {
            return Err(Error::Malformed(format!(
                "garbage found at end of symbol table {}",
                self.section_name(section)?
            )));
        }
        let strtab = section.link() as usize;
        let content = self.section_content(section)?;
        let mut c = Cursor::new(content);
        while c.avail(entsize as usize) {
            let start = c.offset();
            let symbol = read_symbol(&mut c, self.class())?;
            c.move_to(start + entsize as usize)?;
            let name = self.string_at_in(symbol.0 as u64, strtab)?.to_string();
            table.put(Symbol {
                name,
                value: symbol.1,
                size: symbol.2,
                kind: decode_kind(symbol.3),
                bind: decode_bind(symbol.4),
                section: SectionRef::from_u16(symbol.5),
            });
        }
        Ok(())
    }
}

/// (name offset, value, size, type, bind, shndx)
fn read_symbol(c: &mut Cursor, class: Class) -> Result<(u32, u64, u64, u8, u8, u16)> {
    match class {
        Class::Elf32 => {
            let name = c.read_u32()?;
            let value = c.read_u32()? as u64;
            let size = c.read_u32()? as u64;
            let info = c.read_u8()?;
            let _other = c.read_u8()?;
            let shndx = c.read_u16()?;
            Ok((name, value, size, info & 0xf, info >> 4, shndx))
        }
        Class::Elf64 => {
            let name = c.read_u32()?;
            let info = c.read_u8()?;
            let _other = c.read_u8()?;
            let shndx = c.read_u16()?;
            let value = c.read_u64()?;
            let size = c.read_u64()?;
            Ok((name, value, size, info & 0xf, info >> 4, shndx))
        }
    }
}

fn decode_kind(raw: u8) -> SymbolKind {
    match raw {
        STT_NOTYPE => SymbolKind::None,
        STT_OBJECT => SymbolKind::Data,
        STT_FUNC => SymbolKind::Func,
        _ => SymbolKind::Other,
    }
}

fn decode_bind(raw: u8) -> SymbolBind {
    match raw {
        STB_LOCAL => SymbolBind::Local,
        STB_GLOBAL => SymbolBind::Global,
        STB_WEAK => SymbolBind::Weak,
        _ => SymbolBind::Other,
    }
}
