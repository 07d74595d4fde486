//! Source-line debug information in the DWARF format, versions 2 to 5.
//! Only the `.debug_line` subset is interpreted: the line-number programs
//! that map code addresses back to file, line and column. The opcode
//! reference is https://dwarfstd.org/doc/DWARF5.pdf chapter 6.2.
pub mod line;

use crate::error::Result;
use bitflags::bitflags;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

bitflags! {
    /// Per-row flags of the line-number state machine.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct LineFlags: u8 {
        const IS_STMT = 0x01;
        const BASIC_BLOCK = 0x02;
        const PROLOGUE_END = 0x04;
        const EPILOGUE_BEGIN = 0x08;
    }
}

/// Index of a [`SourceFile`] inside its owning [`DebugLine`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SourceId(pub usize);

/// A source file referenced by the line table, with the modification date
/// and size the producer recorded for verification.
#[derive(Debug)]
pub struct SourceFile {
    path: PathBuf,
    date: u64,
    size: u64,
    units: Vec<usize>,
}

impl SourceFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn date(&self) -> u64 {
        self.date
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Indices of the compilation units using code from this file.
    pub fn units(&self) -> &[usize] {
        &self.units
    }
}

/// One row of the reconstructed line table: the code at `addr` comes from
/// `file` at `line:column`.
#[derive(Copy, Clone, Debug)]
pub struct LineRow {
    pub addr: u64,
    pub file: SourceId,
    pub line: u32,
    pub column: u32,
    pub flags: LineFlags,
    pub isa: u32,
    pub discriminator: u32,
    pub op_index: u32,
}

/// One compilation unit of the line table. The last row is a sentinel
/// emitted by the end-of-sequence opcode: it carries no source position of
/// its own and only provides the top address of the row before it.
#[derive(Debug, Default)]
pub struct CompilationUnit {
    rows: Vec<LineRow>,
    files: Vec<SourceId>,
}

impl CompilationUnit {
    /// All rows, sentinel included.
    pub fn rows(&self) -> &[LineRow] {
        &self.rows
    }

    /// Source files declared by the unit header, in declaration order.
    pub fn files(&self) -> &[SourceId] {
        &self.files
    }

    pub fn base_address(&self) -> Option<u64> {
        self.rows.first().map(|r| r.addr)
    }

    /// Exclusive upper address, taken from the sentinel row.
    pub fn top_address(&self) -> Option<u64> {
        self.rows.last().map(|r| r.addr)
    }

    /// The row covering `addr`, if the unit spans it.
    pub fn line_at(&self, addr: u64) -> Option<&LineRow> {
        for pair in self.rows.windows(2) {
            if pair[0].addr <= addr && addr < pair[1].addr {
                return Some(&pair[0]);
            }
        }
        None
    }

    pub(crate) fn add_row(&mut self, row: LineRow) {
        self.rows.push(row);
    }

    pub(crate) fn add_file(&mut self, file: SourceId) {
        self.files.push(file);
    }
}

/// The decoded `.debug_line` contents of one binary: every source file and
/// every compilation unit, owned here and referenced by index.
#[derive(Debug, Default)]
pub struct DebugLine {
    sources: Vec<SourceFile>,
    by_path: HashMap<PathBuf, SourceId>,
    units: Vec<CompilationUnit>,
}

impl DebugLine {
    pub fn units(&self) -> &[CompilationUnit] {
        &self.units
    }

    pub fn sources(&self) -> impl Iterator<Item = (SourceId, &SourceFile)> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, f)| (SourceId(i), f))
    }

    pub fn source(&self, id: SourceId) -> &SourceFile {
        &self.sources[id.0]
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn find_source(&self, path: &Path) -> Option<SourceId> {
        self.by_path.get(path).copied()
    }

    /// The row covering `addr` across all units.
    pub fn line_at(&self, addr: u64) -> Option<&LineRow> {
        for unit in &self.units {
            if let (Some(base), Some(top)) = (unit.base_address(), unit.top_address())
                && base <= addr
                && addr < top
                && let Some(row) = unit.line_at(addr)
            {
                return Some(row);
            }
        }
        None
    }

    /// Address ranges `[start, end)` generated for `line` of the given
    /// source file.
    pub fn addresses_of(&self, source: SourceId, line: u32) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for &ui in self.sources[source.0].units() {
            let rows = self.units[ui].rows();
            for pair in rows.windows(2) {
                if pair[0].file == source && pair[0].line == line {
                    out.push((pair[0].addr, pair[1].addr));
                }
            }
        }
        out
    }

    /// Intern a source file, returning the id of an already-known path.
    pub(crate) fn intern(&mut self, path: PathBuf, date: u64, size: u64) -> SourceId {
        if let Some(&id) = self.by_path.get(&path) {
            return id;
        }
        let id = SourceId(self.sources.len());
        self.by_path.insert(path.clone(), id);
        self.sources.push(SourceFile { path, date, size, units: Vec::new() });
        id
    }

    /// Record a finished unit and fill the back-references from its source
    /// files.
    pub(crate) fn add_unit(&mut self, unit: CompilationUnit) {
        let index = self.units.len();
        for &file in &unit.files {
            let units = &mut self.sources[file.0].units;
            if !units.contains(&index) {
                units.push(index);
            }
        }
        self.units.push(unit);
    }
}

pub use line::LineProgram;

impl DebugLine {
    /// Decode the `.debug_line` section of an ELF file, consulting
    /// `.debug_str` and `.debug_line_str` for DWARF 5 string references.
    /// A file without line information yields an empty table.
    pub fn from_elf(file: &crate::elf::ElfFile) -> Result<DebugLine> {
        line::from_elf(file)
    }
}
