//! The line-number program interpreter: a byte-code virtual machine that
//! rebuilds the address → file:line:column table one compilation unit at a
//! time.
use crate::base::{AddressKind, Buffer, Cursor};
use crate::dwarf::{CompilationUnit, DebugLine, LineFlags, LineRow};
use crate::elf::ElfFile;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

// Standard opcodes
const DW_LNS_COPY: u8 = 1;
const DW_LNS_ADVANCE_PC: u8 = 2;
const DW_LNS_ADVANCE_LINE: u8 = 3;
const DW_LNS_SET_FILE: u8 = 4;
const DW_LNS_SET_COLUMN: u8 = 5;
const DW_LNS_NEGATE_STMT: u8 = 6;
const DW_LNS_SET_BASIC_BLOCK: u8 = 7;
const DW_LNS_CONST_ADD_PC: u8 = 8;
const DW_LNS_FIXED_ADVANCE_PC: u8 = 9;
const DW_LNS_SET_PROLOGUE_END: u8 = 10;
const DW_LNS_SET_EPILOGUE_BEGIN: u8 = 11;
const DW_LNS_SET_ISA: u8 = 12;

// Extended opcodes
const DW_LNE_END_SEQUENCE: u8 = 1;
const DW_LNE_SET_ADDRESS: u8 = 2;
const DW_LNE_DEFINE_FILE: u8 = 3;
const DW_LNE_SET_DISCRIMINATOR: u8 = 4;

// DWARF 5 directory/file entry content types
const DW_LNCT_PATH: u64 = 0x1;
const DW_LNCT_DIRECTORY_INDEX: u64 = 0x2;

// DWARF 5 forms accepted in directory/file tables
const DW_FORM_STRING: u64 = 0x08;
const DW_FORM_STRP: u64 = 0x0e;
const DW_FORM_UDATA: u64 = 0x0f;
const DW_FORM_LINE_STRP: u64 = 0x1f;

/// Decoder for a raw `.debug_line` payload. The address kind fixes the
/// width of `DW_LNE_set_address` operands; the two string buffers back the
/// DWARF 5 `strp`/`line_strp` forms when present.
pub struct LineProgram<'a> {
    buf: Buffer<'a>,
    addr_kind: AddressKind,
    str_buf: Option<Buffer<'a>>,
    line_str_buf: Option<Buffer<'a>>,
}

/// Decode the `.debug_line` section of an ELF file.
pub(crate) fn from_elf(file: &ElfFile) -> Result<DebugLine> {
    let Some(section) = file.find_section(".debug_line")? else {
        return Ok(DebugLine::default());
    };
    let mut program = LineProgram::new(file.section_content(section)?, file.address_kind());
    if let Some(s) = file.find_section(".debug_str")? {
        program = program.with_str(file.section_content(s)?);
    }
    if let Some(s) = file.find_section(".debug_line_str")? {
        program = program.with_line_str(file.section_content(s)?);
    }
    program.decode()
}

impl<'a> LineProgram<'a> {
    pub fn new(buf: Buffer<'a>, addr_kind: AddressKind) -> LineProgram<'a> {
        LineProgram { buf, addr_kind, str_buf: None, line_str_buf: None }
    }

    /// Attach the `.debug_str` payload.
    pub fn with_str(mut self, buf: Buffer<'a>) -> LineProgram<'a> {
        self.str_buf = Some(buf);
        self
    }

    /// Attach the `.debug_line_str` payload.
    pub fn with_line_str(mut self, buf: Buffer<'a>) -> LineProgram<'a> {
        self.line_str_buf = Some(buf);
        self
    }

    /// Run every compilation unit in the buffer.
    pub fn decode(self) -> Result<DebugLine> {
        let mut out = DebugLine::default();
        let mut c = Cursor::new(self.buf);
        while !c.ended() {
            self.read_unit(&mut c, &mut out)?;
        }
        Ok(out)
    }

    fn read_unit(&self, c: &mut Cursor<'a>, out: &mut DebugLine) -> Result<()> {
        // unit_length, with the escape value announcing 64-bit DWARF
        let (unit_length, is_64) = {
            let l = c.read_u32()?;
            if l < 0xffff_ff00 {
                (l as u64, false)
            } else {
                (c.read_u64()?, true)
            }
        };
        let end = c.offset() + unit_length as usize;
        if end > self.buf.len() {
            return Err(Error::Malformed(format!(
                "compilation unit length {unit_length:#x} exceeds the section"
            )));
        }

        let mut sm = StateMachine::new();
        let mut cu = CompilationUnit::default();

        sm.version = c.read_u16()?;
        if sm.version > 5 {
            return Err(Error::Unsupported(format!("DWARF version > 5 ({})", sm.version)));
        }
        if sm.version >= 5 {
            sm.address_size = c.read_u8()?;
            let segment_selector_size = c.read_u8()?;
            if segment_selector_size != 0 {
                return Err(Error::Unsupported(format!(
                    "segment selector size {segment_selector_size} in line program"
                )));
            }
        } else {
            sm.address_size = self.addr_kind.digits() as u8 / 2;
        }

        let header_length = if is_64 { c.read_u64()? } else { c.read_u32()? as u64 };
        let lines_start = c.offset() + header_length as usize;

        sm.minimum_instruction_length = c.read_u8()?;
        sm.maximum_operations_per_instruction = if sm.version >= 4 { c.read_u8()? } else { 1 };
        if sm.maximum_operations_per_instruction == 0 {
            return Err(Error::Malformed("zero operations per instruction".into()));
        }
        if c.read_u8()? != 0 {
            sm.flags |= LineFlags::IS_STMT;
        }
        sm.line_base = c.read_i8()? as i64;
        sm.line_range = c.read_u8()?;
        if sm.line_range == 0 {
            return Err(Error::Malformed("zero line range".into()));
        }
        sm.opcode_base = c.read_u8()?;
        if sm.opcode_base == 0 {
            return Err(Error::Malformed("zero opcode base".into()));
        }
        // operand counts of the standard opcodes; kept only to skip them
        c.read_slice(sm.opcode_base as usize - 1)?;

        self.read_directories(c, &mut sm, is_64)?;
        self.read_files(c, &mut sm, &mut cu, out, is_64)?;

        c.move_to(lines_start)?;
        if c.offset() < end {
            self.run(c, &mut sm, &mut cu, out, end)?;
        }

        out.add_unit(cu);
        c.move_to(end)?;
        Ok(())
    }

    /// Interpret opcodes until the end-of-sequence marker.
    fn run(
        &self,
        c: &mut Cursor<'a>,
        sm: &mut StateMachine,
        cu: &mut CompilationUnit,
        out: &mut DebugLine,
        end: usize,
    ) -> Result<()> {
        while !sm.end_sequence {
            if c.offset() >= end {
                return Err(Error::Malformed("endless debug line opcode program".into()));
            }
            let opcode = c.read_u8()?;

            if opcode >= sm.opcode_base {
                // special opcode: advance both address and line, emit
                let adjusted = (opcode - sm.opcode_base) as u64;
                sm.advance_line(sm.line_base + (adjusted % sm.line_range as u64) as i64);
                sm.advance_pc(adjusted / sm.line_range as u64);
                sm.record(cu)?;
                continue;
            }

            match opcode {
                DW_LNS_COPY => sm.record(cu)?,
                DW_LNS_ADVANCE_PC => {
                    let adv = c.read_uleb128()?;
                    sm.advance_pc(adv);
                }
                DW_LNS_ADVANCE_LINE => {
                    let adv = c.read_sleb128()?;
                    sm.advance_line(adv);
                }
                DW_LNS_SET_FILE => sm.file = c.read_uleb128()?,
                DW_LNS_SET_COLUMN => sm.column = c.read_uleb128()? as u32,
                DW_LNS_NEGATE_STMT => sm.flags.toggle(LineFlags::IS_STMT),
                DW_LNS_SET_BASIC_BLOCK => sm.flags |= LineFlags::BASIC_BLOCK,
                DW_LNS_CONST_ADD_PC => {
                    sm.advance_pc((255 - sm.opcode_base) as u64 / sm.line_range as u64);
                }
                DW_LNS_FIXED_ADVANCE_PC => {
                    let adv = c.read_u16()?;
                    sm.address += adv as u64;
                    sm.op_index = 0;
                }
                DW_LNS_SET_PROLOGUE_END => sm.flags |= LineFlags::PROLOGUE_END,
                DW_LNS_SET_EPILOGUE_BEGIN => sm.flags |= LineFlags::EPILOGUE_BEGIN,
                DW_LNS_SET_ISA => sm.isa = c.read_uleb128()? as u32,

                0 => {
                    let length = c.read_uleb128()? as usize;
                    let ext_end = c.offset() + length;
                    let sub = c.read_u8()?;
                    match sub {
                        DW_LNE_END_SEQUENCE => {
                            sm.record(cu)?;
                            sm.end_sequence = true;
                        }
                        DW_LNE_SET_ADDRESS => sm.address = self.read_address(c, sm)?,
                        DW_LNE_DEFINE_FILE => {
                            let name = c.read_cstr()?;
                            let dir = c.read_uleb128()?;
                            let date = c.read_uleb128()?;
                            let size = c.read_uleb128()?;
                            let path = sm.resolve_path(name, dir)?;
                            cu.add_file(out.intern(path, date, size));
                        }
                        DW_LNE_SET_DISCRIMINATOR => {
                            sm.discriminator = c.read_uleb128()? as u32;
                        }
                        _ => {
                            return Err(Error::Malformed(format!(
                                "invalid debug line extended opcode {sub}"
                            )));
                        }
                    }
                    // the declared length wins over what was consumed
                    c.move_to(ext_end)?;
                }

                _ => {
                    return Err(Error::Malformed(format!(
                        "invalid debug line standard opcode {opcode}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn read_directories(&self, c: &mut Cursor<'a>, sm: &mut StateMachine, is_64: bool) -> Result<()> {
        if sm.version < 5 {
            // null-terminated strings, empty string terminates; entry 0 is
            // implicitly the compilation directory
            sm.directories.push(".".into());
            loop {
                let s = c.read_cstr()?;
                if s.is_empty() {
                    return Ok(());
                }
                sm.directories.push(s.into());
            }
        }

        let formats = self.read_entry_formats(c)?;
        let count = c.read_uleb128()?;
        for _ in 0..count {
            let mut dir = String::from("");
            for &(content, form) in &formats {
                match content {
                    DW_LNCT_PATH => dir = self.read_string(c, form, is_64)?,
                    _ => {
                        return Err(Error::Unsupported(format!(
                            "unsupported directory entry content type {content:#x}"
                        )));
                    }
                }
            }
            sm.directories.push(dir);
        }
        Ok(())
    }

    fn read_files(
        &self,
        c: &mut Cursor<'a>,
        sm: &mut StateMachine,
        cu: &mut CompilationUnit,
        out: &mut DebugLine,
        is_64: bool,
    ) -> Result<()> {
        if sm.version < 5 {
            // (name, dir, mtime, size) records, empty name terminates
            loop {
                let name = c.read_cstr()?;
                if name.is_empty() {
                    return Ok(());
                }
                let dir = c.read_uleb128()?;
                let date = c.read_uleb128()?;
                let size = c.read_uleb128()?;
                let path = sm.resolve_path(name, dir)?;
                cu.add_file(out.intern(path, date, size));
            }
        }

        let formats = self.read_entry_formats(c)?;
        let count = c.read_uleb128()?;
        for _ in 0..count {
            let mut name = String::new();
            let mut dir = String::from(".");
            for &(content, form) in &formats {
                match content {
                    DW_LNCT_PATH => name = self.read_string(c, form, is_64)?,
                    DW_LNCT_DIRECTORY_INDEX => {
                        let index = match form {
                            DW_FORM_UDATA => c.read_uleb128()?,
                            _ => {
                                return Err(Error::Unsupported(format!(
                                    "unsupported directory index form {form:#x}"
                                )));
                            }
                        };
                        dir = sm
                            .directories
                            .get(index as usize)
                            .cloned()
                            .ok_or_else(|| {
                                Error::Malformed(format!("directory index {index} out of range"))
                            })?;
                    }
                    _ => {
                        return Err(Error::Unsupported(format!(
                            "unsupported file entry content type {content:#x}"
                        )));
                    }
                }
            }
            if !name.is_empty() {
                let path = Path::new(&dir).join(name);
                cu.add_file(out.intern(path, 0, 0));
            }
        }
        Ok(())
    }

    /// The `(content type, form)` pairs describing one DWARF 5 entry.
    fn read_entry_formats(&self, c: &mut Cursor<'a>) -> Result<Vec<(u64, u64)>> {
        let count = c.read_u8()?;
        if count == 0 {
            return Err(Error::Malformed("missing directory/file entry format".into()));
        }
        let mut formats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let content = c.read_uleb128()?;
            let form = c.read_uleb128()?;
            formats.push((content, form));
        }
        Ok(formats)
    }

    /// A string in one of the three supported forms: inline, or an offset
    /// into `.debug_str` / `.debug_line_str`.
    fn read_string(&self, c: &mut Cursor<'a>, form: u64, is_64: bool) -> Result<String> {
        match form {
            DW_FORM_STRING => Ok(c.read_cstr()?.into()),
            DW_FORM_STRP => self.indirect_string(c, self.str_buf, ".debug_str", is_64),
            DW_FORM_LINE_STRP => {
                self.indirect_string(c, self.line_str_buf, ".debug_line_str", is_64)
            }
            _ => Err(Error::Unsupported(format!("unsupported string form {form:#x}"))),
        }
    }

    fn indirect_string(
        &self,
        c: &mut Cursor<'a>,
        buf: Option<Buffer<'a>>,
        section: &str,
        is_64: bool,
    ) -> Result<String> {
        let offset = if is_64 { c.read_u64()? } else { c.read_u32()? as u64 };
        let buf = buf.ok_or_else(|| {
            Error::Malformed(format!("string reference without a {section} section"))
        })?;
        Ok(buf.cstr(offset as usize)?.into())
    }

    /// Target-width address operand of `DW_LNE_set_address`.
    fn read_address(&self, c: &mut Cursor<'a>, sm: &StateMachine) -> Result<u64> {
        match sm.address_size {
            2 => Ok(c.read_u16()? as u64),
            4 => Ok(c.read_u32()? as u64),
            8 => c.read_u64(),
            n => Err(Error::Unsupported(format!("address size {n} in line program"))),
        }
    }
}

/// Registers of the line-number virtual machine, plus the header fields
/// that parameterize the opcodes.
struct StateMachine {
    version: u16,
    address: u64,
    op_index: u32,
    file: u64,
    line: u32,
    column: u32,
    isa: u32,
    discriminator: u32,
    flags: LineFlags,
    end_sequence: bool,
    line_base: i64,
    line_range: u8,
    opcode_base: u8,
    minimum_instruction_length: u8,
    maximum_operations_per_instruction: u8,
    address_size: u8,
    directories: Vec<String>,
}

impl StateMachine {
    fn new() -> StateMachine {
        StateMachine {
            version: 0,
            address: 0,
            op_index: 0,
            file: 1,
            line: 1,
            column: 0,
            isa: 0,
            discriminator: 0,
            flags: LineFlags::empty(),
            end_sequence: false,
            line_base: 0,
            line_range: 1,
            opcode_base: 1,
            minimum_instruction_length: 1,
            maximum_operations_per_instruction: 1,
            address_size: 4,
            directories: Vec::new(),
        }
    }

    fn advance_pc(&mut self, advance: u64) {
        if self.maximum_operations_per_instruction == 1 {
            self.address += self.minimum_instruction_length as u64 * advance;
        } else {
            let max_ops = self.maximum_operations_per_instruction as u64;
            let total = self.op_index as u64 + advance;
            self.address += self.minimum_instruction_length as u64 * (total / max_ops);
            self.op_index = (total % max_ops) as u32;
        }
    }

    fn advance_line(&mut self, advance: i64) {
        self.line = (self.line as i64 + advance) as u32;
    }

    /// Emit a row and reset the per-row registers.
    fn record(&mut self, cu: &mut CompilationUnit) -> Result<()> {
        if self.file == 0 || self.file as usize > cu.files().len() {
            return Err(Error::Malformed(format!("file index {} out of range", self.file)));
        }
        let file = cu.files()[self.file as usize - 1];
        cu.add_row(LineRow {
            addr: self.address,
            file,
            line: self.line,
            column: self.column,
            flags: self.flags,
            isa: self.isa,
            discriminator: self.discriminator,
            op_index: self.op_index,
        });
        self.flags &= !(LineFlags::BASIC_BLOCK | LineFlags::PROLOGUE_END | LineFlags::EPILOGUE_BEGIN);
        self.discriminator = 0;
        Ok(())
    }

    /// Path of a file entry given its directory index.
    fn resolve_path(&self, name: &str, dir: u64) -> Result<PathBuf> {
        let dir = self
            .directories
            .get(dir as usize)
            .ok_or_else(|| Error::Malformed(format!("directory index {dir} out of range")))?;
        Ok(Path::new(dir).join(name))
    }
}
