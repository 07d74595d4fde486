//! Image builder mimicking the dynamic loader of a Unix OS: maps the
//! program and every needed library at page-aligned bases, interprets the
//! dynamic entries, and seeds the initial stack the way a System V ABI
//! loader hands it to the process.
use crate::elf::{
    DT_BIND_NOW, DT_DEBUG, DT_FINI, DT_HASH, DT_INIT, DT_JMPREL, DT_NEEDED, DT_PLTGOT, DT_REL,
    DT_RPATH, DT_RUNPATH, DT_STRSZ, DT_STRTAB, DT_SYMBOLIC, DT_SYMENT, DT_SYMTAB, DT_TEXTREL,
    Dyn, DynIter, ElfFile, SegmentKind,
};
use crate::error::{Error, Level, LogReporter, Reporter, Result};
use crate::image::{Image, ImageSegment, Parameter};
use bitflags::bitflags;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

static LOG: LogReporter = LogReporter;

bitflags! {
    /// Flag-like dynamic tags of a unit.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DynFlags: u8 {
        const SYMBOLIC = 0x01;
        const TEXTREL = 0x02;
        const BIND_NOW = 0x04;
    }
}

/// Addresses and sizes extracted from a unit's dynamic section.
#[derive(Debug, Default)]
struct DynInfo {
    strtab: Option<u64>,
    strsz: Option<u64>,
    symtab: Option<u64>,
    syment: Option<u64>,
    hash: Option<u64>,
    pltgot: Option<u64>,
    init: Option<u64>,
    fini: Option<u64>,
    debug: Option<u64>,
    rel: Option<u64>,
    jmprel: Option<u64>,
    flags: DynFlags,
}

impl DynInfo {
    /// One-line rendering for the loader's verbose output.
    fn summary(&self) -> String {
        let fields = [
            ("strtab", self.strtab),
            ("strsz", self.strsz),
            ("symtab", self.symtab),
            ("syment", self.syment),
            ("hash", self.hash),
            ("pltgot", self.pltgot),
            ("init", self.init),
            ("fini", self.fini),
            ("debug", self.debug),
            ("rel", self.rel),
            ("jmprel", self.jmprel),
        ];
        let mut parts: Vec<String> = fields
            .iter()
            .filter_map(|(name, v)| v.map(|v| format!("{name}={v:#x}")))
            .collect();
        if !self.flags.is_empty() {
            parts.push(format!("{:?}", self.flags));
        }
        if parts.is_empty() {
            parts.push("static".to_string());
        }
        parts.join(" ")
    }
}

/// A program or library while the image is being assembled.
struct Unit<'a> {
    path: PathBuf,
    file: UnitFile<'a>,
    base: u64,
    link: usize,
    dynamic: Option<usize>,
    rpaths: Vec<PathBuf>,
    needed: Vec<usize>,
    info: DynInfo,
}

enum UnitFile<'a> {
    Program(&'a ElfFile),
    Library(Box<ElfFile>),
}

impl UnitFile<'_> {
    fn get(&self) -> &ElfFile {
        match self {
            UnitFile::Program(f) => f,
            UnitFile::Library(f) => f,
        }
    }
}

impl<'a> Unit<'a> {
    fn program(file: &'a ElfFile) -> Unit<'a> {
        Unit {
            path: file.path().to_path_buf(),
            file: UnitFile::Program(file),
            base: 0,
            link: 0,
            dynamic: None,
            rpaths: Vec::new(),
            needed: Vec::new(),
            info: DynInfo::default(),
        }
    }

    fn library(path: PathBuf, file: ElfFile) -> Unit<'a> {
        Unit {
            path,
            file: UnitFile::Library(Box::new(file)),
            base: 0,
            link: 0,
            dynamic: None,
            rpaths: Vec::new(),
            needed: Vec::new(),
            info: DynInfo::default(),
        }
    }
}

/// The Unix-like image builder. Only ELF programs are accepted.
pub struct UnixBuilder<'a> {
    prog: &'a ElfFile,
    params: &'a Parameter,
    reporter: &'a dyn Reporter,
    ld_paths: Vec<PathBuf>,
}

impl<'a> UnixBuilder<'a> {
    pub fn new(prog: &'a ElfFile, params: &'a Parameter) -> UnixBuilder<'a> {
        // LD_LIBRARY_PATH is split from the builder's environment once
        let ld_paths = params
            .getenv("LD_LIBRARY_PATH")
            .map(|v| v.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect())
            .unwrap_or_default();
        UnixBuilder { prog, params, reporter: &LOG, ld_paths }
    }

    /// Route diagnostics somewhere other than the default log.
    pub fn with_reporter(mut self, reporter: &'a dyn Reporter) -> UnixBuilder<'a> {
        self.reporter = reporter;
        self
    }

    fn warn(&self, message: &str) {
        self.reporter.report(Level::Warning, message);
    }

    /// Assemble the image: map each unit in discovery order, resolve its
    /// dynamic dependencies (which may enqueue more units), then build the
    /// stack.
    pub fn build(&self) -> Result<Image> {
        let mut image = Image::new(self.prog.path());
        let mut units: Vec<Unit<'a>> = vec![Unit::program(self.prog)];
        let mut by_path: HashMap<PathBuf, usize> = HashMap::new();

        let mut next_base = 0u64;
        let mut current = 0;
        while current < units.len() {
            next_base = self.map_unit(&mut units, current, next_base, &mut image)?;
            self.resolve_dynamic(&mut units, current, &mut image, &mut by_path)?;
            let unit = &units[current];
            tracing::debug!(
                "{} at {:#x}: {} needed, {} rpaths, {}",
                unit.path.display(),
                unit.base,
                unit.needed.len(),
                unit.rpaths.len(),
                unit.info.summary()
            );
            current += 1;
        }

        self.build_stack(&mut image)?;
        Ok(image)
    }

    /// Map every `PT_LOAD` of the unit at `base` and return the next free
    /// page-aligned base address.
    fn map_unit(
        &self,
        units: &mut [Unit<'a>],
        index: usize,
        base: u64,
        image: &mut Image,
    ) -> Result<u64> {
        let unit = &mut units[index];
        unit.base = base;
        unit.link = if index == 0 {
            image.set_base(0, base);
            0
        } else {
            image.add_link(unit.path.clone(), base)
        };

        let file = unit.file.get();
        let mut top = base;
        for ph in file.program_headers()? {
            match ph.kind() {
                SegmentKind::Load => {
                    let bytes = ph.content(file)?.bytes().to_vec();
                    image.add_segment(ImageSegment::new(
                        None,
                        base + ph.vaddr(),
                        bytes,
                        ph.is_writable(),
                        ph.is_executable(),
                        Some(unit.link),
                    ));
                    top = top.max(base + ph.vaddr() + ph.memsz());
                }
                SegmentKind::Dynamic => unit.dynamic = Some(ph.index()),
                SegmentKind::Null
                | SegmentKind::Interpreter
                | SegmentKind::Note
                | SegmentKind::Shlib
                | SegmentKind::Phdr => {}
                other => {
                    self.warn(&format!(
                        "{}: ignoring segment of type {}",
                        unit.path.display(),
                        other.name()
                    ));
                }
            }
        }
        Ok(round_up(top, self.params.page_size))
    }

    /// Interpret the dynamic section of a mapped unit: extract the static
    /// attributes, expand `DT_RPATH`, and resolve every `DT_NEEDED` to a
    /// unit, loading it if it is new.
    fn resolve_dynamic(
        &self,
        units: &mut Vec<Unit<'a>>,
        index: usize,
        image: &mut Image,
        by_path: &mut HashMap<PathBuf, usize>,
    ) -> Result<()> {
        let (entries, base, origin) = {
            let unit = &units[index];
            let Some(ph_index) = unit.dynamic else {
                return Ok(());
            };
            let file = unit.file.get();
            let ph = file.header_at(ph_index)?;
            let entries: Vec<Dyn> =
                DynIter::new(ph.content(file)?, file.class()).collect::<Result<_>>()?;
            let origin = unit.path.parent().map(|p| p.to_path_buf());
            (entries, unit.base, origin)
        };

        let mut info = DynInfo::default();
        for e in &entries {
            match e.tag {
                DT_STRTAB => info.strtab = Some(e.value),
                DT_STRSZ => info.strsz = Some(e.value),
                DT_SYMTAB => info.symtab = Some(e.value),
                DT_SYMENT => info.syment = Some(e.value),
                DT_HASH => info.hash = Some(e.value),
                DT_PLTGOT => info.pltgot = Some(e.value),
                DT_INIT => info.init = Some(e.value),
                DT_FINI => info.fini = Some(e.value),
                DT_DEBUG => info.debug = Some(e.value),
                DT_REL => info.rel = Some(e.value),
                DT_JMPREL => info.jmprel = Some(e.value),
                DT_SYMBOLIC => info.flags |= DynFlags::SYMBOLIC,
                DT_TEXTREL => info.flags |= DynFlags::TEXTREL,
                DT_BIND_NOW => info.flags |= DynFlags::BIND_NOW,
                _ => {}
            }
        }

        let mut rpaths = Vec::new();
        let mut needed = Vec::new();
        let wants_strings = entries
            .iter()
            .any(|e| matches!(e.tag, DT_NEEDED | DT_RPATH | DT_RUNPATH));
        match info.strtab {
            Some(strtab) => {
                // the string table is read out of the already-mapped image
                let strtab_addr = base + strtab;

                for e in &entries {
                    if matches!(e.tag, DT_RPATH | DT_RUNPATH) {
                        if info.strsz.is_some_and(|sz| e.value >= sz) {
                            return Err(Error::Malformed("bad offset in DT_RPATH entry".into()));
                        }
                        let value = image.string_at(strtab_addr + e.value)?;
                        for component in value.split(':').filter(|c| !c.is_empty()) {
                            rpaths.push(PathBuf::from(self.expand(component, origin.as_deref())));
                        }
                    }
                }

                for e in &entries {
                    if e.tag == DT_NEEDED {
                        if info.strsz.is_some_and(|sz| e.value >= sz) {
                            return Err(Error::Malformed("bad offset in DT_NEEDED entry".into()));
                        }
                        let name = image.string_at(strtab_addr + e.value)?;
                        match self.resolve(&name, &rpaths, units, by_path)? {
                            Some(found) => needed.push(found),
                            None => self.warn(&format!("cannot find dynamic library {name}")),
                        }
                    }
                }
            }
            None if wants_strings => {
                self.warn(&format!(
                    "{}: dynamic entries without DT_STRTAB",
                    units[index].path.display()
                ));
            }
            None => {}
        }

        let unit = &mut units[index];
        unit.info = info;
        unit.rpaths = rpaths;
        unit.needed = needed;
        Ok(())
    }

    /// Find a needed library under the Unix search algorithm. A name with
    /// a slash is a path; anything else walks the search directories.
    /// Units are keyed by absolute path, so a library needed twice is
    /// mapped once.
    fn resolve(
        &self,
        name: &str,
        rpaths: &[PathBuf],
        units: &mut Vec<Unit<'a>>,
        by_path: &mut HashMap<PathBuf, usize>,
    ) -> Result<Option<usize>> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if name.contains('/') {
            candidates.push(PathBuf::from(name));
        } else {
            let mut dirs: Vec<&Path> = Vec::new();
            dirs.extend(rpaths.iter().map(PathBuf::as_path));
            dirs.extend(self.ld_paths.iter().map(PathBuf::as_path));
            dirs.extend(self.params.paths.iter().map(PathBuf::as_path));
            dirs.extend(self.params.lib_paths.iter().map(PathBuf::as_path));
            if !self.params.no_default_path {
                if self.params.is_linux {
                    dirs.push(Path::new("/lib"));
                }
                dirs.push(Path::new("/usr/lib"));
            }
            for dir in dirs {
                candidates.push(dir.join(name));
            }
        }

        for candidate in candidates {
            let full = self.sysrooted(&candidate);
            let key = full.canonicalize().unwrap_or_else(|_| full.clone());
            if let Some(&existing) = by_path.get(&key) {
                return Ok(Some(existing));
            }
            if std::fs::File::open(&full).is_err() {
                continue;
            }
            let Some(file) = self.open_library(&full) else {
                continue;
            };
            let index = units.len();
            by_path.insert(key, index);
            units.push(Unit::library(full, file));
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Open a candidate library, discarding it when it does not parse or
    /// does not match the program's machine.
    fn open_library(&self, path: &Path) -> Option<ElfFile> {
        match ElfFile::open(path) {
            Ok(file) => {
                if file.machine_code() == self.prog.machine_code() {
                    Some(file)
                } else {
                    self.warn(&format!("library {}: bad machine", path.display()));
                    None
                }
            }
            Err(e) => {
                self.warn(&format!("loading library {}: {e}", path.display()));
                None
            }
        }
    }

    fn sysrooted(&self, path: &Path) -> PathBuf {
        match &self.params.sys_root {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }

    /// Expand `$ORIGIN`, `$LIB` and `$PLATFORM` (with or without braces)
    /// in a search-path component. Only done for Linux images; unexpanded
    /// tokens are kept verbatim and reported.
    fn expand(&self, component: &str, origin: Option<&Path>) -> String {
        if !self.params.is_linux {
            return component.to_string();
        }
        let mut out = String::new();
        let mut i = 0;
        while i < component.len() {
            let rest = &component[i..];
            if !rest.starts_with('$') {
                if let Some(ch) = rest.chars().next() {
                    out.push(ch);
                    i += ch.len_utf8();
                }
                continue;
            }
            let (name, token_len) = parse_token(rest);
            match name {
                "ORIGIN" => match origin {
                    Some(dir) => out.push_str(&dir.to_string_lossy()),
                    None => out.push('.'),
                },
                "LIB" => out.push_str("lib"),
                "PLATFORM" => {
                    self.warn("$PLATFORM is not supported");
                    out.push_str(&component[i..i + token_len]);
                }
                _ => {
                    self.warn(&format!(
                        "unknown dynamic loader variable in {component}"
                    ));
                    out.push_str(&component[i..i + token_len]);
                }
            }
            i += token_len;
        }
        out
    }

    /// Lay the initial stack out in a fresh writable segment:
    /// `argc`/`argv`/`envp` cells, the two pointer arrays, the auxiliary
    /// vector, then the string bytes, all at the high end. The stack
    /// pointer output points at `argc`.
    fn build_stack(&self, image: &mut Image) -> Result<()> {
        if !self.params.stack_alloc {
            return Ok(());
        }
        let params = self.params;
        let cell = size_of::<u32>();

        // layout, measured from the stack pointer
        let mut need = 3 * cell;
        let arg_array = need;
        need += (params.arg.len() + 1) * cell;
        let env_array = need;
        need += (params.env.len() + 1) * cell;
        let aux_array = need;
        need += (params.auxv.len() * 2 + 2) * cell;
        let arg_strings = need;
        need += params.arg.iter().map(|a| a.len() + 1).sum::<usize>();
        let env_strings = need;
        need += params.env.iter().map(|e| e.len() + 1).sum::<usize>();
        let initial = round_up(need as u64, cell as u64) as usize;

        let size = params.stack_size;
        if size < initial {
            return Err(Error::StackTooSmall);
        }

        let base = if params.stack_at {
            params.stack_addr.checked_sub(size as u64)
        } else {
            0x8000_0000u64.checked_sub(size as u64)
        }
        .ok_or_else(|| Error::Malformed("stack address below stack size".into()))?;
        let sp = base + (size - initial) as u64;

        let enc = self.prog.encoding();
        let mut bytes = vec![0u8; size];
        let top = size - initial;
        let put = |bytes: &mut Vec<u8>, at: usize, v: u32| {
            bytes[top + at..top + at + cell].copy_from_slice(&enc.unfix_u32(v).to_ne_bytes());
        };

        put(&mut bytes, 0, params.arg.len() as u32);
        put(&mut bytes, cell, (sp + arg_array as u64) as u32);
        put(&mut bytes, 2 * cell, (sp + env_array as u64) as u32);

        let mut at = arg_array;
        let mut p = (sp + arg_strings as u64) as u32;
        for arg in &params.arg {
            put(&mut bytes, at, p);
            at += cell;
            p += arg.len() as u32 + 1;
        }
        // zero terminator, then the environment array
        at = env_array;
        p = (sp + env_strings as u64) as u32;
        for env in &params.env {
            put(&mut bytes, at, p);
            at += cell;
            p += env.len() as u32 + 1;
        }

        at = aux_array;
        for aux in &params.auxv {
            put(&mut bytes, at, aux.kind);
            put(&mut bytes, at + cell, aux.value);
            at += 2 * cell;
        }

        at = arg_strings;
        for arg in &params.arg {
            bytes[top + at..top + at + arg.len()].copy_from_slice(arg.as_bytes());
            at += arg.len() + 1;
        }
        at = env_strings;
        for env in &params.env {
            bytes[top + at..top + at + env.len()].copy_from_slice(env.as_bytes());
            at += env.len() + 1;
        }

        let segment = image.add_segment(ImageSegment::new(
            Some("stack"),
            base,
            bytes,
            true,
            false,
            None,
        ));
        image.set_stack(sp, segment);
        Ok(())
    }
}

/// `$NAME` or `${NAME}` at the start of `s` (which begins with `$`):
/// the name and the byte length of the whole token.
fn parse_token(s: &str) -> (&str, usize) {
    let rest = &s[1..];
    if let Some(inner) = rest.strip_prefix('{') {
        match inner.find('}') {
            Some(end) => (&inner[..end], end + 3),
            None => (inner, s.len()),
        }
    } else {
        let end = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        (&rest[..end], end + 1)
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}
