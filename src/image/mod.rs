//! Program-execution images: the memory layout a loader would produce for
//! a program, built either by the trivial copier or by the Unix-like
//! builder that also resolves dynamic libraries and seeds a stack.
pub mod simple;
pub mod unix;

pub use simple::SimpleBuilder;
pub use unix::UnixBuilder;

use crate::base::{Buffer, Encoding};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// An auxiliary-vector entry, the `(type, value)` pairs the Unix System V
/// ABI places on the initial stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Auxiliary {
    pub kind: u32,
    pub value: u32,
}

/// Knobs of the image builders. The plain defaults build a 4 KB stack,
/// no arguments and no extra search paths.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Command-line arguments, one string per entry.
    pub arg: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Whether to synthesize an initial stack.
    pub stack_alloc: bool,
    /// Place the stack top at `stack_addr` instead of the default.
    pub stack_at: bool,
    pub stack_addr: u64,
    /// Stack size in bytes.
    pub stack_size: usize,
    /// Extra library directories, searched after `LD_LIBRARY_PATH`.
    pub paths: Vec<PathBuf>,
    /// Further library directories, searched after `paths`.
    pub lib_paths: Vec<PathBuf>,
    /// Prefix applied to every library path lookup.
    pub sys_root: Option<PathBuf>,
    /// Linux behavior: `$ORIGIN` expansion and `/lib` as a default root.
    pub is_linux: bool,
    /// Skip the default `/lib` and `/usr/lib` roots.
    pub no_default_path: bool,
    /// Allocation alignment of library base addresses.
    pub page_size: u64,
    /// Auxiliary vector placed on the stack.
    pub auxv: Vec<Auxiliary>,
}

impl Default for Parameter {
    fn default() -> Parameter {
        Parameter {
            arg: Vec::new(),
            env: Vec::new(),
            stack_alloc: true,
            stack_at: false,
            stack_addr: 0,
            stack_size: 1 << 12,
            paths: Vec::new(),
            lib_paths: Vec::new(),
            sys_root: None,
            is_linux: false,
            no_default_path: false,
            page_size: 4 * 1024,
            auxv: Vec::new(),
        }
    }
}

impl Parameter {
    /// Value of an environment variable in the builder's `env`.
    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|e| {
            e.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// A file mapped into an image and the base address it got.
#[derive(Clone, Debug)]
pub struct ImageLink {
    pub path: PathBuf,
    pub base: u64,
}

/// One region of an image. The bytes are owned by the segment and are
/// already zero-filled to the in-memory size of their source.
#[derive(Debug)]
pub struct ImageSegment {
    name: String,
    base: u64,
    bytes: Vec<u8>,
    writable: bool,
    executable: bool,
    link: Option<usize>,
}

impl ImageSegment {
    pub(crate) fn new(
        name: Option<&str>,
        base: u64,
        bytes: Vec<u8>,
        writable: bool,
        executable: bool,
        link: Option<usize>,
    ) -> ImageSegment {
        let name = match name {
            Some(n) => n.to_string(),
            None => default_name(writable, executable).to_string(),
        };
        ImageSegment { name, base, bytes, writable, executable, link }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn buffer(&self, enc: Encoding) -> Buffer<'_> {
        Buffer::new(enc, &self.bytes)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Index into [`Image::links`] of the file the segment came from;
    /// `None` for synthesized memory such as the stack.
    pub fn link(&self) -> Option<usize> {
        self.link
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.base + self.bytes.len() as u64
    }
}

/// Name of a segment that was not given one, from its access class.
fn default_name(writable: bool, executable: bool) -> &'static str {
    if executable {
        "code"
    } else if writable {
        "data"
    } else {
        "rodata"
    }
}

/// A built image: the involved files in load order and the memory
/// segments, plus the initial stack-pointer outputs when a stack was
/// requested.
#[derive(Debug, Default)]
pub struct Image {
    links: Vec<ImageLink>,
    segments: Vec<ImageSegment>,
    sp: Option<u64>,
    sp_segment: Option<usize>,
}

impl Image {
    pub(crate) fn new(program: &Path) -> Image {
        let mut image = Image::default();
        image.links.push(ImageLink { path: program.to_path_buf(), base: 0 });
        image
    }

    /// The program link, always first.
    pub fn program(&self) -> &ImageLink {
        &self.links[0]
    }

    pub fn links(&self) -> &[ImageLink] {
        &self.links
    }

    pub fn segments(&self) -> &[ImageSegment] {
        &self.segments
    }

    /// Initial stack pointer, when a stack was built.
    pub fn sp(&self) -> Option<u64> {
        self.sp
    }

    /// Index of the stack segment, when a stack was built.
    pub fn sp_segment(&self) -> Option<usize> {
        self.sp_segment
    }

    /// The segment covering `addr`, if any.
    pub fn at(&self, addr: u64) -> Option<&ImageSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Read a null-terminated string out of the image memory.
    pub fn string_at(&self, addr: u64) -> Result<String> {
        let segment = self
            .at(addr)
            .ok_or_else(|| Error::Malformed(format!("unmapped address {addr:#x}")))?;
        let start = (addr - segment.base) as usize;
        let rest = &segment.bytes[start..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::Malformed(format!("unterminated string at {addr:#x}"))
        })?;
        String::from_utf8(rest[..end].to_vec())
            .map_err(|_| Error::Malformed(format!("non UTF-8 string at {addr:#x}")))
    }

    pub(crate) fn add_link(&mut self, path: PathBuf, base: u64) -> usize {
        self.links.push(ImageLink { path, base });
        self.links.len() - 1
    }

    pub(crate) fn set_base(&mut self, link: usize, base: u64) {
        self.links[link].base = base;
    }

    pub(crate) fn add_segment(&mut self, segment: ImageSegment) -> usize {
        self.segments.push(segment);
        self.segments.len() - 1
    }

    pub(crate) fn set_stack(&mut self, sp: u64, segment: usize) {
        self.sp = Some(sp);
        self.sp_segment = Some(segment);
    }
}
