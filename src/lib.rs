//! Parsing of executable and object-file binaries, primarily ELF in both
//! 32- and 64-bit classes, with secondary PE-COFF support. On top of the
//! parsers sit an image builder that lays a program and its dynamic
//! libraries out in memory the way a Unix loader would (including the
//! initial stack), and an interpreter for DWARF v2–v5 `.debug_line`
//! programs mapping code addresses back to source positions.
//!
//! The usual entry point is [`open`], which sniffs the magic bytes and
//! hands back a [`Binary`]; ELF-specific facilities are reached through
//! [`Binary::as_elf`].
//!
//! ```no_run
//! # fn main() -> loupe::Result<()> {
//! let file = loupe::open("/bin/true")?;
//! println!("{} for {}", file.kind(), file.machine());
//! for (name, sym) in file.symbols()?.iter() {
//!     println!("{name} = {:x}", sym.value);
//! }
//! # Ok(())
//! # }
//! ```
pub mod base;
pub mod binary;
pub mod dwarf;
pub mod elf;
pub mod error;
pub mod image;
pub mod pecoff;

pub use base::{AddressKind, Buffer, Cursor, Encoding};
pub use binary::{Binary, FileKind, SegmentView};
pub use dwarf::{DebugLine, LineFlags, LineRow};
pub use elf::ElfFile;
pub use error::{Error, Level, LogReporter, Reporter, Result};
pub use image::{Auxiliary, Image, ImageSegment, Parameter, SimpleBuilder, UnixBuilder};
pub use pecoff::PeFile;

use std::io::Read;
use std::path::Path;

/// Open an executable file of any supported format, deciding by the first
/// four bytes: ELF, then TI COFF, then PE-COFF.
pub fn open(path: impl AsRef<Path>) -> Result<Binary> {
    let path = path.as_ref();
    let mut magic = [0u8; 4];
    let mut file = std::fs::File::open(path)?;
    let got = file.read(&mut magic)?;
    drop(file);
    if got < magic.len() {
        return Err(Error::BadMagic("does not seem to be a binary"));
    }

    if magic == elf::ELF_MAGIC {
        return Ok(Binary::Elf(ElfFile::open(path)?));
    }
    if (magic[0] == 0xc1 || magic[0] == 0xc2) && magic[1] == 0x00 {
        // TI COFF is recognized but handled by an external toolchain
        return Err(Error::Unsupported("TI COFF files are not supported".into()));
    }
    if magic[..2] == pecoff::MZ_MAGIC {
        return Ok(Binary::PeCoff(PeFile::open(path)?));
    }
    Err(Error::UnknownFormat(magic))
}

/// Open a file that must be ELF, dispatching on its class byte.
pub fn open_elf(path: impl AsRef<Path>) -> Result<ElfFile> {
    ElfFile::open(path)
}
