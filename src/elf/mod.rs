//! ELF file support, both 32- and 64-bit, little- or big-endian, behind a
//! single [`ElfFile`] type. Based on the Tool Interface Standard, ELF
//! Specification v1.2. Quick reference: https://gist.github.com/x0nu11byt3/bcb35c3de461e5fb66173071a2379779
//!
//! An ELF file starts with a fixed header giving the machine, the entry
//! point and the location of two tables:
//! * Program headers describe segments, the units the OS loader maps into
//!   memory (PT_LOAD), plus dynamic-linking and note metadata.
//! * Section headers describe sections, the units the static linker works
//!   with: symbol tables, string tables, relocations, debug info.
//!
//! Everything below the header is loaded lazily and cached on the file.
pub mod dynamic;
pub mod file;
pub mod notes;
pub mod sections;
pub mod segments;
pub mod symbols;

pub use dynamic::*;
pub use file::*;
pub use notes::*;
pub use sections::*;
pub use segments::*;
pub use symbols::*;
