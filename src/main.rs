//! `loupe`: inspect executable binaries and the images they would run as.
//! One subcommand per surface of the library, each a thin printer over it.
use clap::{Parser, Subcommand};
use loupe::elf::{self, SegmentKind};
use loupe::{Binary, Error, Parameter, Result};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "loupe", version, about = "Inspect executable binaries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Display the file header: kind, machine, endianness, entry point
    File {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the program headers of ELF files
    Prog {
        /// Dump the content of PT_NOTE headers
        #[arg(short = 'n')]
        notes: bool,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the section table of ELF files
    Sect {
        /// Find the section containing the given hex address
        #[arg(short = 'f', value_parser = parse_addr)]
        find: Option<u64>,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the loadable segments
    Seg {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the symbol table
    Sym {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the dynamic entries of ELF files
    Dyn {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Build and dump the execution image
    Im {
        /// Do not initialize any stack
        #[arg(short = 's')]
        no_stack: bool,
        /// Do not display the content of the segments
        #[arg(short = 'c')]
        no_content: bool,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Display source line information
    Line {
        /// List address to file:line instead of file:line to addresses
        #[arg(short = 'c')]
        code: bool,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).map_err(|e| format!("bad address {s}: {e}"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("ERROR: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::File { paths } => for_each(&paths, file_info),
        Command::Prog { notes, paths } => for_each(&paths, |f| prog_info(f, notes)),
        Command::Sect { find, paths } => for_each(&paths, |f| sect_info(f, find)),
        Command::Seg { paths } => for_each(&paths, seg_info),
        Command::Sym { paths } => for_each(&paths, sym_info),
        Command::Dyn { paths } => for_each(&paths, dyn_info),
        Command::Im { no_stack, no_content, paths } => {
            for_each(&paths, |f| im_info(f, no_stack, no_content))
        }
        Command::Line { code, paths } => for_each(&paths, |f| line_info(f, code)),
    }
}

fn for_each(paths: &[PathBuf], mut show: impl FnMut(&Binary) -> Result<()>) -> Result<()> {
    for path in paths {
        let file = loupe::open(path)?;
        if paths.len() > 1 {
            println!("FILE: {}", path.display());
        }
        show(&file)?;
    }
    Ok(())
}

fn file_info(file: &Binary) -> Result<()> {
    println!("file name = {}", file.path().display());
    println!("type = {}", file.kind());
    println!("machine = {}", file.machine());
    println!("os = {}", file.os());
    println!(
        "endianness = {}",
        if file.is_big_endian() { "big" } else { "little" }
    );
    println!("entry = {}", file.format_addr(file.entry()));
    if let Some(elf) = file.as_elf() {
        println!("class = {:?}", elf.class());
        println!("version = {}", elf.version());
        println!("flags = {:#x}", elf.flags());
    }
    Ok(())
}

fn require_elf(file: &Binary) -> Result<&loupe::ElfFile> {
    file.as_elf()
        .ok_or_else(|| Error::Unsupported("not an ELF file".into()))
}

fn prog_info(file: &Binary, notes: bool) -> Result<()> {
    let elf = require_elf(file)?;
    println!("INDEX TYPE       OFFSET   VADDR    PADDR    FILESZ   MEMSZ    ALIGN    FLAGS");
    for ph in elf.program_headers()? {
        println!(
            "{:5} {:10} {} {} {} {} {} {} {}",
            ph.index(),
            ph.kind().name(),
            file.format_addr(ph.offset()),
            file.format_addr(ph.vaddr()),
            file.format_addr(ph.paddr()),
            file.format_addr(ph.filesz()),
            file.format_addr(ph.memsz()),
            file.format_addr(ph.align()),
            ph.flags_string(),
        );
    }
    if notes {
        for ph in elf.program_headers()? {
            if ph.kind() != SegmentKind::Note {
                continue;
            }
            for note in elf.notes(ph)? {
                let note = note?;
                println!("NOTE {}: {}", note.name, note.ntype);
                hex_dump(note.desc, 0);
            }
        }
    }
    Ok(())
}

fn sect_info(file: &Binary, find: Option<u64>) -> Result<()> {
    let elf = require_elf(file)?;
    if let Some(addr) = find {
        for section in elf.sections()? {
            if section.contains(addr) {
                println!(
                    "address {} found in section {}",
                    file.format_addr(addr),
                    elf.section_name(section)?
                );
                return Ok(());
            }
        }
        return Err(Error::Malformed(format!(
            "no section containing address {}",
            file.format_addr(addr)
        )));
    }
    println!("INDEX TYPE          FLAGS VADDR    SIZE     OFFSET   LINK  NAME");
    for section in elf.sections()? {
        println!(
            "{:5} {:13} {:5} {} {} {} {:5} {}",
            section.index(),
            section.kind().name(),
            section.flags_string(),
            file.format_addr(section.addr()),
            file.format_addr(section.size()),
            file.format_addr(section.offset()),
            section.link(),
            elf.section_name(section)?,
        );
    }
    Ok(())
}

fn seg_info(file: &Binary) -> Result<()> {
    println!("NAME     BASE     LOAD     SIZE     ALIGN    FLAGS");
    for view in file.segment_views()? {
        let mut flags = String::new();
        if view.writable {
            flags.push('W');
        }
        if view.executable {
            flags.push('X');
        }
        println!(
            "{:8} {} {} {} {} {}",
            view.name,
            file.format_addr(view.base_address),
            file.format_addr(view.load_address),
            file.format_addr(view.size),
            file.format_addr(view.alignment),
            flags,
        );
    }
    Ok(())
}

fn sym_info(file: &Binary) -> Result<()> {
    println!("VALUE    SIZE     BINDING TYPE  NAME");
    for sym in file.symbols()?.sorted() {
        println!(
            "{} {} {:7} {:5} {}",
            file.format_addr(sym.value),
            file.format_addr(sym.size),
            sym.bind_name(),
            sym.kind_name(),
            sym.name,
        );
    }
    Ok(())
}

fn dyn_info(file: &Binary) -> Result<()> {
    let elf = require_elf(file)?;
    let arch = elf::arch_dyn(elf.machine_code());
    let strtab = elf
        .sections()?
        .iter()
        .find(|s| s.kind() == elf::SectionKind::Dynamic)
        .map(|s| s.link() as usize);
    for entry in elf.dyns()? {
        let name = elf::tag_name(entry.tag)
            .map(str::to_string)
            .or_else(|| arch.and_then(|a| a.tag_name(entry.tag)).map(str::to_string))
            .unwrap_or_else(|| format!("{:#x}", entry.tag));
        let value = match entry.tag {
            elf::DT_NEEDED | elf::DT_SONAME | elf::DT_RPATH | elf::DT_RUNPATH => match strtab {
                Some(strtab) => elf.string_at_in(entry.value, strtab)?.to_string(),
                None => format!("{:#x}", entry.value),
            },
            tag if elf::tag_is_address(tag) => file.format_addr(entry.value),
            tag => match arch.and_then(|a| a.format_value(tag, entry.value)) {
                Some(formatted) => formatted,
                None => entry.value.to_string(),
            },
        };
        println!("{name:16} {value}");
    }
    Ok(())
}

fn im_info(file: &Binary, no_stack: bool, no_content: bool) -> Result<()> {
    let params = Parameter {
        stack_alloc: !no_stack,
        ..Parameter::default()
    };
    let image = file.make(&params)?;
    for segment in image.segments() {
        print!(
            "BLOCK {} @ {} ({:#x})",
            segment.name(),
            file.format_addr(segment.base()),
            segment.size(),
        );
        if segment.is_writable() {
            print!(" WRITE");
        }
        if segment.is_executable() {
            print!(" EXEC");
        }
        println!();
        if !no_content {
            hex_dump(segment.bytes(), segment.base());
            println!();
        }
    }
    if let Some(sp) = image.sp() {
        println!("initial sp = {}", file.format_addr(sp));
    }
    Ok(())
}

fn line_info(file: &Binary, code: bool) -> Result<()> {
    let lines = file.debug_lines()?;
    if code {
        for unit in lines.units() {
            let rows = unit.rows();
            for row in rows.iter().take(rows.len().saturating_sub(1)) {
                println!(
                    "{}\t{}:{}",
                    file.format_addr(row.addr),
                    lines.source(row.file).path().display(),
                    row.line,
                );
            }
        }
    } else {
        for (id, source) in lines.sources() {
            let mut by_line: Vec<(u32, u64, u64)> = Vec::new();
            for &ui in source.units() {
                let rows = lines.units()[ui].rows();
                for pair in rows.windows(2) {
                    if pair[0].file == id {
                        by_line.push((pair[0].line, pair[0].addr, pair[1].addr));
                    }
                }
            }
            by_line.sort();
            for (line, start, end) in by_line {
                println!(
                    "{}:{}\t{}-{}",
                    source.path().display(),
                    line,
                    file.format_addr(start),
                    file.format_addr(end),
                );
            }
        }
    }
    Ok(())
}

/// Sixteen bytes per row with an ASCII gutter.
fn hex_dump(bytes: &[u8], base: u64) {
    for (i, row) in bytes.chunks(16).enumerate() {
        print!("{:08x}", base + (i * 16) as u64);
        for b in row {
            print!(" {b:02x}");
        }
        for _ in row.len()..16 {
            print!("   ");
        }
        print!("\t");
        for b in row {
            let ch = *b as char;
            print!("{}", if ch.is_ascii_graphic() { ch } else { '.' });
        }
        println!();
    }
}
