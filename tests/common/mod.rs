//! Builders for synthesized binaries used by the integration tests. They
//! write just enough of each format to exercise the parsers without any
//! fixture files.
#![allow(dead_code)]

use loupe::elf::{ET_EXEC, SHT_NULL, SHT_STRTAB};
use std::path::PathBuf;

/// One section to place in a test ELF.
pub struct Sect {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub link: u32,
    pub entsize: u64,
    pub content: Vec<u8>,
}

impl Sect {
    pub fn new(name: &str, sh_type: u32, content: Vec<u8>) -> Sect {
        Sect {
            name: name.to_string(),
            sh_type,
            flags: 0,
            addr: 0,
            link: 0,
            entsize: 0,
            content,
        }
    }

    pub fn entsize(mut self, entsize: u64) -> Sect {
        self.entsize = entsize;
        self
    }

    pub fn link(mut self, link: u32) -> Sect {
        self.link = link;
        self
    }

    pub fn addr(mut self, addr: u64) -> Sect {
        self.addr = addr;
        self
    }

    pub fn flags(mut self, flags: u64) -> Sect {
        self.flags = flags;
        self
    }
}

/// One program header to place in a test ELF. The file size is the length
/// of `content`.
pub struct Phdr {
    pub p_type: u32,
    pub flags: u32,
    pub vaddr: u64,
    pub paddr: u64,
    pub memsz: u64,
    pub align: u64,
    pub content: Vec<u8>,
}

impl Phdr {
    pub fn new(p_type: u32, flags: u32, vaddr: u64, memsz: u64, content: Vec<u8>) -> Phdr {
        Phdr {
            p_type,
            flags,
            vaddr,
            paddr: vaddr,
            memsz,
            align: 0x1000,
            content,
        }
    }

    /// A physical (load) address distinct from the virtual one, as in
    /// ROM-staged segments.
    pub fn paddr(mut self, paddr: u64) -> Phdr {
        self.paddr = paddr;
        self
    }
}

/// Assembles a small but valid ELF image byte by byte.
pub struct TestElf {
    sixty_four: bool,
    big: bool,
    e_type: u16,
    machine: u16,
    entry: u64,
    sections: Vec<Sect>,
    phdrs: Vec<Phdr>,
}

impl TestElf {
    pub fn new32() -> TestElf {
        TestElf {
            sixty_four: false,
            big: false,
            e_type: ET_EXEC,
            machine: 3, // 386
            entry: 0,
            sections: Vec::new(),
            phdrs: Vec::new(),
        }
    }

    pub fn new64() -> TestElf {
        TestElf {
            sixty_four: true,
            machine: 62, // x86-64
            ..TestElf::new32()
        }
    }

    pub fn big_endian(mut self) -> TestElf {
        self.big = true;
        self
    }

    pub fn e_type(mut self, e_type: u16) -> TestElf {
        self.e_type = e_type;
        self
    }

    pub fn machine(mut self, machine: u16) -> TestElf {
        self.machine = machine;
        self
    }

    pub fn entry(mut self, entry: u64) -> TestElf {
        self.entry = entry;
        self
    }

    /// Section indices start at 1: index 0 is the reserved null entry.
    pub fn section(mut self, sect: Sect) -> TestElf {
        self.sections.push(sect);
        self
    }

    pub fn phdr(mut self, phdr: Phdr) -> TestElf {
        self.phdrs.push(phdr);
        self
    }

    fn w16(&self, out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&if self.big { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn w32(&self, out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&if self.big { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn w64(&self, out: &mut Vec<u8>, v: u64) {
        out.extend_from_slice(&if self.big { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    /// Address-width field: u32 in the 32-bit class, u64 in the 64-bit
    /// class.
    fn waddr(&self, out: &mut Vec<u8>, v: u64) {
        if self.sixty_four {
            self.w64(out, v);
        } else {
            self.w32(out, v as u32);
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let ehsize = if self.sixty_four { 64 } else { 52 };
        let phentsize = if self.sixty_four { 56 } else { 32 };
        let shentsize = if self.sixty_four { 64 } else { 40 };

        // the full section list: null entry, user sections, .shstrtab
        let mut names = vec![0u8]; // the empty name of the null entry
        let mut name_offsets = vec![0u32];
        for s in &self.sections {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(s.name.as_bytes());
            names.push(0);
        }
        let shstrtab_name = names.len() as u32;
        names.extend_from_slice(b".shstrtab");
        names.push(0);

        let have_sections = !self.sections.is_empty();
        let shnum = if have_sections { self.sections.len() + 2 } else { 0 };
        let shstrndx = if have_sections { shnum - 1 } else { 0 };

        // data layout: program contents, section contents, name table,
        // then the two header tables
        let mut offset = ehsize;
        let ph_offsets: Vec<usize> = self
            .phdrs
            .iter()
            .map(|p| {
                let at = offset;
                offset += p.content.len();
                at
            })
            .collect();
        let sect_offsets: Vec<usize> = self
            .sections
            .iter()
            .map(|s| {
                let at = offset;
                offset += s.content.len();
                at
            })
            .collect();
        let names_offset = offset;
        offset += if have_sections { names.len() } else { 0 };
        let phoff = if self.phdrs.is_empty() { 0 } else { offset };
        offset += self.phdrs.len() * phentsize;
        let shoff = if have_sections { offset } else { 0 };

        let mut out = Vec::new();

        // identification
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        out.push(if self.sixty_four { 2 } else { 1 });
        out.push(if self.big { 2 } else { 1 });
        out.push(1); // EI_VERSION
        out.push(0); // EI_OSABI
        out.extend_from_slice(&[0; 8]);

        self.w16(&mut out, self.e_type);
        self.w16(&mut out, self.machine);
        self.w32(&mut out, 1);
        self.waddr(&mut out, self.entry);
        self.waddr(&mut out, phoff as u64);
        self.waddr(&mut out, shoff as u64);
        self.w32(&mut out, 0); // e_flags
        self.w16(&mut out, ehsize as u16);
        self.w16(&mut out, phentsize as u16);
        self.w16(&mut out, self.phdrs.len() as u16);
        self.w16(&mut out, shentsize as u16);
        self.w16(&mut out, shnum as u16);
        self.w16(&mut out, shstrndx as u16);
        assert_eq!(out.len(), ehsize);

        for p in &self.phdrs {
            out.extend_from_slice(&p.content);
        }
        for s in &self.sections {
            out.extend_from_slice(&s.content);
        }
        if have_sections {
            out.extend_from_slice(&names);
        }

        for (p, &at) in self.phdrs.iter().zip(&ph_offsets) {
            if self.sixty_four {
                self.w32(&mut out, p.p_type);
                self.w32(&mut out, p.flags);
                self.w64(&mut out, at as u64);
                self.w64(&mut out, p.vaddr);
                self.w64(&mut out, p.paddr);
                self.w64(&mut out, p.content.len() as u64);
                self.w64(&mut out, p.memsz);
                self.w64(&mut out, p.align);
            } else {
                self.w32(&mut out, p.p_type);
                self.w32(&mut out, at as u32);
                self.w32(&mut out, p.vaddr as u32);
                self.w32(&mut out, p.paddr as u32);
                self.w32(&mut out, p.content.len() as u32);
                self.w32(&mut out, p.memsz as u32);
                self.w32(&mut out, p.flags);
                self.w32(&mut out, p.align as u32);
            }
        }

        if have_sections {
            // the null entry
            self.write_shdr(&mut out, 0, SHT_NULL, 0, 0, 0, 0, 0, 0);
            for (i, s) in self.sections.iter().enumerate() {
                self.write_shdr(
                    &mut out,
                    name_offsets[i + 1],
                    s.sh_type,
                    s.flags,
                    s.addr,
                    sect_offsets[i] as u64,
                    s.content.len() as u64,
                    s.link,
                    s.entsize,
                );
            }
            self.write_shdr(
                &mut out,
                shstrtab_name,
                SHT_STRTAB,
                0,
                0,
                names_offset as u64,
                names.len() as u64,
                0,
                0,
            );
        }

        out
    }

    #[allow(clippy::too_many_arguments)]
    fn write_shdr(
        &self,
        out: &mut Vec<u8>,
        name: u32,
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        entsize: u64,
    ) {
        self.w32(out, name);
        self.w32(out, sh_type);
        if self.sixty_four {
            self.w64(out, flags);
            self.w64(out, addr);
            self.w64(out, offset);
            self.w64(out, size);
            self.w32(out, link);
            self.w32(out, 0); // sh_info
            self.w64(out, 0); // sh_addralign
            self.w64(out, entsize);
        } else {
            self.w32(out, flags as u32);
            self.w32(out, addr as u32);
            self.w32(out, offset as u32);
            self.w32(out, size as u32);
            self.w32(out, link);
            self.w32(out, 0);
            self.w32(out, 0);
            self.w32(out, entsize as u32);
        }
    }
}

/// A 32-bit little-endian symbol-table entry.
pub fn sym32(name_offset: u32, value: u32, size: u32, info: u8, shndx: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&name_offset.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.push(info);
    out.push(0);
    out.extend_from_slice(&shndx.to_le_bytes());
    out
}

/// A 32-bit little-endian dynamic entry.
pub fn dyn32(tag: i32, value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out
}

/// A scratch directory for tests that need real files.
pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("loupe-{label}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
