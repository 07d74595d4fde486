//! End-to-end checks of the ELF parser over synthesized images.
mod common;

use common::{Phdr, Sect, TestElf, scratch_dir, sym32};
use loupe::elf::{
    ET_DYN, PF_R, PF_W, PF_X, PT_LOAD, PT_NOTE, SHT_DYNAMIC, SHT_SYMTAB, SHT_STRTAB,
    SectionRef, SymbolBind, SymbolKind,
};
use loupe::{AddressKind, Binary, ElfFile, FileKind};

#[test]
fn minimal_program_header_and_segment() {
    // a 32-bit little-endian program with one executable load
    let bytes = TestElf::new32()
        .entry(0x8080)
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 256, vec![0x90; 256]))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();

    assert_eq!(elf.kind(), FileKind::Program);
    assert_eq!(elf.address_kind(), AddressKind::A32);
    assert!(!elf.is_big_endian());
    assert_eq!(elf.entry(), 0x8080);
    assert_eq!(elf.machine(), "386");
    assert_eq!(elf.os(), "SysV");

    let segments = elf.segments().unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].name(), "code");
    assert_eq!(segments[0].base_address(), 0x8000);
    assert_eq!(segments[0].size(), 256);
    assert!(segments[0].is_executable());
    assert!(!segments[0].is_writable());
}

#[test]
fn unknown_magic_names_the_bytes() {
    let dir = scratch_dir("magic");
    let path = dir.join("junk");
    std::fs::write(&path, [0u8; 16]).unwrap();
    let err = loupe::open(&path).unwrap_err();
    assert!(
        err.to_string()
            .contains("unknown executable format with magic: 00000000"),
        "{err}"
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn ti_coff_magic_is_recognized_but_unsupported() {
    let dir = scratch_dir("ticoff");
    let path = dir.join("ti");
    std::fs::write(&path, [0xc2, 0x00, 0x01, 0x02, 0, 0, 0, 0]).unwrap();
    let err = loupe::open(&path).unwrap_err();
    assert!(err.to_string().contains("TI COFF"), "{err}");
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn symbol_table_is_built_once_across_sections() {
    // .strtab holds "a\0b\0c\0" so the names sit at offsets 0, 2, 4
    let mut symtab = Vec::new();
    symtab.extend(sym32(0, 0x100, 4, 0x12, 1)); // global func a
    symtab.extend(sym32(2, 0x200, 8, 0x01, 1)); // local data b
    symtab.extend(sym32(4, 0x300, 0, 0x20, 0)); // weak undef c
    let bytes = TestElf::new32()
        .section(Sect::new(".symtab", SHT_SYMTAB, symtab).entsize(16).link(2))
        .section(Sect::new(".strtab", SHT_STRTAB, b"a\0b\0c\0".to_vec()))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();

    let symbols = elf.symbols().unwrap();
    assert_eq!(symbols.len(), 3);
    let mut names: Vec<&str> = symbols.iter().map(|(n, _)| n).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);

    let a = symbols.get("a").unwrap();
    assert_eq!(a.value, 0x100);
    assert_eq!(a.kind, SymbolKind::Func);
    assert_eq!(a.bind, SymbolBind::Global);
    assert_eq!(a.section, SectionRef::Index(1));
    let b = symbols.get("b").unwrap();
    assert_eq!(b.kind, SymbolKind::Data);
    assert_eq!(b.bind, SymbolBind::Local);
    let c = symbols.get("c").unwrap();
    assert_eq!(c.bind, SymbolBind::Weak);
    assert_eq!(c.section, SectionRef::Undef);

    // lazy tables hand back the same object on every call
    assert!(std::ptr::eq(symbols, elf.symbols().unwrap()));
    let s1 = elf.sections().unwrap();
    let s2 = elf.sections().unwrap();
    assert!(std::ptr::eq(s1.as_ptr(), s2.as_ptr()));
}

#[test]
fn symbol_table_with_trailing_garbage_is_rejected() {
    let mut symtab = sym32(0, 0, 0, 0, 0);
    symtab.extend_from_slice(&[0xff; 5]); // size no longer a multiple of 16
    let bytes = TestElf::new32()
        .section(Sect::new(".symtab", SHT_SYMTAB, symtab).entsize(16).link(2))
        .section(Sect::new(".strtab", SHT_STRTAB, b"\0".to_vec()))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let err = elf.symbols().unwrap_err();
    assert!(err.to_string().contains("garbage"), "{err}");
}

#[test]
fn out_of_range_string_table_index_is_rejected() {
    let mut bytes = TestElf::new32()
        .section(Sect::new(".strtab", SHT_STRTAB, b"\0".to_vec()))
        .build();
    // e_shstrndx sits at offset 50 of the 32-bit header
    bytes[50] = 9;
    bytes[51] = 0;
    assert!(ElfFile::from_bytes("a.out", bytes).is_err());
}

#[test]
fn bss_tail_is_zero_filled() {
    // 8 bytes in the file, 32 in memory
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_R | PF_W, 0x1000, 32, vec![0xaa; 8]))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let segment = &elf.segments().unwrap()[0];
    assert_eq!(segment.name(), "data");
    let content = segment.content(&elf).unwrap();
    assert_eq!(content.len(), 32);
    assert_eq!(&content.bytes()[..8], &[0xaa; 8]);
    assert_eq!(&content.bytes()[8..], &[0u8; 24]);
}

#[test]
fn zero_file_size_load_is_all_zeroes() {
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_R | PF_W, 0x1000, 16, Vec::new()))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let content = elf.segments().unwrap()[0].content(&elf).unwrap();
    assert_eq!(content.bytes(), &[0u8; 16]);
}

#[test]
fn big_endian_64_bit_files_parse() {
    let bytes = TestElf::new64()
        .big_endian()
        .machine(20) // ppc
        .e_type(ET_DYN)
        .entry(0x1_0000_0010)
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x1_0000_0000, 64, vec![0; 64]))
        .build();
    let elf = ElfFile::from_bytes("lib.so", bytes).unwrap();
    assert_eq!(elf.kind(), FileKind::Library);
    assert!(elf.is_big_endian());
    assert_eq!(elf.address_kind(), AddressKind::A64);
    assert_eq!(elf.entry(), 0x1_0000_0010);
    assert_eq!(elf.machine(), "ppc");
    assert_eq!(elf.segments().unwrap()[0].base_address(), 0x1_0000_0000);
}

#[test]
fn dynamic_section_entries_stop_at_null() {
    use common::dyn32;
    let mut dynamic = Vec::new();
    dynamic.extend(dyn32(1, 7)); // DT_NEEDED
    dynamic.extend(dyn32(5, 0x2000)); // DT_STRTAB
    dynamic.extend(dyn32(0, 0)); // DT_NULL
    dynamic.extend(dyn32(14, 1)); // DT_SONAME, past the terminator
    let bytes = TestElf::new32()
        .section(Sect::new(".dynamic", SHT_DYNAMIC, dynamic).entsize(8).link(2))
        .section(Sect::new(".dynstr", SHT_STRTAB, b"\0libm.so\0".to_vec()))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let dyns = elf.dyns().unwrap();
    assert_eq!(dyns.len(), 2);
    assert_eq!(dyns[0].tag, 1);
    assert_eq!(dyns[0].value, 7);
    assert_eq!(dyns[1].tag, 5);
}

#[test]
fn notes_walk_through_a_pt_note_header() {
    let mut note = Vec::new();
    note.extend_from_slice(&4u32.to_le_bytes()); // namesz ("GNU\0")
    note.extend_from_slice(&8u32.to_le_bytes()); // descsz
    note.extend_from_slice(&3u32.to_le_bytes()); // type
    note.extend_from_slice(b"GNU\0");
    note.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let memsz = note.len() as u64;
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_NOTE, PF_R, 0, memsz, note))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let ph = &elf.program_headers().unwrap()[0];
    let notes: Vec<_> = elf
        .notes(ph)
        .unwrap()
        .collect::<loupe::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].name, "GNU");
    assert_eq!(notes[0].ntype, 3);
    assert_eq!(notes[0].desc, &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn section_listing() {
    let bytes = TestElf::new32()
        .section(Sect::new(".symtab", SHT_SYMTAB, sym32(0, 0, 0, 0, 0)).entsize(16).link(2))
        .section(Sect::new(".strtab", SHT_STRTAB, b"\0".to_vec()))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let listing: String = elf
        .sections()
        .unwrap()
        .iter()
        .map(|s| {
            format!(
                "{} {} '{}'\n",
                s.index(),
                s.kind().name(),
                elf.section_name(s).unwrap()
            )
        })
        .collect();
    insta::assert_snapshot!(listing, @r"
    0 NULL ''
    1 SYMTAB '.symtab'
    2 STRTAB '.strtab'
    3 STRTAB '.shstrtab'
    ");
}

#[test]
fn opener_dispatches_elf_from_disk() {
    let dir = scratch_dir("open");
    let path = dir.join("prog");
    let bytes = TestElf::new32()
        .entry(0x400)
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x400, 16, vec![0x90; 16]))
        .build();
    std::fs::write(&path, bytes).unwrap();
    let binary = loupe::open(&path).unwrap();
    assert!(matches!(binary, Binary::Elf(_)));
    assert_eq!(binary.kind(), FileKind::Program);
    assert_eq!(binary.entry(), 0x400);
    assert_eq!(binary.format_addr(binary.entry()), "00000400");
    std::fs::remove_dir_all(&dir).ok();
}
