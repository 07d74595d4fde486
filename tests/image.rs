//! End-to-end checks of the image builders.
mod common;

use common::{Phdr, TestElf, dyn32, scratch_dir};
use loupe::elf::{ET_DYN, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD};
use loupe::{Binary, ElfFile, Error, Parameter, UnixBuilder};

#[test]
fn simple_builder_maps_each_load_at_its_own_address() {
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 16, vec![0x90; 16]))
        .phdr(Phdr::new(PT_LOAD, PF_R | PF_W, 0x9000, 32, vec![0xaa; 8]))
        .build();
    let binary = Binary::Elf(ElfFile::from_bytes("a.out", bytes).unwrap());

    let image = binary.make_simple().unwrap();
    let mut bases: Vec<u64> = image.segments().iter().map(|s| s.base()).collect();
    bases.sort();
    assert_eq!(bases, vec![0x8000, 0x9000]);

    let code = image.at(0x8000).unwrap();
    assert_eq!(code.name(), "code");
    assert_eq!(code.bytes(), &[0x90; 16]);
    let data = image.at(0x9000).unwrap();
    assert_eq!(data.size(), 32);
    assert_eq!(&data.bytes()[..8], &[0xaa; 8]);
    assert_eq!(&data.bytes()[8..], &[0u8; 24]);
    assert!(image.at(0x7fff).is_none());
}

#[test]
fn simple_builder_places_rom_staged_segments_at_their_load_address() {
    // runs at 0x8000 but is staged at 0x2_0000; the image follows the
    // load address
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 16, vec![0x90; 16]).paddr(0x2_0000))
        .build();
    let binary = Binary::Elf(ElfFile::from_bytes("a.out", bytes).unwrap());

    let image = binary.make_simple().unwrap();
    assert_eq!(image.segments().len(), 1);
    let segment = &image.segments()[0];
    assert_eq!(segment.base(), 0x2_0000);
    assert_eq!(segment.bytes(), &[0x90; 16]);
    assert!(image.at(0x8000).is_none());
}

fn stack_params() -> Parameter {
    Parameter {
        arg: vec!["./a".into(), "x".into()],
        env: vec!["A=1".into()],
        ..Parameter::default()
    }
}

#[test]
fn unix_stack_layout() {
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 16, vec![0x90; 16]))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let params = stack_params();
    let image = UnixBuilder::new(&elf, &params).build().unwrap();

    let stack = &image.segments()[image.sp_segment().unwrap()];
    assert_eq!(stack.name(), "stack");
    assert!(stack.is_writable());
    assert!(!stack.is_executable());
    assert_eq!(stack.size(), 4096);
    assert_eq!(stack.base(), 0x8000_0000 - 4096);

    let sp = image.sp().unwrap();
    let buf = stack.buffer(elf.encoding());
    let at = |addr: u64| (addr - stack.base()) as usize;

    // argc, then the argv and envp array pointers
    assert_eq!(buf.get_u32(at(sp)).unwrap(), 2);
    let argv = buf.get_u32(at(sp) + 4).unwrap() as u64;
    let envp = buf.get_u32(at(sp) + 8).unwrap() as u64;
    assert_eq!(argv, sp + 12);
    assert_eq!(envp, sp + 12 + 3 * 4);

    // argv[0] points at "./a", argv[1] at "x", then a null entry
    let arg0 = buf.get_u32(at(argv)).unwrap() as u64;
    let arg1 = buf.get_u32(at(argv) + 4).unwrap() as u64;
    assert_eq!(buf.get_u32(at(argv) + 8).unwrap(), 0);
    assert_eq!(buf.cstr(at(arg0)).unwrap(), "./a");
    assert_eq!(buf.cstr(at(arg1)).unwrap(), "x");

    // envp[0] points at "A=1", then a null entry
    let env0 = buf.get_u32(at(envp)).unwrap() as u64;
    assert_eq!(buf.cstr(at(env0)).unwrap(), "A=1");
    assert_eq!(buf.get_u32(at(envp) + 4).unwrap(), 0);
}

#[test]
fn too_small_a_stack_fails_without_partial_output() {
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 16, vec![0x90; 16]))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let params = Parameter {
        stack_size: 40,
        ..stack_params()
    };
    let err = UnixBuilder::new(&elf, &params).build().unwrap_err();
    assert!(matches!(err, Error::StackTooSmall));
    assert_eq!(err.to_string(), "stack size too small");
}

#[test]
fn stack_at_a_fixed_address() {
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 16, vec![0x90; 16]))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let params = Parameter {
        stack_at: true,
        stack_addr: 0x4000_0000,
        ..Parameter::default()
    };
    let image = UnixBuilder::new(&elf, &params).build().unwrap();
    let stack = &image.segments()[image.sp_segment().unwrap()];
    assert_eq!(stack.base(), 0x4000_0000 - 4096);
}

#[test]
fn no_stack_when_disabled() {
    let bytes = TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_X | PF_R, 0x8000, 16, vec![0x90; 16]))
        .build();
    let elf = ElfFile::from_bytes("a.out", bytes).unwrap();
    let params = Parameter {
        stack_alloc: false,
        ..Parameter::default()
    };
    let image = UnixBuilder::new(&elf, &params).build().unwrap();
    assert!(image.sp().is_none());
    assert_eq!(image.segments().len(), 1);
}

/// A library with one load of recognizable bytes.
fn library_bytes(payload: u8) -> Vec<u8> {
    TestElf::new32()
        .e_type(ET_DYN)
        .phdr(Phdr::new(PT_LOAD, PF_R, 0, 16, vec![payload; 16]))
        .build()
}

/// A program whose dynamic section needs `libfoo.so`; its string table is
/// mapped at 0x1000.
fn needing_program(extra: &[Vec<u8>]) -> Vec<u8> {
    let strtab = b"\0libfoo.so\0$ORIGIN\0".to_vec();
    let memsz = strtab.len() as u64;
    let mut dynamic = Vec::new();
    dynamic.extend(dyn32(5, 0x1000)); // DT_STRTAB
    for e in extra {
        dynamic.extend_from_slice(e);
    }
    dynamic.extend(dyn32(1, 1)); // DT_NEEDED -> "libfoo.so"
    dynamic.extend(dyn32(0, 0)); // DT_NULL
    let dyn_memsz = dynamic.len() as u64;
    TestElf::new32()
        .phdr(Phdr::new(PT_LOAD, PF_R, 0x1000, memsz, strtab))
        .phdr(Phdr::new(PT_DYNAMIC, PF_R, 0x2000, dyn_memsz, dynamic))
        .build()
}

#[test]
fn needed_library_is_found_through_search_paths() {
    let dir = scratch_dir("needed");
    std::fs::write(dir.join("libfoo.so"), library_bytes(0x42)).unwrap();

    let elf = ElfFile::from_bytes(dir.join("prog"), needing_program(&[])).unwrap();
    let params = Parameter {
        paths: vec![dir.clone()],
        stack_alloc: false,
        ..Parameter::default()
    };
    let image = UnixBuilder::new(&elf, &params).build().unwrap();

    assert_eq!(image.links().len(), 2);
    assert_eq!(image.program().base, 0);
    let lib = &image.links()[1];
    assert!(lib.path.ends_with("libfoo.so"));
    // the program's single load ends inside the 0x1000 page, so the
    // library starts at the next one
    assert_eq!(lib.base, 0x2000);
    let mapped = image.at(lib.base).unwrap();
    assert_eq!(mapped.bytes(), &[0x42; 16]);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn rpath_origin_expansion_finds_a_sibling_library() {
    let dir = scratch_dir("origin");
    std::fs::write(dir.join("libfoo.so"), library_bytes(0x7)).unwrap();

    // DT_RPATH "$ORIGIN" at string offset 11
    let elf =
        ElfFile::from_bytes(dir.join("prog"), needing_program(&[dyn32(15, 11)])).unwrap();
    let params = Parameter {
        is_linux: true,
        no_default_path: true,
        stack_alloc: false,
        ..Parameter::default()
    };
    let image = UnixBuilder::new(&elf, &params).build().unwrap();
    assert_eq!(image.links().len(), 2);
    assert!(image.links()[1].path.ends_with("libfoo.so"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_library_is_a_warning_not_an_error() {
    let dir = scratch_dir("missing");
    let elf = ElfFile::from_bytes(dir.join("prog"), needing_program(&[])).unwrap();
    let params = Parameter {
        no_default_path: true,
        stack_alloc: false,
        ..Parameter::default()
    };
    // resolution fails but the image is still produced
    let image = UnixBuilder::new(&elf, &params).build().unwrap();
    assert_eq!(image.links().len(), 1);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn mismatched_machine_is_discarded() {
    let dir = scratch_dir("machine");
    let lib = TestElf::new32()
        .e_type(ET_DYN)
        .machine(40) // arm library for a 386 program
        .phdr(Phdr::new(PT_LOAD, PF_R, 0, 16, vec![0; 16]))
        .build();
    std::fs::write(dir.join("libfoo.so"), lib).unwrap();

    let elf = ElfFile::from_bytes(dir.join("prog"), needing_program(&[])).unwrap();
    let params = Parameter {
        paths: vec![dir.clone()],
        no_default_path: true,
        stack_alloc: false,
        ..Parameter::default()
    };
    let image = UnixBuilder::new(&elf, &params).build().unwrap();
    assert_eq!(image.links().len(), 1);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn image_strings_are_read_out_of_mapped_memory() {
    let elf = ElfFile::from_bytes("prog", needing_program(&[])).unwrap();
    let params = Parameter {
        no_default_path: true,
        stack_alloc: false,
        ..Parameter::default()
    };
    let image = UnixBuilder::new(&elf, &params).build().unwrap();
    assert_eq!(image.string_at(0x1001).unwrap(), "libfoo.so");
    assert!(image.string_at(0x9_0000).is_err());
}
