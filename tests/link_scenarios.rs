//! End-to-end link-driver scenarios exercised through the public API
//! (spec §8): multiple inputs, every output path, and the map render.

use stld_core::format::header::HeaderFlags;
use stld_core::format::object::{Object, ObjSection};
use stld_core::format::relocation::{RelocationKind, RelocationRecord};
use stld_core::format::section::{SectionFlags, SectionRecord};
use stld_core::format::symbol::{SymbolBinding, SymbolKind, SymbolRecord};
use stld_core::strtab::StringPool;
use stld_core::{LinkDriver, LinkOptions, OutputType};

fn object_with_section(
    section_name: &str,
    data: Vec<u8>,
    flags: SectionFlags,
    symbols: &[(&str, u32, SymbolBinding)],
) -> Object {
    let mut strings = StringPool::new();
    let name_offset = strings.intern(section_name);
    let symbols = symbols
        .iter()
        .map(|(name, value, binding)| {
            let name_offset = strings.intern(name);
            SymbolRecord::builder()
                .name_offset(name_offset)
                .value(*value)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(*binding)
                .build()
        })
        .collect();
    Object {
        flags: HeaderFlags::LITTLE_ENDIAN | HeaderFlags::RELOCATABLE,
        entry_point: 0,
        sections: vec![ObjSection {
            record: SectionRecord::builder()
                .name_offset(name_offset)
                .virtual_addr(0)
                .size(data.len() as u32)
                .file_offset(0)
                .flags(flags)
                .alignment_log2(0)
                .build(),
            data,
        }],
        symbols,
        relocations: Vec::new(),
        imports: Vec::new(),
        strings,
    }
}

#[test]
fn two_inputs_merge_into_one_object_with_entry_symbol() {
    let a = object_with_section(
        ".text",
        vec![0x01, 0x02, 0x03, 0x04],
        SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE,
        &[("start", 0, SymbolBinding::Global)],
    );
    let b = object_with_section(
        ".text",
        vec![0x05, 0x06, 0x07, 0x08],
        SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE,
        &[("helper", 0, SymbolBinding::Global)],
    );

    let options = LinkOptions::builder()
        .output_type(OutputType::Object)
        .entry_symbol("start".to_string())
        .build();
    let mut driver = LinkDriver::new(options);
    driver.add_input("a.obj", a).unwrap();
    driver.add_input("b.obj", b).unwrap();
    let out = driver.link().unwrap();

    let merged = Object::parse(&out.bytes).unwrap();
    assert_eq!(merged.sections.len(), 1);
    assert_eq!(merged.sections[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(merged.symbols.len(), 2);
}

#[test]
fn static_library_output_contains_one_member_per_input() {
    let a = object_with_section(".text", vec![0xAA; 4], SectionFlags::ALLOCATABLE, &[]);
    let b = object_with_section(".data", vec![0xBB; 8], SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE, &[]);

    let options = LinkOptions::builder().output_type(OutputType::Static).build();
    let mut driver = LinkDriver::new(options);
    driver.add_input("a.o", a).unwrap();
    driver.add_input("b.o", b).unwrap();
    let out = driver.link().unwrap();

    let archive = stld_core::archive::Archive::deserialize(&out.bytes).unwrap();
    assert_eq!(archive.len(), 2);
    assert!(archive.find_by_name("a.o").is_some());
    assert!(archive.find_by_name("b.o").is_some());
}

#[test]
fn generate_map_renders_sections_and_global_symbols() {
    let a = object_with_section(
        ".text",
        vec![0u8; 4],
        SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE,
        &[("entry", 0, SymbolBinding::Global)],
    );
    let options = LinkOptions::builder()
        .output_type(OutputType::Object)
        .generate_map(true)
        .build();
    let mut driver = LinkDriver::new(options);
    driver.add_input("a.obj", a).unwrap();
    let out = driver.link().unwrap();

    let map = out.map.expect("map requested");
    assert!(map.contains(".text"));
    assert!(map.contains("entry"));
}

#[test]
fn absolute_relocation_is_patched_at_merged_address() {
    let mut a = object_with_section(
        ".text",
        vec![0u8; 8],
        SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE,
        &[("target", 0, SymbolBinding::Global)],
    );
    a.relocations.push(
        RelocationRecord::builder()
            .offset(4)
            .symbol_index(0)
            .kind(RelocationKind::Abs32)
            .target_section(0)
            .build(),
    );

    let options = LinkOptions::builder()
        .output_type(OutputType::Flat)
        .base_address(0x2000)
        .build();
    let mut driver = LinkDriver::new(options);
    driver.add_input("a.obj", a).unwrap();
    let out = driver.link().unwrap();

    assert_eq!(&out.bytes[4..8], &0x2000u32.to_le_bytes());
}

#[test]
fn strip_debug_drops_debug_sections_and_local_symbols() {
    let mut obj = object_with_section(
        ".debug_info",
        vec![0xFFu8; 16],
        SectionFlags::ALLOCATABLE,
        &[("local_sym", 0, SymbolBinding::Local)],
    );
    obj.sections.push(ObjSection {
        record: SectionRecord::builder()
            .name_offset(obj.strings.intern(".text"))
            .virtual_addr(0)
            .size(4)
            .file_offset(0)
            .flags(SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE)
            .alignment_log2(0)
            .build(),
        data: vec![0x90; 4],
    });

    let options = LinkOptions::builder()
        .output_type(OutputType::Object)
        .strip_debug(true)
        .build();
    let mut driver = LinkDriver::new(options);
    driver.add_input("a.obj", obj).unwrap();
    let out = driver.link().unwrap();

    let merged = Object::parse(&out.bytes).unwrap();
    assert_eq!(merged.sections.len(), 1);
    assert!(merged.symbols.is_empty());
}
