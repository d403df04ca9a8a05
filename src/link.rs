//! Link driver (C7): orchestrates parse → ingest → resolve → layout →
//! relocate → emit.

use std::collections::HashMap;

use typed_builder::TypedBuilder;

use crate::error::{CollectingSink, Error, ErrorSink, Result};
use crate::format::header::{HeaderFlags, ObjHeader};
use crate::format::object::{Object, ObjSection};
use crate::format::relocation::{RelocationKind, RelocationRecord};
use crate::format::section::SectionFlags;
use crate::format::symbol::SymbolBinding;
use crate::reloc::{self, OutputMode};
use crate::sections::SectionManager;
use crate::strtab::StringPool;
use crate::symtab::SymbolTable;

/// One of the three emission paths selectable via [`LinkOptions`]
/// (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Object,
    Shared,
    Static,
    Flat,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct LinkOptions {
    #[builder(default = OutputType::Object)]
    pub output_type: OutputType,
    #[builder(default)]
    pub base_address: u32,
    #[builder(default, setter(strip_option))]
    pub entry_point: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub entry_symbol: Option<String>,
    #[builder(default)]
    pub strip_debug: bool,
    #[builder(default)]
    pub optimize_size: bool,
    #[builder(default)]
    pub generate_map: bool,
    #[builder(default)]
    pub verbose: bool,
}

/// Result of a completed link job: the emitted bytes, plus a memory
/// map if `generate_map` was set (spec §6's `map[=<path>]`; presented
/// here as a plain `String` so the caller decides whether/where to
/// write it).
#[derive(Debug, Clone)]
pub struct LinkOutput {
    pub bytes: Vec<u8>,
    pub map: Option<String>,
}

struct NamedInput {
    name: String,
    object: Object,
}

/// A dynamic-kind relocation (`got32`/`plt32`/`copy`/`glob_dat`/
/// `jmp_slot`) captured during [`LinkDriver::relocate`] for carry-
/// through into a `Shared` output's relocation table (spec §4.6).
/// `reloc::apply` is a no-op for these under `OutputMode::Shared`, so
/// the record has to be stashed here rather than recovered from
/// patched bytes, and translated into merged-output coordinates once
/// [`LinkDriver::emit_object`] knows the final section/symbol numbering.
struct PendingDynamicReloc {
    kind: RelocationKind,
    offset_in_chunk: u32,
    target_chunk: String,
    symbol_name: String,
}

/// Debug sections are identified by name convention (`.debug*`); the
/// wire format has no dedicated section flag for them (spec §3's
/// `SectionFlags` enumerates writable/allocatable/executable/merge/
/// strings/zero-fill/compressed only).
fn is_debug_section(name: &str) -> bool {
    name.starts_with(".debug")
}

pub struct LinkDriver {
    options: LinkOptions,
    inputs: Vec<NamedInput>,
    sections: SectionManager,
    symbols: SymbolTable,
    dynamic_relocations: Vec<PendingDynamicReloc>,
}

impl LinkDriver {
    pub fn new(options: LinkOptions) -> Self {
        Self {
            options,
            inputs: Vec::new(),
            sections: SectionManager::new(),
            symbols: SymbolTable::new(),
            dynamic_relocations: Vec::new(),
        }
    }

    fn options(&self) -> &LinkOptions {
        &self.options
    }

    /// Ingest phase: enters every section of `object` into the section
    /// manager (merging where names collide) and every symbol into the
    /// symbol table (spec §4.7).
    pub fn add_input(&mut self, name: impl Into<String>, object: Object) -> Result<()> {
        let name = name.into();
        let input_index = self.inputs.len();
        log::debug!("ingest: {name} ({} sections, {} symbols)", object.sections.len(), object.symbols.len());

        for (idx, section) in object.sections.iter().enumerate() {
            let section_name = object
                .strings
                .get(section.record.name_offset)
                .unwrap_or("")
                .to_string();
            if self.options().strip_debug && is_debug_section(&section_name) {
                continue;
            }
            self.sections.ingest_section(
                &section_name,
                input_index,
                idx as u16,
                &section.record,
                section.data.clone(),
            )?;
        }

        for symbol in &object.symbols {
            if self.options().strip_debug && symbol.binding == SymbolBinding::Local {
                continue;
            }
            let sym_name = object.strings.get(symbol.name_offset).unwrap_or("").to_string();
            self.symbols.ingest(&sym_name, *symbol, input_index)?;
        }

        self.inputs.push(NamedInput { name, object });
        Ok(())
    }

    /// Runs resolve → layout → relocate → emit and produces the final
    /// output per `options.output_type`.
    pub fn link(&mut self) -> Result<LinkOutput> {
        if self.options().output_type == OutputType::Static {
            return self.emit_static_library();
        }

        log::debug!("resolve: checking {} symbols", self.symbols.len());
        let all_names: Vec<String> = self.symbols.iter().map(|(name, _)| name.clone()).collect();
        let mut sink = CollectingSink::default();
        self.symbols.resolve(&all_names, &mut sink)?;

        log::debug!("layout: base_address={:#x}", self.options().base_address);
        self.sections.layout(self.options().base_address)?;

        log::debug!("relocate");
        self.relocate()?;

        log::debug!("emit: {:?}", self.options().output_type);
        match self.options().output_type {
            OutputType::Flat => self.emit_flat(),
            OutputType::Shared | OutputType::Object => self.emit_object(),
            OutputType::Static => unreachable!("handled above"),
        }
    }

    fn relocate(&mut self) -> Result<()> {
        let mode = match self.options().output_type {
            OutputType::Shared => OutputMode::Shared,
            _ => OutputMode::Static,
        };

        for input_index in 0..self.inputs.len() {
            let relocations = self.inputs[input_index].object.relocations.clone();
            for record in &relocations {
                if record.kind.is_dynamic() {
                    reloc::apply(record, &mut [], 0, 0, 0, input_index, record.target_section as usize, mode)?;
                    if mode == OutputMode::Shared {
                        let symbol = self.inputs[input_index]
                            .object
                            .symbols
                            .get(record.symbol_index as usize)
                            .ok_or_else(|| {
                                Error::InvalidRelocation(format!(
                                    "symbol_index {} out of range for input {input_index}",
                                    record.symbol_index
                                ))
                            })?;
                        let symbol_name = self.inputs[input_index]
                            .object
                            .strings
                            .get(symbol.name_offset)
                            .unwrap_or("")
                            .to_string();
                        let (target_chunk, chunk_offset) = self
                            .sections
                            .chunk_location(input_index, record.target_section)
                            .ok_or_else(|| {
                                Error::InvalidRelocation(format!(
                                    "target_section {} not laid out for input {input_index}",
                                    record.target_section
                                ))
                            })?;
                        self.dynamic_relocations.push(PendingDynamicReloc {
                            kind: record.kind,
                            offset_in_chunk: chunk_offset.wrapping_add(record.offset),
                            target_chunk,
                            symbol_name,
                        });
                    }
                    continue;
                }

                let symbol = self.inputs[input_index]
                    .object
                    .symbols
                    .get(record.symbol_index as usize)
                    .ok_or_else(|| {
                        Error::InvalidRelocation(format!(
                            "symbol_index {} out of range for input {input_index}",
                            record.symbol_index
                        ))
                    })?;
                let name = self.inputs[input_index]
                    .object
                    .strings
                    .get(symbol.name_offset)
                    .unwrap_or("")
                    .to_string();
                let def = if symbol.binding == SymbolBinding::Local {
                    self.symbols
                        .get_local(input_index, &name)
                        .ok_or_else(|| Error::SymbolNotFound(name.clone()))?
                } else {
                    self.symbols.get(&name).ok_or_else(|| Error::SymbolNotFound(name.clone()))?
                };
                let symbol_address = self
                    .sections
                    .address_of(def.input_index, def.local_section_index)
                    .ok_or_else(|| Error::Internal(format!("no output address for symbol `{name}`")))?
                    .wrapping_add(def.record.value);

                let section_base = self
                    .sections
                    .address_of(input_index, record.target_section)
                    .ok_or_else(|| {
                        Error::InvalidRelocation(format!(
                            "target_section {} not laid out for input {input_index}",
                            record.target_section
                        ))
                    })?;
                let width = record.kind.width().unwrap_or(0);
                let pc = section_base.wrapping_add(record.offset).wrapping_add(width);

                let (slice, _chunk_base) = self
                    .sections
                    .segment_slice_mut(input_index, record.target_section)
                    .ok_or_else(|| {
                        Error::InvalidRelocation(format!(
                            "no writable bytes for input {input_index} section {}",
                            record.target_section
                        ))
                    })?;
                reloc::apply(
                    record,
                    slice,
                    symbol_address,
                    section_base,
                    pc,
                    input_index,
                    record.target_section as usize,
                    mode,
                )?;
            }
        }
        Ok(())
    }

    fn emit_object(&self) -> Result<LinkOutput> {
        let mut strings = StringPool::new();
        let mut sections = Vec::new();
        for chunk in self.sections.iter() {
            let name_offset = strings.intern(&chunk.name);
            let record = crate::format::section::SectionRecord::builder()
                .name_offset(name_offset)
                .virtual_addr(chunk.output_address)
                .size(chunk.size)
                .file_offset(0)
                .flags(chunk.flags)
                .alignment_log2(chunk.alignment.trailing_zeros() as u8)
                .build();
            sections.push(ObjSection {
                record,
                data: chunk.data.clone(),
            });
        }

        let mut symbols = Vec::new();
        let mut names: Vec<(&str, &crate::symtab::Definition)> =
            self.symbols.iter().map(|(name, def)| (name.as_str(), def)).collect();
        names.extend(self.symbols.iter_locals().map(|def| (def.name.as_str(), def)));
        // Spec §3: local symbols must precede all non-local symbols.
        names.sort_by_key(|(_, def)| def.record.binding as u8);
        let mut symbol_index_by_name: HashMap<&str, u32> = HashMap::new();
        for (i, &(name, def)) in names.iter().enumerate() {
            let name_offset = strings.intern(name);
            let mut rec = def.record;
            rec.name_offset = name_offset;
            symbols.push(rec);
            symbol_index_by_name.insert(name, i as u32);
        }

        let mut section_index_by_name: HashMap<&str, u16> = HashMap::new();
        for (i, chunk) in self.sections.iter().enumerate() {
            section_index_by_name.insert(chunk.name.as_str(), i as u16);
        }

        let mut relocations = Vec::new();
        if self.options().output_type == OutputType::Shared {
            for pending in &self.dynamic_relocations {
                let symbol_index = *symbol_index_by_name.get(pending.symbol_name.as_str()).ok_or_else(|| {
                    Error::SymbolNotFound(pending.symbol_name.clone())
                })?;
                let target_section = *section_index_by_name.get(pending.target_chunk.as_str()).ok_or_else(|| {
                    Error::Internal(format!("no output section for chunk `{}`", pending.target_chunk))
                })?;
                relocations.push(
                    RelocationRecord::builder()
                        .offset(pending.offset_in_chunk)
                        .symbol_index(symbol_index)
                        .kind(pending.kind)
                        .target_section(target_section)
                        .build(),
                );
            }
        }

        let entry_point = self.resolve_entry_point()?;

        let mut flags = HeaderFlags::LITTLE_ENDIAN | HeaderFlags::RELOCATABLE;
        if self.options().output_type == OutputType::Shared {
            flags |= HeaderFlags::SHARED;
        }
        if self.options().strip_debug {
            flags |= HeaderFlags::STRIPPED;
        }

        let object = Object {
            flags,
            entry_point,
            sections,
            symbols,
            relocations,
            imports: Vec::new(),
            strings,
        };
        let bytes = object.emit()?;
        let map = if self.options().generate_map {
            Some(self.render_map())
        } else {
            None
        };
        Ok(LinkOutput { bytes, map })
    }

    /// Flat binary path (spec §4.7): concatenates only loadable
    /// sections in address order, gaps zero-filled, clipped to
    /// `[base, last section end)`. No header is emitted.
    fn emit_flat(&self) -> Result<LinkOutput> {
        let mut loadable: Vec<_> = self
            .sections
            .filter_by_flags(SectionFlags::ALLOCATABLE, true)
            .collect();
        loadable.sort_by_key(|c| c.output_address);

        let base = self.options().base_address;
        let end = loadable
            .iter()
            .map(|c| c.output_address + c.size)
            .max()
            .unwrap_or(base);

        let mut image = vec![0u8; (end - base) as usize];
        for chunk in &loadable {
            if chunk.flags.contains(SectionFlags::ZERO_FILL) {
                continue; // already zero in `image`
            }
            let start = (chunk.output_address - base) as usize;
            image[start..start + chunk.data.len()].copy_from_slice(&chunk.data);
        }

        let map = if self.options().generate_map {
            Some(self.render_map())
        } else {
            None
        };
        Ok(LinkOutput { bytes: image, map })
    }

    fn emit_static_library(&self) -> Result<LinkOutput> {
        log::debug!("emit: static library, {} members", self.inputs.len());
        let mut archive = crate::archive::Archive::new();
        for input in &self.inputs {
            let bytes = input.object.emit()?;
            archive.add(&input.name, bytes, crate::archive::AddOptions::default())?;
        }
        let bytes = archive.serialize()?;
        Ok(LinkOutput { bytes, map: None })
    }

    fn resolve_entry_point(&self) -> Result<u32> {
        if let Some(explicit) = self.options().entry_point {
            return Ok(explicit);
        }
        if let Some(symbol_name) = &self.options().entry_symbol {
            let def = self
                .symbols
                .get(symbol_name)
                .ok_or_else(|| Error::SymbolNotFound(symbol_name.clone()))?;
            let address = self
                .sections
                .address_of(def.input_index, def.local_section_index)
                .ok_or_else(|| Error::Internal("entry symbol has no output address".into()))?;
            return Ok(address.wrapping_add(def.record.value));
        }
        Ok(0)
    }

    /// Renders the plain-text memory map (spec §6): one line per output
    /// section, then one line per global symbol.
    pub fn render_map(&self) -> String {
        let mut out = String::new();
        for chunk in self.sections.iter() {
            out.push_str(&format!(
                "{}  {:#010x}  {:#x}  {:?}\n",
                chunk.name, chunk.output_address, chunk.size, chunk.flags
            ));
        }
        let mut globals: Vec<_> = self
            .symbols
            .iter()
            .filter(|(_, def)| def.record.binding == SymbolBinding::Global)
            .collect();
        globals.sort_by(|a, b| a.0.cmp(b.0));
        for (name, def) in globals {
            let addr = self
                .sections
                .address_of(def.input_index, def.local_section_index)
                .map(|a| a.wrapping_add(def.record.value))
                .unwrap_or(0);
            out.push_str(&format!("{name}  {addr:#010x}  {:#x}  {}\n", def.record.size, def.local_section_index));
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::header::HeaderFlags;
    use crate::format::import::ImportRecord;
    use crate::format::section::SectionRecord;
    use crate::format::symbol::{SymbolKind, SymbolRecord, UNDEFINED_SECTION};

    fn single_section_object(name: &str, data: Vec<u8>, flags: SectionFlags) -> Object {
        let mut strings = StringPool::new();
        let name_offset = strings.intern(name);
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
            symbols: Vec::new(),
            relocations: Vec::new(),
            imports: Vec::<ImportRecord>::new(),
            strings,
        }
    }

    #[test]
    fn scenario_single_input_flat_link() {
        let text = vec![0x90u8; 16];
        let mut object = single_section_object(".text", text, SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let main_name = object.strings.intern("main");
        object.symbols.push(
            SymbolRecord::builder()
                .name_offset(main_name)
                .value(0)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .build(),
        );
        object.relocations.push(
            RelocationRecord::builder()
                .offset(8)
                .symbol_index(0)
                .kind(RelocationKind::Abs32)
                .target_section(0)
                .build(),
        );

        let options = LinkOptions::builder()
            .output_type(OutputType::Flat)
            .base_address(0x1000)
            .build();
        let mut driver = LinkDriver::new(options);
        driver.add_input("a.obj", object).unwrap();
        let out = driver.link().unwrap();

        assert_eq!(out.bytes.len(), 16);
        assert_eq!(&out.bytes[0..8], &[0x90; 8]);
        assert_eq!(&out.bytes[8..12], &0x1000u32.to_le_bytes());
        assert_eq!(&out.bytes[12..16], &[0x90; 4]);
    }

    #[test]
    fn scenario_duplicate_global_is_fatal() {
        let mut a = single_section_object(".text", vec![0u8; 4], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let foo_a = a.strings.intern("foo");
        a.symbols.push(
            SymbolRecord::builder()
                .name_offset(foo_a)
                .value(0)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .build(),
        );
        let mut b = single_section_object(".text", vec![0u8; 4], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let foo_b = b.strings.intern("foo");
        b.symbols.push(
            SymbolRecord::builder()
                .name_offset(foo_b)
                .value(0)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .build(),
        );

        let options = LinkOptions::builder().output_type(OutputType::Object).build();
        let mut driver = LinkDriver::new(options);
        driver.add_input("a.obj", a).unwrap();
        let err = driver.add_input("b.obj", b);
        assert!(matches!(err, Err(Error::DuplicateSymbol(ref s)) if s == "foo"));
    }

    #[test]
    fn scenario_weak_override_resolves_to_global_definition() {
        let mut a = single_section_object(".text", vec![0u8; 4], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let foo_a = a.strings.intern("foo");
        a.symbols.push(
            SymbolRecord::builder()
                .name_offset(foo_a)
                .value(0)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Weak)
                .build(),
        );
        let mut b = single_section_object(".text", vec![1u8; 4], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let foo_b = b.strings.intern("foo");
        b.symbols.push(
            SymbolRecord::builder()
                .name_offset(foo_b)
                .value(0)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .build(),
        );

        let options = LinkOptions::builder().output_type(OutputType::Object).build();
        let mut driver = LinkDriver::new(options);
        driver.add_input("a.obj", a).unwrap();
        driver.add_input("b.obj", b).unwrap();
        let def = driver.symbols.get("foo").unwrap();
        assert_eq!(def.input_index, 1);
    }

    #[test]
    fn scenario_shared_output_passes_through_dynamic_relocations() {
        let mut obj = single_section_object(".text", vec![0u8; 16], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let sym_name = obj.strings.intern("shared_fn");
        obj.symbols.push(
            SymbolRecord::builder()
                .name_offset(sym_name)
                .value(0)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .build(),
        );
        obj.relocations.push(
            RelocationRecord::builder()
                .offset(4)
                .symbol_index(0)
                .kind(RelocationKind::Plt32)
                .target_section(0)
                .build(),
        );

        let options = LinkOptions::builder().output_type(OutputType::Shared).build();
        let mut driver = LinkDriver::new(options);
        driver.add_input("a.obj", obj).unwrap();
        let out = driver.link().unwrap();

        let parsed = Object::parse(&out.bytes).unwrap();
        assert_eq!(parsed.relocations.len(), 1);
        assert_eq!(parsed.relocations[0].kind, RelocationKind::Plt32);
        assert_eq!(parsed.relocations[0].offset, 4);
        let reloc_symbol = &parsed.symbols[parsed.relocations[0].symbol_index as usize];
        assert_eq!(parsed.strings.get(reloc_symbol.name_offset), Some("shared_fn"));
    }

    #[test]
    fn scenario_pcrel8_overflow_fails_link() {
        let mut obj = single_section_object(".text", vec![0u8; 256], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let target_name = obj.strings.intern("target");
        obj.symbols.push(
            SymbolRecord::builder()
                .name_offset(target_name)
                .value(200)
                .size(0)
                .section_index(0)
                .kind(SymbolKind::NoType)
                .binding(SymbolBinding::Global)
                .build(),
        );
        obj.relocations.push(
            RelocationRecord::builder()
                .offset(0)
                .symbol_index(0)
                .kind(RelocationKind::PcRel8)
                .target_section(0)
                .build(),
        );

        let options = LinkOptions::builder().output_type(OutputType::Object).build();
        let mut driver = LinkDriver::new(options);
        driver.add_input("a.obj", obj).unwrap();
        let err = driver.link();
        assert!(matches!(err, Err(Error::RelocationFailed { .. })));
    }

    #[test]
    fn undefined_external_reference_is_reported() {
        let mut obj = single_section_object(".text", vec![0u8; 4], SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE);
        let ext_name = obj.strings.intern("extern_fn");
        obj.symbols.push(
            SymbolRecord::builder()
                .name_offset(ext_name)
                .value(0)
                .size(0)
                .section_index(UNDEFINED_SECTION)
                .kind(SymbolKind::NoType)
                .binding(SymbolBinding::Global)
                .build(),
        );
        let options = LinkOptions::builder().output_type(OutputType::Object).build();
        let mut driver = LinkDriver::new(options);
        driver.add_input("a.obj", obj).unwrap();
        let err = driver.link();
        assert!(matches!(err, Err(Error::Unresolved(v)) if v.len() == 1));
    }
}
