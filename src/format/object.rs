//! The full parsed OBJ file (C2): header, sections (with bodies),
//! symbols, relocations, imports and the string table, plus the
//! `parse`/`emit` pair that is the bit-exact boundary of the format.
//!
//! Table layout on the wire (spec §4.2's emit order, generalized to a
//! concrete offset scheme since spec §3 stores only the section,
//! relocation and string table offsets explicitly): header, section
//! bodies, section table, symbol table, relocation table, import
//! table, string table. The symbol and import table offsets are not
//! stored in the header — they are derived from the preceding table's
//! stored offset plus its entry count and record size, and
//! cross-checked against `reloc_table_offset`/`string_table_offset`
//! during parse (an Open Question resolution, see `DESIGN.md`).

use crate::error::{Error, Result};
use crate::format::header::{HeaderFlags, ObjHeader, HEADER_SIZE, MAX_SECTIONS, MAX_SYMBOLS};
use crate::format::import::{ImportRecord, IMPORT_RECORD_SIZE};
use crate::format::relocation::{RelocationRecord, RELOCATION_RECORD_SIZE};
use crate::format::section::{SectionFlags, SectionRecord, SECTION_RECORD_SIZE};
use crate::format::symbol::{SymbolBinding, SymbolRecord, UNDEFINED_SECTION, SYMBOL_RECORD_SIZE};
use crate::format::{Cursor, Endian, Writer};
use crate::strtab::StringPool;

const MAX_FILE_SIZE: u64 = (1u64 << 31) - 1;

/// A section plus the bytes it owns in the file (empty for zero-fill
/// sections, which occupy no file bytes per spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjSection {
    pub record: SectionRecord,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub flags: HeaderFlags,
    pub entry_point: u32,
    pub sections: Vec<ObjSection>,
    pub symbols: Vec<SymbolRecord>,
    pub relocations: Vec<RelocationRecord>,
    pub imports: Vec<ImportRecord>,
    pub strings: StringPool,
}

impl Object {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = ObjHeader::read(&mut cursor)?;
        let endian = header.endian()?;
        let file_len = bytes.len() as u64;

        let section_table_offset = header.section_table_offset as u64;
        let section_table_size = header.section_count as u64 * SECTION_RECORD_SIZE as u64;
        check_within_file(section_table_offset, section_table_size, file_len, "section table")?;

        let symbol_table_offset = section_table_offset + section_table_size;
        let symbol_table_size = header.symbol_count as u64 * SYMBOL_RECORD_SIZE as u64;
        check_within_file(symbol_table_offset, symbol_table_size, file_len, "symbol table")?;

        let derived_reloc_offset = symbol_table_offset + symbol_table_size;
        if derived_reloc_offset != header.reloc_table_offset as u64 {
            return Err(Error::CorruptHeader(format!(
                "reloc_table_offset {} does not immediately follow the symbol table (expected {})",
                header.reloc_table_offset, derived_reloc_offset
            )));
        }
        let reloc_table_size = header.reloc_count as u64 * RELOCATION_RECORD_SIZE as u64;
        check_within_file(derived_reloc_offset, reloc_table_size, file_len, "relocation table")?;

        let import_table_offset = derived_reloc_offset + reloc_table_size;
        let import_table_size = header.import_count as u64 * IMPORT_RECORD_SIZE as u64;
        check_within_file(import_table_offset, import_table_size, file_len, "import table")?;

        let derived_string_offset = import_table_offset + import_table_size;
        if derived_string_offset != header.string_table_offset as u64 {
            return Err(Error::CorruptHeader(format!(
                "string_table_offset {} does not immediately follow the import table (expected {})",
                header.string_table_offset, derived_string_offset
            )));
        }
        check_within_file(
            header.string_table_offset as u64,
            header.string_table_size as u64,
            file_len,
            "string table",
        )?;

        // String table: leading and trailing NUL.
        let str_start = header.string_table_offset as usize;
        let str_end = str_start + header.string_table_size as usize;
        let str_bytes = &bytes[str_start..str_end];
        if str_bytes.first() != Some(&0) {
            return Err(Error::CorruptHeader("string table missing leading NUL".into()));
        }
        if header.string_table_size > 0 && str_bytes.last() != Some(&0) {
            return Err(Error::CorruptHeader("string table missing trailing NUL".into()));
        }
        let strings = StringPool::from_bytes(str_bytes.to_vec());

        // Section table + bodies.
        cursor.seek(section_table_offset as usize)?;
        let mut records = Vec::with_capacity(header.section_count as usize);
        for _ in 0..header.section_count {
            records.push(SectionRecord::read(&mut cursor, endian)?);
        }

        let mut loaded_ranges: Vec<(u64, u64)> = Vec::new();
        let mut sections = Vec::with_capacity(records.len());
        for record in records {
            let data = if record.flags.contains(SectionFlags::ZERO_FILL) {
                Vec::new()
            } else if record.size == 0 {
                Vec::new()
            } else {
                let start = record.file_offset as u64;
                let end = start + record.size as u64;
                check_within_file(start, record.size as u64, file_len, "section body")?;
                for &(other_start, other_end) in &loaded_ranges {
                    if start < other_end && other_start < end {
                        return Err(Error::InvalidSection(format!(
                            "section body range [{start}, {end}) overlaps another section"
                        )));
                    }
                }
                loaded_ranges.push((start, end));
                bytes[start as usize..end as usize].to_vec()
            };
            sections.push(ObjSection { record, data });
        }

        // Symbol table.
        cursor.seek(symbol_table_offset as usize)?;
        let mut symbols = Vec::with_capacity(header.symbol_count as usize);
        for _ in 0..header.symbol_count {
            let symbol = SymbolRecord::read(&mut cursor, endian)?;
            if symbol.section_index != UNDEFINED_SECTION
                && symbol.section_index as usize >= sections.len()
            {
                return Err(Error::InvalidSymbol(format!(
                    "symbol section_index {} is neither 0xFFFF nor a valid section (section_count={})",
                    symbol.section_index,
                    sections.len()
                )));
            }
            symbols.push(symbol);
        }
        validate_symbol_ordering(&symbols)?;

        // Relocation table.
        cursor.seek(derived_reloc_offset as usize)?;
        let mut relocations = Vec::with_capacity(header.reloc_count as usize);
        for _ in 0..header.reloc_count {
            let reloc = RelocationRecord::read(&mut cursor, endian)?;
            let target = sections.get(reloc.target_section as usize).ok_or_else(|| {
                Error::InvalidRelocation(format!(
                    "target_section {} is out of range (section_count={})",
                    reloc.target_section,
                    sections.len()
                ))
            })?;
            if !target.record.flags.contains(SectionFlags::ALLOCATABLE) {
                return Err(Error::InvalidRelocation(format!(
                    "target_section {} is not a loadable section",
                    reloc.target_section
                )));
            }
            relocations.push(reloc);
        }

        // Import table.
        cursor.seek(import_table_offset as usize)?;
        let mut imports = Vec::with_capacity(header.import_count as usize);
        for _ in 0..header.import_count {
            imports.push(ImportRecord::read(&mut cursor, endian)?);
        }

        Ok(Self {
            flags: header.flags,
            entry_point: header.entry_point,
            sections,
            symbols,
            relocations,
            imports,
            strings,
        })
    }

    pub fn emit(&self) -> Result<Vec<u8>> {
        let endian = ObjHeader {
            flags: self.flags,
            entry_point: 0,
            section_count: 0,
            symbol_count: 0,
            string_table_offset: 0,
            string_table_size: 0,
            section_table_offset: 0,
            reloc_table_offset: 0,
            reloc_count: 0,
            import_count: 0,
        }
        .endian()?;

        if self.sections.len() > MAX_SECTIONS as usize {
            return Err(Error::SystemLimit(format!(
                "section count {} exceeds maximum {MAX_SECTIONS}",
                self.sections.len()
            )));
        }
        if self.symbols.len() > MAX_SYMBOLS as usize {
            return Err(Error::SystemLimit(format!(
                "symbol count {} exceeds maximum {MAX_SYMBOLS}",
                self.symbols.len()
            )));
        }

        let mut writer = Writer::new();
        // Placeholder header; backpatched once offsets are known.
        let placeholder = ObjHeader {
            flags: self.flags,
            entry_point: self.entry_point,
            section_count: self.sections.len() as u16,
            symbol_count: self.symbols.len() as u16,
            string_table_offset: 0,
            string_table_size: 0,
            section_table_offset: 0,
            reloc_table_offset: 0,
            reloc_count: self.relocations.len() as u16,
            import_count: self.imports.len() as u16,
        };
        placeholder.write(&mut writer)?;
        debug_assert_eq!(writer.position(), HEADER_SIZE);

        // Section bodies, each padded up to its own alignment.
        let mut final_sections = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            let mut record = section.record;
            if !record.flags.contains(SectionFlags::ZERO_FILL) && !section.data.is_empty() {
                writer.pad_to(record.alignment() as usize);
                record.file_offset = writer.position() as u32;
                writer.bytes(&section.data);
            } else if record.flags.contains(SectionFlags::ZERO_FILL) {
                record.file_offset = 0;
            }
            final_sections.push(record);
        }

        let section_table_offset = writer.position();
        for record in &final_sections {
            record.write(&mut writer, endian)?;
        }

        let symbol_table_offset = writer.position();
        for symbol in &self.symbols {
            symbol.write(&mut writer, endian);
        }

        let reloc_table_offset = writer.position();
        for reloc in &self.relocations {
            reloc.write(&mut writer, endian)?;
        }

        let import_table_offset = writer.position();
        for import in &self.imports {
            import.write(&mut writer, endian);
        }

        let string_table_offset = writer.position();
        writer.bytes(self.strings.bytes());
        let string_table_size = self.strings.bytes().len();

        if writer.position() as u64 > MAX_FILE_SIZE {
            return Err(Error::OutputTooLarge);
        }

        writer.patch_u32(8, self.entry_point, endian);
        let header_flags_endian = ObjHeader {
            flags: self.flags,
            entry_point: 0,
            section_count: 0,
            symbol_count: 0,
            string_table_offset: 0,
            string_table_size: 0,
            section_table_offset: 0,
            reloc_table_offset: 0,
            reloc_count: 0,
            import_count: 0,
        }
        .endian()?;
        writer.patch_u32(16, string_table_offset as u32, header_flags_endian);
        writer.patch_u32(20, string_table_size as u32, header_flags_endian);
        writer.patch_u32(24, section_table_offset as u32, header_flags_endian);
        writer.patch_u32(28, reloc_table_offset as u32, header_flags_endian);

        let _ = symbol_table_offset; // derived on read, not stored
        let _ = import_table_offset; // derived on read, not stored

        Ok(writer.into_vec())
    }
}

fn check_within_file(offset: u64, size: u64, file_len: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| Error::CorruptHeader(format!("{what} offset/size overflow")))?;
    if end > file_len {
        return Err(Error::CorruptHeader(format!(
            "{what} [{offset}, {end}) exceeds file length {file_len}"
        )));
    }
    Ok(())
}

fn validate_symbol_ordering(symbols: &[SymbolRecord]) -> Result<()> {
    let mut seen_non_local = false;
    for symbol in symbols {
        match symbol.binding {
            SymbolBinding::Local => {
                if seen_non_local {
                    return Err(Error::InvalidSymbol(
                        "local symbols must precede all non-local symbols".into(),
                    ));
                }
            }
            SymbolBinding::Global | SymbolBinding::Weak => seen_non_local = true,
        }
    }
    Ok(())
}
