//! OBJ header record (spec §3): fixed 36-byte record at the start of
//! every object file.

use bitflags::bitflags;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::format::{Cursor, Endian, Writer};

/// Magic identifying the OBJ format.
pub const MAGIC: u32 = 0x4A42_4F30; // "0OBJ" read as a little-endian u32
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 36;
pub const MAX_SECTIONS: u16 = 255;
pub const MAX_SYMBOLS: u16 = 65535;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u16 {
        const EXECUTABLE           = 1 << 0;
        const RELOCATABLE          = 1 << 1;
        const SHARED               = 1 << 2;
        const DEBUG                = 1 << 3;
        const LITTLE_ENDIAN        = 1 << 4;
        const BIG_ENDIAN           = 1 << 5;
        const POSITION_INDEPENDENT = 1 << 6;
        const STRIPPED             = 1 << 7;
        const STATIC               = 1 << 8;
        const COMPRESSED           = 1 << 9;
        const ENCRYPTED            = 1 << 10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct ObjHeader {
    pub flags: HeaderFlags,
    pub entry_point: u32,
    pub section_count: u16,
    pub symbol_count: u16,
    pub string_table_offset: u32,
    pub string_table_size: u32,
    pub section_table_offset: u32,
    pub reloc_table_offset: u32,
    pub reloc_count: u16,
    pub import_count: u16,
}

impl ObjHeader {
    /// The byte order this header declares for the rest of the file.
    pub fn endian(&self) -> Result<Endian> {
        match (
            self.flags.contains(HeaderFlags::LITTLE_ENDIAN),
            self.flags.contains(HeaderFlags::BIG_ENDIAN),
        ) {
            (true, false) => Ok(Endian::Little),
            (false, true) => Ok(Endian::Big),
            _ => Err(Error::CorruptHeader(
                "exactly one of {little, big} endian flags must be set".into(),
            )),
        }
    }

    /// Parse the header from the start of `cursor`, validating every
    /// invariant from spec §3 except the table-offset-within-file
    /// checks, which require knowing the total file length (performed
    /// by the caller, `Object::parse`).
    pub fn read(cursor: &mut Cursor) -> Result<Self> {
        // Magic and version are read with a fixed (little-endian) byte
        // order since the flags field that would tell us the file's
        // endianness has not been read yet.
        let magic = cursor.u32(Endian::Little)?;
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = cursor.u16(Endian::Little)?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let raw_flags = cursor.u16(Endian::Little)?;
        let flags = HeaderFlags::from_bits(raw_flags)
            .ok_or_else(|| Error::CorruptHeader(format!("unknown header flag bits {raw_flags:#06x}")))?;
        let endian = {
            let probe = ObjHeader {
                flags,
                entry_point: 0,
                section_count: 0,
                symbol_count: 0,
                string_table_offset: 0,
                string_table_size: 0,
                section_table_offset: 0,
                reloc_table_offset: 0,
                reloc_count: 0,
                import_count: 0,
            };
            probe.endian()?
        };

        let entry_point = cursor.u32(endian)?;
        let section_count = cursor.u16(endian)?;
        let symbol_count = cursor.u16(endian)?;
        let string_table_offset = cursor.u32(endian)?;
        let string_table_size = cursor.u32(endian)?;
        let section_table_offset = cursor.u32(endian)?;
        let reloc_table_offset = cursor.u32(endian)?;
        let reloc_count = cursor.u16(endian)?;
        let import_count = cursor.u16(endian)?;

        if section_count > MAX_SECTIONS {
            return Err(Error::CorruptHeader(format!(
                "section_count {section_count} exceeds maximum {MAX_SECTIONS}"
            )));
        }
        if symbol_count > MAX_SYMBOLS {
            return Err(Error::CorruptHeader(format!(
                "symbol_count {symbol_count} exceeds maximum {MAX_SYMBOLS}"
            )));
        }

        Ok(Self {
            flags,
            entry_point,
            section_count,
            symbol_count,
            string_table_offset,
            string_table_size,
            section_table_offset,
            reloc_table_offset,
            reloc_count,
            import_count,
        })
    }

    pub fn write(&self, writer: &mut Writer) -> Result<()> {
        let endian = self.endian()?;
        writer.u32(MAGIC, Endian::Little);
        writer.u16(VERSION, Endian::Little);
        writer.u16(self.flags.bits(), Endian::Little);
        writer.u32(self.entry_point, endian);
        writer.u16(self.section_count, endian);
        writer.u16(self.symbol_count, endian);
        writer.u32(self.string_table_offset, endian);
        writer.u32(self.string_table_size, endian);
        writer.u32(self.section_table_offset, endian);
        writer.u32(self.reloc_table_offset, endian);
        writer.u16(self.reloc_count, endian);
        writer.u16(self.import_count, endian);
        Ok(())
    }
}
