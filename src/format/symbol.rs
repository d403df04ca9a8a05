//! Symbol record (spec §3): fixed 16-byte record.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::format::{Cursor, Endian, Writer};

pub const SYMBOL_RECORD_SIZE: usize = 16;

/// Marks a symbol as undefined (no owning section).
pub const UNDEFINED_SECTION: u16 = 0xFFFF;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SymbolKind {
    NoType = 0,
    Object = 1,
    Func = 2,
    Section = 3,
    File = 4,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SymbolBinding {
    Local = 0,
    Global = 1,
    Weak = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct SymbolRecord {
    pub name_offset: u32,
    pub value: u32,
    pub size: u32,
    /// `0xFFFF` denotes an undefined symbol (spec §3).
    pub section_index: u16,
    pub kind: SymbolKind,
    pub binding: SymbolBinding,
}

impl SymbolRecord {
    pub fn is_undefined(&self) -> bool {
        self.section_index == UNDEFINED_SECTION
    }

    pub fn read(cursor: &mut Cursor, endian: Endian) -> Result<Self> {
        let name_offset = cursor.u32(endian)?;
        let value = cursor.u32(endian)?;
        let size = cursor.u32(endian)?;
        let section_index = cursor.u16(endian)?;
        let raw_kind = cursor.u8()?;
        let raw_binding = cursor.u8()?;
        let kind = SymbolKind::from_u8(raw_kind)
            .ok_or_else(|| Error::InvalidSymbol(format!("unknown symbol type {raw_kind}")))?;
        let binding = SymbolBinding::from_u8(raw_binding)
            .ok_or_else(|| Error::InvalidSymbol(format!("unknown symbol binding {raw_binding}")))?;
        Ok(Self {
            name_offset,
            value,
            size,
            section_index,
            kind,
            binding,
        })
    }

    pub fn write(&self, writer: &mut Writer, endian: Endian) {
        writer.u32(self.name_offset, endian);
        writer.u32(self.value, endian);
        writer.u32(self.size, endian);
        writer.u16(self.section_index, endian);
        writer.u8(self.kind as u8);
        writer.u8(self.binding as u8);
    }
}
