//! Relocation record (spec §3): fixed 8-byte patch description.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::format::{Cursor, Endian, Writer};

pub const RELOCATION_RECORD_SIZE: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RelocationKind {
    None = 0,
    Abs8 = 1,
    Abs16 = 2,
    Abs32 = 3,
    PcRel8 = 4,
    PcRel16 = 5,
    PcRel32 = 6,
    Got32 = 7,
    Plt32 = 8,
    Copy = 9,
    GlobDat = 10,
    JmpSlot = 11,
    Relative = 12,
}

impl RelocationKind {
    /// True for the dynamic-linking kinds reserved by spec §4.6: under
    /// static output they are errors, under shared output they pass
    /// through unchanged.
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            RelocationKind::Got32
                | RelocationKind::Plt32
                | RelocationKind::Copy
                | RelocationKind::GlobDat
                | RelocationKind::JmpSlot
        )
    }

    /// Patch width in bytes for the fixed-width absolute/pc-relative
    /// kinds, or `None` for kinds with no fixed patch width.
    pub fn width(&self) -> Option<u32> {
        match self {
            RelocationKind::Abs8 | RelocationKind::PcRel8 => Some(1),
            RelocationKind::Abs16 | RelocationKind::PcRel16 => Some(2),
            RelocationKind::Abs32 | RelocationKind::PcRel32 | RelocationKind::Relative => Some(4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct RelocationRecord {
    /// Offset within the target section.
    pub offset: u32,
    pub symbol_index: u32,
    pub kind: RelocationKind,
    pub target_section: u16,
}

impl RelocationRecord {
    pub fn read(cursor: &mut Cursor, endian: Endian) -> Result<Self> {
        let offset = cursor.u32(endian)?;
        let symbol_index = cursor.u16(endian)? as u32;
        let raw_kind = cursor.u8()?;
        let kind = RelocationKind::from_u8(raw_kind)
            .ok_or_else(|| Error::InvalidRelocation(format!("unknown relocation type {raw_kind}")))?;
        let target_section = cursor.u8()? as u16;
        Ok(Self {
            offset,
            symbol_index,
            kind,
            target_section,
        })
    }

    pub fn write(&self, writer: &mut Writer, endian: Endian) -> Result<()> {
        if self.symbol_index > u16::MAX as u32 {
            return Err(Error::InvalidRelocation(format!(
                "symbol_index {} exceeds 16 bits",
                self.symbol_index
            )));
        }
        if self.target_section > u8::MAX as u16 {
            return Err(Error::InvalidRelocation(format!(
                "target_section {} exceeds 8 bits",
                self.target_section
            )));
        }
        writer.u32(self.offset, endian);
        writer.u16(self.symbol_index as u16, endian);
        writer.u8(self.kind as u8);
        writer.u8(self.target_section as u8);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> RelocationRecord {
        RelocationRecord {
            offset: 8,
            symbol_index: 3,
            kind: RelocationKind::Abs32,
            target_section: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let rec = sample();
        let mut w = Writer::new();
        rec.write(&mut w, Endian::Little).unwrap();
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), RELOCATION_RECORD_SIZE);
        let mut c = Cursor::new(&bytes);
        assert_eq!(RelocationRecord::read(&mut c, Endian::Little).unwrap(), rec);
    }

    #[test]
    fn dynamic_kinds_are_flagged() {
        assert!(RelocationKind::Got32.is_dynamic());
        assert!(!RelocationKind::Abs32.is_dynamic());
    }

    #[test]
    fn width_matches_fixed_width_kinds() {
        assert_eq!(RelocationKind::Abs8.width(), Some(1));
        assert_eq!(RelocationKind::PcRel16.width(), Some(2));
        assert_eq!(RelocationKind::Relative.width(), Some(4));
        assert_eq!(RelocationKind::Got32.width(), None);
    }
}
