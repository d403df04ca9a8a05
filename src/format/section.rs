//! Section record (spec §3): fixed 20-byte record describing one named,
//! flagged byte range.

use bitflags::bitflags;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::format::{Cursor, Endian, Writer};

pub const SECTION_RECORD_SIZE: usize = 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u16 {
        const WRITABLE    = 1 << 0;
        const ALLOCATABLE = 1 << 1;
        const EXECUTABLE  = 1 << 2;
        const MERGE       = 1 << 3;
        const STRINGS     = 1 << 4;
        const ZERO_FILL   = 1 << 5;
        const COMPRESSED  = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct SectionRecord {
    pub name_offset: u32,
    pub virtual_addr: u32,
    pub size: u32,
    pub file_offset: u32,
    pub flags: SectionFlags,
    pub alignment_log2: u8,
}

impl SectionRecord {
    pub fn alignment(&self) -> u32 {
        1u32 << self.alignment_log2
    }

    pub fn validate(&self) -> Result<()> {
        if self.alignment_log2 > 15 {
            return Err(Error::InvalidSection(format!(
                "alignment_log2 {} exceeds maximum 15",
                self.alignment_log2
            )));
        }
        if self.flags.contains(SectionFlags::ZERO_FILL) && self.file_offset != 0 {
            return Err(Error::InvalidSection(
                "zero-fill section must have file_offset == 0".into(),
            ));
        }
        Ok(())
    }

    pub fn read(cursor: &mut Cursor, endian: Endian) -> Result<Self> {
        let name_offset = cursor.u32(endian)?;
        let virtual_addr = cursor.u32(endian)?;
        let size = cursor.u32(endian)?;
        let file_offset = cursor.u32(endian)?;
        let raw_flags = cursor.u16(endian)?;
        let flags = SectionFlags::from_bits(raw_flags).ok_or_else(|| {
            Error::InvalidSection(format!("unknown section flag bits {raw_flags:#06x}"))
        })?;
        let alignment_log2 = cursor.u8()?;
        let _reserved = cursor.u8()?;
        let record = Self {
            name_offset,
            virtual_addr,
            size,
            file_offset,
            flags,
            alignment_log2,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn write(&self, writer: &mut Writer, endian: Endian) -> Result<()> {
        self.validate()?;
        writer.u32(self.name_offset, endian);
        writer.u32(self.virtual_addr, endian);
        writer.u32(self.size, endian);
        writer.u32(self.file_offset, endian);
        writer.u16(self.flags.bits(), endian);
        writer.u8(self.alignment_log2);
        writer.u8(0); // reserved
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> SectionRecord {
        SectionRecord {
            name_offset: 1,
            virtual_addr: 0x1000,
            size: 64,
            file_offset: 36,
            flags: SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE,
            alignment_log2: 4,
        }
    }

    #[test]
    fn roundtrip() {
        let rec = sample();
        let mut w = Writer::new();
        rec.write(&mut w, Endian::Little).unwrap();
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), SECTION_RECORD_SIZE);
        let mut c = Cursor::new(&bytes);
        assert_eq!(SectionRecord::read(&mut c, Endian::Little).unwrap(), rec);
    }

    #[test]
    fn alignment_is_power_of_two_of_log2() {
        let mut rec = sample();
        rec.alignment_log2 = 0;
        assert_eq!(rec.alignment(), 1);
        rec.alignment_log2 = 5;
        assert_eq!(rec.alignment(), 32);
    }

    #[test]
    fn zero_fill_requires_zero_file_offset() {
        let mut rec = sample();
        rec.flags |= SectionFlags::ZERO_FILL;
        rec.file_offset = 4;
        assert!(rec.validate().is_err());
        rec.file_offset = 0;
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn rejects_alignment_log2_over_15() {
        let mut rec = sample();
        rec.alignment_log2 = 16;
        assert!(rec.validate().is_err());
    }
}
