//! Import record (spec §3): fixed 8-byte (library, symbol) name pair.

use typed_builder::TypedBuilder;

use crate::error::Result;
use crate::format::{Cursor, Endian, Writer};

pub const IMPORT_RECORD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct ImportRecord {
    pub library_name_offset: u32,
    pub symbol_name_offset: u32,
}

impl ImportRecord {
    pub fn read(cursor: &mut Cursor, endian: Endian) -> Result<Self> {
        let library_name_offset = cursor.u32(endian)?;
        let symbol_name_offset = cursor.u32(endian)?;
        Ok(Self {
            library_name_offset,
            symbol_name_offset,
        })
    }

    pub fn write(&self, writer: &mut Writer, endian: Endian) {
        writer.u32(self.library_name_offset, endian);
        writer.u32(self.symbol_name_offset, endian);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let rec = ImportRecord {
            library_name_offset: 12,
            symbol_name_offset: 40,
        };
        let mut w = Writer::new();
        rec.write(&mut w, Endian::Big);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), IMPORT_RECORD_SIZE);
        let mut c = Cursor::new(&bytes);
        assert_eq!(ImportRecord::read(&mut c, Endian::Big).unwrap(), rec);
    }
}
