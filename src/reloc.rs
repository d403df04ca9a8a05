//! Relocation engine (C6): patches section bytes in place per spec §4.6.

use crate::error::{Error, Result};
use crate::format::relocation::{RelocationKind, RelocationRecord};

/// Output mode affects how the reserved dynamic relocation kinds are
/// handled (spec §4.6): rejected for `Static`, passed through untouched
/// for `Shared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Static,
    Shared,
}

/// Apply one relocation to `section_data`, given the already-resolved
/// `symbol_address`, the target section's own `section_base` (used by
/// `Relative`, which ignores the symbol and rebases an existing
/// addend), and the relocation site's `pc` (`section_base + offset +
/// width`, needed for pc-relative kinds).
pub fn apply(
    record: &RelocationRecord,
    section_data: &mut [u8],
    symbol_address: u32,
    section_base: u32,
    pc: u32,
    input_index: usize,
    section_index: usize,
    mode: OutputMode,
) -> Result<()> {
    if record.kind.is_dynamic() {
        return match mode {
            OutputMode::Shared => Ok(()),
            OutputMode::Static => Err(Error::RelocationFailed {
                input: input_index,
                section: section_index,
                offset: record.offset,
                reason: format!("{:?} relocation requires shared output", record.kind),
            }),
        };
    }

    let offset = record.offset as usize;
    let width = record.kind.width().unwrap_or(0) as usize;
    if width == 0 {
        // RelocationKind::None: no-op by definition.
        return Ok(());
    }
    let end = offset
        .checked_add(width)
        .ok_or_else(|| relocation_failed(input_index, section_index, record.offset, "offset overflow"))?;
    if end > section_data.len() {
        return Err(relocation_failed(
            input_index,
            section_index,
            record.offset,
            "relocation site exceeds section bounds",
        ));
    }

    let value: i64 = match record.kind {
        RelocationKind::Abs8 | RelocationKind::Abs16 | RelocationKind::Abs32 => symbol_address as i64,
        RelocationKind::PcRel8 | RelocationKind::PcRel16 | RelocationKind::PcRel32 => {
            symbol_address as i64 - pc as i64
        }
        RelocationKind::Relative => {
            // Spec §4.6: add the target section's base to the existing
            // 32-bit addend already stored at the site; the symbol is
            // not consulted.
            let existing = u32::from_le_bytes(section_data[offset..end].try_into().unwrap());
            existing as i64 + section_base as i64
        }
        _ => unreachable!("dynamic kinds handled above"),
    };

    write_checked(record.kind, value, &mut section_data[offset..end], input_index, section_index, record.offset)
}

fn write_checked(
    kind: RelocationKind,
    value: i64,
    dest: &mut [u8],
    input_index: usize,
    section_index: usize,
    reloc_offset: u32,
) -> Result<()> {
    let fail = |reason: &str| relocation_failed(input_index, section_index, reloc_offset, reason);
    match kind {
        RelocationKind::Abs8 => {
            let v: u8 = value.try_into().map_err(|_| fail("value does not fit in 8 bits"))?;
            dest[0] = v;
        }
        RelocationKind::PcRel8 => {
            let v: i8 = value.try_into().map_err(|_| fail("pc-relative value overflows 8-bit signed range"))?;
            dest[0] = v as u8;
        }
        RelocationKind::Abs16 => {
            let v: u16 = value.try_into().map_err(|_| fail("value does not fit in 16 bits"))?;
            dest.copy_from_slice(&v.to_le_bytes());
        }
        RelocationKind::PcRel16 => {
            let v: i16 = value
                .try_into()
                .map_err(|_| fail("pc-relative value overflows 16-bit signed range"))?;
            dest.copy_from_slice(&v.to_le_bytes());
        }
        RelocationKind::Abs32 | RelocationKind::Relative => {
            let v: u32 = value.try_into().map_err(|_| fail("value does not fit in 32 bits"))?;
            dest.copy_from_slice(&v.to_le_bytes());
        }
        RelocationKind::PcRel32 => {
            let v: i32 = value
                .try_into()
                .map_err(|_| fail("pc-relative value overflows 32-bit signed range"))?;
            dest.copy_from_slice(&v.to_le_bytes());
        }
        _ => unreachable!("dynamic and None kinds handled by caller"),
    }
    Ok(())
}

fn relocation_failed(input: usize, section: usize, offset: u32, reason: &str) -> Error {
    Error::RelocationFailed {
        input,
        section,
        offset,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::relocation::RelocationRecord;

    fn rec(kind: RelocationKind, offset: u32) -> RelocationRecord {
        RelocationRecord::builder()
            .offset(offset)
            .symbol_index(0)
            .kind(kind)
            .target_section(0)
            .build()
    }

    #[test]
    fn abs32_writes_symbol_address() {
        let r = rec(RelocationKind::Abs32, 0);
        let mut data = [0u8; 4];
        apply(&r, &mut data, 0xDEADBEEF, 0, 0, 0, 0, OutputMode::Static).unwrap();
        assert_eq!(data, 0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    fn pcrel32_is_signed_difference() {
        let r = rec(RelocationKind::PcRel32, 0);
        let mut data = [0u8; 4];
        apply(&r, &mut data, 0x2000, 0, 0x1000, 0, 0, OutputMode::Static).unwrap();
        assert_eq!(i32::from_le_bytes(data), 0x1000);
    }

    #[test]
    fn pcrel8_overflow_is_rejected() {
        let r = rec(RelocationKind::PcRel8, 0);
        let mut data = [0u8; 1];
        let err = apply(&r, &mut data, 0x1000, 0, 0, 2, 1, OutputMode::Static);
        assert!(matches!(err, Err(Error::RelocationFailed { input: 2, section: 1, .. })));
    }

    #[test]
    fn relative_adds_section_base_to_existing_addend() {
        let r = rec(RelocationKind::Relative, 0);
        let mut data = 10u32.to_le_bytes();
        apply(&r, &mut data, 0xFFFF_FFFF, 0x2000, 0, 0, 0, OutputMode::Static).unwrap();
        assert_eq!(u32::from_le_bytes(data), 0x2000 + 10);
    }

    #[test]
    fn dynamic_kind_rejected_under_static_passthrough_under_shared() {
        let r = rec(RelocationKind::Plt32, 0);
        let mut data = [0u8; 4];
        assert!(apply(&r, &mut data, 0, 0, 0, 0, 0, OutputMode::Static).is_err());
        assert!(apply(&r, &mut data, 0, 0, 0, 0, 0, OutputMode::Shared).is_ok());
    }

    #[test]
    fn none_kind_is_noop() {
        let r = rec(RelocationKind::None, 0);
        let mut data = [0xAAu8; 4];
        apply(&r, &mut data, 0xFF, 0, 0, 0, 0, OutputMode::Static).unwrap();
        assert_eq!(data, [0xAA; 4]);
    }

    #[test]
    fn out_of_bounds_site_is_rejected() {
        let r = rec(RelocationKind::Abs32, 10);
        let mut data = [0u8; 4];
        assert!(apply(&r, &mut data, 0, 0, 0, 0, 0, OutputMode::Static).is_err());
    }
}
