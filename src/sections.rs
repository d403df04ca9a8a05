//! Output section manager (C5): merges per-input sections into output
//! sections and assigns final addresses.

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::format::align_up;
use crate::format::section::{SectionFlags, SectionRecord};

/// Placement category, ordered per spec §4.5: text, then rodata, then
/// data, then bss. Sections merge into an output bucket by this
/// category, derived from the input section's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Text,
    RoData,
    Data,
    Bss,
}

impl Category {
    pub fn classify(flags: SectionFlags) -> Self {
        if flags.contains(SectionFlags::ZERO_FILL) {
            Category::Bss
        } else if flags.contains(SectionFlags::EXECUTABLE) {
            Category::Text
        } else if flags.contains(SectionFlags::WRITABLE) {
            Category::Data
        } else {
            Category::RoData
        }
    }
}

/// Records where one input's local section landed inside a (possibly
/// merged) output chunk, needed to resolve a relocation or symbol
/// value into a final address after layout.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub input_index: usize,
    pub local_section_index: u16,
    pub offset_in_chunk: u32,
    pub length: u32,
}

/// One output section: the concatenation of every input section that
/// shares its name (spec §4.5's "merge two sections with identical
/// names"), retained until layout assigns it a final address.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub category: Category,
    pub alignment: u32,
    pub size: u32,
    pub data: Vec<u8>,
    pub flags: SectionFlags,
    pub segments: Vec<Segment>,
    /// Filled in by [`SectionManager::layout`].
    pub output_address: u32,
}

#[derive(Debug)]
pub struct SectionManager {
    chunks: Vec<Chunk>,
    /// Backs every merged-section byte buffer staged during ingest
    /// (spec §3/§5: the arena is the allocator record storage goes
    /// through); each staged buffer is copied into its owning `Chunk`
    /// immediately, so nothing ever borrows into the arena.
    arena: Arena,
}

impl Default for SectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionManager {
    pub fn new() -> Self {
        Self { chunks: Vec::new(), arena: Arena::scratch() }
    }

    /// Stage `data` through the arena and copy it back out, so merged
    /// section bytes are allocated via C1 rather than directly via
    /// `Vec`.
    fn stage_bytes(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut staged = self.arena.alloc_growing(data.len(), 1)?;
        staged.copy_from_slice(data);
        Ok(staged)
    }

    /// Enter one input section. A chunk already carrying this name is
    /// reused (merged into) if its flags are compatible; otherwise a
    /// fresh chunk is created (spec §4.5: "merge two sections with
    /// identical names and compatible flags ... otherwise error").
    pub fn ingest_section(
        &mut self,
        name: &str,
        input_index: usize,
        local_section_index: u16,
        record: &SectionRecord,
        data: Vec<u8>,
    ) -> Result<()> {
        record.validate()?;
        let zero_fill = record.flags.contains(SectionFlags::ZERO_FILL);

        let merge_index = match self.chunks.iter().position(|c| c.name == name) {
            Some(i) if !compatible(self.chunks[i].flags, record.flags) => {
                return Err(Error::InvalidSection(format!(
                    "section `{name}` flags are incompatible for merge"
                )));
            }
            found => found,
        };
        let staged = if zero_fill { Vec::new() } else { self.stage_bytes(&data)? };

        if let Some(i) = merge_index {
            let existing = &mut self.chunks[i];
            let offset_in_chunk = existing.size;
            existing.alignment = existing.alignment.max(record.alignment());
            if !zero_fill {
                existing.data.extend_from_slice(&staged);
            }
            existing.size += record.size;
            existing.segments.push(Segment {
                input_index,
                local_section_index,
                offset_in_chunk,
                length: record.size,
            });
            return Ok(());
        }

        self.chunks.push(Chunk {
            name: name.to_string(),
            category: Category::classify(record.flags),
            alignment: record.alignment(),
            size: record.size,
            data: staged,
            flags: record.flags,
            segments: vec![Segment {
                input_index,
                local_section_index,
                offset_in_chunk: 0,
                length: record.size,
            }],
            output_address: 0,
        });
        Ok(())
    }

    pub fn set_alignment(&mut self, chunk_name: &str, alignment: u32) -> Result<()> {
        if !alignment.is_power_of_two() {
            return Err(Error::SectionAlignment(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| c.name == chunk_name)
            .ok_or_else(|| Error::InvalidSection(format!("no section named `{chunk_name}`")))?;
        chunk.alignment = alignment;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn filter_by_flags(&self, mask: SectionFlags, match_all: bool) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(move |c| {
            if match_all {
                c.flags.contains(mask)
            } else {
                c.flags.intersects(mask)
            }
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Output address of an input's local section, found through
    /// whichever chunk it was merged into. Callers add their own
    /// in-section offset (e.g. a relocation site or symbol value) on
    /// top of the returned base.
    pub fn address_of(&self, input_index: usize, local_section_index: u16) -> Option<u32> {
        for chunk in &self.chunks {
            for seg in &chunk.segments {
                if seg.input_index == input_index && seg.local_section_index == local_section_index {
                    return Some(chunk.output_address + seg.offset_in_chunk);
                }
            }
        }
        None
    }

    /// Name of the output chunk an input's local section landed in, and
    /// its offset within that chunk — used to translate a relocation
    /// site into merged-section-relative coordinates without requiring
    /// output addresses to have been assigned yet (spec §4.6
    /// passthrough for dynamic relocation kinds).
    pub fn chunk_location(&self, input_index: usize, local_section_index: u16) -> Option<(String, u32)> {
        for chunk in &self.chunks {
            for seg in &chunk.segments {
                if seg.input_index == input_index && seg.local_section_index == local_section_index {
                    return Some((chunk.name.clone(), seg.offset_in_chunk));
                }
            }
        }
        None
    }

    /// Mutable window onto exactly the bytes one input's local section
    /// contributed to its (possibly merged) output chunk, plus that
    /// chunk's output address — used by the relocation engine to patch
    /// in place.
    pub fn segment_slice_mut(&mut self, input_index: usize, local_section_index: u16) -> Option<(&mut [u8], u32)> {
        for chunk in &mut self.chunks {
            let found = chunk
                .segments
                .iter()
                .find(|s| s.input_index == input_index && s.local_section_index == local_section_index)
                .map(|s| (s.offset_in_chunk, s.length));
            if let Some((offset, length)) = found {
                let base = chunk.output_address;
                let start = offset as usize;
                let end = start + length as usize;
                if end > chunk.data.len() {
                    return None;
                }
                return Some((&mut chunk.data[start..end], base));
            }
        }
        None
    }

    /// Lays sections out at `base_address` in category order (text,
    /// rodata, data, bss), insertion order within a category, aligning
    /// each chunk's start up to its own alignment (spec §4.5). Returns
    /// the final cursor (one past the last byte used), the image size.
    /// Rejects a layout that would not fit in 32 bits.
    pub fn layout(&mut self, base_address: u32) -> Result<u32> {
        let mut order: Vec<usize> = (0..self.chunks.len()).collect();
        order.sort_by_key(|&i| (self.chunks[i].category, i));

        let mut cursor: u64 = base_address as u64;
        for &i in &order {
            let align = self.chunks[i].alignment.max(1) as u64;
            cursor = align_up(cursor, align);
            if cursor > u32::MAX as u64 {
                return Err(Error::OutputTooLarge);
            }
            self.chunks[i].output_address = cursor as u32;
            cursor += self.chunks[i].size as u64;
        }
        if cursor > u32::MAX as u64 {
            return Err(Error::OutputTooLarge);
        }
        Ok(cursor as u32)
    }
}

fn compatible(a: SectionFlags, b: SectionFlags) -> bool {
    let exec = SectionFlags::EXECUTABLE;
    let write = SectionFlags::WRITABLE;
    (a.contains(exec) && b.contains(exec)) || (a.contains(write) && b.contains(write))
        || (!a.intersects(exec | write) && !b.intersects(exec | write))
}

#[cfg(test)]
mod test {
    use super::*;

    fn rec(size: u32, align_log2: u8, flags: SectionFlags) -> SectionRecord {
        SectionRecord::builder()
            .name_offset(0)
            .virtual_addr(0)
            .size(size)
            .file_offset(0)
            .flags(flags)
            .alignment_log2(align_log2)
            .build()
    }

    #[test]
    fn classify_by_flags() {
        assert_eq!(Category::classify(SectionFlags::EXECUTABLE), Category::Text);
        assert_eq!(Category::classify(SectionFlags::WRITABLE), Category::Data);
        assert_eq!(Category::classify(SectionFlags::ZERO_FILL), Category::Bss);
        assert_eq!(Category::classify(SectionFlags::ALLOCATABLE), Category::RoData);
    }

    #[test]
    fn layout_orders_by_category_then_insertion_order() {
        let mut mgr = SectionManager::new();
        mgr.ingest_section(".data", 0, 0, &rec(4, 0, SectionFlags::WRITABLE), vec![0; 4])
            .unwrap();
        mgr.ingest_section(".text", 1, 0, &rec(8, 2, SectionFlags::EXECUTABLE), vec![0; 8])
            .unwrap();
        mgr.ingest_section(".bss", 0, 1, &rec(16, 0, SectionFlags::ZERO_FILL), vec![])
            .unwrap();

        let end = mgr.layout(0x1000).unwrap();
        assert_eq!(mgr.address_of(1, 0), Some(0x1000));
        assert_eq!(mgr.address_of(0, 0), Some(0x1000 + 8));
        assert_eq!(mgr.address_of(0, 1), Some(0x1000 + 8 + 4));
        assert_eq!(end, 0x1000 + 8 + 4 + 16);
    }

    #[test]
    fn same_name_sections_merge_and_track_segments() {
        let mut mgr = SectionManager::new();
        mgr.ingest_section(".text", 0, 0, &rec(4, 0, SectionFlags::EXECUTABLE), vec![1, 2, 3, 4])
            .unwrap();
        mgr.ingest_section(".text", 1, 0, &rec(2, 0, SectionFlags::EXECUTABLE), vec![5, 6])
            .unwrap();
        assert_eq!(mgr.len(), 1);
        let chunk = mgr.iter().next().unwrap();
        assert_eq!(chunk.size, 6);
        assert_eq!(chunk.data, vec![1, 2, 3, 4, 5, 6]);

        mgr.layout(0).unwrap();
        assert_eq!(mgr.address_of(0, 0), Some(0));
        assert_eq!(mgr.address_of(1, 0), Some(4));
    }

    #[test]
    fn incompatible_merge_is_rejected() {
        let mut mgr = SectionManager::new();
        mgr.ingest_section(".mixed", 0, 0, &rec(4, 0, SectionFlags::EXECUTABLE), vec![0; 4])
            .unwrap();
        let err = mgr.ingest_section(".mixed", 1, 0, &rec(4, 0, SectionFlags::WRITABLE), vec![0; 4]);
        assert!(matches!(err, Err(Error::InvalidSection(_))));
    }

    #[test]
    fn layout_respects_alignment() {
        let mut mgr = SectionManager::new();
        mgr.ingest_section(".a", 0, 0, &rec(1, 0, SectionFlags::EXECUTABLE), vec![0])
            .unwrap();
        mgr.ingest_section(".b", 0, 1, &rec(4, 4, SectionFlags::EXECUTABLE), vec![0; 4])
            .unwrap();
        mgr.layout(0).unwrap();
        let addrs: Vec<u32> = mgr.iter().map(|c| c.output_address).collect();
        assert_eq!(addrs[0], 0);
        assert_eq!(addrs[1] % 16, 0);
    }

    #[test]
    fn layout_rejects_overflow_past_32_bits() {
        let mut mgr = SectionManager::new();
        mgr.ingest_section(".a", 0, 0, &rec(u32::MAX, 0, SectionFlags::EXECUTABLE), vec![])
            .unwrap();
        mgr.ingest_section(".b", 0, 1, &rec(16, 0, SectionFlags::EXECUTABLE), vec![])
            .unwrap();
        assert!(matches!(mgr.layout(1), Err(Error::OutputTooLarge)));
    }
}
