//! Archive engine (C9): member storage, a hand-rolled open-addressing
//! name index, and (de)serialization of the on-disk container (spec
//! §4.9, §6).

use bitflags::bitflags;
use typed_builder::TypedBuilder;

use crate::compress;
use crate::error::{Error, Result};

const MAGIC: u32 = 0x4152_4331; // "1CRA" read little-endian
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 20;
const INDEX_RECORD_SIZE: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemberFlags: u32 {
        const COMPRESSED = 1 << 0;
        const EXECUTABLE = 1 << 1;
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct AddOptions {
    #[builder(default)]
    pub compress: bool,
    #[builder(default)]
    pub executable: bool,
    /// Caller-supplied timestamp (seconds since epoch, or any
    /// caller-defined clock): the engine never reads the wall clock
    /// itself, keeping `add` a pure function of its arguments.
    #[builder(default)]
    pub timestamp: u64,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub original_size: u32,
    pub stored_size: u32,
    pub body_offset: u32,
    pub crc32: u32,
    pub timestamp: u64,
    pub flags: MemberFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Size,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveStats {
    pub entries: usize,
    pub table_size: usize,
    pub load_factor: f64,
}

/// Open-addressing hash index by member name, linear probing, grown to
/// keep the load factor at or below `GROWTH_TARGET` (spec §4.9).
#[derive(Debug, Clone)]
struct NameIndex {
    slots: Vec<Option<(String, usize)>>,
    len: usize,
}

const GROWTH_TARGET: f64 = 0.5;

impl NameIndex {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(8);
        Self {
            slots: vec![None; capacity],
            len: 0,
        }
    }

    fn load_factor(&self) -> f64 {
        self.len as f64 / self.slots.len() as f64
    }

    fn insert(&mut self, name: &str, member_index: usize) {
        self.insert_with_target(name, member_index, GROWTH_TARGET);
    }

    /// Like [`insert`](Self::insert) but grows only once the load
    /// factor would exceed `target_load_factor`, instead of the normal
    /// incremental-growth threshold `GROWTH_TARGET`. Used by
    /// [`rebuild`](Self::rebuild) so a denser `optimize()` target
    /// (spec §4.9's ≤0.75) isn't undone mid-rebuild by the unrelated
    /// 0.5 threshold `insert` otherwise applies.
    fn insert_with_target(&mut self, name: &str, member_index: usize, target_load_factor: f64) {
        if (self.len + 1) as f64 / self.slots.len() as f64 > target_load_factor {
            self.grow(target_load_factor);
        }
        let mut i = (fnv1a(name.as_bytes()) as usize) % self.slots.len();
        loop {
            match &self.slots[i] {
                None => {
                    self.slots[i] = Some((name.to_string(), member_index));
                    self.len += 1;
                    return;
                }
                Some((existing, _)) if existing == name => {
                    self.slots[i] = Some((name.to_string(), member_index));
                    return;
                }
                _ => i = (i + 1) % self.slots.len(),
            }
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mut i = (fnv1a(name.as_bytes()) as usize) % self.slots.len();
        let start = i;
        loop {
            match &self.slots[i] {
                None => return None,
                Some((existing, idx)) if existing == name => return Some(*idx),
                _ => {
                    i = (i + 1) % self.slots.len();
                    if i == start {
                        return None;
                    }
                }
            }
        }
    }

    fn grow(&mut self, target_load_factor: f64) {
        let new_capacity = self.slots.len() * 2;
        let old_slots = std::mem::replace(&mut self.slots, vec![None; new_capacity]);
        self.len = 0;
        for slot in old_slots.into_iter().flatten() {
            self.insert_with_target(&slot.0, slot.1, target_load_factor);
        }
    }

    fn rebuild(members: &[Member], target_load_factor: f64) -> Self {
        let capacity = ((members.len() as f64 / target_load_factor).ceil() as usize)
            .next_power_of_two()
            .max(8);
        let mut index = Self::with_capacity(capacity);
        for (i, member) in members.iter().enumerate() {
            index.insert_with_target(&member.name, i, target_load_factor);
        }
        index
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The archive engine itself. `members` stays in insertion (hence
/// `body_offset`-monotonic) order so [`Archive::find_by_offset`] can
/// binary-search it directly; `order` is the independently
/// re-sortable public iteration order (spec §4.9's supplemented
/// `sort()` behavior — grounded on `ar_archive_writer`'s split between
/// storage order and symbol/name indexing).
#[derive(Debug, Clone)]
pub struct Archive {
    members: Vec<Member>,
    bodies: Vec<u8>,
    index: NameIndex,
    order: Vec<usize>,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

impl Archive {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            bodies: Vec::new(),
            index: NameIndex::with_capacity(8),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn add(&mut self, name: &str, bytes: Vec<u8>, opts: AddOptions) -> Result<()> {
        if self.index.find(name).is_some() {
            return Err(Error::DuplicateSymbol(name.to_string()));
        }
        let crc32 = crc32fast::hash(&bytes);
        let original_size = bytes.len() as u32;
        let stored = if opts.compress {
            compress::compress(&bytes)
        } else {
            bytes
        };
        let stored_size = stored.len() as u32;

        while self.bodies.len() % 4 != 0 {
            self.bodies.push(0);
        }
        let body_offset = self.bodies.len() as u32;
        self.bodies.extend_from_slice(&stored);

        let mut flags = MemberFlags::empty();
        if opts.compress {
            flags |= MemberFlags::COMPRESSED;
        }
        if opts.executable {
            flags |= MemberFlags::EXECUTABLE;
        }

        let member_index = self.members.len();
        self.members.push(Member {
            name: name.to_string(),
            original_size,
            stored_size,
            body_offset,
            crc32,
            timestamp: opts.timestamp,
            flags,
        });
        self.index.insert(name, member_index);
        self.order.push(member_index);
        log::debug!("archive: added `{name}` ({original_size} bytes, compressed={})", opts.compress);
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Member> {
        self.index.find(name).map(|i| &self.members[i])
    }

    /// O(log n): `members` is kept in insertion order, and `body_offset`
    /// is strictly increasing by construction, so it doubles as the
    /// sorted-by-offset auxiliary view spec §3/§4.9 calls for.
    pub fn find_by_offset(&self, offset: u32) -> Option<&Member> {
        self.members
            .binary_search_by_key(&offset, |m| m.body_offset)
            .ok()
            .map(|i| &self.members[i])
    }

    pub fn search_by_size_range(&self, lo: u32, hi: u32) -> Vec<&Member> {
        self.order
            .iter()
            .map(|&i| &self.members[i])
            .filter(|m| m.original_size >= lo && m.original_size <= hi)
            .collect()
    }

    pub fn search_by_flags(&self, mask: MemberFlags, match_all: bool) -> Vec<&Member> {
        self.order
            .iter()
            .map(|&i| &self.members[i])
            .filter(|m| if match_all { m.flags.contains(mask) } else { m.flags.intersects(mask) })
            .collect()
    }

    pub fn search_by_substring(&self, needle: &str) -> Vec<&Member> {
        self.order
            .iter()
            .map(|&i| &self.members[i])
            .filter(|m| m.name.contains(needle))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.order.iter().map(|&i| &self.members[i])
    }

    /// Reorders the public iteration order by `key`/`order` without
    /// touching `body_offset` or the name index (spec §4.9's
    /// supplemented deterministic-iteration guarantee).
    pub fn sort(&mut self, key: SortKey, order: SortOrder) {
        self.order.sort_by(|&a, &b| {
            let (ma, mb) = (&self.members[a], &self.members[b]);
            let ord = match key {
                SortKey::Name => ma.name.cmp(&mb.name),
                SortKey::Size => ma.original_size.cmp(&mb.original_size),
                SortKey::Timestamp => ma.timestamp.cmp(&mb.timestamp),
            };
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut name_pool = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.members.len());
        for member in &self.members {
            name_offsets.push(name_pool.len() as u32);
            let bytes = member.name.as_bytes();
            name_pool.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            name_pool.extend_from_slice(bytes);
        }

        let mut index = Vec::with_capacity(self.members.len() * INDEX_RECORD_SIZE);
        for (member, &name_offset) in self.members.iter().zip(&name_offsets) {
            index.extend_from_slice(&name_offset.to_le_bytes());
            index.extend_from_slice(&member.body_offset.to_le_bytes());
            index.extend_from_slice(&member.original_size.to_le_bytes());
            index.extend_from_slice(&member.stored_size.to_le_bytes());
            index.extend_from_slice(&member.crc32.to_le_bytes());
            index.extend_from_slice(&member.timestamp.to_le_bytes());
            index.extend_from_slice(&member.flags.bits().to_le_bytes());
        }

        let entry_count = self.members.len() as u32;
        let index_offset = HEADER_SIZE as u32;
        let total_size = HEADER_SIZE as u32 + index.len() as u32 + name_pool.len() as u32 + self.bodies.len() as u32;

        let mut out = Vec::with_capacity(total_size as usize);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags, reserved
        out.extend_from_slice(&entry_count.to_le_bytes());
        out.extend_from_slice(&index_offset.to_le_bytes());
        out.extend_from_slice(&total_size.to_le_bytes());
        out.extend_from_slice(&index);
        out.extend_from_slice(&name_pool);
        out.extend_from_slice(&self.bodies);
        Ok(out)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::ArchiveCorrupt("file shorter than header".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::ArchiveCorrupt("bad magic".into()));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::ArchiveCorrupt(format!("unsupported version {version}")));
        }
        let entry_count = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let index_offset = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        let total_size = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        if total_size > buf.len() {
            return Err(Error::ArchiveCorrupt(format!(
                "declared total_size {total_size} exceeds buffer length {}",
                buf.len()
            )));
        }

        let index_end = index_offset + entry_count * INDEX_RECORD_SIZE;
        if index_end > buf.len() {
            return Err(Error::ArchiveCorrupt("index table exceeds file length".into()));
        }

        struct RawEntry {
            name_offset: u32,
            body_offset: u32,
            original_size: u32,
            stored_size: u32,
            crc32: u32,
            timestamp: u64,
            flags: u32,
        }
        let mut raw_entries = Vec::with_capacity(entry_count);
        let mut cursor = index_offset;
        for _ in 0..entry_count {
            let rec = &buf[cursor..cursor + INDEX_RECORD_SIZE];
            raw_entries.push(RawEntry {
                name_offset: u32::from_le_bytes(rec[0..4].try_into().unwrap()),
                body_offset: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
                original_size: u32::from_le_bytes(rec[8..12].try_into().unwrap()),
                stored_size: u32::from_le_bytes(rec[12..16].try_into().unwrap()),
                crc32: u32::from_le_bytes(rec[16..20].try_into().unwrap()),
                timestamp: u64::from_le_bytes(rec[20..28].try_into().unwrap()),
                flags: u32::from_le_bytes(rec[28..32].try_into().unwrap()),
            });
            cursor += INDEX_RECORD_SIZE;
        }

        let name_pool_offset = index_end;
        let mut members = Vec::with_capacity(entry_count);
        let mut max_name_pool_end = name_pool_offset;
        for raw in &raw_entries {
            let start = name_pool_offset + raw.name_offset as usize;
            if start + 4 > buf.len() {
                return Err(Error::ArchiveCorrupt("name pool entry out of bounds".into()));
            }
            let len = u32::from_le_bytes(buf[start..start + 4].try_into().unwrap()) as usize;
            let name_start = start + 4;
            let name_end = name_start + len;
            if name_end > buf.len() {
                return Err(Error::ArchiveCorrupt("name pool entry out of bounds".into()));
            }
            max_name_pool_end = max_name_pool_end.max(name_end);
            let name = std::str::from_utf8(&buf[name_start..name_end])
                .map_err(|_| Error::ArchiveCorrupt("name pool entry is not valid UTF-8".into()))?
                .to_string();
            let flags = MemberFlags::from_bits(raw.flags)
                .ok_or_else(|| Error::ArchiveCorrupt(format!("unknown member flag bits {:#x}", raw.flags)))?;
            members.push(Member {
                name,
                original_size: raw.original_size,
                stored_size: raw.stored_size,
                body_offset: raw.body_offset,
                crc32: raw.crc32,
                timestamp: raw.timestamp,
                flags,
            });
        }

        let bodies_offset = max_name_pool_end;
        if bodies_offset > total_size {
            return Err(Error::ArchiveCorrupt("name pool overruns declared total_size".into()));
        }
        let bodies = buf[bodies_offset..total_size].to_vec();

        let mut index = NameIndex::with_capacity(entry_count.max(1));
        for (i, member) in members.iter().enumerate() {
            index.insert(&member.name, i);
        }
        let order = (0..members.len()).collect();

        Ok(Self { members, bodies, index, order })
    }

    /// Rebuilds the hash index to target load factor ≤ 0.75 (spec
    /// §4.9) and returns a snapshot of its shape.
    pub fn optimize(&mut self) -> ArchiveStats {
        self.index = NameIndex::rebuild(&self.members, 0.75);
        log::debug!(
            "archive: optimize rebuilt index, table_size={}, load_factor={:.3}",
            self.index.slots.len(),
            self.index.load_factor()
        );
        ArchiveStats {
            entries: self.members.len(),
            table_size: self.index.slots.len(),
            load_factor: self.index.load_factor(),
        }
    }

    /// Fetches a member's original (decompressed if needed) bytes.
    pub fn body(&self, member: &Member) -> Result<Vec<u8>> {
        let start = member.body_offset as usize;
        let end = start + member.stored_size as usize;
        let stored = self
            .bodies
            .get(start..end)
            .ok_or_else(|| Error::ArchiveCorrupt("member body out of bounds".into()))?;
        if member.flags.contains(MemberFlags::COMPRESSED) {
            compress::decompress(stored, member.original_size as usize)
        } else {
            Ok(stored.to_vec())
        }
    }
}
