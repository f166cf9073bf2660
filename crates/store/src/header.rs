//! Dual-slot commit header stored in the index file's metadata area.
//!
//! # Crash Safety
//!
//! The header holds two [`CommitSlot`]s and a selector byte. A checkpoint
//! never touches the active slot:
//!
//! 1. Write the new state into the inactive slot.
//! 2. Force. The inactive slot now has a valid XXH3-64 checksum.
//! 3. Flip bit 0 of the selector. This single byte write is the commit point.
//! 4. Force.
//!
//! A crash before step 2 leaves the old primary intact. Between steps 2 and 4
//! both slots verify. On open the selected slot is tried first and the other
//! is the fallback; if neither verifies the database cannot be opened.
//!
//! Bit 1 of the selector is the recovery flag. It is set when a database is
//! opened for writing and cleared by a clean close; finding it set on open
//! forces the full consistency check.

use crate::{
    error::{Result, corrupted},
    storage::{Adr, META_SIZE},
};

/// Database state as of one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSlot {
    /// Root of the table directory trie in the index file.
    pub dbinfo_root: Adr,
    /// Index file high-water mark.
    pub index_upto: u64,
    /// Data file high-water mark.
    pub data_upto: u64,
    /// Sequence number of the last commit included.
    pub commit_seq: u64,
    /// Bumped by every commit that creates or drops a table or index.
    pub schema_version: u64,
    /// Data file address of the last commit record, or 0.
    pub last_commit_adr: Adr,
    /// Checksum stored in that commit record.
    pub last_commit_checksum: u64,
    /// Unix seconds when the slot was written.
    pub timestamp: u64,
}

impl CommitSlot {
    /// Size of a slot on disk.
    pub const SIZE: usize = 64;

    /// Bytes covered by the trailing checksum.
    const CHECKSUMMED_SIZE: usize = 56;

    /// Serializes the slot, appending its checksum.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.dbinfo_root.to_le_bytes());
        buf[4..8].copy_from_slice(&self.last_commit_adr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_upto.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_upto.to_le_bytes());
        buf[24..32].copy_from_slice(&self.commit_seq.to_le_bytes());
        buf[32..40].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_commit_checksum.to_le_bytes());
        buf[48..56].copy_from_slice(&self.timestamp.to_le_bytes());
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUMMED_SIZE]);
        buf[56..64].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserializes a slot, returning `None` when its checksum does not match.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(..Self::SIZE)?;
        let u32_at = |i: usize| buf[i..i + 4].try_into().ok().map(u32::from_le_bytes);
        let u64_at = |i: usize| buf[i..i + 8].try_into().ok().map(u64::from_le_bytes);
        let checksum = u64_at(56)?;
        if checksum != xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUMMED_SIZE]) {
            return None;
        }
        Some(Self {
            dbinfo_root: u32_at(0)?,
            last_commit_adr: u32_at(4)?,
            index_upto: u64_at(8)?,
            data_upto: u64_at(16)?,
            commit_seq: u64_at(24)?,
            schema_version: u64_at(32)?,
            last_commit_checksum: u64_at(40)?,
            timestamp: u64_at(48)?,
        })
    }
}

/// Selector byte plus two commit slots.
///
/// # Layout (within the metadata area)
///
/// - Byte 0: selector (bit 0 = primary slot, bit 1 = recovery flag)
/// - Bytes 8-71: slot 0
/// - Bytes 72-135: slot 1
#[derive(Debug, Clone)]
pub struct DatabaseHeader {
    selector: u8,
    slots: [Option<CommitSlot>; 2],
}

impl DatabaseHeader {
    /// Offset of the selector byte.
    pub const SELECTOR_OFFSET: usize = 0;

    /// Offset of slot 0.
    pub const SLOT0_OFFSET: usize = 8;

    /// Offset of slot 1.
    pub const SLOT1_OFFSET: usize = Self::SLOT0_OFFSET + CommitSlot::SIZE;

    const SLOT_MASK: u8 = 0x01;
    const RECOVERY_MASK: u8 = 0x02;

    /// Header of a freshly created database: slot 0 primary and empty.
    pub fn new() -> Self {
        Self { selector: 0, slots: [Some(CommitSlot::default()), None] }
    }

    /// Index of the primary slot.
    pub fn primary_index(&self) -> usize {
        usize::from(self.selector & Self::SLOT_MASK)
    }

    /// Index of the slot the next checkpoint writes.
    pub fn secondary_index(&self) -> usize {
        1 - self.primary_index()
    }

    /// The slot at `index`, if it verified.
    pub fn slot(&self, index: usize) -> Option<&CommitSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// True when the last session did not close cleanly.
    pub fn recovery_required(&self) -> bool {
        self.selector & Self::RECOVERY_MASK != 0
    }

    /// Sets or clears the recovery flag.
    pub fn set_recovery_required(&mut self, required: bool) {
        if required {
            self.selector |= Self::RECOVERY_MASK;
        } else {
            self.selector &= !Self::RECOVERY_MASK;
        }
    }

    /// Stores `slot` as the secondary slot. The primary is untouched.
    pub fn set_secondary(&mut self, slot: CommitSlot) {
        self.slots[self.secondary_index()] = Some(slot);
    }

    /// Makes the secondary slot primary.
    pub fn flip(&mut self) {
        self.selector ^= Self::SLOT_MASK;
    }

    /// Chooses the slot to open from: the primary when it verifies, else the
    /// secondary. Returns the index and the slot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` when neither slot verifies.
    pub fn choose(&self) -> Result<(usize, &CommitSlot)> {
        let primary = self.primary_index();
        if let Some(slot) = self.slot(primary) {
            return Ok((primary, slot));
        }
        let secondary = self.secondary_index();
        if let Some(slot) = self.slot(secondary) {
            tracing::warn!(primary, "Primary commit slot invalid, using secondary");
            return Ok((secondary, slot));
        }
        Err(corrupted("both commit slots have invalid checksums"))
    }

    /// Makes `index` the primary slot.
    pub fn select(&mut self, index: usize) {
        if index != self.primary_index() {
            self.flip();
        }
    }

    /// Serializes into a metadata area.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; META_SIZE];
        buf[Self::SELECTOR_OFFSET] = self.selector;
        for (i, offset) in [Self::SLOT0_OFFSET, Self::SLOT1_OFFSET].into_iter().enumerate() {
            if let Some(slot) = &self.slots[i] {
                buf[offset..offset + CommitSlot::SIZE].copy_from_slice(&slot.to_bytes());
            }
        }
        buf
    }

    /// Parses a metadata area. Slots whose checksum fails read as `None`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the area is too short.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SLOT1_OFFSET + CommitSlot::SIZE {
            return Err(corrupted("commit header too short"));
        }
        Ok(Self {
            selector: buf[Self::SELECTOR_OFFSET],
            slots: [
                CommitSlot::from_bytes(&buf[Self::SLOT0_OFFSET..]),
                CommitSlot::from_bytes(&buf[Self::SLOT1_OFFSET..]),
            ],
        })
    }
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn slot(seq: u64) -> CommitSlot {
        CommitSlot {
            dbinfo_root: 42,
            index_upto: 4096,
            data_upto: 8192,
            commit_seq: seq,
            schema_version: 3,
            last_commit_adr: 77,
            last_commit_checksum: 0xDEAD_BEEF,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_commit_slot_round_trip() {
        let bytes = slot(9).to_bytes();
        assert_eq!(CommitSlot::from_bytes(&bytes), Some(slot(9)));
    }

    #[test]
    fn test_commit_slot_rejects_bad_checksum() {
        let mut bytes = slot(9).to_bytes();
        bytes[25] ^= 0x01;
        assert_eq!(CommitSlot::from_bytes(&bytes), None);
    }

    #[test]
    fn test_new_header_chooses_slot_zero() {
        let header = DatabaseHeader::from_bytes(&DatabaseHeader::new().to_bytes()).unwrap();
        let (index, chosen) = header.choose().unwrap();
        assert_eq!(index, 0);
        assert_eq!(*chosen, CommitSlot::default());
        assert!(!header.recovery_required());
    }

    #[test]
    fn test_secondary_then_flip() {
        let mut header = DatabaseHeader::new();
        header.set_secondary(slot(1));
        assert_eq!(header.choose().unwrap().1.commit_seq, 0, "unflipped header keeps primary");
        header.flip();
        assert_eq!(header.primary_index(), 1);
        assert_eq!(header.choose().unwrap().1.commit_seq, 1);
    }

    #[test]
    fn test_fallback_to_secondary() {
        let mut header = DatabaseHeader::new();
        header.set_secondary(slot(1));
        header.flip();
        let mut bytes = header.to_bytes();
        // Damage slot 1, the primary.
        bytes[DatabaseHeader::SLOT1_OFFSET + 3] ^= 0xFF;
        let header = DatabaseHeader::from_bytes(&bytes).unwrap();
        let (index, chosen) = header.choose().unwrap();
        assert_eq!(index, 0);
        assert_eq!(chosen.commit_seq, 0);
    }

    #[test]
    fn test_both_slots_corrupt() {
        let mut header = DatabaseHeader::new();
        header.set_secondary(slot(1));
        let mut bytes = header.to_bytes();
        bytes[DatabaseHeader::SLOT0_OFFSET + 60] ^= 0xFF;
        bytes[DatabaseHeader::SLOT1_OFFSET + 60] ^= 0xFF;
        let header = DatabaseHeader::from_bytes(&bytes).unwrap();
        assert!(header.choose().unwrap_err().is_corruption());
    }

    #[test]
    fn test_recovery_flag_independent_of_slot() {
        let mut header = DatabaseHeader::new();
        header.set_recovery_required(true);
        header.flip();
        assert!(header.recovery_required());
        assert_eq!(header.primary_index(), 1);
        header.set_recovery_required(false);
        assert!(!header.recovery_required());
        assert_eq!(header.primary_index(), 1);
    }
}
