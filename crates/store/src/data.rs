//! Rows and commit records in the data file.
//!
//! Both are blobs (see [`storage::blob`](crate::storage)):
//!
//! ```text
//! row:    [tag 0x01][tblnum u32 LE][record]
//! commit: [tag 0x02][tran u64][seq u64][nadds u32][nremoves u32]
//!         [adds u32...][removes u32...][checksum u64]
//! ```
//!
//! The commit checksum is XXH3-64 over everything before it plus the payloads
//! of the added rows, so a verified commit record vouches for its rows too.
//! Rows written by transactions that never committed stay in the file but no
//! commit record names them.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    error::{Result, corrupted},
    record::{BufRecord, RecordBuf},
    storage::{Adr, BlobScan, Storage, adr_to_offset, read_blob, write_blob},
};

/// Blob tag of a row.
pub const ROW_TAG: u8 = 0x01;

/// Blob tag of a commit record.
pub const COMMIT_TAG: u8 = 0x02;

const ROW_PREFIX: usize = 5;

/// Appends a row for table `tblnum`.
///
/// # Errors
///
/// Propagates storage errors.
pub fn write_row(storage: &dyn Storage, tblnum: u32, record: &RecordBuf) -> Result<Adr> {
    let mut payload = Vec::with_capacity(ROW_PREFIX + record.as_bytes().len());
    payload.push(ROW_TAG);
    payload.write_u32::<LittleEndian>(tblnum)?;
    payload.extend_from_slice(record.as_bytes());
    write_blob(storage, &payload)
}

/// Reads the row at `adr`, returning its table number and record.
///
/// # Errors
///
/// Returns `Error::Corrupted` if `adr` does not hold a well-formed row.
pub fn read_row(storage: &dyn Storage, adr: Adr) -> Result<(u32, RecordBuf)> {
    let payload = read_blob(storage, adr)?;
    decode_row(&payload).map_err(|e| match e {
        crate::Error::Corrupted { reason } => corrupted(format!("row {adr}: {reason}")),
        other => other,
    })
}

fn decode_row(payload: &[u8]) -> Result<(u32, RecordBuf)> {
    if payload.len() <= ROW_PREFIX || payload[0] != ROW_TAG {
        return Err(corrupted("not a row blob"));
    }
    let tblnum = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let record = RecordBuf::from_packed(payload[ROW_PREFIX..].to_vec())?;
    Ok((tblnum, record))
}

/// The rows added and removed by one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Transaction number.
    pub tran: u64,
    /// Commit sequence number.
    pub seq: u64,
    /// Rows the transaction added.
    pub adds: Vec<Adr>,
    /// Rows the transaction removed.
    pub removes: Vec<Adr>,
}

impl CommitRecord {
    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(25 + 4 * (self.adds.len() + self.removes.len()) + 8);
        buf.push(COMMIT_TAG);
        buf.write_u64::<LittleEndian>(self.tran)?;
        buf.write_u64::<LittleEndian>(self.seq)?;
        buf.write_u32::<LittleEndian>(self.adds.len() as u32)?;
        buf.write_u32::<LittleEndian>(self.removes.len() as u32)?;
        for adr in self.adds.iter().chain(&self.removes) {
            buf.write_u32::<LittleEndian>(*adr)?;
        }
        Ok(buf)
    }

    /// Checksum over `body` and the payloads of the added rows.
    fn checksum(&self, storage: &dyn Storage, body: &[u8]) -> Result<u64> {
        let mut hasher = Xxh3::new();
        hasher.update(body);
        for adr in &self.adds {
            hasher.update(&read_blob(storage, *adr)?);
        }
        Ok(hasher.digest())
    }

    /// Appends the record, returning its address and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if an added row cannot be read or the append fails.
    pub fn write(&self, storage: &dyn Storage) -> Result<(Adr, u64)> {
        let mut buf = self.encode_body()?;
        let checksum = self.checksum(storage, &buf)?;
        buf.write_u64::<LittleEndian>(checksum)?;
        Ok((write_blob(storage, &buf)?, checksum))
    }

    /// Parses a commit blob, returning the record and its stored checksum.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` on malformed input.
    pub fn decode(payload: &[u8]) -> Result<(Self, u64)> {
        let truncated = |_| corrupted("truncated commit record");
        let mut cur = Cursor::new(payload);
        if cur.read_u8().map_err(truncated)? != COMMIT_TAG {
            return Err(corrupted("not a commit record"));
        }
        let tran = cur.read_u64::<LittleEndian>().map_err(truncated)?;
        let seq = cur.read_u64::<LittleEndian>().map_err(truncated)?;
        let nadds = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let nremoves = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if 4 * (nadds + nremoves) + 8 != payload.len() - cur.position() as usize {
            return Err(corrupted(format!("commit record {seq} length mismatch")));
        }
        let mut read = |n| {
            (0..n)
                .map(|_| cur.read_u32::<LittleEndian>().map_err(truncated))
                .collect::<Result<Vec<_>>>()
        };
        let adds = read(nadds)?;
        let removes = read(nremoves)?;
        let checksum = cur.read_u64::<LittleEndian>().map_err(truncated)?;
        Ok((Self { tran, seq, adds, removes }, checksum))
    }

    /// Reads the commit record at `adr` and checks its checksum.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the record is malformed or does not
    /// verify.
    pub fn read_verified(storage: &dyn Storage, adr: Adr) -> Result<(Self, u64)> {
        let payload = read_blob(storage, adr)?;
        let (record, stored) = Self::decode(&payload)?;
        let body = &payload[..payload.len() - 8];
        let computed = record.checksum(storage, body)?;
        if computed != stored {
            return Err(corrupted(format!(
                "commit record {} at {adr}: checksum {stored:#x} != computed {computed:#x}",
                record.seq
            )));
        }
        Ok((record, stored))
    }
}

/// One blob of the data file.
#[derive(Debug, Clone)]
pub enum DataEntry {
    /// A row, committed or not.
    Row {
        /// Row address.
        adr: Adr,
        /// Owning table.
        tblnum: u32,
        /// Row contents.
        record: RecordBuf,
    },
    /// A commit record, not yet verified.
    Commit {
        /// Record address.
        adr: Adr,
        /// Parsed record.
        record: CommitRecord,
        /// Stored checksum.
        checksum: u64,
    },
}

/// Sequential walk over the blobs of a data file.
pub struct DataScan<'a> {
    blobs: BlobScan<'a>,
}

impl<'a> DataScan<'a> {
    /// Scans `storage` up to `end`.
    pub fn new(storage: &'a dyn Storage, end: u64) -> Self {
        Self { blobs: BlobScan::new(storage, end) }
    }
}

impl Iterator for DataScan<'_> {
    type Item = Result<DataEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let (adr, payload) = match self.blobs.next()? {
            Ok(blob) => blob,
            Err(e) => return Some(Err(e)),
        };
        let entry = match payload.first() {
            Some(&ROW_TAG) => decode_row(&payload)
                .map(|(tblnum, record)| DataEntry::Row { adr, tblnum, record }),
            Some(&COMMIT_TAG) => CommitRecord::decode(&payload)
                .map(|(record, checksum)| DataEntry::Commit { adr, record, checksum }),
            _ => Err(corrupted(format!("unknown data blob at {adr}"))),
        };
        Some(entry.map_err(|e| match e {
            crate::Error::Corrupted { reason } => corrupted(format!("data blob {adr}: {reason}")),
            other => other,
        }))
    }
}

/// A change named by a verified commit record.
#[derive(Debug, Clone)]
pub enum CommittedChange {
    /// A row added by commit `seq`.
    Added {
        /// Commit sequence number.
        seq: u64,
        /// Row address.
        adr: Adr,
        /// Owning table.
        tblnum: u32,
        /// Row contents.
        record: RecordBuf,
    },
    /// A row removed by commit `seq`.
    Removed {
        /// Commit sequence number.
        seq: u64,
        /// Row address.
        adr: Adr,
    },
}

/// Walks commit records in file order, yielding the changes of those that
/// verify. A record that fails verification ends the walk with an error.
pub struct CommittedRecords<'a> {
    storage: &'a dyn Storage,
    scan: DataScan<'a>,
    pending: std::vec::IntoIter<CommittedChange>,
}

impl<'a> CommittedRecords<'a> {
    /// Walks `storage` up to `end`.
    pub fn new(storage: &'a dyn Storage, end: u64) -> Self {
        Self { storage, scan: DataScan::new(storage, end), pending: Vec::new().into_iter() }
    }

    fn expand(&self, adr: Adr) -> Result<Vec<CommittedChange>> {
        let (record, _) = CommitRecord::read_verified(self.storage, adr)?;
        let mut changes = Vec::with_capacity(record.adds.len() + record.removes.len());
        for row in &record.adds {
            let (tblnum, data) = read_row(self.storage, *row)?;
            let seq = record.seq;
            changes.push(CommittedChange::Added { seq, adr: *row, tblnum, record: data });
        }
        let seq = record.seq;
        changes.extend(
            record.removes.iter().map(|adr| CommittedChange::Removed { seq, adr: *adr }),
        );
        Ok(changes)
    }
}

impl Iterator for CommittedRecords<'_> {
    type Item = Result<CommittedChange>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(change) = self.pending.next() {
                return Some(Ok(change));
            }
            match self.scan.next()? {
                Ok(DataEntry::Commit { adr, .. }) => match self.expand(adr) {
                    Ok(changes) => self.pending = changes.into_iter(),
                    Err(e) => return Some(Err(e)),
                },
                Ok(DataEntry::Row { .. }) => {},
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Borrowed view of a row payload's record, without copying.
///
/// # Errors
///
/// Returns `Error::Corrupted` if `payload` is not a row.
pub fn row_record(payload: &[u8]) -> Result<(u32, BufRecord<'_>)> {
    if payload.len() <= ROW_PREFIX || payload[0] != ROW_TAG {
        return Err(corrupted("not a row blob"));
    }
    let tblnum = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((tblnum, BufRecord::new(&payload[ROW_PREFIX..])?))
}

/// True when `adr` lies in the data written before `end`.
pub fn is_below(adr: Adr, end: u64) -> bool {
    adr != 0 && adr_to_offset(adr) < end
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        record::{Record, RecordBuilder},
        storage::{DATA_MAGIC, HeapStorage, offset_to_adr},
    };

    fn storage() -> HeapStorage {
        HeapStorage::new(DATA_MAGIC, 1 << 20).unwrap()
    }

    fn row(s: &str) -> RecordBuf {
        RecordBuilder::new().field(s).field(s.len().to_string()).build()
    }

    #[test]
    fn test_row_round_trip() {
        let storage = storage();
        let adr = write_row(&storage, 17, &row("hello")).unwrap();
        let (tblnum, record) = read_row(&storage, adr).unwrap();
        assert_eq!(tblnum, 17);
        assert_eq!(record, row("hello"));
        assert!(is_below(adr, storage.up_to()));
    }

    #[test]
    fn test_commit_record_verifies_rows() {
        let storage = storage();
        let a = write_row(&storage, 10, &row("a")).unwrap();
        let b = write_row(&storage, 10, &row("b")).unwrap();
        let commit = CommitRecord { tran: 3, seq: 1, adds: vec![a, b], removes: vec![99] };
        let (adr, checksum) = commit.write(&storage).unwrap();
        let (back, stored) = CommitRecord::read_verified(&storage, adr).unwrap();
        assert_eq!(back, commit);
        assert_eq!(stored, checksum);

        // Damage a byte of row `b`'s record; the commit record no longer verifies.
        let offset = adr_to_offset(b) + 4 + ROW_PREFIX as u64 + 4;
        let damaged = offset_to_adr(offset & !7);
        let mut bytes = storage.read(damaged, 8).unwrap();
        bytes[(offset & 7) as usize] ^= 0xFF;
        storage.write(damaged, &bytes).unwrap();
        assert!(CommitRecord::read_verified(&storage, adr).unwrap_err().is_corruption());
    }

    #[test]
    fn test_commit_decode_rejects_bad_length() {
        let storage = storage();
        let commit = CommitRecord { tran: 1, seq: 1, adds: vec![], removes: vec![5, 6] };
        let (adr, _) = commit.write(&storage).unwrap();
        let mut payload = read_blob(&storage, adr).unwrap();
        payload.push(0);
        assert!(CommitRecord::decode(&payload).unwrap_err().is_corruption());
        assert!(CommitRecord::decode(&[COMMIT_TAG, 1]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_scan_and_committed_records() {
        let storage = storage();
        let kept = write_row(&storage, 10, &row("kept")).unwrap();
        let _orphan = write_row(&storage, 10, &row("aborted")).unwrap();
        let first = CommitRecord { tran: 1, seq: 1, adds: vec![kept], removes: vec![] };
        first.write(&storage).unwrap();
        let second = CommitRecord { tran: 2, seq: 2, adds: vec![], removes: vec![kept] };
        second.write(&storage).unwrap();

        let entries: Vec<_> =
            DataScan::new(&storage, storage.up_to()).collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 4);
        assert!(matches!(entries[0], DataEntry::Row { tblnum: 10, .. }));
        assert!(matches!(entries[3], DataEntry::Commit { .. }));

        let changes: Vec<_> =
            CommittedRecords::new(&storage, storage.up_to()).collect::<Result<_>>().unwrap();
        assert_eq!(changes.len(), 2);
        match &changes[0] {
            CommittedChange::Added { seq, adr, record, .. } => {
                assert_eq!((*seq, *adr), (1, kept));
                assert_eq!(record.get(0), b"kept");
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(changes[1], CommittedChange::Removed { seq: 2, adr } if adr == kept));
    }

    #[test]
    fn test_row_record_view() {
        let storage = storage();
        let adr = write_row(&storage, 5, &row("view")).unwrap();
        let payload = read_blob(&storage, adr).unwrap();
        let (tblnum, view) = row_record(&payload).unwrap();
        assert_eq!(tblnum, 5);
        assert_eq!(view.get(0), b"view");
    }
}
