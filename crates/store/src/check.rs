//! Full consistency check.
//!
//! Walks the data file and every index tree and cross-checks them:
//!
//! - every commit record verifies and sequence numbers increase by one
//! - every row a commit adds exists, and every removal names a live row
//! - index keys are strictly ascending, within their separators, and all
//!   leaves of a tree are at the same depth
//! - every index key points at a live row of its table whose key matches
//! - every index of a table holds exactly `nrows` keys
//!
//! Problems are collected rather than returned, so one pass reports all of
//! them. Run on open when the fast check fails or the last session did not
//! close cleanly, and on demand through [`Database::check`](crate::Database::check).

use std::collections::HashMap;

use crate::{
    btree::{NodeRef, NodeSource, SharedNodes},
    data::{CommitRecord, DataEntry, DataScan, row_record},
    record::{Record, RecordBuf},
    storage::{Adr, Storage, read_blob},
    table::{IndexInfo, TableInfo, key_adr},
    trie::PersistentTrie,
};

/// Outcome of a consistency check.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Tables examined.
    pub tables: u64,
    /// Live rows according to the commit records.
    pub rows: u64,
    /// Index nodes visited.
    pub nodes: u64,
    /// Commit records verified.
    pub commits: u64,
    /// Sequence number of the last verified commit record.
    pub last_commit_seq: u64,
    /// Problems found.
    pub errors: Vec<CheckError>,
}

impl CheckReport {
    /// True when no problem was found.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, location: impl Into<String>, description: impl Into<String>) {
        self.errors.push(CheckError { location: location.into(), description: description.into() });
    }
}

/// A single problem found by a check.
#[derive(Debug, Clone)]
pub struct CheckError {
    /// Where: a data address, or a table and index.
    pub location: String,
    /// What is wrong.
    pub description: String,
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.description)
    }
}

/// Rows of the data file, and which of them are live.
#[derive(Default)]
struct Rows {
    owner: HashMap<Adr, u32>,
    live: HashMap<Adr, u32>,
}

pub(crate) fn run(
    data: &dyn Storage,
    nodes: &SharedNodes,
    dbinfo: &PersistentTrie<TableInfo>,
    data_end: u64,
) -> CheckReport {
    let mut report = CheckReport::default();
    let rows = scan_data(data, data_end, &mut report);
    report.rows = rows.live.len() as u64;

    let tables = match dbinfo.entries(nodes.storage().as_ref()) {
        Ok(tables) => tables,
        Err(e) => {
            report.error("directory", format!("cannot load table directory: {e}"));
            return report;
        },
    };
    for (tblnum, info) in tables {
        report.tables += 1;
        if tblnum != info.tblnum {
            report.error(format!("table {tblnum}"), format!("entry names table {}", info.tblnum));
        }
        for (i, index) in info.indexes.iter().enumerate() {
            let mut walk = IndexWalk {
                data,
                nodes,
                rows: &rows,
                tblnum,
                index,
                location: format!("table {tblnum} index {i}"),
                keys: 0,
                leaf_depth: None,
            };
            walk.run(&mut report);
            if walk.keys != info.nrows {
                report.error(
                    walk.location,
                    format!("{} keys for {} rows", walk.keys, info.nrows),
                );
            }
        }
    }
    tracing::debug!(
        tables = report.tables,
        rows = report.rows,
        nodes = report.nodes,
        commits = report.commits,
        errors = report.errors.len(),
        "Consistency check finished"
    );
    report
}

fn scan_data(data: &dyn Storage, end: u64, report: &mut CheckReport) -> Rows {
    let mut rows = Rows::default();
    for entry in DataScan::new(data, end) {
        match entry {
            Ok(DataEntry::Row { adr, tblnum, .. }) => {
                rows.owner.insert(adr, tblnum);
            },
            Ok(DataEntry::Commit { adr, record, .. }) => {
                if let Err(e) = CommitRecord::read_verified(data, adr) {
                    report.error(format!("data {adr}"), e.to_string());
                    continue;
                }
                report.commits += 1;
                if record.seq != report.last_commit_seq + 1 {
                    report.error(
                        format!("data {adr}"),
                        format!("commit {} follows commit {}", record.seq, report.last_commit_seq),
                    );
                }
                report.last_commit_seq = record.seq;
                for row in &record.adds {
                    match rows.owner.get(row) {
                        Some(tblnum) => {
                            rows.live.insert(*row, *tblnum);
                        },
                        None => report.error(
                            format!("data {adr}"),
                            format!("commit {} adds unknown row {row}", record.seq),
                        ),
                    }
                }
                for row in &record.removes {
                    if rows.live.remove(row).is_none() {
                        report.error(
                            format!("data {adr}"),
                            format!("commit {} removes row {row} that is not live", record.seq),
                        );
                    }
                }
            },
            Err(e) => {
                report.error("data file", e.to_string());
                break;
            },
        }
    }
    rows
}

struct IndexWalk<'a> {
    data: &'a dyn Storage,
    nodes: &'a SharedNodes,
    rows: &'a Rows,
    tblnum: u32,
    index: &'a IndexInfo,
    location: String,
    keys: u64,
    leaf_depth: Option<u32>,
}

impl IndexWalk<'_> {
    fn run(&mut self, report: &mut CheckReport) {
        if self.index.root.is_empty_tree() {
            return;
        }
        let root = self.index.root.clone();
        self.node(&root, None, None, 1, report);
    }

    fn node(
        &mut self,
        node_ref: &NodeRef,
        lo: Option<&RecordBuf>,
        hi: Option<&RecordBuf>,
        depth: u32,
        report: &mut CheckReport,
    ) {
        let node = match self.nodes.node(node_ref) {
            Ok(node) => node,
            Err(e) => {
                report.error(&self.location, format!("cannot load node: {e}"));
                return;
            },
        };
        report.nodes += 1;
        let keys = node.keys();
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            report.error(&self.location, format!("node at depth {depth} keys out of order"));
        }

        if node.is_leaf() {
            match self.leaf_depth {
                None => self.leaf_depth = Some(depth),
                Some(expected) if expected != depth => report.error(
                    &self.location,
                    format!("leaf at depth {depth}, expected {expected}"),
                ),
                Some(_) => {},
            }
            for key in keys {
                let below_lo = lo.is_some_and(|lo| key < lo);
                let at_or_above_hi = hi.is_some_and(|hi| key >= hi);
                if below_lo || at_or_above_hi {
                    report.error(&self.location, format!("key {key:?} outside its separators"));
                }
                self.key(key, report);
            }
            return;
        }

        let children = node.children();
        if children.len() != keys.len() || children.is_empty() {
            report.error(
                &self.location,
                format!("tree node with {} keys and {} children", keys.len(), children.len()),
            );
            return;
        }
        for (i, child) in children.iter().enumerate() {
            let child_lo = if i == 0 { lo } else { Some(&keys[i]) };
            let child_hi = keys.get(i + 1).or(hi);
            self.node(child, child_lo, child_hi, depth + 1, report);
        }
    }

    fn key(&mut self, key: &RecordBuf, report: &mut CheckReport) {
        self.keys += 1;
        let adr = match key_adr(key) {
            Ok(adr) => adr,
            Err(e) => {
                report.error(&self.location, e.to_string());
                return;
            },
        };
        if self.rows.live.get(&adr) != Some(&self.tblnum) {
            report.error(&self.location, format!("key points at {adr}, not a live row"));
            return;
        }
        let payload = match read_blob(self.data, adr) {
            Ok(payload) => payload,
            Err(e) => {
                report.error(&self.location, e.to_string());
                return;
            },
        };
        match row_record(&payload) {
            Ok((_, row)) if self.index.key_of(&row, adr) == *key => {},
            Ok((_, row)) => report.error(
                &self.location,
                format!("key {key:?} does not match row {adr} ({} fields)", row.size()),
            ),
            Err(e) => report.error(&self.location, e.to_string()),
        }
    }
}
