/// Changeset - Edit Scripts Between Two Row Snapshots
///
/// This module defines the data structures the diff engine produces and
/// consumes. An `EditScript` transforms one ordered row sequence into the
/// next; a `RowDiff` is its hash-free form that subscribers receive.
///
/// # Operation Types
///
/// - `AddedRow`: content that did not exist before, at its new index
/// - `RemovedRow`: an old row with no counterpart in the new sequence
/// - `MovedRow`: an old row that survived unchanged but changed position
/// - `CopiedRow`: an extra occurrence of content that already existed
/// - `ChangedRow`: a row whose identity key survived but whose content did not
///
/// # Index Conventions
///
/// `from`, `old_index` and `RemovedRow::index` address the old sequence;
/// `to` and `index` address the new one. Rows not mentioned anywhere keep
/// their relative order.

use crate::row::{HashedRow, Row, RowKey};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct AddedRow {
    pub index: usize,
    pub row: HashedRow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemovedRow {
    pub index: usize,
    pub hash: String,
    pub key: RowKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovedRow {
    pub key: RowKey,
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopiedRow {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangedRow {
    pub old_index: usize,
    pub index: usize,
    pub row: HashedRow,
}

/// Transform from one ordered row sequence to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditScript {
    pub added: Vec<AddedRow>,
    pub removed: Vec<RemovedRow>,
    pub moved: Vec<MovedRow>,
    pub copied: Vec<CopiedRow>,
    pub changed: Vec<ChangedRow>,
}

impl EditScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the script describes no operation at all
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
            && self.copied.is_empty()
            && self.changed.is_empty()
    }

    /// Total number of operations
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.moved.len() + self.copied.len() + self.changed.len()
    }

    /// Length of the sequence produced by applying this script to `old_len` rows
    pub fn result_len(&self, old_len: usize) -> Option<usize> {
        old_len
            .checked_sub(self.removed.len())
            .map(|n| n + self.added.len() + self.copied.len())
    }

    /// Strip hashes for broadcast. Removed and copied rows are looked up in
    /// `old`, the sequence the script was generated against.
    pub fn to_row_diff(&self, old: &[HashedRow]) -> RowDiff {
        RowDiff {
            added: self.added.iter().map(|a| a.row.data.clone()).collect(),
            removed: self
                .removed
                .iter()
                .filter_map(|r| old.get(r.index))
                .map(|r| r.data.clone())
                .collect(),
            moved: self.moved.clone(),
            copied: self
                .copied
                .iter()
                .filter_map(|c| {
                    old.get(c.from).map(|r| RowCopy {
                        from: c.from,
                        to: c.to,
                        row: r.data.clone(),
                    })
                })
                .collect(),
            changed: self.changed.iter().map(|c| c.row.data.clone()).collect(),
        }
    }
}

/// A copy as subscribers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowCopy {
    pub from: usize,
    pub to: usize,
    pub row: Row,
}

/// Hash-free edit script delivered with every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowDiff {
    pub added: Vec<Row>,
    pub removed: Vec<Row>,
    pub moved: Vec<MovedRow>,
    pub copied: Vec<RowCopy>,
    pub changed: Vec<Row>,
}

impl RowDiff {
    /// Diff that brings an empty view up to `rows`: every row is added.
    pub fn snapshot(rows: &[HashedRow]) -> Self {
        RowDiff {
            added: rows.iter().map(|r| r.data.clone()).collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
            && self.copied.is_empty()
            && self.changed.is_empty()
    }
}
