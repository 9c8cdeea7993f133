//! MVCC key layout and row resolution.
//!
//! Every stored version is addressed by a [`VersionedKey`]:
//!
//! | field      | order      | meaning                                   |
//! |------------|------------|-------------------------------------------|
//! | `row`      | ascending  | primary key bytes                          |
//! | `column`   | ascending  | `None` = row marker (liveness/tombstone)  |
//! | `ht`       | descending | hybrid time of the write                  |
//! | `write_id` | descending | position inside the write batch           |
//!
//! Newest-first ordering within one `(row, column)` means a forward scan sees
//! the version visible at a read time before any older one.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use granite_common::datum::Datum;
use granite_common::types::ColumnId;
use granite_common::HybridTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    pub row: Vec<u8>,
    pub column: Option<ColumnId>,
}

impl StorageKey {
    pub fn row_marker(row: impl Into<Vec<u8>>) -> Self {
        StorageKey {
            row: row.into(),
            column: None,
        }
    }

    pub fn column(row: impl Into<Vec<u8>>, column: ColumnId) -> Self {
        StorageKey {
            row: row.into(),
            column: Some(column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedKey {
    pub row: Vec<u8>,
    pub column: Option<ColumnId>,
    pub ht: HybridTime,
    pub write_id: u32,
}

impl VersionedKey {
    pub fn new(key: StorageKey, ht: HybridTime, write_id: u32) -> Self {
        VersionedKey {
            row: key.row,
            column: key.column,
            ht,
            write_id,
        }
    }

    /// Smallest key of `row`: sorts before every version stored for it.
    pub fn row_start(row: &[u8]) -> Self {
        VersionedKey {
            row: row.to_vec(),
            column: None,
            ht: HybridTime::INVALID,
            write_id: u32::MAX,
        }
    }

    pub fn storage_key(&self) -> StorageKey {
        StorageKey {
            row: self.row.clone(),
            column: self.column,
        }
    }

    pub fn same_cell(&self, other: &VersionedKey) -> bool {
        self.row == other.row && self.column == other.column
    }
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| other.ht.cmp(&self.ht))
            .then_with(|| other.write_id.cmp(&self.write_id))
    }
}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stored value of one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Put(Datum),
    Tombstone,
}

impl Value {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    pub fn approx_size(&self) -> usize {
        match self {
            Value::Put(Datum::Text(s)) => 8 + s.len(),
            Value::Put(Datum::Bytes(b)) => 8 + b.len(),
            _ => 9,
        }
    }
}

/// Half-open range of row keys. An empty `start` is unbounded below, an
/// `end` of `None` unbounded above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn all() -> Self {
        KeyRange::default()
    }

    pub fn new(start: impl Into<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        KeyRange {
            start: start.into(),
            end,
        }
    }

    /// Range holding exactly `row`.
    pub fn single(row: &[u8]) -> Self {
        let mut end = row.to_vec();
        end.push(0);
        KeyRange {
            start: row.to_vec(),
            end: Some(end),
        }
    }

    pub fn contains(&self, row: &[u8]) -> bool {
        row >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| row < end)
    }
}

/// One row as seen at a read time.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleRow {
    pub key: Vec<u8>,
    pub columns: BTreeMap<ColumnId, Datum>,
}

/// Fold sorted versions (all with `ht <= read_time`) into the rows visible at
/// that time. A row tombstone hides every column version not newer than it.
pub fn resolve_rows<I>(versions: I) -> Vec<VisibleRow>
where
    I: IntoIterator<Item = (VersionedKey, Value)>,
{
    let mut rows = Vec::new();
    let mut current: Option<RowBuilder> = None;
    let mut last_cell: Option<(Vec<u8>, Option<ColumnId>)> = None;

    for (key, value) in versions {
        if current.as_ref().map_or(true, |b| b.key != key.row) {
            if let Some(done) = current.take().and_then(RowBuilder::finish) {
                rows.push(done);
            }
            current = Some(RowBuilder::new(key.row.clone()));
            last_cell = None;
        }
        let cell = (key.row.clone(), key.column);
        let newest = last_cell.as_ref() != Some(&cell);
        // older row markers still matter: a delete under a reinsert
        if !newest && key.column.is_some() {
            continue;
        }
        last_cell = Some(cell);
        if let Some(builder) = current.as_mut() {
            builder.add_version(&key, value, newest);
        }
    }
    if let Some(done) = current.and_then(RowBuilder::finish) {
        rows.push(done);
    }
    rows
}

struct RowBuilder {
    key: Vec<u8>,
    live: bool,
    deleted_at: Option<HybridTime>,
    columns: BTreeMap<ColumnId, Datum>,
}

impl RowBuilder {
    fn new(key: Vec<u8>) -> Self {
        RowBuilder {
            key,
            live: false,
            deleted_at: None,
            columns: BTreeMap::new(),
        }
    }

    /// Versions arrive newest first, so the first row tombstone seen is the
    /// latest delete.
    fn add_version(&mut self, key: &VersionedKey, value: Value, newest: bool) {
        match (key.column, value) {
            (None, Value::Put(_)) => self.live |= newest,
            (None, Value::Tombstone) => {
                self.deleted_at.get_or_insert(key.ht);
            }
            (Some(_), _) if self.deleted_at.is_some_and(|t| key.ht <= t) => {}
            (Some(col), Value::Put(datum)) => {
                self.columns.insert(col, datum);
            }
            (Some(_), Value::Tombstone) => {}
        }
    }

    fn finish(self) -> Option<VisibleRow> {
        if !self.live && self.columns.is_empty() {
            return None;
        }
        Some(VisibleRow {
            key: self.key,
            columns: self.columns,
        })
    }
}
