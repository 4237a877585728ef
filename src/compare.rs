// ABOUTME: Record comparison and diff classification for master/slave page pairs
// ABOUTME: Full outer join on record identifier yields OnlyMaster, OnlySlave, Value or None

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use crate::error::{ReconcileError, Result};
use crate::page::{Page, PageRecord};
use crate::record::Record;

/// Classification of one master/slave record pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferType {
    /// Both sides agree
    None,
    /// The record exists only on the master
    OnlyMaster,
    /// The record exists only on the slave
    OnlySlave,
    /// Both sides hold the record but at least one field differs
    Value,
}

impl DifferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifferType::None => "none",
            DifferType::OnlyMaster => "only_master",
            DifferType::OnlySlave => "only_slave",
            DifferType::Value => "value",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(DifferType::None),
            "only_master" => Ok(DifferType::OnlyMaster),
            "only_slave" => Ok(DifferType::OnlySlave),
            "value" => Ok(DifferType::Value),
            other => Err(ReconcileError::InvalidInput(format!(
                "unknown differ type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DifferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified discrepancy.
///
/// The master side is present iff the type is `OnlyMaster` or `Value`; the
/// slave side iff it is `OnlySlave` or `Value`. For `Value` differs each side
/// holds only the columns that disagree; for `Only*` differs it holds the
/// whole record. The invariant is enforced by the constructors and checked
/// again on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDiffer")]
pub struct Differ {
    #[serde(rename = "type")]
    kind: DifferType,
    key: String,
    master_column: Option<Record>,
    slave_column: Option<Record>,
}

#[derive(Deserialize)]
struct RawDiffer {
    #[serde(rename = "type")]
    kind: DifferType,
    #[serde(default)]
    key: String,
    master_column: Option<Record>,
    slave_column: Option<Record>,
}

impl TryFrom<RawDiffer> for Differ {
    type Error = String;

    fn try_from(raw: RawDiffer) -> std::result::Result<Self, Self::Error> {
        let expects_master = matches!(raw.kind, DifferType::OnlyMaster | DifferType::Value);
        let expects_slave = matches!(raw.kind, DifferType::OnlySlave | DifferType::Value);
        if raw.master_column.is_some() != expects_master
            || raw.slave_column.is_some() != expects_slave
        {
            return Err(format!("{} differ has inconsistent columns", raw.kind));
        }
        Ok(Differ {
            kind: raw.kind,
            key: raw.key,
            master_column: raw.master_column,
            slave_column: raw.slave_column,
        })
    }
}

impl Differ {
    pub fn none() -> Self {
        Self {
            kind: DifferType::None,
            key: String::new(),
            master_column: None,
            slave_column: None,
        }
    }

    pub fn only_master(master: Record) -> Self {
        Self {
            kind: DifferType::OnlyMaster,
            key: String::new(),
            master_column: Some(master),
            slave_column: None,
        }
    }

    pub fn only_slave(slave: Record) -> Self {
        Self {
            kind: DifferType::OnlySlave,
            key: String::new(),
            master_column: None,
            slave_column: Some(slave),
        }
    }

    pub fn value(master: Record, slave: Record) -> Self {
        Self {
            kind: DifferType::Value,
            key: String::new(),
            master_column: Some(master),
            slave_column: Some(slave),
        }
    }

    /// Attach the record identifier this differ is about.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn kind(&self) -> DifferType {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn master_column(&self) -> Option<&Record> {
        self.master_column.as_ref()
    }

    pub fn slave_column(&self) -> Option<&Record> {
        self.slave_column.as_ref()
    }

    pub fn is_none(&self) -> bool {
        self.kind == DifferType::None
    }
}

/// Field-by-field comparison of two records that are both present.
pub trait RecordComparable: Send + Sync {
    /// Compare `left` (master) with `right` (slave).
    ///
    /// Records of different widths fail with `ColumnCountMismatch`. The returned
    /// differ has no key; the caller attaches one.
    fn compare(&self, left: &Record, right: &Record) -> Result<Differ>;
}

/// Positional comparator with an optional set of ignored columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnComparator {
    ignore: HashSet<String>,
}

impl ColumnComparator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip columns (by master-side name) when comparing values. Column counts
    /// must still match.
    pub fn ignoring<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignore: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl RecordComparable for ColumnComparator {
    fn compare(&self, left: &Record, right: &Record) -> Result<Differ> {
        if left.len() != right.len() {
            return Err(ReconcileError::ColumnCountMismatch {
                master: left.len(),
                slave: right.len(),
            });
        }

        let mut master = Vec::new();
        let mut slave = Vec::new();
        for (l, r) in left.iter().zip(right.iter()) {
            if self.ignore.contains(&l.name) {
                continue;
            }
            if l.value != r.value {
                master.push(l.clone());
                slave.push(r.clone());
            }
        }

        if master.is_empty() {
            Ok(Differ::none())
        } else {
            Ok(Differ::value(Record::new(master), Record::new(slave)))
        }
    }
}

/// Reconcile one master page against its slave counterpart.
///
/// Performs a full outer join on record identifier and returns one differ per
/// distinct key (including `None` differs for agreeing pairs), ordered by
/// offset.
pub fn diff_pages(
    comparator: &dyn RecordComparable,
    master: &Page,
    slave: &Page,
) -> Result<Vec<Differ>> {
    let mut joined: Vec<(&String, &PageRecord, Option<&PageRecord>, Option<&PageRecord>)> =
        Vec::with_capacity(master.len().max(slave.len()));

    for (key, record) in &master.records {
        joined.push((key, record, Some(record), slave.records.get(key)));
    }
    for (key, record) in &slave.records {
        if !master.records.contains_key(key) {
            joined.push((key, record, None, Some(record)));
        }
    }

    // Every offset must be comparable before sorting, so the sort itself is total.
    if let Some((_, first, _, _)) = joined.first() {
        for (_, record, _, _) in &joined[1..] {
            first.offset.compare(&record.offset)?;
        }
    }
    joined.sort_by(|a, b| {
        a.1.offset
            .compare(&b.1.offset)
            .unwrap_or(Ordering::Equal)
    });

    joined
        .into_iter()
        .map(|(key, _, m, s)| {
            let differ = match (m, s) {
                (Some(m), Some(s)) => comparator.compare(&m.record, &s.record)?,
                (Some(m), None) => Differ::only_master(m.record.clone()),
                (None, Some(s)) => Differ::only_slave(s.record.clone()),
                (None, None) => unreachable!("joined keys come from at least one page"),
            };
            Ok(differ.with_key(key.clone()))
        })
        .collect()
}
