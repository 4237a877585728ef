// ABOUTME: Pagination contract between the driver and table adapters
// ABOUTME: PageParam is a half-open offset window; Page is what reading it produced

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ReconcileError, Result};
use crate::offset::Offset;
use crate::record::Record;

/// A half-open window `[start, end)` of offsets plus an adapter-specific query.
///
/// `start` is `None` only for the first page of a scan and `end` is `None` only
/// for the last. The `query` payload is opaque to the driver and travels with
/// the window into the page tracker, so a resumed scan reads exactly what the
/// original plan described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageParam {
    pub start: Option<Offset>,
    pub end: Option<Offset>,
    #[serde(default)]
    pub query: serde_json::Value,
}

impl PageParam {
    pub fn new(start: Option<Offset>, end: Option<Offset>) -> Self {
        Self {
            start,
            end,
            query: serde_json::Value::Null,
        }
    }

    /// The single window covering `(-inf, +inf)`.
    pub fn unbounded() -> Self {
        Self::new(None, None)
    }

    pub fn with_query(mut self, query: serde_json::Value) -> Self {
        self.query = query;
        self
    }

    pub fn is_first(&self) -> bool {
        self.start.is_none()
    }

    pub fn is_last(&self) -> bool {
        self.end.is_none()
    }

    /// Whether `offset` falls inside `[start, end)`.
    pub fn contains(&self, offset: &Offset) -> Result<bool> {
        if let Some(start) = &self.start {
            if offset.compare(start)? == Ordering::Less {
                return Ok(false);
            }
        }
        if let Some(end) = &self.end {
            if offset.compare(end)? != Ordering::Less {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for PageParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(start) => write!(f, "[{}", start)?,
            None => write!(f, "(-inf")?,
        }
        match &self.end {
            Some(end) => write!(f, ", {})", end),
            None => write!(f, ", +inf)"),
        }
    }
}

/// Check that `pages` are contiguous, non-overlapping and gap-free.
///
/// With `full_cover` the plan must also span `(-inf, +inf)`, which is what a
/// fresh split produces. A resumed plan only has to be contiguous and end at
/// `+inf`.
pub fn check_plan(pages: &[PageParam], full_cover: bool) -> Result<()> {
    let (first, last) = match (pages.first(), pages.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            if full_cover {
                return Err(ReconcileError::InvalidInput(
                    "page plan is empty".to_string(),
                ));
            }
            return Ok(());
        }
    };

    if full_cover && first.start.is_some() {
        return Err(ReconcileError::InvalidInput(format!(
            "first page {} does not start at -inf",
            first
        )));
    }
    if last.end.is_some() {
        return Err(ReconcileError::InvalidInput(format!(
            "last page {} does not end at +inf",
            last
        )));
    }

    for (idx, page) in pages.iter().enumerate() {
        if let (Some(start), Some(end)) = (&page.start, &page.end) {
            if start.compare(end)? != Ordering::Less {
                return Err(ReconcileError::InvalidInput(format!(
                    "page {} {} is empty or inverted",
                    idx, page
                )));
            }
        }
        if idx > 0 && page.start.is_none() {
            return Err(ReconcileError::InvalidInput(format!(
                "page {} {} starts at -inf but is not the first page",
                idx, page
            )));
        }
    }

    for (idx, pair) in pages.windows(2).enumerate() {
        let boundary_matches = match (&pair[0].end, &pair[1].start) {
            (Some(end), Some(start)) => end.compare(start)? == Ordering::Equal,
            _ => false,
        };
        if !boundary_matches {
            return Err(ReconcileError::InvalidInput(format!(
                "pages {} {} and {} {} are not contiguous",
                idx,
                pair[0],
                idx + 1,
                pair[1]
            )));
        }
    }

    Ok(())
}

/// One row of a page: its own offset plus its typed field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub offset: Offset,
    pub record: Record,
}

impl PageRecord {
    pub fn new(offset: Offset, record: Record) -> Self {
        Self { offset, record }
    }
}

/// The result of reading one [`PageParam`].
///
/// `min`/`max` are the offsets actually observed, which may be narrower than
/// the requested window. Records are keyed by [`Offset::encode`].
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub min: Option<Offset>,
    pub max: Option<Offset>,
    pub records: BTreeMap<String, PageRecord>,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a record, widening `min`/`max`. Duplicate identifiers mean the key
    /// is not actually unique and are rejected.
    pub fn insert(&mut self, record: PageRecord) -> Result<()> {
        let key = record.offset.encode();
        if self.records.contains_key(&key) {
            return Err(ReconcileError::InvalidInput(format!(
                "duplicate primary key {} in page",
                record.offset
            )));
        }

        let below_min = match &self.min {
            Some(min) => record.offset.compare(min)? == Ordering::Less,
            None => true,
        };
        if below_min {
            self.min = Some(record.offset.clone());
        }
        let above_max = match &self.max {
            Some(max) => record.offset.compare(max)? == Ordering::Greater,
            None => true,
        };
        if above_max {
            self.max = Some(record.offset.clone());
        }

        self.records.insert(key, record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PageRecord> {
        self.records.get(key)
    }

    pub fn from_records(records: impl IntoIterator<Item = PageRecord>) -> Result<Self> {
        let mut page = Page::new();
        for record in records {
            page.insert(record)?;
        }
        Ok(page)
    }
}
