//! Machine-parseable error records.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, ErrorKind};

/// One failure or recoverable problem, with the coordinates it occurred at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Error classification.
    pub kind: ErrorKind,
    /// Region (channel) name.
    pub region: Option<String>,
    /// Era label.
    pub year: Option<String>,
    /// Process group.
    pub group: Option<String>,
    /// Process member.
    pub member: Option<String>,
    /// Variation column.
    pub variation: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl ErrorRecord {
    /// Build a record with no coordinates.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            region: None,
            year: None,
            group: None,
            member: None,
            variation: None,
            message: message.into(),
        }
    }

    /// Build a record from an error.
    pub fn from_error(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }

    /// Set the region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the year.
    pub fn year(mut self, year: impl fmt::Display) -> Self {
        self.year = Some(year.to_string());
        self
    }

    /// Set the group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the member.
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Set the variation.
    pub fn variation(mut self, variation: impl Into<String>) -> Self {
        self.variation = Some(variation.into());
        self
    }

    /// Render as one `key=value` line. Missing coordinates print as `-`.
    pub fn to_line(&self) -> String {
        let f = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        format!(
            "kind={} region={} year={} group={} member={} variation={} message={:?}",
            self.kind,
            f(&self.region),
            f(&self.year),
            f(&self.group),
            f(&self.member),
            f(&self.variation),
            self.message
        )
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Accumulates error records from one task or from the whole run.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    records: Vec<ErrorRecord>,
}

impl Diagnostics {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record and emit it as a warning.
    pub fn push(&mut self, record: ErrorRecord) {
        tracing::warn!(
            kind = %record.kind,
            region = record.region.as_deref().unwrap_or("-"),
            year = record.year.as_deref().unwrap_or("-"),
            group = record.group.as_deref().unwrap_or("-"),
            member = record.member.as_deref().unwrap_or("-"),
            variation = record.variation.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );
        self.records.push(record);
    }

    /// Move every record of `other` into `self`.
    pub fn extend(&mut self, other: Diagnostics) {
        self.records.extend(other.records);
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    /// `true` when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether any record is a task failure (as opposed to a skip).
    ///
    /// `MissingInput` and `ScaleTableMiss` are handled locally and do not make
    /// the run fail; everything else does.
    pub fn has_failures(&self) -> bool {
        self.records
            .iter()
            .any(|r| !matches!(r.kind, ErrorKind::MissingInput | ErrorKind::ScaleTableMiss))
    }

    /// Count per kind.
    pub fn counts(&self) -> BTreeMap<ErrorKind, usize> {
        let mut out = BTreeMap::new();
        for r in &self.records {
            *out.entry(r.kind).or_insert(0) += 1;
        }
        out
    }

    /// Final summary line, e.g. `summary total=3 MissingInputError=2 ShapeArtifactError=1`.
    pub fn summary(&self) -> String {
        let mut s = format!("summary total={}", self.records.len());
        for (kind, n) in self.counts() {
            s.push_str(&format!(" {kind}={n}"));
        }
        s
    }
}
