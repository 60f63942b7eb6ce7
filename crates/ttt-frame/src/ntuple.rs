//! Batch-file layout: one directory per batch, one sub-directory per member.
//!
//! ```text
//! <batch>/
//!   <member>/
//!     meta.json        Systematics, Syst_Index, sumweight
//!     <tree>.parquet   one per region tree
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ttt_core::{Error, NOMINAL, Presence, Result};

use crate::frame::{EventFrame, FrameOptions, SourceKind};
use crate::parquet::{ParquetSource, write_event_table};
use crate::source::EventTable;

/// File name of the per-member metadata.
pub const META_FILE: &str = "meta.json";

/// Variations normalised by their own generator sum of weights, with their
/// slot in the `sumweight` table. Slot 0 is the generator sum.
const SUMWEIGHT_SLOTS: [(&str, usize); 8] = [
    ("LHE_muR_down", 1),
    ("LHE_muF_down", 2),
    ("LHE_muF_up", 3),
    ("LHE_muR_up", 4),
    ("PDF_unc_down", 5),
    ("PDF_unc_up", 6),
    ("PDF_alphaZ_down", 7),
    ("PDF_alphaZ_up", 8),
];

/// Slot of `variation` in the `sumweight` table (0 when it has no own entry).
pub fn sumweight_slot(variation: &str) -> usize {
    SUMWEIGHT_SLOTS.iter().find(|(n, _)| *n == variation).map_or(0, |(_, i)| *i)
}

/// Per-member metadata shared by all trees of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberMeta {
    /// Variation name of each weight column; column 0 is `Nominal`.
    pub systematics: Vec<String>,
    /// Weight column → selection bit. Columns not listed use their own index.
    #[serde(default)]
    pub syst_index: BTreeMap<usize, usize>,
    /// Generator sums of weights, see [`sumweight_slot`].
    #[serde(default)]
    pub sumweight: Vec<f64>,
}

impl MemberMeta {
    /// Metadata with one bit per column and no sums of weights (data).
    pub fn new(systematics: Vec<String>) -> Self {
        Self { systematics, syst_index: BTreeMap::new(), sumweight: Vec::new() }
    }

    /// Set the column → bit mapping.
    pub fn with_syst_index(mut self, index: BTreeMap<usize, usize>) -> Self {
        self.syst_index = index;
        self
    }

    /// Set the sum-of-weights table.
    pub fn with_sumweight(mut self, sumweight: Vec<f64>) -> Self {
        self.sumweight = sumweight;
        self
    }

    /// Check the invariants readers depend on.
    pub fn validate(&self) -> Result<()> {
        if self.systematics.first().map(String::as_str) != Some(NOMINAL) {
            return Err(Error::MissingInput(format!(
                "Systematics table must start with '{NOMINAL}', got {:?}",
                self.systematics.first()
            )));
        }
        if let Some((col, bit)) = self.syst_index.iter().find(|(_, b)| **b >= 64) {
            return Err(Error::Validation(format!(
                "Syst_Index maps column {col} to bit {bit}, bitmaps have 64 bits"
            )));
        }
        Ok(())
    }

    /// Weight column of a variation.
    pub fn column_of(&self, variation: &str) -> Option<usize> {
        self.systematics.iter().position(|s| s == variation)
    }

    /// Selection bit of a weight column.
    pub fn bit_of(&self, column: usize) -> usize {
        self.syst_index.get(&column).copied().unwrap_or(column)
    }

    /// Variations that share the selection of `column` (same bit).
    pub fn same_selection(&self, column: usize) -> Vec<&str> {
        let bit = self.bit_of(column);
        self.systematics
            .iter()
            .enumerate()
            .filter(|(c, _)| self.bit_of(*c) == bit)
            .map(|(_, s)| s.as_str())
            .collect()
    }

    /// Sum of generator weights used to normalise `variation`.
    ///
    /// Falls back to the generator sum when the variation's own entry is
    /// missing or below `floor` times the generator sum.
    pub fn sumweight_for(&self, variation: &str, floor: f64) -> Result<f64> {
        let total = match self.sumweight.first() {
            Some(v) if *v > 0.0 && v.is_finite() => *v,
            other => {
                return Err(Error::MissingInput(format!(
                    "sumweight table has no usable generator sum (got {other:?})"
                )));
            }
        };
        let slot = sumweight_slot(variation);
        match self.sumweight.get(slot) {
            Some(v) if slot > 0 && v.is_finite() && *v / total > floor => Ok(*v),
            Some(v) if slot > 0 => {
                tracing::debug!(
                    variation,
                    sumweight = *v,
                    total,
                    floor,
                    "variation sum of weights below floor, using generator sum"
                );
                Ok(total)
            }
            _ => Ok(total),
        }
    }
}

/// One batch file.
#[derive(Debug, Clone)]
pub struct NtupleFile {
    path: PathBuf,
}

impl NtupleFile {
    /// Open a batch directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::MissingInput(format!(
                "batch file {} does not exist",
                path.display()
            )));
        }
        Ok(Self { path: path.to_path_buf() })
    }

    /// Path of the batch directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Members stored in this batch, sorted.
    pub fn members(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.path().join(META_FILE).is_file() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Metadata of a member, absent when the member is not in this batch.
    pub fn meta(&self, member: &str) -> Result<Presence<MemberMeta>> {
        let p = self.path.join(member).join(META_FILE);
        if !p.is_file() {
            return Ok(Presence::Absent(format!(
                "member '{member}' not in {}",
                self.path.display()
            )));
        }
        let meta: MemberMeta = serde_json::from_slice(&std::fs::read(&p)?)?;
        meta.validate()?;
        Ok(Presence::Present(meta))
    }

    /// Whether a member has a given tree.
    pub fn has_tree(&self, member: &str, tree: &str) -> bool {
        self.tree_path(member, tree).is_file()
    }

    fn tree_path(&self, member: &str, tree: &str) -> PathBuf {
        self.path.join(member).join(format!("{tree}.parquet"))
    }

    /// Open the source of one (member, tree).
    pub fn source(&self, member: &str, tree: &str) -> Result<Presence<ParquetSource>> {
        let p = self.tree_path(member, tree);
        if !p.is_file() {
            return Ok(Presence::Absent(format!(
                "tree '{tree}' of member '{member}' not in {}",
                self.path.display()
            )));
        }
        Ok(Presence::Present(ParquetSource::open(&p)?))
    }

    /// Open an event frame on one (member, tree), switched to `initial_variation`.
    ///
    /// Absent when the member or the tree is not in this batch.
    pub fn open_frame(
        &self,
        member: &str,
        tree: &str,
        kind: SourceKind,
        options: &FrameOptions,
        initial_variation: &str,
    ) -> Result<Presence<EventFrame>> {
        let meta = match self.meta(member)? {
            Presence::Present(m) => m,
            Presence::Absent(r) => return Ok(Presence::Absent(r)),
        };
        let source = match self.source(member, tree)? {
            Presence::Present(s) => s,
            Presence::Absent(r) => return Ok(Presence::Absent(r)),
        };
        let frame = EventFrame::open(
            Box::new(source),
            meta,
            member,
            tree,
            kind,
            options.clone(),
            initial_variation,
        )?;
        Ok(Presence::Present(frame))
    }
}

/// Writes batch directories in the layout [`NtupleFile`] reads.
#[derive(Debug, Clone)]
pub struct NtupleWriter {
    root: PathBuf,
}

impl NtupleWriter {
    /// Create (or reuse) the batch directory.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Write one member: its metadata and every given tree.
    pub fn write_member(
        &self,
        member: &str,
        meta: &MemberMeta,
        trees: &[(&str, &EventTable)],
    ) -> Result<()> {
        meta.validate()?;
        let dir = self.root.join(member);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(meta)?)?;
        for (tree, table) in trees {
            if table.weight_table().n_columns() != meta.systematics.len() {
                return Err(Error::Validation(format!(
                    "tree '{tree}' of '{member}' has {} weight columns, Systematics lists {}",
                    table.weight_table().n_columns(),
                    meta.systematics.len()
                )));
            }
            write_event_table(table, &dir.join(format!("{tree}.parquet")))?;
        }
        Ok(())
    }

    /// Batch directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MemberMeta {
        MemberMeta::new(vec!["Nominal".into(), "LHE_muR_up".into(), "Jet_JER_up".into()])
            .with_syst_index(BTreeMap::from([(1, 0), (2, 1)]))
            .with_sumweight(vec![100.0, 90.0, 95.0, 105.0, 5.0, 80.0, 120.0, 99.0, 101.0])
    }

    #[test]
    fn bits_and_columns() {
        let m = meta();
        assert_eq!(m.column_of("Jet_JER_up"), Some(2));
        assert_eq!(m.bit_of(0), 0);
        assert_eq!(m.bit_of(1), 0);
        assert_eq!(m.bit_of(2), 1);
        assert_eq!(m.same_selection(0), vec!["Nominal", "LHE_muR_up"]);
    }

    #[test]
    fn sumweight_floor_fallback() {
        let m = meta();
        assert_eq!(m.sumweight_for("Nominal", 0.1).unwrap(), 100.0);
        assert_eq!(m.sumweight_for("LHE_muR_down", 0.1).unwrap(), 90.0);
        // LHE_muR_up sits at 5% of the generator sum
        assert_eq!(m.sumweight_for("LHE_muR_up", 0.1).unwrap(), 100.0);
        assert_eq!(m.sumweight_for("LHE_muR_up", 0.01).unwrap(), 5.0);
        assert_eq!(m.sumweight_for("PDF_alphaZ_up", 0.1).unwrap(), 101.0);
        let empty = MemberMeta::new(vec!["Nominal".into()]);
        assert!(empty.sumweight_for("Nominal", 0.1).is_err());
    }

    #[test]
    fn meta_validation_and_serde() {
        assert!(MemberMeta::new(vec!["PU_up".into()]).validate().is_err());
        let json = r#"{"systematics":["Nominal","JER_up"],"syst_index":{"1":1},"sumweight":[1.0]}"#;
        let m: MemberMeta = serde_json::from_str(json).unwrap();
        assert_eq!(m.bit_of(1), 1);
        m.validate().unwrap();
    }
}
