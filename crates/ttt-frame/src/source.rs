//! Event sources: where an [`EventFrame`](crate::EventFrame) reads its columns from.
//!
//! A source exposes the capabilities `has_column`, `has_collection` and
//! `has_jec_shift`, and hands out whole columns on request. The frame
//! decides what to read and caches it; sources never cache.

use std::collections::BTreeMap;

use ttt_core::{Error, Result};

use crate::jagged::{Jagged, WeightTable};

/// Column holding the dense weight table.
pub const WEIGHT_COLUMN: &str = "weight";
/// Column holding the per-event selection bitmap.
pub const PASS_EVENT_COLUMN: &str = "PassEvent";
/// Per-particle selection bitmap field.
pub const BITMAP_FIELD: &str = "syst_bitMap";
/// Per-particle jet-energy shifted transverse momentum.
pub const PT_SHIFT_FIELD: &str = "pt_shift";
/// Per-particle jet-energy shifted mass.
pub const MASS_SHIFT_FIELD: &str = "mass_shift";

/// Physical column name of a collection field, `<collection>/<field>`.
pub fn collection_column(collection: &str, field: &str) -> String {
    format!("{collection}/{field}")
}

/// A scalar column as stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// One value per event, independent of the variation.
    Flat(Vec<f64>),
    /// One value per (event, selection bit).
    PerVariation(Jagged<f64>),
}

impl Column {
    /// Number of events.
    pub fn len(&self) -> usize {
        match self {
            Column::Flat(v) => v.len(),
            Column::PerVariation(j) => j.n_events(),
        }
    }

    /// `true` for a column with no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values under selection bit `bit`.
    pub fn at_bit(&self, name: &str, bit: usize) -> Result<Vec<f64>> {
        match self {
            Column::Flat(v) => Ok(v.clone()),
            Column::PerVariation(j) => j
                .rows()
                .enumerate()
                .map(|(i, row)| {
                    row.get(bit).copied().ok_or_else(|| {
                        Error::MissingInput(format!(
                            "column '{name}' has {} variation entries at event {i}, bit {bit} requested",
                            row.len()
                        ))
                    })
                })
                .collect(),
        }
    }
}

/// Which kinematic quantity a jet-energy shift table replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftKind {
    /// Transverse momentum.
    Pt,
    /// Mass.
    Mass,
}

impl ShiftKind {
    /// Field name the shift replaces.
    pub fn target_field(self) -> &'static str {
        match self {
            ShiftKind::Pt => "pt",
            ShiftKind::Mass => "mass",
        }
    }

    /// Field name of the stored shift table.
    pub fn column_field(self) -> &'static str {
        match self {
            ShiftKind::Pt => PT_SHIFT_FIELD,
            ShiftKind::Mass => MASS_SHIFT_FIELD,
        }
    }
}

/// Read access to one (member, tree) of one batch.
pub trait EventSource: Send {
    /// Human readable location, used in messages.
    fn describe(&self) -> String;

    /// Number of events in the tree.
    fn n_events(&self) -> usize;

    /// Whether a scalar column exists.
    fn has_column(&self, name: &str) -> bool;

    /// Whether any `<collection>/...` column exists.
    fn has_collection(&self, collection: &str) -> bool;

    /// Whether a stored field exists on a collection.
    fn has_field(&self, collection: &str, field: &str) -> bool;

    /// Whether the collection carries a shift table of the given kind.
    fn has_shift(&self, collection: &str, kind: ShiftKind) -> bool;

    /// Whether the collection carries jet-energy shift tables.
    fn has_jec_shift(&self, collection: &str) -> bool {
        self.has_shift(collection, ShiftKind::Pt)
    }

    /// Read a scalar column.
    fn scalar(&self, name: &str) -> Result<Column>;

    /// Read the dense weight table.
    fn weights(&self) -> Result<WeightTable>;

    /// Read the per-event selection bitmap.
    fn pass_event(&self) -> Result<Vec<u64>>;

    /// Read one stored field of a collection.
    fn field(&self, collection: &str, field: &str) -> Result<Jagged<f64>>;

    /// Read a collection's per-particle selection bitmap, if stored.
    fn bitmap(&self, collection: &str) -> Result<Option<Jagged<u64>>>;

    /// Read a collection's shift table `[event][particle][jec variation]`.
    fn shift(&self, collection: &str, kind: ShiftKind) -> Result<Jagged<Vec<f64>>>;
}

/// Stored columns of one particle collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionData {
    fields: BTreeMap<String, Jagged<f64>>,
    bitmap: Option<Jagged<u64>>,
    pt_shift: Option<Jagged<Vec<f64>>>,
    mass_shift: Option<Jagged<Vec<f64>>>,
}

impl CollectionData {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stored field.
    pub fn with_field(mut self, name: impl Into<String>, values: Jagged<f64>) -> Self {
        self.fields.insert(name.into(), values);
        self
    }

    /// Add the per-particle selection bitmap.
    pub fn with_bitmap(mut self, bitmap: Jagged<u64>) -> Self {
        self.bitmap = Some(bitmap);
        self
    }

    /// Add a jet-energy shift table.
    pub fn with_shift(mut self, kind: ShiftKind, table: Jagged<Vec<f64>>) -> Self {
        match kind {
            ShiftKind::Pt => self.pt_shift = Some(table),
            ShiftKind::Mass => self.mass_shift = Some(table),
        }
        self
    }

    /// Stored fields.
    pub fn fields(&self) -> &BTreeMap<String, Jagged<f64>> {
        &self.fields
    }

    /// Per-particle selection bitmap.
    pub fn bitmap(&self) -> Option<&Jagged<u64>> {
        self.bitmap.as_ref()
    }

    /// Shift table.
    pub fn shift(&self, kind: ShiftKind) -> Option<&Jagged<Vec<f64>>> {
        match kind {
            ShiftKind::Pt => self.pt_shift.as_ref(),
            ShiftKind::Mass => self.mass_shift.as_ref(),
        }
    }
}

/// Fully in-memory tree. Used as a fixture source and as the input of
/// [`write_event_table`](crate::parquet::write_event_table).
#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    weights: WeightTable,
    pass_event: Vec<u64>,
    scalars: BTreeMap<String, Column>,
    collections: BTreeMap<String, CollectionData>,
}

impl EventTable {
    /// New table; every event passes every selection bit until
    /// [`with_pass_event`](Self::with_pass_event) says otherwise.
    pub fn new(weights: WeightTable) -> Self {
        let n = weights.n_events();
        Self {
            weights,
            pass_event: vec![u64::MAX; n],
            scalars: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    /// Set the per-event selection bitmap.
    pub fn with_pass_event(mut self, bits: Vec<u64>) -> Self {
        self.pass_event = bits;
        self
    }

    /// Add a variation-independent scalar column.
    pub fn with_scalar(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.scalars.insert(name.into(), Column::Flat(values));
        self
    }

    /// Add a scalar column stored per selection bit.
    pub fn with_scalar_per_variation(mut self, name: impl Into<String>, values: Jagged<f64>) -> Self {
        self.scalars.insert(name.into(), Column::PerVariation(values));
        self
    }

    /// Add a particle collection.
    pub fn with_collection(mut self, name: impl Into<String>, data: CollectionData) -> Self {
        self.collections.insert(name.into(), data);
        self
    }

    /// Check that every column has one entry per event.
    pub fn validate(&self) -> Result<()> {
        let n = self.weights.n_events();
        if self.pass_event.len() != n {
            return Err(Error::Validation(format!(
                "{PASS_EVENT_COLUMN} has {} entries, expected {n}",
                self.pass_event.len()
            )));
        }
        for (name, col) in &self.scalars {
            if col.len() != n {
                return Err(Error::Validation(format!(
                    "column '{name}' has {} entries, expected {n}",
                    col.len()
                )));
            }
        }
        for (coll, data) in &self.collections {
            let Some(first) = data.fields.values().next() else {
                return Err(Error::Validation(format!("collection '{coll}' has no fields")));
            };
            for (field, values) in &data.fields {
                if values.offsets() != first.offsets() || values.n_events() != n {
                    return Err(Error::Validation(format!(
                        "field '{coll}/{field}' does not match the collection layout"
                    )));
                }
            }
            if let Some(b) = &data.bitmap
                && b.offsets() != first.offsets()
            {
                return Err(Error::Validation(format!("'{coll}/{BITMAP_FIELD}' layout mismatch")));
            }
            for kind in [ShiftKind::Pt, ShiftKind::Mass] {
                if let Some(s) = data.shift(kind)
                    && s.offsets() != first.offsets()
                {
                    return Err(Error::Validation(format!(
                        "'{coll}/{}' layout mismatch",
                        kind.column_field()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Weight table.
    pub fn weight_table(&self) -> &WeightTable {
        &self.weights
    }

    /// Selection bitmap.
    pub fn pass_events(&self) -> &[u64] {
        &self.pass_event
    }

    /// Scalar columns.
    pub fn scalars(&self) -> &BTreeMap<String, Column> {
        &self.scalars
    }

    /// Collections.
    pub fn collections(&self) -> &BTreeMap<String, CollectionData> {
        &self.collections
    }

    fn collection(&self, name: &str) -> Result<&CollectionData> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unknown collection '{name}'")))
    }
}

impl EventSource for EventTable {
    fn describe(&self) -> String {
        format!("<memory:{} events>", self.weights.n_events())
    }

    fn n_events(&self) -> usize {
        self.weights.n_events()
    }

    fn has_column(&self, name: &str) -> bool {
        self.scalars.contains_key(name)
    }

    fn has_collection(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    fn has_field(&self, collection: &str, field: &str) -> bool {
        self.collections.get(collection).is_some_and(|c| c.fields.contains_key(field))
    }

    fn has_shift(&self, collection: &str, kind: ShiftKind) -> bool {
        self.collections.get(collection).is_some_and(|c| c.shift(kind).is_some())
    }

    fn scalar(&self, name: &str) -> Result<Column> {
        self.scalars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingInput(format!("no column '{name}' in {}", self.describe())))
    }

    fn weights(&self) -> Result<WeightTable> {
        Ok(self.weights.clone())
    }

    fn pass_event(&self) -> Result<Vec<u64>> {
        Ok(self.pass_event.clone())
    }

    fn field(&self, collection: &str, field: &str) -> Result<Jagged<f64>> {
        self.collection(collection)?.fields.get(field).cloned().ok_or_else(|| {
            Error::Validation(format!("unknown field '{field}' on collection '{collection}'"))
        })
    }

    fn bitmap(&self, collection: &str) -> Result<Option<Jagged<u64>>> {
        Ok(self.collection(collection)?.bitmap.clone())
    }

    fn shift(&self, collection: &str, kind: ShiftKind) -> Result<Jagged<Vec<f64>>> {
        self.collection(collection)?.shift(kind).cloned().ok_or_else(|| {
            Error::MissingInput(format!(
                "collection '{collection}' has no '{}' table",
                kind.column_field()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_variation_column_at_bit() {
        let col = Column::PerVariation(Jagged::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]));
        assert_eq!(col.at_bit("NJets", 1).unwrap(), vec![2.0, 4.0]);
        assert!(col.at_bit("NJets", 2).is_err());
        assert_eq!(Column::Flat(vec![5.0]).at_bit("HT", 7).unwrap(), vec![5.0]);
    }

    #[test]
    fn table_validation_catches_layout_errors() {
        let w = WeightTable::from_columns(&[vec![1.0, 1.0]]).unwrap();
        let ok = EventTable::new(w.clone()).with_scalar("HT", vec![1.0, 2.0]).with_collection(
            "Jets",
            CollectionData::new()
                .with_field("pt", Jagged::from_rows(&[vec![50.0], vec![]]))
                .with_field("eta", Jagged::from_rows(&[vec![0.1], vec![]])),
        );
        ok.validate().unwrap();
        assert!(ok.has_collection("Jets"));
        assert!(ok.has_field("Jets", "eta"));
        assert!(!ok.has_jec_shift("Jets"));

        let bad = EventTable::new(w.clone()).with_scalar("HT", vec![1.0]);
        assert!(bad.validate().is_err());

        let bad = EventTable::new(w).with_collection(
            "Jets",
            CollectionData::new()
                .with_field("pt", Jagged::from_rows(&[vec![50.0], vec![]]))
                .with_field("eta", Jagged::from_rows(&[vec![], vec![0.1]])),
        );
        assert!(bad.validate().is_err());
    }
}
