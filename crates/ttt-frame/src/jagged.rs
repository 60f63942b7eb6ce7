//! Columnar containers: jagged per-event lists and the dense weight table.

use ttt_core::{Error, Result};

/// Variable-length per-event lists stored as offsets + flat values.
///
/// `offsets` has `n_events + 1` entries; event `i` owns
/// `values[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Jagged<T> {
    offsets: Vec<usize>,
    values: Vec<T>,
}

impl<T> Default for Jagged<T> {
    fn default() -> Self {
        Self { offsets: vec![0], values: Vec::new() }
    }
}

impl<T: Clone> Jagged<T> {
    /// Build from offsets and flat values, validating the layout.
    pub fn from_parts(offsets: Vec<usize>, values: Vec<T>) -> Result<Self> {
        if offsets.first() != Some(&0) {
            return Err(Error::Validation("jagged offsets must start at 0".into()));
        }
        if offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::Validation("jagged offsets must be non-decreasing".into()));
        }
        if offsets.last() != Some(&values.len()) {
            return Err(Error::Validation(format!(
                "jagged offsets end at {:?} but there are {} values",
                offsets.last(),
                values.len()
            )));
        }
        Ok(Self { offsets, values })
    }

    /// Build from one `Vec` per event.
    pub fn from_rows<R: AsRef<[T]>>(rows: &[R]) -> Self {
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut values = Vec::new();
        offsets.push(0);
        for r in rows {
            values.extend_from_slice(r.as_ref());
            offsets.push(values.len());
        }
        Self { offsets, values }
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The list of event `i`.
    pub fn row(&self, i: usize) -> &[T] {
        &self.values[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Iterate over event lists.
    pub fn rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.offsets.windows(2).map(move |w| &self.values[w[0]..w[1]])
    }

    /// Per-event list length.
    pub fn counts(&self) -> Vec<usize> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Flat values.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Offsets (`n_events + 1` entries).
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Element-wise map keeping the layout.
    pub fn map<U: Clone>(&self, f: impl FnMut(&T) -> U) -> Jagged<U> {
        Jagged { offsets: self.offsets.clone(), values: self.values.iter().map(f).collect() }
    }

    /// Element-wise combination of two jagged arrays with identical layout.
    pub fn zip_with<U: Clone, V: Clone>(
        &self,
        other: &Jagged<U>,
        mut f: impl FnMut(&T, &U) -> V,
    ) -> Result<Jagged<V>> {
        if self.offsets != other.offsets {
            return Err(Error::Validation("jagged layouts differ".into()));
        }
        let values = self.values.iter().zip(other.values.iter()).map(|(a, b)| f(a, b)).collect();
        Ok(Jagged { offsets: self.offsets.clone(), values })
    }

    /// Keep only the elements where `keep` is true (same layout as `self`).
    pub fn filter(&self, keep: &Jagged<bool>) -> Result<Jagged<T>> {
        if self.offsets != keep.offsets {
            return Err(Error::Validation("jagged mask layout differs from data".into()));
        }
        let mut offsets = Vec::with_capacity(self.offsets.len());
        let mut values = Vec::new();
        offsets.push(0);
        for (row, mask) in self.rows().zip(keep.rows()) {
            values.extend(row.iter().zip(mask).filter(|(_, m)| **m).map(|(v, _)| v.clone()));
            offsets.push(values.len());
        }
        Ok(Jagged { offsets, values })
    }

    /// Keep only the events where `keep` is true.
    pub fn select_events(&self, keep: &[bool]) -> Result<Jagged<T>> {
        if keep.len() != self.n_events() {
            return Err(Error::Validation(format!(
                "event mask has {} entries, column has {} events",
                keep.len(),
                self.n_events()
            )));
        }
        let mut offsets = Vec::with_capacity(keep.len() + 1);
        let mut values = Vec::new();
        offsets.push(0);
        for (row, k) in self.rows().zip(keep) {
            if *k {
                values.extend_from_slice(row);
                offsets.push(values.len());
            }
        }
        Ok(Jagged { offsets, values })
    }
}

/// Dense `W[event, variation]` weight matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    n_events: usize,
    n_columns: usize,
    data: Vec<f64>,
}

impl WeightTable {
    /// Build from row-major data.
    pub fn new(n_events: usize, n_columns: usize, data: Vec<f64>) -> Result<Self> {
        if n_columns == 0 {
            return Err(Error::Validation("weight table needs at least the Nominal column".into()));
        }
        if data.len() != n_events * n_columns {
            return Err(Error::Validation(format!(
                "weight table {n_events}x{n_columns} needs {} values, got {}",
                n_events * n_columns,
                data.len()
            )));
        }
        Ok(Self { n_events, n_columns, data })
    }

    /// Build from per-variation columns (column 0 is Nominal).
    pub fn from_columns(columns: &[Vec<f64>]) -> Result<Self> {
        let n_columns = columns.len();
        let n_events = columns.first().map_or(0, Vec::len);
        if columns.iter().any(|c| c.len() != n_events) {
            return Err(Error::Validation("weight columns have different lengths".into()));
        }
        let mut data = Vec::with_capacity(n_events * n_columns);
        for i in 0..n_events {
            data.extend(columns.iter().map(|c| c[i]));
        }
        Self::new(n_events, n_columns, data)
    }

    /// All-ones table (data events).
    pub fn ones(n_events: usize, n_columns: usize) -> Self {
        let n_columns = n_columns.max(1);
        Self { n_events, n_columns, data: vec![1.0; n_events * n_columns] }
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// Number of variation columns.
    pub fn n_columns(&self) -> usize {
        self.n_columns
    }

    /// Weights of event `i`, one per variation.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_columns..(i + 1) * self.n_columns]
    }

    /// Copy out variation column `j`.
    pub fn column(&self, j: usize) -> Result<Vec<f64>> {
        if j >= self.n_columns {
            return Err(Error::MissingInput(format!(
                "weight column {j} requested, table has {}",
                self.n_columns
            )));
        }
        Ok((0..self.n_events).map(|i| self.data[i * self.n_columns + j]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_and_access() {
        let j = Jagged::from_rows(&[vec![1.0, 2.0], vec![], vec![3.0]]);
        assert_eq!(j.n_events(), 3);
        assert_eq!(j.counts(), vec![2, 0, 1]);
        assert_eq!(j.row(2), &[3.0]);
        assert_eq!(j.offsets(), &[0, 2, 2, 3]);
    }

    #[test]
    fn from_parts_validates() {
        assert!(Jagged::from_parts(vec![0, 2], vec![1.0]).is_err());
        assert!(Jagged::from_parts(vec![1, 2], vec![1.0, 2.0]).is_err());
        assert!(Jagged::from_parts(vec![0, 2, 1], vec![1.0, 2.0]).is_err());
        assert!(Jagged::<f64>::from_parts(vec![0], vec![]).is_ok());
    }

    #[test]
    fn filter_and_select() {
        let j = Jagged::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0]]);
        let m = Jagged::from_rows(&[vec![true, false, true], vec![false]]);
        let f = j.filter(&m).unwrap();
        assert_eq!(f.row(0), &[1.0, 3.0]);
        assert!(f.row(1).is_empty());
        let s = j.select_events(&[false, true]).unwrap();
        assert_eq!(s.n_events(), 1);
        assert_eq!(s.row(0), &[4.0]);
    }

    #[test]
    fn weight_table_columns() {
        let w = WeightTable::from_columns(&[vec![1.0, 2.0], vec![1.1, 2.2]]).unwrap();
        assert_eq!(w.n_columns(), 2);
        assert_eq!(w.row(1), &[2.0, 2.2]);
        assert_eq!(w.column(1).unwrap(), vec![1.1, 2.2]);
        assert!(w.column(2).is_err());
        assert!(WeightTable::new(2, 2, vec![1.0]).is_err());
    }
}
