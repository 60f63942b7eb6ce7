//! Weighted histograms with per-member provenance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ttt_core::{Error, Result};

use crate::axis::Axis;

/// What to do with bins whose content ends up negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeBinPolicy {
    /// Replace the content by its absolute value.
    #[default]
    Abs,
    /// Replace the content by zero.
    Floor,
}

/// Contribution of one member to a histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Sum of weights.
    pub sumw: f64,
    /// Sum of squared weights.
    pub sumw2: f64,
    /// Number of filled entries.
    pub entries: u64,
}

impl Provenance {
    fn add(&mut self, other: &Provenance) {
        self.sumw += other.sumw;
        self.sumw2 += other.sumw2;
        self.entries += other.entries;
    }
}

/// A 1-D or 2-D histogram.
///
/// Out-of-range entries are absorbed by the nearest in-range bin on each
/// axis; NaN values are skipped. 2-D contents are stored row-major
/// (`ix * ny + iy`).
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    axes: Vec<Axis>,
    values: Vec<f64>,
    sumw2: Vec<f64>,
    breakdown: BTreeMap<String, Provenance>,
}

impl Histogram {
    /// Empty histogram over one or two axes.
    pub fn new(axes: Vec<Axis>) -> Result<Self> {
        if axes.is_empty() || axes.len() > 2 {
            return Err(Error::Validation(format!("histograms have 1 or 2 axes, got {}", axes.len())));
        }
        for a in &axes {
            a.validate()?;
        }
        let n = axes.iter().map(Axis::n_bins).product();
        Ok(Self { axes, values: vec![0.0; n], sumw2: vec![0.0; n], breakdown: BTreeMap::new() })
    }

    /// Empty 1-D histogram.
    pub fn new_1d(axis: Axis) -> Result<Self> {
        Self::new(vec![axis])
    }

    /// Histogram with given contents and no provenance.
    pub fn from_contents(axes: Vec<Axis>, values: Vec<f64>, sumw2: Vec<f64>) -> Result<Self> {
        let mut h = Self::new(axes)?;
        if values.len() != h.values.len() || sumw2.len() != h.values.len() {
            return Err(Error::Validation(format!(
                "histogram has {} bins, got {} values and {} variances",
                h.values.len(),
                values.len(),
                sumw2.len()
            )));
        }
        h.values = values;
        h.sumw2 = sumw2;
        Ok(h)
    }

    /// Same binning, new contents.
    pub fn with_contents(&self, values: Vec<f64>, sumw2: Vec<f64>) -> Result<Self> {
        Self::from_contents(self.axes.clone(), values, sumw2)
    }

    /// Axes.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// First axis.
    pub fn axis(&self) -> &Axis {
        &self.axes[0]
    }

    /// `true` for 2-D histograms.
    pub fn is_2d(&self) -> bool {
        self.axes.len() == 2
    }

    /// Total number of bins.
    pub fn n_bins(&self) -> usize {
        self.values.len()
    }

    /// Bin contents.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Sums of squared weights.
    pub fn variances(&self) -> &[f64] {
        &self.sumw2
    }

    /// Per-member contributions.
    pub fn breakdown(&self) -> &BTreeMap<String, Provenance> {
        &self.breakdown
    }

    /// Sum of bin contents.
    pub fn integral(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Sum of variances.
    pub fn variance_total(&self) -> f64 {
        self.sumw2.iter().sum()
    }

    /// Fill a 1-D histogram, attributing the entries to `member`.
    pub fn fill(&mut self, values: &[f64], weights: &[f64], member: &str) -> Result<()> {
        if self.is_2d() {
            return Err(Error::Validation("1-D fill on a 2-D histogram".into()));
        }
        if values.len() != weights.len() {
            return Err(Error::Validation(format!(
                "{} values and {} weights",
                values.len(),
                weights.len()
            )));
        }
        let mut prov = Provenance::default();
        for (v, w) in values.iter().zip(weights) {
            if let Some(i) = self.axes[0].index(*v) {
                self.values[i] += w;
                self.sumw2[i] += w * w;
                prov.sumw += w;
                prov.sumw2 += w * w;
                prov.entries += 1;
            }
        }
        self.breakdown.entry(member.to_string()).or_default().add(&prov);
        Ok(())
    }

    /// Fill a 2-D histogram.
    pub fn fill_2d(&mut self, xs: &[f64], ys: &[f64], weights: &[f64], member: &str) -> Result<()> {
        if !self.is_2d() {
            return Err(Error::Validation("2-D fill on a 1-D histogram".into()));
        }
        if xs.len() != weights.len() || ys.len() != weights.len() {
            return Err(Error::Validation(format!(
                "{} x values, {} y values and {} weights",
                xs.len(),
                ys.len(),
                weights.len()
            )));
        }
        let ny = self.axes[1].n_bins();
        let mut prov = Provenance::default();
        for ((x, y), w) in xs.iter().zip(ys).zip(weights) {
            if let (Some(ix), Some(iy)) = (self.axes[0].index(*x), self.axes[1].index(*y)) {
                let i = ix * ny + iy;
                self.values[i] += w;
                self.sumw2[i] += w * w;
                prov.sumw += w;
                prov.sumw2 += w * w;
                prov.entries += 1;
            }
        }
        self.breakdown.entry(member.to_string()).or_default().add(&prov);
        Ok(())
    }

    /// Add another histogram with the same binning.
    pub fn add(&mut self, other: &Histogram) -> Result<()> {
        if self.axes != other.axes {
            return Err(Error::Validation("cannot add histograms with different binning".into()));
        }
        for (a, b) in self.values.iter_mut().zip(&other.values) {
            *a += b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += b;
        }
        for (m, p) in &other.breakdown {
            self.breakdown.entry(m.clone()).or_default().add(p);
        }
        Ok(())
    }

    /// Apply the negative-bin policy. Returns the number of bins changed.
    ///
    /// Variances are left as filled.
    pub fn fix_negative(&mut self, policy: NegativeBinPolicy) -> usize {
        let mut n = 0;
        for v in self.values.iter_mut().filter(|v| **v < 0.0) {
            *v = match policy {
                NegativeBinPolicy::Abs => v.abs(),
                NegativeBinPolicy::Floor => 0.0,
            };
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ht_axis() -> Axis {
        Axis::variable(vec![0.0, 200.0, 400.0]).unwrap()
    }

    #[test]
    fn two_event_fill() {
        let mut h = Histogram::new_1d(ht_axis()).unwrap();
        h.fill(&[150.0, 350.0], &[1.0, 2.0], "ttz").unwrap();
        assert_eq!(h.values(), &[1.0, 2.0]);
        assert_eq!(h.variances(), &[1.0, 4.0]);
        let p = h.breakdown()["ttz"];
        assert_eq!(p.entries, 2);
        assert_relative_eq!(p.sumw, 3.0);
        assert_relative_eq!(p.sumw2, 5.0);
    }

    #[test]
    fn flow_absorbed_and_nan_skipped() {
        let mut h = Histogram::new_1d(ht_axis()).unwrap();
        h.fill(&[-10.0, 1e6, f64::NAN], &[1.0, 2.0, 4.0], "a").unwrap();
        assert_eq!(h.values(), &[1.0, 2.0]);
        assert_eq!(h.breakdown()["a"].entries, 2);
    }

    #[test]
    fn two_dimensional_corners() {
        let x = Axis::regular(2, 0.0, 2.0).unwrap();
        let y = Axis::regular(3, 0.0, 3.0).unwrap();
        let mut h = Histogram::new(vec![x, y]).unwrap();
        h.fill_2d(&[-1.0, 5.0, 0.5], &[-1.0, 5.0, 1.5], &[1.0, 2.0, 3.0], "m").unwrap();
        // (0,0) underflow corner, (1,2) overflow corner, (0,1)
        assert_eq!(h.values(), &[1.0, 3.0, 0.0, 0.0, 0.0, 2.0]);
        assert!(h.fill(&[1.0], &[1.0], "m").is_err());
    }

    #[test]
    fn add_merges_breakdown() {
        let mut a = Histogram::new_1d(ht_axis()).unwrap();
        a.fill(&[10.0], &[1.0], "x").unwrap();
        let mut b = Histogram::new_1d(ht_axis()).unwrap();
        b.fill(&[10.0, 300.0], &[2.0, 1.0], "x").unwrap();
        b.fill(&[300.0], &[0.5], "y").unwrap();
        a.add(&b).unwrap();
        assert_eq!(a.values(), &[3.0, 1.5]);
        assert_eq!(a.breakdown()["x"].entries, 3);
        assert_eq!(a.breakdown()["y"].entries, 1);
        let other = Histogram::new_1d(Axis::regular(2, 0.0, 1.0).unwrap()).unwrap();
        assert!(a.add(&other).is_err());
    }

    #[test]
    fn negative_bins() {
        let mut h = Histogram::new_1d(ht_axis()).unwrap();
        h.fill(&[10.0, 300.0], &[-2.0, 1.0], "x").unwrap();
        let mut f = h.clone();
        assert_eq!(h.fix_negative(NegativeBinPolicy::Abs), 1);
        assert_eq!(h.values(), &[2.0, 1.0]);
        assert_eq!(h.variances(), &[4.0, 1.0]);
        f.fix_negative(NegativeBinPolicy::Floor);
        assert_eq!(f.values(), &[0.0, 1.0]);
    }
}
