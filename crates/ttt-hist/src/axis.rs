//! Histogram axes.

use serde::{Deserialize, Serialize};

use ttt_core::{Error, Result};

/// A binned axis.
///
/// In YAML: `{regular: {bins: 15, lo: 75, hi: 105}}` or
/// `{variable: [0.0, 0.15, 0.3, 1.1]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisRepr", into = "AxisRepr")]
pub enum Axis {
    /// `bins` equal-width bins on `[lo, hi)`.
    Regular {
        /// Number of bins.
        bins: usize,
        /// Lower edge.
        lo: f64,
        /// Upper edge.
        hi: f64,
    },
    /// Explicit, strictly increasing edges.
    Variable(Vec<f64>),
}

/// Map form shared by YAML and JSON: exactly one of `regular` / `variable`.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AxisRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regular: Option<RegularRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variable: Option<Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegularRepr {
    bins: usize,
    lo: f64,
    hi: f64,
}

impl TryFrom<AxisRepr> for Axis {
    type Error = Error;

    fn try_from(repr: AxisRepr) -> Result<Self> {
        match (repr.regular, repr.variable) {
            (Some(r), None) => Axis::regular(r.bins, r.lo, r.hi),
            (None, Some(edges)) => Axis::variable(edges),
            _ => Err(Error::Configuration(
                "axis needs exactly one of `regular` or `variable`".into(),
            )),
        }
    }
}

impl From<Axis> for AxisRepr {
    fn from(axis: Axis) -> Self {
        match axis {
            Axis::Regular { bins, lo, hi } => {
                AxisRepr { regular: Some(RegularRepr { bins, lo, hi }), variable: None }
            }
            Axis::Variable(edges) => AxisRepr { regular: None, variable: Some(edges) },
        }
    }
}

impl Axis {
    /// Regular axis.
    pub fn regular(bins: usize, lo: f64, hi: f64) -> Result<Self> {
        let a = Axis::Regular { bins, lo, hi };
        a.validate()?;
        Ok(a)
    }

    /// Variable-width axis.
    pub fn variable(edges: Vec<f64>) -> Result<Self> {
        let a = Axis::Variable(edges);
        a.validate()?;
        Ok(a)
    }

    /// Check the binning.
    pub fn validate(&self) -> Result<()> {
        match self {
            Axis::Regular { bins, lo, hi } => {
                if *bins == 0 || !lo.is_finite() || !hi.is_finite() || lo >= hi {
                    return Err(Error::Configuration(format!(
                        "invalid regular axis ({bins}, {lo}, {hi})"
                    )));
                }
            }
            Axis::Variable(edges) => {
                if edges.len() < 2
                    || edges.iter().any(|e| !e.is_finite())
                    || edges.windows(2).any(|w| w[0] >= w[1])
                {
                    return Err(Error::Configuration(format!("invalid variable axis {edges:?}")));
                }
            }
        }
        Ok(())
    }

    /// Number of in-range bins.
    pub fn n_bins(&self) -> usize {
        match self {
            Axis::Regular { bins, .. } => *bins,
            Axis::Variable(edges) => edges.len().saturating_sub(1),
        }
    }

    /// Bin edges (`n_bins + 1` entries).
    pub fn edges(&self) -> Vec<f64> {
        match self {
            Axis::Regular { bins, lo, hi } => {
                let width = (hi - lo) / *bins as f64;
                (0..=*bins).map(|i| if i == *bins { *hi } else { lo + width * i as f64 }).collect()
            }
            Axis::Variable(edges) => edges.clone(),
        }
    }

    /// Bin centres.
    pub fn centers(&self) -> Vec<f64> {
        self.edges().windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    /// Bin of a value. Underflow goes to the first bin and overflow to the
    /// last; NaN has no bin.
    pub fn index(&self, v: f64) -> Option<usize> {
        if v.is_nan() {
            return None;
        }
        let n = self.n_bins();
        if n == 0 {
            return None;
        }
        let i = match self {
            Axis::Regular { bins, lo, hi } => {
                if v < *lo {
                    0
                } else if v >= *hi {
                    n - 1
                } else {
                    (((v - lo) / (hi - lo)) * *bins as f64) as usize
                }
            }
            Axis::Variable(edges) => edges.partition_point(|e| *e <= v).saturating_sub(1),
        };
        Some(i.min(n - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_binning_absorbs_flow() {
        let a = Axis::regular(15, 75.0, 105.0).unwrap();
        assert_eq!(a.n_bins(), 15);
        assert_eq!(a.index(75.0), Some(0));
        assert_eq!(a.index(76.99), Some(0));
        assert_eq!(a.index(77.5), Some(1));
        assert_eq!(a.index(-1e9), Some(0));
        assert_eq!(a.index(105.0), Some(14));
        assert_eq!(a.index(f64::INFINITY), Some(14));
        assert_eq!(a.index(f64::NAN), None);
        assert_eq!(a.edges().len(), 16);
        assert_eq!(*a.edges().last().unwrap(), 105.0);
    }

    #[test]
    fn variable_binning() {
        let a = Axis::variable(vec![0.0, 200.0, 400.0]).unwrap();
        assert_eq!(a.index(150.0), Some(0));
        assert_eq!(a.index(200.0), Some(1));
        assert_eq!(a.index(350.0), Some(1));
        assert_eq!(a.index(1000.0), Some(1));
        assert_eq!(a.index(-5.0), Some(0));
        assert_eq!(a.centers(), vec![100.0, 300.0]);
    }

    #[test]
    fn invalid_axes() {
        assert!(Axis::regular(0, 0.0, 1.0).is_err());
        assert!(Axis::regular(3, 1.0, 1.0).is_err());
        assert!(Axis::variable(vec![0.0]).is_err());
        assert!(Axis::variable(vec![0.0, 2.0, 1.0]).is_err());
    }

    #[test]
    fn yaml_forms() {
        let a: Axis = serde_yaml_ng::from_str("regular: {bins: 3, lo: 0, hi: 3}").unwrap();
        assert_eq!(a, Axis::Regular { bins: 3, lo: 0.0, hi: 3.0 });
        let v: Axis = serde_json::from_str(r#"{"variable": [0, 1, 2.5]}"#).unwrap();
        assert_eq!(v.n_bins(), 2);
        let v: Axis = serde_yaml_ng::from_str("{variable: [0, 200, 400]}").unwrap();
        assert_eq!(v, Axis::Variable(vec![0.0, 200.0, 400.0]));
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"variable":[0.0,200.0,400.0]}"#);
    }

    #[test]
    fn yaml_rejects_ambiguous_or_invalid() {
        assert!(serde_yaml_ng::from_str::<Axis>("{}").is_err());
        assert!(serde_yaml_ng::from_str::<Axis>("{variable: [0, 1], regular: {bins: 1, lo: 0, hi: 1}}").is_err());
        assert!(serde_yaml_ng::from_str::<Axis>("{variable: [1, 0]}").is_err());
        assert!(serde_yaml_ng::from_str::<Axis>("{regular: {bins: 0, lo: 0, hi: 1}}").is_err());
    }
}
