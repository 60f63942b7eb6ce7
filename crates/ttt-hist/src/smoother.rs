//! LOWESS smoothing of up/down shape templates.

use serde::{Deserialize, Serialize};

use ttt_core::{Error, Result};

use crate::histogram::Histogram;
use crate::templates::ShapeTemplates;

/// Symmetric ratio-to-nominal smoother.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShapeSmoother {
    /// LOWESS window fraction.
    pub frac: f64,
    /// Robustifying iterations.
    pub iterations: usize,
    /// Added to `2 · nominal` in the ratio denominators.
    pub epsilon: f64,
}

impl Default for ShapeSmoother {
    fn default() -> Self {
        Self { frac: 0.67, iterations: 5, epsilon: 1e-5 }
    }
}

impl ShapeSmoother {
    /// Smoothed (up, down) for one group.
    ///
    /// With two bins or fewer the raw templates are returned unchanged.
    /// Otherwise the symmetric ratios
    /// `1 ± (up − down) / (2·nominal + ε)` are smoothed against the bin
    /// centres and multiplied back onto the nominal. Variances are copied
    /// from the raw templates.
    pub fn smooth(
        &self,
        nominal: &Histogram,
        up: &Histogram,
        down: &Histogram,
    ) -> Result<(Histogram, Histogram)> {
        if nominal.axes() != up.axes() || nominal.axes() != down.axes() {
            return Err(Error::Validation("smoothing templates with different binning".into()));
        }
        let n = nominal.n_bins();
        if n <= 2 {
            return Ok((up.clone(), down.clone()));
        }
        let nom = nominal.values();
        let r_up: Vec<f64> = nom
            .iter()
            .zip(up.values().iter().zip(down.values()))
            .map(|(n, (u, d))| 1.0 + (u - d) / (2.0 * n + self.epsilon))
            .collect();
        let r_down: Vec<f64> = r_up.iter().map(|r| 2.0 - r).collect();

        let x: Vec<f64> = if nominal.is_2d() {
            (0..n).map(|i| i as f64).collect()
        } else {
            nominal.axis().centers()
        };
        let s_up = self.fit_ratio(&x, &r_up)?;
        let s_down = self.fit_ratio(&x, &r_down)?;

        let scale = |r: &[f64]| nom.iter().zip(r).map(|(n, r)| n * r).collect::<Vec<f64>>();
        let h_up = up.with_contents(scale(&s_up), up.variances().to_vec())?;
        let h_down = down.with_contents(scale(&s_down), down.variances().to_vec())?;
        Ok((h_up, h_down))
    }

    /// LOWESS curve of `ratio` against increasing `x`, one value per point.
    fn fit_ratio(&self, x: &[f64], ratio: &[f64]) -> Result<Vec<f64>> {
        use lowess::prelude::*;

        if !(self.frac > 0.0 && self.frac <= 1.0) {
            return Err(Error::Validation(format!("lowess: frac {} outside (0, 1]", self.frac)));
        }
        if ratio.iter().any(|r| !r.is_finite()) {
            return Err(Error::Validation("lowess: non-finite ratio".into()));
        }
        let model = Lowess::new()
            .fraction(self.frac)
            .iterations(self.iterations)
            .adapter(Batch)
            .build()
            .map_err(|e| Error::Validation(format!("lowess: {e}")))?;
        let fit = model.fit(x, ratio).map_err(|e| Error::Validation(format!("lowess: {e}")))?;
        if fit.y.len() != ratio.len() {
            return Err(Error::Validation(format!(
                "lowess: {} fitted points for {} bins",
                fit.y.len(),
                ratio.len()
            )));
        }
        Ok(fit.y)
    }

    /// Smooth every shape of `templates` whose nuisance asks for it, renaming
    /// it to its smoothed name. Returns the number of shapes smoothed.
    pub fn apply(&self, templates: &mut ShapeTemplates) -> Result<usize> {
        let nominal = &templates.nominal;
        let mut n = 0;
        for shape in &mut templates.shapes {
            if shape.smoothed_name.is_none() || shape.smoothed {
                continue;
            }
            for (group, up) in shape.up.iter_mut() {
                let (Some(down), Some(nom)) = (shape.down.get_mut(group), nominal.get(group)) else {
                    continue;
                };
                let (u, d) = self.smooth(nom, up, down)?;
                *up = u;
                *down = d;
            }
            shape.smoothed = true;
            tracing::debug!(shape = shape.name(), graph = %templates.graph, "smoothed");
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use approx::assert_abs_diff_eq;

    fn hist(axis: &Axis, values: &[f64]) -> Histogram {
        Histogram::from_contents(vec![axis.clone()], values.to_vec(), values.to_vec()).unwrap()
    }

    #[test]
    fn three_bins_constant_ratio() {
        let axis = Axis::variable(vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let nom = hist(&axis, &[10.0, 20.0, 10.0]);
        let up = hist(&axis, &[11.0, 22.0, 11.0]);
        let down = hist(&axis, &[9.0, 18.0, 9.0]);
        let s = ShapeSmoother { frac: 1.0, ..ShapeSmoother::default() };
        let (su, sd) = s.smooth(&nom, &up, &down).unwrap();
        for (a, b) in su.values().iter().zip([11.0, 22.0, 11.0]) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-2);
        }
        for (a, b) in sd.values().iter().zip([9.0, 18.0, 9.0]) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-2);
        }
        assert_eq!(su.variances(), up.variances());
    }

    #[test]
    fn two_bins_bypass() {
        let axis = Axis::variable(vec![0.0, 200.0, 400.0]).unwrap();
        let nom = hist(&axis, &[1.0, 2.0]);
        let up = hist(&axis, &[1.1, 2.2]);
        let down = hist(&axis, &[0.9, 1.8]);
        let (su, sd) = ShapeSmoother::default().smooth(&nom, &up, &down).unwrap();
        assert_eq!(su, up);
        assert_eq!(sd, down);
    }

    #[test]
    fn monotone_ratio_keeps_integral() {
        let axis = Axis::regular(10, 0.0, 10.0).unwrap();
        let nom_v: Vec<f64> = (0..10).map(|i| 100.0 + 10.0 * f64::from(i)).collect();
        let up_v: Vec<f64> = nom_v.iter().enumerate().map(|(i, v)| v * (1.0 + 0.01 * i as f64)).collect();
        let down_v: Vec<f64> = nom_v.iter().enumerate().map(|(i, v)| v * (1.0 - 0.01 * i as f64)).collect();
        let (nom, up, down) = (hist(&axis, &nom_v), hist(&axis, &up_v), hist(&axis, &down_v));
        let (su, sd) = ShapeSmoother::default().smooth(&nom, &up, &down).unwrap();
        assert!((su.integral() / up.integral() - 1.0).abs() < 0.01);
        assert!((sd.integral() / down.integral() - 1.0).abs() < 0.01);
        // direction preserved bin by bin
        for ((s, n), i) in su.values().iter().zip(nom.values()).zip(0..) {
            if i > 0 {
                assert!(s > n);
            }
        }
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let axis = Axis::regular(4, 0.0, 4.0).unwrap();
        let h = hist(&axis, &[1.0; 4]);
        let s = ShapeSmoother { frac: 0.0, ..ShapeSmoother::default() };
        assert_eq!(s.smooth(&h, &h, &h).unwrap_err().kind(), ttt_core::ErrorKind::Internal);
    }

    #[test]
    fn binning_mismatch() {
        let a = Axis::regular(3, 0.0, 3.0).unwrap();
        let b = Axis::regular(3, 0.0, 6.0).unwrap();
        let s = ShapeSmoother::default();
        assert!(s.smooth(&hist(&a, &[1.0; 3]), &hist(&b, &[1.0; 3]), &hist(&a, &[1.0; 3])).is_err());
    }

    #[test]
    fn apply_renames_smoothed_shapes_only() {
        use crate::set::HistogramSet;
        use ttt_core::Era;
        use ttt_syst::{Magnitude, Systematic, SystematicCatalog};

        let axis = Axis::regular(4, 0.0, 4.0).unwrap();
        let mut set = HistogramSet::new();
        let mut put = |var: &str, v: &[f64]| {
            *set.entry("HT", var, "ttz", || Ok(hist(&axis, v))).unwrap() = hist(&axis, v);
        };
        put("Nominal", &[10.0, 10.0, 10.0, 10.0]);
        put("Jet_JER_up", &[11.0, 10.5, 11.5, 11.0]);
        put("Jet_JER_down", &[9.0, 9.5, 8.5, 9.0]);
        put("PU_up", &[11.0, 11.0, 11.0, 11.0]);
        put("PU_down", &[9.0, 9.0, 9.0, 9.0]);
        let catalog = SystematicCatalog::from_systematics([
            Systematic::shape("Jet_JER").smooth().add_all_years(Magnitude::Symmetric(1.0), &["ttz"]),
            Systematic::shape("PU").correlated().add_all_years(Magnitude::Symmetric(1.0), &["ttz"]),
        ])
        .unwrap();
        let mut t = ShapeTemplates::build(&set, "HT", &catalog, Era::Y2018, "Dilepton").unwrap();
        assert_eq!(ShapeSmoother::default().apply(&mut t).unwrap(), 1);
        let names: Vec<&str> = t.shapes.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["Jet_JER_2018_lowess", "PU"]);
        assert_eq!(t.shapes[1].up["ttz"].values(), &[11.0; 4]);
        // second pass is a no-op
        assert_eq!(ShapeSmoother::default().apply(&mut t).unwrap(), 0);
    }
}
