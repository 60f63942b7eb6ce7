//! Per-graph template bundles: nominal histograms plus the up/down pairs of
//! every shape nuisance, ready for the artifact writer.

use std::collections::BTreeMap;

use ttt_core::{Direction, Era, Error, Result};
use ttt_syst::SystematicCatalog;

use crate::histogram::Histogram;
use crate::set::HistogramSet;

/// Up/down templates of one shape nuisance, keyed by group.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeTemplate {
    /// Catalog name.
    pub syst: String,
    /// Rendered (per-era) name before smoothing.
    pub raw_name: String,
    /// Name the smoothed pair is written under, when the nuisance is smoothed.
    pub smoothed_name: Option<String>,
    /// Whether [`crate::ShapeSmoother::apply`] already replaced the pairs.
    pub smoothed: bool,
    /// Up templates by group.
    pub up: BTreeMap<String, Histogram>,
    /// Down templates by group.
    pub down: BTreeMap<String, Histogram>,
}

impl ShapeTemplate {
    /// Name written to the artifact and card.
    pub fn name(&self) -> &str {
        match (&self.smoothed_name, self.smoothed) {
            (Some(s), true) => s,
            _ => &self.raw_name,
        }
    }

    /// Groups carrying this shape.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.up.keys().map(String::as_str)
    }

    /// Template of one direction.
    pub fn get(&self, group: &str, dir: Direction) -> Option<&Histogram> {
        match dir {
            Direction::Up => self.up.get(group),
            Direction::Down => self.down.get(group),
        }
    }
}

/// Everything written for one (graph, era, region).
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeTemplates {
    /// Graph name.
    pub graph: String,
    /// Era.
    pub era: Era,
    /// Region (channel).
    pub region: String,
    /// Nominal histograms by group, data included.
    pub nominal: BTreeMap<String, Histogram>,
    /// Shape nuisances in catalog order. Only shapes with at least one group.
    pub shapes: Vec<ShapeTemplate>,
}

impl ShapeTemplates {
    /// Collect the templates of `graph` from a filled set.
    ///
    /// A shape is kept for a group only when the systematic applies to it
    /// and both directions were filled by every member of the group.
    pub fn build(
        set: &HistogramSet,
        graph: &str,
        catalog: &SystematicCatalog,
        era: Era,
        region: &str,
    ) -> Result<Self> {
        let nominal = set.nominal(graph).cloned().ok_or_else(|| {
            Error::MissingInput(format!("no nominal histograms for '{graph}' in {region} {era}"))
        })?;

        let mut shapes = Vec::new();
        for sv in catalog.enumerate_shape_variations(era) {
            let Some(syst) = catalog.get(&sv.syst) else { continue };
            let mut up = BTreeMap::new();
            let mut down = BTreeMap::new();
            for group in nominal.keys() {
                if !syst.applies_to(group, era, region) {
                    continue;
                }
                let (u_col, d_col) = (&sv.up_column, &sv.down_column);
                if !set.is_complete(group, u_col) || !set.is_complete(group, d_col) {
                    tracing::debug!(group, syst = %sv.syst, "shape incomplete, dropped for group");
                    continue;
                }
                if let (Some(u), Some(d)) = (set.get(graph, u_col, group), set.get(graph, d_col, group)) {
                    up.insert(group.clone(), u.clone());
                    down.insert(group.clone(), d.clone());
                }
            }
            if up.is_empty() {
                continue;
            }
            let rendered = catalog.render_name(syst, era);
            shapes.push(ShapeTemplate {
                syst: sv.syst,
                raw_name: rendered.raw,
                smoothed_name: rendered.smoothed,
                smoothed: false,
                up,
                down,
            });
        }
        Ok(Self { graph: graph.to_string(), era, region: region.to_string(), nominal, shapes })
    }

    /// Names of the shapes present for `group`.
    pub fn shapes_of<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.shapes.iter().filter(move |s| s.up.contains_key(group)).map(ShapeTemplate::name)
    }

    /// Shape by output name.
    pub fn shape(&self, name: &str) -> Option<&ShapeTemplate> {
        self.shapes.iter().find(|s| s.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use ttt_syst::Systematic;

    fn h(values: &[f64]) -> Histogram {
        let axis = Axis::regular(values.len(), 0.0, values.len() as f64).unwrap();
        Histogram::from_contents(vec![axis], values.to_vec(), values.to_vec()).unwrap()
    }

    fn put(set: &mut HistogramSet, var: &str, group: &str, values: &[f64]) {
        *set.entry("HT", var, group, || Ok(h(values))).unwrap() = h(values);
    }

    fn catalog() -> SystematicCatalog {
        SystematicCatalog::from_systematics([
            Systematic::shape("PileupSF").columns("PU_up", "PU_down").correlated().add_all_years(
                ttt_syst::Magnitude::Symmetric(1.0),
                &["ttz", "ttw"],
            ),
            Systematic::shape("Jet_JER").smooth().add_all_years(
                ttt_syst::Magnitude::Symmetric(1.0),
                &["ttz"],
            ),
            Systematic::lnn("lumi").add_all_years(ttt_syst::Magnitude::Symmetric(1.025), &[] as &[&str]),
        ])
        .unwrap()
    }

    #[test]
    fn keeps_complete_applicable_pairs() {
        let mut set = HistogramSet::new();
        for g in ["ttz", "ttw", "data"] {
            put(&mut set, "Nominal", g, &[1.0, 2.0]);
        }
        put(&mut set, "PU_up", "ttz", &[1.1, 2.1]);
        put(&mut set, "PU_down", "ttz", &[0.9, 1.9]);
        put(&mut set, "PU_up", "ttw", &[1.1, 2.1]);
        put(&mut set, "PU_down", "ttw", &[0.9, 1.9]);
        set.mark_incomplete("ttw", "PU_down");
        put(&mut set, "Jet_JER_up", "ttz", &[1.0, 2.0]);

        let t = ShapeTemplates::build(&set, "HT", &catalog(), Era::Y2018, "Dilepton").unwrap();
        assert_eq!(t.nominal.len(), 3);
        assert_eq!(t.shapes.len(), 1);
        assert_eq!(t.shapes[0].name(), "PileupSF");
        assert_eq!(t.shapes[0].groups().collect::<Vec<_>>(), vec!["ttz"]);
        assert_eq!(t.shapes_of("ttz").collect::<Vec<_>>(), vec!["PileupSF"]);
        assert_eq!(t.shapes_of("ttw").count(), 0);
    }

    #[test]
    fn missing_nominal_is_missing_input() {
        let set = HistogramSet::new();
        let err = ShapeTemplates::build(&set, "HT", &catalog(), Era::Y2016Pre, "Multi").unwrap_err();
        assert_eq!(err.kind(), ttt_core::ErrorKind::MissingInput);
    }

    #[test]
    fn smoothed_names_are_era_suffixed() {
        let mut set = HistogramSet::new();
        put(&mut set, "Nominal", "ttz", &[1.0, 2.0, 3.0]);
        put(&mut set, "Jet_JER_up", "ttz", &[1.1, 2.1, 3.1]);
        put(&mut set, "Jet_JER_down", "ttz", &[0.9, 1.9, 2.9]);
        let mut t = ShapeTemplates::build(&set, "HT", &catalog(), Era::Y2017, "Dilepton").unwrap();
        assert_eq!(t.shapes[0].name(), "Jet_JER_2017");
        t.shapes[0].smoothed = true;
        assert_eq!(t.shapes[0].name(), "Jet_JER_2017_lowess");
        assert!(t.shape("Jet_JER_2017_lowess").is_some());
    }
}
