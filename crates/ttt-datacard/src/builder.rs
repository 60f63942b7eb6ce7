//! Model card for one (graph, era, region) artifact.

use ttt_core::{Era, Result};
use ttt_syst::{
    DUMMY_MAGNITUDE, DUMMY_NAME, GroupKind, Magnitude, ProcessGroups, SystKind, SystematicCatalog,
};

use crate::artifact::ShapeArtifact;
use crate::card::{DataCard, NuisanceRow, ProcessColumn, RateParam, ShapesLine};

/// Name of the group declaration listing every nuisance.
pub const SYST_GROUP: &str = "syst_error";

/// Builds cards consistent with a shape artifact.
#[derive(Debug, Clone)]
pub struct CardBuilder<'a> {
    catalog: &'a SystematicCatalog,
    groups: &'a ProcessGroups,
    rate_params: Vec<String>,
    systematics: bool,
    auto_mc_threshold: u32,
}

impl<'a> CardBuilder<'a> {
    /// Builder with systematics enabled and no floating normalisations.
    pub fn new(catalog: &'a SystematicCatalog, groups: &'a ProcessGroups) -> Self {
        Self { catalog, groups, rate_params: Vec::new(), systematics: true, auto_mc_threshold: 0 }
    }

    /// Groups given a free `rate_<g>` normalisation.
    pub fn with_rate_params<S: AsRef<str>>(mut self, groups: &[S]) -> Self {
        self.rate_params = groups.iter().map(|g| g.as_ref().to_string()).collect();
        self
    }

    /// Replace every nuisance with a single placeholder lnN.
    pub fn without_systematics(mut self) -> Self {
        self.systematics = false;
        self
    }

    /// Event threshold of the per-bin statistical nuisances.
    pub fn with_auto_mc_threshold(mut self, threshold: u32) -> Self {
        self.auto_mc_threshold = threshold;
        self
    }

    /// Process columns: groups with a nominal template, signals first.
    fn columns(&self, region: &str, artifact: &ShapeArtifact) -> Vec<(String, ProcessColumn)> {
        let present = |g: &str| artifact.histograms.contains_key(self.groups.combine_name(g));
        let mut out = Vec::new();
        for (i, g) in self.groups.signals().into_iter().filter(|g| present(g)).enumerate() {
            out.push((g.to_string(), column(region, self.groups.combine_name(g), -(i as i32))));
        }
        for (i, g) in self.groups.backgrounds().into_iter().filter(|g| present(g)).enumerate() {
            out.push((g.to_string(), column(region, self.groups.combine_name(g), i as i32 + 1)));
        }
        out
    }

    /// Card for `artifact`, stored next to the card as `artifact_file`.
    ///
    /// Shape rows are limited to shapes with both directions present in the
    /// artifact for the process; rows that end up empty are dropped.
    pub fn build(&self, era: Era, region: &str, artifact_file: &str, artifact: &ShapeArtifact) -> Result<DataCard> {
        let columns = self.columns(region, artifact);
        let mut card = DataCard {
            shapes: vec![ShapesLine::wildcard(artifact_file)],
            observations: vec![(region.to_string(), -1.0)],
            processes: columns.iter().map(|(_, c)| c.clone()).collect(),
            ..DataCard::default()
        };

        if self.systematics {
            for syst in self.catalog.iter().filter(|s| s.active_in(era, region)) {
                let rendered = self.catalog.render_name(syst, era);
                let row = match syst.kind() {
                    SystKind::LnN => {
                        let names: Vec<&str> = columns.iter().map(|(g, _)| g.as_str()).collect();
                        NuisanceRow {
                            name: rendered.raw.clone(),
                            kind: syst.kind().as_str().to_string(),
                            cells: self.catalog.lnn_row(syst, &names, era),
                        }
                    }
                    SystKind::Shape => {
                        let name = rendered
                            .smoothed
                            .as_deref()
                            .filter(|s| artifact.has_directory(s))
                            .unwrap_or(&rendered.raw)
                            .to_string();
                        let cells = columns
                            .iter()
                            .map(|(g, c)| {
                                let on = syst.applies_to(g, era, region) && artifact.has_shape(&name, &c.process);
                                (if on { "1" } else { "-" }).to_string()
                            })
                            .collect();
                        NuisanceRow { name, kind: syst.kind().as_str().to_string(), cells }
                    }
                };
                if row.cells.iter().all(|c| c == "-") {
                    continue;
                }
                card.nuisances.push(row);
            }
        } else if let Some(target) = self.dummy_target(&columns) {
            let cells = columns
                .iter()
                .map(|(g, _)| {
                    if *g == target { Magnitude::Symmetric(DUMMY_MAGNITUDE).render() } else { "-".to_string() }
                })
                .collect();
            card.nuisances.push(NuisanceRow { name: DUMMY_NAME.into(), kind: SystKind::LnN.as_str().into(), cells });
        }

        if !card.nuisances.is_empty() {
            card.groups.push((SYST_GROUP.to_string(), card.nuisances.iter().map(|n| n.name.clone()).collect()));
        }
        for g in &self.rate_params {
            let Some((_, col)) = columns.iter().find(|(name, _)| name == g) else {
                tracing::debug!(group = %g, region, %era, "rateParam group has no template, skipped");
                continue;
            };
            card.rate_params.push(RateParam {
                name: format!("rate_{}", col.process),
                bin: "*".into(),
                process: col.process.clone(),
                value: 1.0,
            });
        }
        card.auto_mc_stats.push(("*".into(), self.auto_mc_threshold));
        card.validate()?;
        Ok(card)
    }

    /// Group carrying the placeholder nuisance: `rare` when present, else the
    /// first background, else the first process.
    fn dummy_target(&self, columns: &[(String, ProcessColumn)]) -> Option<String> {
        let is_bkg = |g: &str| {
            !self.groups.is_signal(g) && self.groups.kind_of(g).is_some_and(|k| k != GroupKind::Data)
        };
        columns
            .iter()
            .find(|(g, _)| g == "rare")
            .or_else(|| columns.iter().find(|(g, _)| is_bkg(g)))
            .or_else(|| columns.first())
            .map(|(g, _)| g.clone())
    }
}

fn column(region: &str, process: &str, index: i32) -> ProcessColumn {
    ProcessColumn { bin: region.to_string(), process: process.to_string(), index, rate: -1.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::HistData;
    use ttt_syst::{DATA_OBS, ProcessGroup, Systematic};

    fn hd(values: &[f64]) -> HistData {
        HistData {
            edges: (0..=values.len()).map(|i| i as f64).collect(),
            y_edges: None,
            values: values.to_vec(),
            variances: values.to_vec(),
        }
    }

    fn groups() -> ProcessGroups {
        ProcessGroups::new(vec![
            ProcessGroup::simulation("ttt", &["tttj"]).signal(),
            ProcessGroup::simulation("ttz", &["ttz"]),
            ProcessGroup::simulation("ttw", &["ttw"]),
            ProcessGroup::simulation("rare", &["ww"]),
            ProcessGroup::simulation("xg", &["ttg"]),
            ProcessGroup::simulation("data", &["data"]).kind(GroupKind::Data),
        ])
        .unwrap()
    }

    fn catalog() -> SystematicCatalog {
        SystematicCatalog::from_systematics([
            Systematic::lnn("lumi").add_all_years(Magnitude::Symmetric(1.025), &[] as &[&str]),
            Systematic::shape("PU").correlated().add_all_years(Magnitude::Symmetric(1.0), &["ttw", "ttt"]),
            Systematic::shape("Jet_JER").smooth().add_all_years(Magnitude::Symmetric(1.0), &["ttw", "rare"]),
            Systematic::lnn("ChargeMisId").channels(&["Multi"]).add_all_years(Magnitude::Symmetric(1.2), &["ttw"]),
        ])
        .unwrap()
    }

    /// ttt, ttz, ttw, rare present; xg has no template. PU exists for ttw only,
    /// Jet_JER (smoothed) for ttw.
    fn artifact() -> ShapeArtifact {
        let mut a = ShapeArtifact::new();
        for p in ["ttt", "ttz", "ttw", "rare", DATA_OBS] {
            a.histograms.insert(p.into(), hd(&[1.0, 2.0]));
        }
        for d in ["PUUp", "PUDown", "Jet_JER_2018_lowessUp", "Jet_JER_2018_lowessDown"] {
            a.directories.entry(d.into()).or_default().insert("ttw".into(), hd(&[1.0, 2.0]));
        }
        a
    }

    #[test]
    fn process_table_orders_signals_first() {
        let (c, g) = (catalog(), groups());
        let card = CardBuilder::new(&c, &g).build(Era::Y2018, "Dilepton", "a.json", &artifact()).unwrap();
        assert_eq!(card.process_names(), vec!["ttt", "ttz", "ttw", "rare"]);
        let idx: Vec<i32> = card.processes.iter().map(|p| p.index).collect();
        assert_eq!(idx, vec![0, 1, 2, 3]);
        assert!(card.processes.iter().all(|p| p.rate == -1.0 && p.bin == "Dilepton"));
    }

    #[test]
    fn shape_rows_only_reference_present_templates() {
        let (c, g) = (catalog(), groups());
        let a = artifact();
        let card = CardBuilder::new(&c, &g).build(Era::Y2018, "Dilepton", "a.json", &a).unwrap();
        let names: Vec<&str> = card.nuisances.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["lumi_2018", "PU", "Jet_JER_2018_lowess"]);
        assert_eq!(card.nuisance("lumi_2018").unwrap().cells, vec!["1.025"; 4]);
        // PU applies to ttt too, but ttt has no PU templates
        assert_eq!(card.nuisance("PU").unwrap().cells, vec!["-", "-", "1", "-"]);
        assert_eq!(card.nuisance("Jet_JER_2018_lowess").unwrap().cells, vec!["-", "-", "1", "-"]);
        for n in card.nuisances.iter().filter(|n| n.kind == "shape") {
            for (cell, p) in n.cells.iter().zip(&card.processes) {
                if cell == "1" {
                    assert!(a.has_shape(&n.name, &p.process));
                }
            }
        }
        assert_eq!(card.groups[0].0, SYST_GROUP);
        assert_eq!(card.groups[0].1.len(), 3);
    }

    #[test]
    fn channel_restricted_rows() {
        let (c, g) = (catalog(), groups());
        let card = CardBuilder::new(&c, &g).build(Era::Y2017, "Multi", "a.json", &artifact()).unwrap();
        assert_eq!(card.nuisance("ChargeMisId_2017").unwrap().cells, vec!["-", "-", "1.2", "-"]);
    }

    #[test]
    fn rate_param_for_present_groups_only() {
        let (c, g) = (catalog(), groups());
        let card = CardBuilder::new(&c, &g)
            .with_rate_params(&["ttz", "xg"])
            .build(Era::Y2018, "Dilepton", "a.json", &artifact())
            .unwrap();
        assert_eq!(card.rate_params.len(), 1);
        assert!(card.render().contains("\nrate_ttz rateParam * ttz 1.0\n"));
        // no shape row references ttz
        let ttz = card.process_names().iter().position(|p| *p == "ttz").unwrap();
        assert!(card.nuisances.iter().filter(|n| n.kind == "shape").all(|n| n.cells[ttz] == "-"));
    }

    #[test]
    fn no_systs_places_one_dummy_on_rare() {
        let (c, g) = (catalog(), groups());
        let card = CardBuilder::new(&c, &g)
            .without_systematics()
            .build(Era::Y2018, "Dilepton", "a.json", &artifact())
            .unwrap();
        assert_eq!(card.nuisances.len(), 1);
        let d = &card.nuisances[0];
        assert_eq!(d.name, DUMMY_NAME);
        assert_eq!(d.kind, "lnN");
        assert_eq!(d.cells, vec!["-", "-", "-", "1.0001"]);
        assert!(card.render().contains("autoMCStats 0"));

        let mut a = artifact();
        a.histograms.remove("rare");
        let card = CardBuilder::new(&c, &g).without_systematics().build(Era::Y2018, "Dilepton", "a.json", &a).unwrap();
        assert_eq!(card.nuisances[0].cells, vec!["-", "1.0001", "-"]);
    }
}
