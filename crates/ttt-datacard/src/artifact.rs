//! The shape artifact: nominal templates at the top level, shape variations
//! in `<name>Up` / `<name>Down` directories, plus `data_obs`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use ttt_core::{Direction, Error, Result};
use ttt_hist::{Axis, Histogram, ShapeTemplates};
use ttt_syst::{DATA_OBS, GroupKind, ProcessGroups};

/// Format tag written into every artifact.
pub const ARTIFACT_FORMAT: &str = "ttt_shapes_v1";

/// One stored histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistData {
    /// Bin edges (first axis).
    pub edges: Vec<f64>,
    /// Bin edges of the second axis of 2-D templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_edges: Option<Vec<f64>>,
    /// Bin contents.
    pub values: Vec<f64>,
    /// Bin variances.
    pub variances: Vec<f64>,
}

impl HistData {
    /// Snapshot of a histogram.
    pub fn from_histogram(h: &Histogram) -> Self {
        let axes = h.axes();
        Self {
            edges: axes[0].edges(),
            y_edges: axes.get(1).map(Axis::edges),
            values: h.values().to_vec(),
            variances: h.variances().to_vec(),
        }
    }

    /// Rebuild a histogram (variable-width axes).
    pub fn to_histogram(&self) -> Result<Histogram> {
        let mut axes = vec![Axis::variable(self.edges.clone())?];
        if let Some(y) = &self.y_edges {
            axes.push(Axis::variable(y.clone())?);
        }
        Histogram::from_contents(axes, self.values.clone(), self.variances.clone())
    }

    /// Sum of bin contents.
    pub fn integral(&self) -> f64 {
        self.values.iter().sum()
    }

    fn check(&self, path: &str) -> Result<()> {
        let bins = (self.edges.len().saturating_sub(1))
            * self.y_edges.as_ref().map_or(1, |y| y.len().saturating_sub(1));
        if self.values.len() != bins || self.variances.len() != bins {
            return Err(Error::ShapeArtifact(format!(
                "{path}: {bins} bins but {} values and {} variances",
                self.values.len(),
                self.variances.len()
            )));
        }
        let bad = |v: &f64| !v.is_finite() || *v < 0.0;
        if let Some((i, v)) = self.values.iter().enumerate().find(|(_, v)| bad(v)) {
            return Err(Error::ShapeArtifact(format!("{path}: bin {i} has value {v}")));
        }
        if let Some((i, v)) = self.variances.iter().enumerate().find(|(_, v)| bad(v)) {
            return Err(Error::ShapeArtifact(format!("{path}: bin {i} has variance {v}")));
        }
        Ok(())
    }
}

/// Contents of one artifact file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeArtifact {
    /// Always [`ARTIFACT_FORMAT`].
    pub format: String,
    /// Nominal templates by fitter process name, and `data_obs`.
    pub histograms: BTreeMap<String, HistData>,
    /// `<shape>Up` / `<shape>Down` → process → template.
    pub directories: BTreeMap<String, BTreeMap<String, HistData>>,
}

impl Default for ShapeArtifact {
    fn default() -> Self {
        Self {
            format: ARTIFACT_FORMAT.to_string(),
            histograms: BTreeMap::new(),
            directories: BTreeMap::new(),
        }
    }
}

impl ShapeArtifact {
    /// Empty artifact.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes with a nominal template (`data_obs` excluded).
    pub fn processes(&self) -> impl Iterator<Item = &str> {
        self.histograms.keys().map(String::as_str).filter(|p| *p != DATA_OBS)
    }

    /// Directory name of one direction of a shape.
    pub fn directory_name(shape: &str, dir: Direction) -> String {
        format!("{shape}{}", dir.fitter_suffix())
    }

    /// Whether both directions of `shape` exist for `process`.
    pub fn has_shape(&self, shape: &str, process: &str) -> bool {
        Direction::BOTH.iter().all(|d| {
            self.directories
                .get(&Self::directory_name(shape, *d))
                .is_some_and(|m| m.contains_key(process))
        })
    }

    /// Whether any directory of `shape` exists.
    pub fn has_directory(&self, shape: &str) -> bool {
        Direction::BOTH.iter().any(|d| self.directories.contains_key(&Self::directory_name(shape, *d)))
    }

    /// Check the format tag, that `data_obs` exists, that every shape has
    /// both directions, and that every content is finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        if self.format != ARTIFACT_FORMAT {
            return Err(Error::ShapeArtifact(format!("unknown artifact format '{}'", self.format)));
        }
        if !self.histograms.contains_key(DATA_OBS) {
            return Err(Error::ShapeArtifact(format!("artifact has no '{DATA_OBS}'")));
        }
        for (name, h) in &self.histograms {
            h.check(name)?;
        }
        for (dir, procs) in &self.directories {
            let (shape, other) = if let Some(s) = dir.strip_suffix(Direction::Up.fitter_suffix()) {
                (s, Direction::Down)
            } else if let Some(s) = dir.strip_suffix(Direction::Down.fitter_suffix()) {
                (s, Direction::Up)
            } else {
                return Err(Error::ShapeArtifact(format!("directory '{dir}' is neither Up nor Down")));
            };
            let pair = self.directories.get(&Self::directory_name(shape, other));
            for (proc, h) in procs {
                if !pair.is_some_and(|p| p.contains_key(proc)) {
                    return Err(Error::ShapeArtifact(format!(
                        "'{dir}/{proc}' has no {} partner",
                        other.fitter_suffix()
                    )));
                }
                h.check(&format!("{dir}/{proc}"))?;
            }
        }
        Ok(())
    }

    /// Read and validate an artifact file.
    pub fn read(path: &Path) -> Result<Self> {
        let artifact: ShapeArtifact = serde_json::from_slice(&std::fs::read(path)?)?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Validate and write.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}

/// Turns per-graph templates into an artifact.
#[derive(Debug, Clone)]
pub struct ShapeWriter<'a> {
    groups: &'a ProcessGroups,
    blinded: bool,
}

impl<'a> ShapeWriter<'a> {
    /// Writer for a set of process groups. A blinded writer synthesises
    /// `data_obs` from the background templates.
    pub fn new(groups: &'a ProcessGroups, blinded: bool) -> Self {
        Self { groups, blinded }
    }

    /// Build the artifact without touching the filesystem.
    pub fn assemble(&self, templates: &ShapeTemplates) -> Result<ShapeArtifact> {
        let mut artifact = ShapeArtifact::new();
        for (group, hist) in &templates.nominal {
            match self.groups.kind_of(group) {
                Some(GroupKind::Data) => continue,
                Some(_) => {}
                None => {
                    tracing::debug!(group, "templates for a group outside the model, skipped");
                    continue;
                }
            }
            artifact
                .histograms
                .insert(self.groups.combine_name(group).to_string(), HistData::from_histogram(hist));
        }
        let data = self.observed(templates)?;
        artifact.histograms.insert(DATA_OBS.to_string(), HistData::from_histogram(&data));

        for shape in &templates.shapes {
            for group in shape.groups() {
                if !matches!(self.groups.kind_of(group), Some(k) if k != GroupKind::Data) {
                    continue;
                }
                let process = self.groups.combine_name(group);
                for dir in Direction::BOTH {
                    let Some(h) = shape.get(group, dir) else { continue };
                    artifact
                        .directories
                        .entry(ShapeArtifact::directory_name(shape.name(), dir))
                        .or_default()
                        .insert(process.to_string(), HistData::from_histogram(h));
                }
            }
        }
        Ok(artifact)
    }

    fn observed(&self, templates: &ShapeTemplates) -> Result<Histogram> {
        let binning = templates.nominal.values().next().ok_or_else(|| {
            Error::MissingInput(format!(
                "no templates for '{}' in {} {}",
                templates.graph, templates.region, templates.era
            ))
        })?;
        if !self.blinded {
            let data = self
                .groups
                .data_group()
                .ok_or_else(|| Error::Configuration("unblinded run without a data group".into()))?;
            return match templates.nominal.get(&data.name) {
                Some(h) => Ok(h.clone()),
                None => Histogram::new(binning.axes().to_vec()),
            };
        }
        let mut sum = Histogram::new(binning.axes().to_vec())?;
        for bkg in self.groups.backgrounds() {
            if let Some(h) = templates.nominal.get(bkg) {
                sum.add(h)?;
            }
        }
        let values = sum.values().to_vec();
        sum.with_contents(values.clone(), values)
    }

    /// Assemble, validate and write the artifact to `path`.
    pub fn write(&self, templates: &ShapeTemplates, path: &Path) -> Result<ShapeArtifact> {
        let artifact = self.assemble(templates)?;
        artifact.write(path)?;
        tracing::info!(
            path = %path.display(),
            processes = artifact.processes().count(),
            directories = artifact.directories.len(),
            "wrote shape artifact"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ttt_core::Era;
    use ttt_hist::ShapeTemplate;
    use ttt_syst::ProcessGroup;

    fn h(values: &[f64]) -> Histogram {
        let axis = Axis::variable((0..=values.len()).map(|i| i as f64 * 100.0).collect()).unwrap();
        Histogram::from_contents(vec![axis], values.to_vec(), values.iter().map(|v| v * 0.1).collect())
            .unwrap()
    }

    fn groups() -> ProcessGroups {
        ProcessGroups::new(vec![
            ProcessGroup::simulation("ttt", &["tttj", "tttw"]).signal(),
            ProcessGroup::simulation("ttz", &["ttz"]),
            ProcessGroup::simulation("ttw", &["ttw"]),
            ProcessGroup::simulation("nonprompt", &[] as &[&str]).kind(GroupKind::DataDriven),
            ProcessGroup::simulation("data", &["data"]).kind(GroupKind::Data),
        ])
        .unwrap()
    }

    fn templates() -> ShapeTemplates {
        let nominal = BTreeMap::from([
            ("ttt".to_string(), h(&[0.1, 0.2, 0.3])),
            ("ttz".to_string(), h(&[3.0, 2.0, 0.5])),
            ("ttw".to_string(), h(&[1.5, 0.5, 0.25])),
            ("nonprompt".to_string(), h(&[0.5, 0.5, 0.25])),
            ("data".to_string(), h(&[7.0, 2.0, 1.0])),
        ]);
        let shape = ShapeTemplate {
            syst: "Jet_JER".into(),
            raw_name: "Jet_JER_2018".into(),
            smoothed_name: None,
            smoothed: false,
            up: BTreeMap::from([("ttz".to_string(), h(&[3.3, 2.2, 0.55]))]),
            down: BTreeMap::from([("ttz".to_string(), h(&[2.7, 1.8, 0.45]))]),
        };
        ShapeTemplates {
            graph: "Signal".into(),
            era: Era::Y2018,
            region: "Dilepton".into(),
            nominal,
            shapes: vec![shape],
        }
    }

    #[test]
    fn blinded_data_is_background_sum() {
        let g = groups();
        let a = ShapeWriter::new(&g, true).assemble(&templates()).unwrap();
        let data = &a.histograms[DATA_OBS];
        assert_eq!(data.values, vec![5.0, 3.0, 1.0]);
        assert_eq!(data.variances, data.values);
        assert!(!a.histograms.contains_key("data"));
        assert_eq!(a.processes().collect::<Vec<_>>(), vec!["nonprompt", "ttt", "ttw", "ttz"]);
        assert!(a.has_shape("Jet_JER_2018", "ttz"));
        assert!(!a.has_shape("Jet_JER_2018", "ttw"));
        a.validate().unwrap();
    }

    #[test]
    fn unblinded_data_is_real_data() {
        let g = groups();
        let a = ShapeWriter::new(&g, false).assemble(&templates()).unwrap();
        assert_eq!(a.histograms[DATA_OBS].values, vec![7.0, 2.0, 1.0]);
    }

    #[test]
    fn negative_content_is_rejected() {
        let g = groups();
        let mut t = templates();
        t.nominal.insert("ttw".into(), h(&[1.0, -0.5, 0.0]));
        let a = ShapeWriter::new(&g, false).assemble(&t).unwrap();
        let err = a.validate().unwrap_err();
        assert_eq!(err.kind(), ttt_core::ErrorKind::ShapeArtifact);

        let mut t = templates();
        t.nominal.insert("ttz".into(), h(&[f64::NAN, 1.0, 1.0]));
        assert!(ShapeWriter::new(&g, true).assemble(&t).unwrap().validate().is_err());
    }

    #[test]
    fn unpaired_directory_is_rejected() {
        let g = groups();
        let mut a = ShapeWriter::new(&g, true).assemble(&templates()).unwrap();
        a.directories.remove("Jet_JER_2018Down");
        assert!(a.validate().is_err());
    }
}
