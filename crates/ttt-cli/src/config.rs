//! Run configuration.
//!
//! One YAML (or JSON) document threaded through the driver. Relative paths
//! inside it resolve against the directory of the configuration file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use ttt_core::{Era, Error, Result};
use ttt_datacard::Fitter;
use ttt_frame::FrameOptions;
use ttt_hist::{GraphConfig, GraphSpec, NegativeBinPolicy, ScaleChain, ScaleOptions, ShapeSmoother};
use ttt_syst::{GroupKind, ProcessGroup, ProcessGroups, SystematicCatalog, TreeLayout, default_catalog};

/// Placeholder replaced by the era label in ntuple paths.
pub const YEAR_PLACEHOLDER: &str = "{year}";

/// Cross section of one member in pb, optionally with a k-factor.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CrossSection {
    /// Bare value.
    Plain(f64),
    /// Value and k-factor.
    Scaled {
        /// Cross section.
        xsec: f64,
        /// Higher-order correction.
        #[serde(default = "one")]
        kfactor: f64,
    },
}

fn one() -> f64 {
    1.0
}

impl CrossSection {
    /// σ · k.
    pub fn value(self) -> f64 {
        match self {
            CrossSection::Plain(x) => x,
            CrossSection::Scaled { xsec, kfactor } => xsec * kfactor,
        }
    }
}

/// One ntuple production.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NtupleConfig {
    /// Directory per era, e.g. `ntuples/{year}`. Holds batch directories, or
    /// is itself the only batch.
    pub path: String,
    /// Trees and data-driven overrides.
    pub layout: TreeLayout,
    /// Event preselection applied in every region.
    #[serde(default)]
    pub cut: Option<String>,
    /// Collections presented as the union of stored ones.
    #[serde(default)]
    pub merges: BTreeMap<String, Vec<String>>,
}

/// One analysis region (card channel).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    /// Channel name.
    pub name: String,
    /// Region selection, applied after the ntuple cut.
    #[serde(default)]
    pub mask: Option<String>,
    /// Trees to read; every layout tree when empty.
    #[serde(default)]
    pub trees: Vec<String>,
    /// Groups that do not enter this region.
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Reweighting chain.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScalesConfig {
    /// Directory of the JSON scale tables.
    pub dir: Option<PathBuf>,
    /// Applier names in execution order.
    pub appliers: Vec<String>,
    /// Collections and members the appliers look at.
    pub options: ScaleOptions,
}

/// The whole run configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Luminosity overrides in fb^-1.
    #[serde(default)]
    pub lumi: BTreeMap<Era, f64>,
    /// Cross sections by member.
    #[serde(default)]
    pub xsecs: BTreeMap<String, CrossSection>,
    /// Process groups in card order.
    pub groups: Vec<ProcessGroup>,
    /// Systematic catalog file; the built-in catalog when absent.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    /// Restrict the catalog to these nuisances.
    #[serde(default)]
    pub systematics: Option<Vec<String>>,
    /// Ntuple productions by name.
    pub ntuples: BTreeMap<String, NtupleConfig>,
    /// Regions.
    pub regions: Vec<RegionConfig>,
    /// Histogram recipes; the signal discriminant when empty.
    #[serde(default)]
    pub graphs: Vec<GraphConfig>,
    /// Graph whose cards feed the run-wide card; the first graph when absent.
    #[serde(default)]
    pub fit_graph: Option<String>,
    /// Reweighting chain.
    #[serde(default)]
    pub scales: ScalesConfig,
    /// LOWESS parameters.
    #[serde(default)]
    pub smoothing: ShapeSmoother,
    /// Negative-bin fixup.
    #[serde(default)]
    pub negative_bins: NegativeBinPolicy,
    /// Fraction of the generator sum below which a variation's own sum of
    /// weights is ignored.
    #[serde(default = "default_sumweight_floor")]
    pub sumweight_floor: f64,
    /// Variation prefixes that shift jet momenta.
    #[serde(default = "default_jec_prefixes")]
    pub jec_prefixes: Vec<String>,
    /// Groups with a free normalisation.
    #[serde(default)]
    pub rate_params: Vec<String>,
    /// Bin-statistics threshold of the `autoMCStats` line.
    #[serde(default)]
    pub auto_mc_threshold: u32,
    /// Fitter command.
    #[serde(default)]
    pub fitter: Fitter,
    /// Also run the fitter on every (region, year) card.
    #[serde(default)]
    pub fit_each_card: bool,

    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_sumweight_floor() -> f64 {
    FrameOptions::default().sumweight_floor
}

fn default_jec_prefixes() -> Vec<String> {
    FrameOptions::default().jec_prefixes
}

/// Load a run configuration. `.json` files are read as JSON, anything else
/// as YAML.
pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Configuration(format!("cannot read {}: {e}", path.display())))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let cfg: RunConfig = if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?
    } else {
        serde_yaml_ng::from_slice(&bytes)?
    };
    let cfg = cfg.with_base_dir(path.parent().map(Path::to_path_buf).unwrap_or_default());
    tracing::debug!(path = %path.display(), regions = cfg.regions.len(), "loaded run config");
    Ok(cfg)
}

impl RunConfig {
    /// Set the directory relative paths resolve against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() { p.to_path_buf() } else { self.base_dir.join(p) }
    }

    /// Luminosity of an era in fb^-1.
    pub fn lumi(&self, era: Era) -> f64 {
        self.lumi.get(&era).copied().unwrap_or_else(|| era.default_lumi())
    }

    /// `σ · k · L · 1000` for a simulated member.
    pub fn xsec_scale(&self, member: &str, era: Era) -> Result<f64> {
        let xs = self
            .xsecs
            .get(member)
            .ok_or_else(|| Error::Configuration(format!("no cross section for member '{member}'")))?;
        Ok(xs.value() * self.lumi(era) * 1000.0)
    }

    /// Ntuple by name. `None` picks the only one configured.
    pub fn ntuple_name<'a>(&'a self, name: Option<&'a str>) -> Result<&'a str> {
        match name {
            Some(n) if self.ntuples.contains_key(n) => Ok(n),
            Some(n) => Err(Error::Configuration(format!("unknown ntuple '{n}'"))),
            None if self.ntuples.len() == 1 => {
                Ok(self.ntuples.keys().next().map(String::as_str).unwrap_or_default())
            }
            None => Err(Error::Configuration(format!(
                "several ntuples configured ({}), pick one with --ntuple",
                self.ntuples.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Ntuple descriptor.
    pub fn ntuple(&self, name: &str) -> Result<&NtupleConfig> {
        self.ntuples.get(name).ok_or_else(|| Error::Configuration(format!("unknown ntuple '{name}'")))
    }

    /// Era directory of an ntuple.
    pub fn ntuple_dir(&self, ntuple: &NtupleConfig, era: Era) -> PathBuf {
        self.resolve(Path::new(&ntuple.path.replace(YEAR_PLACEHOLDER, era.as_str())))
    }

    /// Trees a region reads.
    pub fn region_trees<'a>(&'a self, ntuple: &'a NtupleConfig, region: &'a RegionConfig) -> &'a [String] {
        if region.trees.is_empty() { &ntuple.layout.trees } else { &region.trees }
    }

    /// Validated process groups.
    pub fn process_groups(&self) -> Result<ProcessGroups> {
        ProcessGroups::new(self.groups.clone())
    }

    /// The catalog file, or the built-in catalog, restricted to `systematics`.
    pub fn catalog(&self) -> Result<SystematicCatalog> {
        let catalog = match &self.catalog {
            Some(p) => SystematicCatalog::load(&self.resolve(p))?,
            None => default_catalog()?,
        };
        match &self.systematics {
            Some(names) => catalog.select(names),
            None => Ok(catalog),
        }
    }

    /// Built graphs with unique names.
    pub fn graph_specs(&self) -> Result<Vec<GraphSpec>> {
        if self.graphs.is_empty() {
            return Ok(vec![GraphSpec::signal("signal")?]);
        }
        let mut seen = BTreeSet::new();
        self.graphs
            .iter()
            .map(|g| {
                if !seen.insert(g.name.as_str()) {
                    return Err(Error::Configuration(format!("graph '{}' defined twice", g.name)));
                }
                g.build()
            })
            .collect()
    }

    /// Scale appliers, tables loaded from the scale directory.
    pub fn scale_chain(&self) -> Result<ScaleChain> {
        if self.scales.appliers.is_empty() {
            return Ok(ScaleChain::new());
        }
        let dir = self
            .scales
            .dir
            .as_deref()
            .ok_or_else(|| Error::Configuration("scale appliers configured without scales.dir".into()))?;
        ScaleChain::from_names(&self.scales.appliers, &self.resolve(dir), &self.scales.options)
    }

    /// Frame knobs.
    pub fn frame_options(&self) -> FrameOptions {
        FrameOptions { jec_prefixes: self.jec_prefixes.clone(), sumweight_floor: self.sumweight_floor }
    }

    /// Startup checks for a run on `ntuple`. Every failure is a
    /// configuration error.
    pub fn validate(&self, ntuple: &str) -> Result<()> {
        let groups = self.process_groups()?;
        let nt = self.ntuple(ntuple)?;
        nt.layout.validate(&groups)?;
        if nt.layout.trees.is_empty() {
            return Err(Error::Configuration(format!("ntuple '{ntuple}' lists no trees")));
        }
        if self.regions.is_empty() {
            return Err(Error::Configuration("no regions configured".into()));
        }
        if !(0.0..1.0).contains(&self.sumweight_floor) {
            return Err(Error::Configuration(format!(
                "sumweight_floor must be in [0, 1), got {}",
                self.sumweight_floor
            )));
        }
        let mut names = BTreeSet::new();
        for region in &self.regions {
            if !names.insert(region.name.as_str()) {
                return Err(Error::Configuration(format!("region '{}' defined twice", region.name)));
            }
            if let Some(t) = region.trees.iter().find(|t| !nt.layout.trees.contains(t)) {
                return Err(Error::Configuration(format!(
                    "region '{}' reads tree '{t}' that ntuple '{ntuple}' does not list",
                    region.name
                )));
            }
            if let Some(g) = region.remove.iter().find(|g| !groups.contains(g)) {
                return Err(Error::Configuration(format!("region '{}' removes unknown group '{g}'", region.name)));
            }
            let region_groups = groups.without(&region.remove);
            for tree in self.region_trees(nt, region) {
                for a in nt.layout.assignments(&region_groups, tree)? {
                    if a.kind == GroupKind::Simulation && !self.xsecs.contains_key(&a.member) {
                        return Err(Error::Configuration(format!(
                            "no cross section for member '{}' of group '{}'",
                            a.member, a.group
                        )));
                    }
                }
            }
        }
        if let Some(g) = self.rate_params.iter().find(|g| !groups.contains(g)) {
            return Err(Error::Configuration(format!("rate parameter for unknown group '{g}'")));
        }
        if let Some(fit) = &self.fit_graph
            && !self.graph_specs()?.iter().any(|g| &g.name == fit)
        {
            return Err(Error::Configuration(format!("fit_graph '{fit}' is not a configured graph")));
        }
        Ok(())
    }

    /// Name of the graph feeding the run-wide card.
    pub fn fit_graph_name(&self, graphs: &[GraphSpec]) -> Option<String> {
        self.fit_graph.clone().or_else(|| graphs.first().map(|g| g.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ttt_core::ErrorKind;

    const YAML: &str = r#"
lumi: {2018: 60.0}
xsecs:
  ttz_m10: 0.28
  ttw_lnu: {xsec: 0.2, kfactor: 1.5}
groups:
  - {name: ttz, members: [ttz_m10], signal: true}
  - {name: ttw, members: [ttw_lnu]}
  - {name: nonprompt, kind: data_driven}
  - {name: data, members: [data], kind: data}
ntuples:
  v1:
    path: "ntuples/{year}"
    cut: "passZVeto == 1"
    merges: {TightLepton: [TightMuon, TightElectron]}
    layout:
      trees: [Signal_Dilepton, Nonprompt_FakeRate]
      changes: {Nonprompt_FakeRate: {nonprompt: data}}
regions:
  - {name: Dilepton, mask: "TightLepton.n == 2"}
  - {name: Multi, mask: "TightLepton.n > 2", trees: [Signal_Dilepton], remove: [nonprompt]}
systematics: [LUMI_RUN2, Jet_JER]
rate_params: [ttz]
fitter: ["sh", "-c", "true"]
"#;

    fn config() -> RunConfig {
        serde_yaml_ng::from_str::<RunConfig>(YAML).unwrap().with_base_dir("/data/run")
    }

    #[test]
    fn parses_and_validates() {
        let cfg = config();
        cfg.validate("v1").unwrap();
        assert_eq!(cfg.ntuple_name(None).unwrap(), "v1");
        assert_eq!(cfg.ntuple_name(Some("v2")).unwrap_err().kind(), ErrorKind::Configuration);
        let nt = cfg.ntuple("v1").unwrap();
        assert_eq!(cfg.ntuple_dir(nt, Era::Y2016Post), PathBuf::from("/data/run/ntuples/2016post"));
        assert_eq!(cfg.region_trees(nt, &cfg.regions[0]).len(), 2);
        assert_eq!(cfg.region_trees(nt, &cfg.regions[1]), ["Signal_Dilepton".to_string()]);
        assert_eq!(cfg.catalog().unwrap().len(), 2);
        assert_eq!(cfg.graph_specs().unwrap()[0].name, "signal");
        assert!(cfg.scale_chain().unwrap().is_empty());
        assert_eq!(cfg.frame_options(), FrameOptions::default());
    }

    #[test]
    fn normalisation_uses_lumi_and_kfactor() {
        let cfg = config();
        assert_relative_eq!(cfg.xsec_scale("ttw_lnu", Era::Y2018).unwrap(), 0.3 * 60.0 * 1000.0);
        assert_relative_eq!(cfg.xsec_scale("ttz_m10", Era::Y2017).unwrap(), 0.28 * 41.48 * 1000.0);
        assert_eq!(cfg.xsec_scale("nope", Era::Y2017).unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn startup_errors_are_configuration_errors() {
        let mut cfg = config();
        cfg.xsecs.remove("ttw_lnu");
        assert_eq!(cfg.validate("v1").unwrap_err().kind(), ErrorKind::Configuration);

        let mut cfg = config();
        cfg.regions[1].trees = vec!["Signal_Multi".into()];
        assert_eq!(cfg.validate("v1").unwrap_err().kind(), ErrorKind::Configuration);

        let mut cfg = config();
        cfg.regions.push(cfg.regions[0].clone());
        assert_eq!(cfg.validate("v1").unwrap_err().kind(), ErrorKind::Configuration);

        let mut cfg = config();
        cfg.rate_params.push("ttbar".into());
        assert_eq!(cfg.validate("v1").unwrap_err().kind(), ErrorKind::Configuration);

        let mut cfg = config();
        cfg.fit_graph = Some("HT".into());
        assert_eq!(cfg.validate("v1").unwrap_err().kind(), ErrorKind::Configuration);

        let mut cfg = config();
        cfg.scales.appliers = vec!["wz".into()];
        assert_eq!(cfg.scale_chain().unwrap_err().kind(), ErrorKind::Configuration);

        assert!(serde_yaml_ng::from_str::<RunConfig>("groups: []\nntuples: {}\nregions: []\nbogus: 1\n").is_err());
    }

    #[test]
    fn json_configs_are_accepted() {
        let dir = std::env::temp_dir().join(format!("ttt_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.json");
        std::fs::write(
            &path,
            r#"{"groups": [{"name": "ttz", "members": ["ttz_m10"]}],
                "xsecs": {"ttz_m10": 0.28},
                "ntuples": {"v1": {"path": "nt/{year}", "layout": {"trees": ["Signal_Dilepton"]}}},
                "regions": [{"name": "Dilepton"}]}"#,
        )
        .unwrap();
        let cfg = read_run_config(&path).unwrap();
        cfg.validate("v1").unwrap();
        let nt = cfg.ntuple("v1").unwrap();
        assert_eq!(cfg.ntuple_dir(nt, Era::Y2017), dir.join("nt/2017"));
        assert_eq!(cfg.fitter, Fitter::default());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
