//! The systematic catalog: every nuisance of the model, keyed by logical name.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use ttt_core::{Direction, Era, Error, Result};

use crate::systematic::{ALL_GROUPS, Magnitude, SMOOTHED_SUFFIX, SystKind, Systematic};

/// External label of a systematic in one year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedName {
    /// Name the raw templates are filed under.
    pub raw: String,
    /// Name of the smoothed templates, for smoothed shapes.
    pub smoothed: Option<String>,
}

impl RenderedName {
    /// Name written to the artifact and the card.
    pub fn output(&self) -> &str {
        self.smoothed.as_deref().unwrap_or(&self.raw)
    }
}

/// One shape nuisance to fill: its columns and rendered raw name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeVariation {
    /// Logical name in the catalog.
    pub syst: String,
    /// Rendered (unsmoothed) name.
    pub raw_name: String,
    /// Up weight column.
    pub up_column: String,
    /// Down weight column.
    pub down_column: String,
}

impl ShapeVariation {
    /// Column of one direction.
    pub fn column(&self, dir: Direction) -> &str {
        match dir {
            Direction::Up => &self.up_column,
            Direction::Down => &self.down_column,
        }
    }
}

/// Registry of nuisance definitions.
///
/// Built once at startup and shared read-only by every task.
#[derive(Debug, Clone, Default)]
pub struct SystematicCatalog {
    entries: Vec<Systematic>,
    index: HashMap<String, usize>,
}

impl SystematicCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Duplicate logical names are rejected.
    pub fn register(&mut self, syst: Systematic) -> Result<()> {
        if self.index.contains_key(syst.name()) {
            return Err(Error::Configuration(format!(
                "systematic '{}' registered twice",
                syst.name()
            )));
        }
        self.index.insert(syst.name().to_string(), self.entries.len());
        self.entries.push(syst);
        Ok(())
    }

    /// Build from a list of descriptors.
    pub fn from_systematics(systs: impl IntoIterator<Item = Systematic>) -> Result<Self> {
        let mut cat = Self::new();
        for s in systs {
            cat.register(s)?;
        }
        Ok(cat)
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Systematic> {
        self.entries.iter()
    }

    /// Look up by logical name.
    pub fn get(&self, name: &str) -> Option<&Systematic> {
        self.index.get(name).map(|i| &self.entries[*i])
    }

    /// Keep only the named descriptors, in registration order.
    ///
    /// Unknown names are a configuration error.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        for n in names {
            if !self.index.contains_key(n.as_ref()) {
                return Err(Error::Configuration(format!(
                    "unknown systematic '{}'",
                    n.as_ref()
                )));
            }
        }
        Self::from_systematics(
            self.entries
                .iter()
                .filter(|s| names.iter().any(|n| n.as_ref() == s.name()))
                .cloned(),
        )
    }

    /// Systematics entering the card for one (group, year, channel).
    pub fn applicable<'a>(
        &'a self,
        group: &'a str,
        era: Era,
        channel: &'a str,
    ) -> impl Iterator<Item = &'a Systematic> + 'a {
        self.entries.iter().filter(move |s| s.applies_to(group, era, channel))
    }

    /// External label for a year.
    ///
    /// Uncorrelated systematics get the era appended (directly when the base
    /// already ends in `_`). Smoothed shapes also carry `<raw>_lowess`.
    pub fn render_name(&self, syst: &Systematic, era: Era) -> RenderedName {
        let base = syst.base_name();
        let raw = if syst.is_correlated() {
            base.to_string()
        } else if base.ends_with('_') {
            format!("{base}{era}")
        } else {
            format!("{base}_{era}")
        };
        let smoothed = (syst.is_shape() && syst.is_smoothed()).then(|| format!("{raw}{SMOOTHED_SUFFIX}"));
        RenderedName { raw, smoothed }
    }

    /// Card cells of an lnN row, one per group: the factor, `d/u`, or `-`.
    pub fn lnn_row<S: AsRef<str>>(&self, syst: &Systematic, groups: &[S], era: Era) -> Vec<String> {
        groups
            .iter()
            .map(|g| syst.magnitude(g.as_ref(), era).map_or_else(|| "-".to_string(), |m| m.render()))
            .collect()
    }

    /// Every shape nuisance defined in `era`, in registration order.
    pub fn enumerate_shape_variations(&self, era: Era) -> Vec<ShapeVariation> {
        self.entries
            .iter()
            .filter(|s| s.is_shape() && s.groups_in(era).next().is_some())
            .map(|s| ShapeVariation {
                syst: s.name().to_string(),
                raw_name: self.render_name(s, era).raw,
                up_column: s.up_column().to_string(),
                down_column: s.down_column().to_string(),
            })
            .collect()
    }

    /// The shape descriptor owning a weight column, with its direction.
    pub fn find_by_column(&self, column: &str) -> Option<(&Systematic, Direction)> {
        self.entries
            .iter()
            .filter(|s| s.is_shape())
            .find_map(|s| s.direction_of(column).map(|d| (s, d)))
    }

    /// Parse a YAML catalog.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml_ng::from_str(text)?;
        file.build()
    }

    /// Load a YAML (or `.json`) catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let file: CatalogFile = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_slice(&bytes)?
        } else {
            serde_yaml_ng::from_slice(&bytes)?
        };
        tracing::info!(path = %path.display(), n = file.systematics.len(), "loaded systematic catalog");
        file.build()
    }
}

// ── file format ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    /// Named group lists usable as `@name` in `groups`.
    #[serde(default)]
    group_sets: BTreeMap<String, Vec<String>>,
    systematics: Vec<SystematicEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SystematicEntry {
    name: String,
    kind: SystKind,
    #[serde(default)]
    correlated: bool,
    #[serde(default)]
    dname: Option<String>,
    #[serde(default)]
    smooth: bool,
    #[serde(default)]
    up: Option<String>,
    #[serde(default)]
    down: Option<String>,
    #[serde(default)]
    channels: Option<Vec<String>>,
    values: Vec<ValueEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValueEntry {
    #[serde(default = "unit_magnitude")]
    magnitude: Magnitude,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    years: Option<Vec<Era>>,
}

fn unit_magnitude() -> Magnitude {
    Magnitude::Symmetric(1.0)
}

impl CatalogFile {
    fn expand(&self, groups: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for g in groups {
            match g.strip_prefix('@') {
                Some(set) => match self.group_sets.get(set) {
                    Some(members) => out.extend(members.iter().cloned()),
                    None => {
                        return Err(Error::Configuration(format!("unknown group set '@{set}'")));
                    }
                },
                None if g == ALL_GROUPS => return Ok(Vec::new()),
                None => out.push(g.clone()),
            }
        }
        Ok(out)
    }

    fn build(self) -> Result<SystematicCatalog> {
        let mut cat = SystematicCatalog::new();
        for e in &self.systematics {
            if e.values.is_empty() {
                return Err(Error::Configuration(format!("systematic '{}' has no values", e.name)));
            }
            let mut s = Systematic::new(e.name.clone(), e.kind)
                .with_correlated(e.correlated)
                .with_smooth(e.smooth);
            if let Some(d) = &e.dname {
                s = s.dname(d.clone());
            }
            if e.up.is_some() || e.down.is_some() {
                let up = e.up.clone().unwrap_or_else(|| s.up_column().to_string());
                let down = e.down.clone().unwrap_or_else(|| s.down_column().to_string());
                s = s.columns(up, down);
            }
            if let Some(ch) = &e.channels {
                s = s.channels(ch);
            }
            for v in &e.values {
                let groups = self.expand(&v.groups)?;
                let years = v.years.clone().unwrap_or_else(|| Era::ALL.to_vec());
                s = s.add(v.magnitude, &groups, &years);
            }
            cat.register(s)?;
        }
        Ok(cat)
    }
}
