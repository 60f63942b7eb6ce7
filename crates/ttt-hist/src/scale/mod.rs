//! Post-hoc event reweighting.
//!
//! Appliers run in configuration order on every (frame, variation) before
//! any histogram is filled. They only touch simulated frames: data and
//! data-driven weights are never rescaled.

mod btag;
mod theory;
mod wz;

pub use btag::BtagJetLep;
pub use theory::TheoryRescale;
pub use wz::WzScale;

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ttt_core::{Era, Error, ErrorKind, Result};
use ttt_frame::{EventFrame, SourceKind};

/// Coordinates of one reweighting call.
#[derive(Debug, Clone, Copy)]
pub struct ScaleContext<'a> {
    /// Process group.
    pub group: &'a str,
    /// Member being read.
    pub member: &'a str,
    /// Era.
    pub era: Era,
    /// Active variation.
    pub variation: &'a str,
}

/// A reweighter of the active weight column.
///
/// A table that does not cover the context is reported as
/// [`Error::ScaleTableMiss`] before any weight is touched.
pub trait ScaleApplier: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Rescale the selected events of `frame`.
    fn apply(&self, frame: &mut EventFrame, ctx: &ScaleContext<'_>) -> Result<()>;
}

/// Collections and members the appliers look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScaleOptions {
    /// Jet collection counted for the jet-multiplicity bin.
    pub jets: String,
    /// Lepton collection counted for the lepton-multiplicity split.
    pub leptons: String,
    /// Members the WZ correction applies to.
    pub wz_members: Vec<String>,
    /// Variation prefixes renormalised by the theory rescaling.
    pub theory_prefixes: Vec<String>,
}

impl Default for ScaleOptions {
    fn default() -> Self {
        Self {
            jets: "Jets".into(),
            leptons: "TightLepton".into(),
            wz_members: vec!["wzTo3lnu".into()],
            theory_prefixes: vec!["LHE_".into(), "PS_".into()],
        }
    }
}

/// Ordered list of appliers.
#[derive(Default)]
pub struct ScaleChain {
    appliers: Vec<Box<dyn ScaleApplier>>,
}

impl std::fmt::Debug for ScaleChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.appliers.iter().map(|a| a.name())).finish()
    }
}

impl ScaleChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an applier.
    pub fn push(&mut self, applier: Box<dyn ScaleApplier>) {
        self.appliers.push(applier);
    }

    /// Number of appliers.
    pub fn len(&self) -> usize {
        self.appliers.len()
    }

    /// `true` when no applier is configured.
    pub fn is_empty(&self) -> bool {
        self.appliers.is_empty()
    }

    /// Names in order.
    pub fn names(&self) -> Vec<&str> {
        self.appliers.iter().map(|a| a.name()).collect()
    }

    /// Build the chain from applier names, loading tables from `dir`.
    pub fn from_names<S: AsRef<str>>(names: &[S], dir: &Path, options: &ScaleOptions) -> Result<Self> {
        let mut chain = Self::new();
        for n in names {
            let applier: Box<dyn ScaleApplier> = match n.as_ref() {
                BtagJetLep::NAME => Box::new(BtagJetLep::load(dir, options)?),
                WzScale::NAME => Box::new(WzScale::load(dir, options)?),
                TheoryRescale::NAME => Box::new(TheoryRescale::load(dir, options)?),
                other => {
                    return Err(Error::Configuration(format!("unknown scale applier '{other}'")));
                }
            };
            chain.push(applier);
        }
        Ok(chain)
    }

    /// Run every applier in order.
    ///
    /// Table misses are returned (the weights stay as they were for that
    /// applier); any other error aborts.
    pub fn apply(&self, frame: &mut EventFrame, ctx: &ScaleContext<'_>) -> Result<Vec<Error>> {
        let mut misses = Vec::new();
        if !matches!(frame.kind(), SourceKind::Simulation { .. }) {
            return Ok(misses);
        }
        for a in &self.appliers {
            match a.apply(frame, ctx) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::ScaleTableMiss => {
                    tracing::debug!(applier = a.name(), group = ctx.group, error = %e, "scale table miss");
                    misses.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(misses)
    }
}

/// Read a JSON scale table. A missing file is a configuration error.
pub(crate) fn load_table<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<T> {
    let path = dir.join(file);
    if !path.is_file() {
        return Err(Error::Configuration(format!("scale table {} not found", path.display())));
    }
    let table = serde_json::from_slice(&std::fs::read(&path)?)?;
    tracing::debug!(path = %path.display(), "loaded scale table");
    Ok(table)
}

/// Jet-multiplicity bin: multiplicities below `first` go to bin 0, beyond
/// the table to the last bin. Low multiplicities are clamped rather than
/// wrapped to the last bin.
pub(crate) fn multiplicity_bin(n: usize, first: usize, len: usize) -> usize {
    n.saturating_sub(first).min(len.saturating_sub(1))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ttt_frame::{CollectionData, EventTable, FrameOptions, Jagged, MemberMeta, WeightTable};

    /// Four events with 2, 4, 7, 3 jets and 2, 3, 2, 1 leptons; weights 1.
    pub fn frame(member: &str, kind: SourceKind) -> EventFrame {
        frame_with(member, kind, &[2, 4, 7, 3], &[2, 3, 2, 1])
    }

    /// One event per entry of `njets` / `nleps`; weights 1.
    pub fn frame_with(member: &str, kind: SourceKind, njets: &[usize], nleps: &[usize]) -> EventFrame {
        let n = njets.len();
        let jets: Vec<Vec<f64>> = njets.iter().map(|n| vec![50.0; *n]).collect();
        let leps: Vec<Vec<f64>> = nleps.iter().map(|n| vec![30.0; *n]).collect();
        let w = WeightTable::from_columns(&[vec![1.0; n], vec![1.0; n], vec![1.0; n]]).unwrap();
        let t = EventTable::new(w)
            .with_collection("Jets", CollectionData::new().with_field("pt", Jagged::from_rows(&jets)))
            .with_collection("TightLepton", CollectionData::new().with_field("pt", Jagged::from_rows(&leps)));
        let meta = MemberMeta::new(vec!["Nominal".into(), "BJet_Shape_hf_up".into(), "LHE_muF_up".into()])
            .with_syst_index([(1, 0), (2, 0)].into_iter().collect())
            .with_sumweight(vec![1.0]);
        EventFrame::open(Box::new(t), meta, member, "Signal_Multi", kind, FrameOptions::default(), "Nominal")
            .unwrap()
    }
}
