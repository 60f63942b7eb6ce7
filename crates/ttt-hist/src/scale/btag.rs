use std::collections::BTreeMap;
use std::path::Path;

use ttt_core::{Era, Error, NOMINAL, Result};
use ttt_frame::EventFrame;

use super::{ScaleApplier, ScaleContext, ScaleOptions, load_table, multiplicity_bin};

/// `era → group → variation → factor per jet bin`.
pub type BtagTable = BTreeMap<Era, BTreeMap<String, BTreeMap<String, Vec<f64>>>>;

/// First jet multiplicity with its own bin.
const FIRST_JET_BIN: usize = 2;

/// B-tag shape renormalisation binned in jet multiplicity, with separate
/// tables for exactly two and for three or more leptons.
///
/// Variations without their own entry use the Nominal factors.
#[derive(Debug, Clone)]
pub struct BtagJetLep {
    lep2: BtagTable,
    lep3: BtagTable,
    jets: String,
    leptons: String,
}

impl BtagJetLep {
    /// Registry name.
    pub const NAME: &'static str = "btag_jetlep";
    /// Table file for two-lepton events.
    pub const LEP2_FILE: &'static str = "btag_scales_njet_lep2.json";
    /// Table file for events with three or more leptons.
    pub const LEP3_FILE: &'static str = "btag_scales_njet_lep3.json";

    /// Applier over in-memory tables.
    pub fn new(lep2: BtagTable, lep3: BtagTable, options: &ScaleOptions) -> Self {
        Self { lep2, lep3, jets: options.jets.clone(), leptons: options.leptons.clone() }
    }

    /// Load both tables from the scale directory.
    pub fn load(dir: &Path, options: &ScaleOptions) -> Result<Self> {
        Ok(Self::new(load_table(dir, Self::LEP2_FILE)?, load_table(dir, Self::LEP3_FILE)?, options))
    }

    fn factors<'t>(table: &'t BtagTable, label: &str, ctx: &ScaleContext<'_>) -> Result<&'t [f64]> {
        let by_group = table.get(&ctx.era).ok_or_else(|| {
            Error::ScaleTableMiss(format!("b-tag {label} table has no era {}", ctx.era))
        })?;
        let by_var = by_group.get(ctx.group).ok_or_else(|| {
            Error::ScaleTableMiss(format!("b-tag {label} table has no group '{}' in {}", ctx.group, ctx.era))
        })?;
        let f = by_var.get(ctx.variation).or_else(|| by_var.get(NOMINAL)).ok_or_else(|| {
            Error::ScaleTableMiss(format!(
                "b-tag {label} table has neither '{}' nor Nominal for '{}' in {}",
                ctx.variation, ctx.group, ctx.era
            ))
        })?;
        if f.is_empty() {
            return Err(Error::ScaleTableMiss(format!(
                "b-tag {label} table for '{}' in {} is empty",
                ctx.group, ctx.era
            )));
        }
        Ok(f)
    }
}

impl ScaleApplier for BtagJetLep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, frame: &mut EventFrame, ctx: &ScaleContext<'_>) -> Result<()> {
        let lep2 = Self::factors(&self.lep2, "2-lepton", ctx)?;
        let lep3 = Self::factors(&self.lep3, "3-lepton", ctx)?;
        let njets = frame.num(&self.jets)?;
        let nleps = frame.num(&self.leptons)?;
        let factors: Vec<f64> = njets
            .iter()
            .zip(&nleps)
            .map(|(nj, nl)| match nl {
                2 => lep2[multiplicity_bin(*nj, FIRST_JET_BIN, lep2.len())],
                n if *n > 2 => lep3[multiplicity_bin(*nj, FIRST_JET_BIN, lep3.len())],
                _ => 1.0,
            })
            .collect();
        frame.scale(&factors)
    }
}
