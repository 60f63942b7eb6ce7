use std::collections::BTreeMap;
use std::path::Path;

use ttt_core::{Era, Error, Result};
use ttt_frame::EventFrame;

use super::{ScaleApplier, ScaleContext, ScaleOptions, load_table};

/// `era → variation → group → Nominal / variation yield ratio`.
pub type TheoryTable = BTreeMap<Era, BTreeMap<String, BTreeMap<String, f64>>>;

/// Removes the rate effect of scale and parton-shower variations so they
/// only change the shape.
#[derive(Debug, Clone)]
pub struct TheoryRescale {
    table: TheoryTable,
    prefixes: Vec<String>,
}

impl TheoryRescale {
    /// Registry name.
    pub const NAME: &'static str = "theory_rescale";
    /// Table file.
    pub const FILE: &'static str = "theory_scales.json";

    /// Applier over an in-memory table.
    pub fn new(table: TheoryTable, options: &ScaleOptions) -> Self {
        Self { table, prefixes: options.theory_prefixes.clone() }
    }

    /// Load the table from the scale directory.
    pub fn load(dir: &Path, options: &ScaleOptions) -> Result<Self> {
        Ok(Self::new(load_table(dir, Self::FILE)?, options))
    }
}

impl ScaleApplier for TheoryRescale {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, frame: &mut EventFrame, ctx: &ScaleContext<'_>) -> Result<()> {
        if !self.prefixes.iter().any(|p| ctx.variation.starts_with(p.as_str())) {
            return Ok(());
        }
        let factor = self
            .table
            .get(&ctx.era)
            .and_then(|v| v.get(ctx.variation))
            .and_then(|g| g.get(ctx.group))
            .copied()
            .ok_or_else(|| {
                Error::ScaleTableMiss(format!(
                    "no theory rescaling for '{}' / '{}' in {}",
                    ctx.variation, ctx.group, ctx.era
                ))
            })?;
        frame.scale_all(factor);
        Ok(())
    }
}
