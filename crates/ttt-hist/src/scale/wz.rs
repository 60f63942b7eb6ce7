use std::collections::BTreeMap;
use std::path::Path;

use ttt_core::{Era, Error, Result};
use ttt_frame::EventFrame;

use super::{ScaleApplier, ScaleContext, ScaleOptions, load_table, multiplicity_bin};

/// `era → factor per jet bin`.
pub type WzTable = BTreeMap<Era, Vec<f64>>;

const FIRST_JET_BIN: usize = 2;

/// Jet-multiplicity correction for WZ, measured in the WZ control region.
#[derive(Debug, Clone)]
pub struct WzScale {
    table: WzTable,
    members: Vec<String>,
    jets: String,
}

impl WzScale {
    /// Registry name.
    pub const NAME: &'static str = "wz";
    /// Table file.
    pub const FILE: &'static str = "wz_scale_factor.json";

    /// Applier over an in-memory table.
    pub fn new(table: WzTable, options: &ScaleOptions) -> Self {
        Self { table, members: options.wz_members.clone(), jets: options.jets.clone() }
    }

    /// Load the table from the scale directory.
    pub fn load(dir: &Path, options: &ScaleOptions) -> Result<Self> {
        Ok(Self::new(load_table(dir, Self::FILE)?, options))
    }
}

impl ScaleApplier for WzScale {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, frame: &mut EventFrame, ctx: &ScaleContext<'_>) -> Result<()> {
        if !self.members.iter().any(|m| m == ctx.member) {
            return Ok(());
        }
        let factors = self
            .table
            .get(&ctx.era)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::ScaleTableMiss(format!("no WZ scale factors for {}", ctx.era)))?;
        let scale: Vec<f64> = frame
            .num(&self.jets)?
            .into_iter()
            .map(|nj| factors[multiplicity_bin(nj, FIRST_JET_BIN, factors.len())])
            .collect();
        frame.scale(&scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::test_support::frame;
    use approx::assert_relative_eq;
    use ttt_core::ErrorKind;
    use ttt_frame::SourceKind;

    fn applier() -> WzScale {
        WzScale::new(BTreeMap::from([(Era::Y2017, vec![0.9, 1.0, 1.1, 1.3])]), &ScaleOptions::default())
    }

    #[test]
    fn only_wz_members_are_scaled() {
        let a = applier();
        let mut f = frame("wzTo3lnu", SourceKind::Simulation { xsec_scale: 1.0 });
        let c = ScaleContext { group: "rare", member: "wzTo3lnu", era: Era::Y2017, variation: "Nominal" };
        a.apply(&mut f, &c).unwrap();
        let w = f.weights();
        // 2, 4, 7, 3 jets
        assert_relative_eq!(w[0], 0.9);
        assert_relative_eq!(w[1], 1.1);
        assert_relative_eq!(w[2], 1.3);
        assert_relative_eq!(w[3], 1.0);

        let mut g = frame("tzq", SourceKind::Simulation { xsec_scale: 1.0 });
        let c = ScaleContext { member: "tzq", ..c };
        a.apply(&mut g, &c).unwrap();
        assert_eq!(g.weights(), vec![1.0; 4]);
    }

    #[test]
    fn missing_era() {
        let mut f = frame("wzTo3lnu", SourceKind::Simulation { xsec_scale: 1.0 });
        let c = ScaleContext { group: "rare", member: "wzTo3lnu", era: Era::Y2018, variation: "Nominal" };
        assert_eq!(applier().apply(&mut f, &c).unwrap_err().kind(), ErrorKind::ScaleTableMiss);
    }
}
