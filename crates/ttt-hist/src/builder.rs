//! Fill histograms for one (region, era) from batch files.

use std::collections::{BTreeMap, BTreeSet};

use ttt_core::{Diagnostics, Era, Error, ErrorKind, ErrorRecord, NOMINAL, Presence, Result};
use ttt_frame::{CompiledExpr, EventFrame, FrameOptions, NtupleFile, SourceKind};
use ttt_syst::SystematicCatalog;

use crate::graph::GraphSpec;
use crate::histogram::NegativeBinPolicy;
use crate::scale::{ScaleChain, ScaleContext};
use crate::set::HistogramSet;

/// One member to read, with the group it feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSource {
    /// Process group.
    pub group: String,
    /// Member directory.
    pub member: String,
    /// Weighting.
    pub kind: SourceKind,
}

impl MemberSource {
    /// New source.
    pub fn new(group: &str, member: &str, kind: SourceKind) -> Self {
        Self { group: group.to_string(), member: member.to_string(), kind }
    }
}

/// Histogram builder for one (region, era).
///
/// For every member and every variation it needs, the builder switches the
/// frame, applies the region cuts and the scale chain, evaluates every graph
/// and fills `(graph, variation, group)`. Missing inputs are recorded and
/// skipped; anything else aborts.
pub struct HistogramBuilder<'a> {
    catalog: &'a SystematicCatalog,
    graphs: &'a [GraphSpec],
    scales: &'a ScaleChain,
    era: Era,
    region: String,
    cuts: Vec<CompiledExpr>,
    merges: Vec<(String, Vec<String>)>,
    systematics: bool,
    set: HistogramSet,
    diagnostics: Diagnostics,
    reported_misses: BTreeSet<(String, String)>,
}

impl std::fmt::Debug for HistogramBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramBuilder")
            .field("era", &self.era)
            .field("region", &self.region)
            .field("graphs", &self.graphs.len())
            .field("histograms", &self.set.len())
            .finish()
    }
}

impl<'a> HistogramBuilder<'a> {
    /// Builder with no cuts, no merged collections and systematics enabled.
    pub fn new(
        catalog: &'a SystematicCatalog,
        graphs: &'a [GraphSpec],
        scales: &'a ScaleChain,
        era: Era,
        region: &str,
    ) -> Self {
        Self {
            catalog,
            graphs,
            scales,
            era,
            region: region.to_string(),
            cuts: Vec::new(),
            merges: Vec::new(),
            systematics: true,
            set: HistogramSet::new(),
            diagnostics: Diagnostics::new(),
            reported_misses: BTreeSet::new(),
        }
    }

    /// Event cuts applied after every variation switch, in order.
    pub fn with_cuts<S: AsRef<str>>(mut self, cuts: &[S]) -> Result<Self> {
        self.cuts = cuts.iter().map(|c| CompiledExpr::compile(c.as_ref())).collect::<Result<_>>()?;
        Ok(self)
    }

    /// Collections presented as the union of stored ones (`name ← parts`).
    pub fn with_merges(mut self, merges: &BTreeMap<String, Vec<String>>) -> Self {
        self.merges = merges.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self
    }

    /// Fill the nominal variation only.
    pub fn without_systematics(mut self) -> Self {
        self.systematics = false;
        self
    }

    /// Era.
    pub fn era(&self) -> Era {
        self.era
    }

    /// Region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Histograms filled so far.
    pub fn histograms(&self) -> &HistogramSet {
        &self.set
    }

    /// Problems recorded so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Variations filled for a group: the nominal, then the up and down
    /// columns of every shape nuisance applying to it. Data gets the nominal
    /// only.
    pub fn variations_for(&self, group: &str, kind: SourceKind) -> Vec<String> {
        let mut out = vec![NOMINAL.to_string()];
        if !self.systematics || kind.is_data() {
            return out;
        }
        for sv in self.catalog.enumerate_shape_variations(self.era) {
            let applies = self
                .catalog
                .get(&sv.syst)
                .is_some_and(|s| s.applies_to(group, self.era, &self.region));
            if !applies {
                continue;
            }
            for col in [sv.up_column, sv.down_column] {
                if !out.contains(&col) {
                    out.push(col);
                }
            }
        }
        out
    }

    fn record(&mut self, err: &Error, group: &str, member: &str, variation: Option<&str>) {
        let mut r = ErrorRecord::from_error(err)
            .region(self.region.as_str())
            .year(self.era)
            .group(group)
            .member(member);
        if let Some(v) = variation {
            r = r.variation(v);
        }
        self.diagnostics.push(r);
    }

    /// Fill every variation of one member of `group`.
    ///
    /// A variation the member cannot provide marks `(group, variation)` as
    /// incomplete; a member without a usable nominal is skipped entirely.
    pub fn fill_frame(&mut self, group: &str, frame: &mut EventFrame) -> Result<()> {
        let member = frame.member().to_string();
        for (name, parts) in &self.merges {
            if !frame.has_collection(name) {
                let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
                frame.merge(name, &parts)?;
            }
        }

        for variation in self.variations_for(group, frame.kind()) {
            let outcome = match frame.set_variation(&variation) {
                Ok(true) => self.fill_variation(group, &member, frame, &variation),
                Ok(false) => Err(Error::MissingInput(format!(
                    "'{member}' does not store variation '{variation}'"
                ))),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::MissingInput => {
                    self.record(&e, group, &member, Some(&variation));
                    self.set.mark_incomplete(group, &variation);
                    if variation == NOMINAL {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn fill_variation(
        &mut self,
        group: &str,
        member: &str,
        frame: &mut EventFrame,
        variation: &str,
    ) -> Result<()> {
        for cut in &self.cuts {
            frame.mask_expr(cut)?;
        }
        let ctx = ScaleContext { group, member, era: self.era, variation };
        for miss in self.scales.apply(frame, &ctx)? {
            // one record per (member, table entry), not per variation
            if self.reported_misses.insert((member.to_string(), miss.to_string())) {
                self.record(&miss, group, member, None);
            }
        }

        let graphs = self.graphs;
        let fills = graphs.iter().map(|g| g.evaluate(frame)).collect::<Result<Vec<_>>>()?;
        for (graph, fill) in graphs.iter().zip(&fills) {
            if fill.is_empty() {
                continue;
            }
            let hist = self.set.entry(&graph.name, variation, group, || graph.empty_histogram())?;
            fill.fill_into(hist, member)?;
        }
        Ok(())
    }

    /// Read every source from one tree of a batch file.
    ///
    /// Members not in the batch are skipped silently; a member present
    /// without the tree is recorded as missing input.
    pub fn run(
        &mut self,
        file: &NtupleFile,
        tree: &str,
        sources: &[MemberSource],
        options: &FrameOptions,
    ) -> Result<()> {
        for src in sources {
            match file.open_frame(&src.member, tree, src.kind, options, NOMINAL) {
                Ok(Presence::Present(mut frame)) => self.fill_frame(&src.group, &mut frame)?,
                Ok(Presence::Absent(reason)) => {
                    let member_here = file.meta(&src.member).map(|m| m.is_present()).unwrap_or(false);
                    if member_here {
                        self.record(&Error::MissingInput(reason), &src.group, &src.member, None);
                    } else {
                        tracing::debug!(member = %src.member, file = %file.path().display(), "{reason}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::MissingInput => {
                    self.record(&e, &src.group, &src.member, None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Histograms and records as filled, before any negative-bin fix.
    ///
    /// Used when several builders are merged and the fix has to see the
    /// summed contents.
    pub fn into_parts(self) -> (HistogramSet, Diagnostics) {
        tracing::debug!(region = %self.region, era = %self.era, histograms = self.set.len(), "histograms filled");
        (self.set, self.diagnostics)
    }

    /// Apply the negative-bin policy and hand out the results.
    pub fn finish(mut self, policy: NegativeBinPolicy) -> (HistogramSet, Diagnostics) {
        let fixed = self.set.fix_negative(policy);
        tracing::debug!(
            region = %self.region,
            era = %self.era,
            histograms = self.set.len(),
            negative_bins = fixed,
            "histograms filled"
        );
        (self.set, self.diagnostics)
    }
}

/// Compare the Systematics list of every member across batch files.
///
/// The first file a member appears in is the reference. Returns, per file,
/// the members whose list differs (to be excluded from that file) and a
/// missing-input record for each.
pub fn check_systematics_lists(files: &[NtupleFile]) -> Result<(Vec<BTreeSet<String>>, Diagnostics)> {
    let mut reference: BTreeMap<String, (usize, Vec<String>)> = BTreeMap::new();
    let mut excluded = vec![BTreeSet::new(); files.len()];
    let mut diagnostics = Diagnostics::new();
    for (i, file) in files.iter().enumerate() {
        for member in file.members()? {
            let Presence::Present(meta) = file.meta(&member)? else { continue };
            match reference.get(&member) {
                None => {
                    reference.insert(member, (i, meta.systematics));
                }
                Some((first, systs)) if *systs != meta.systematics => {
                    diagnostics.push(
                        ErrorRecord::new(
                            ErrorKind::MissingInput,
                            format!(
                                "Systematics list in {} differs from {}",
                                file.path().display(),
                                files[*first].path().display()
                            ),
                        )
                        .member(member.as_str()),
                    );
                    excluded[i].insert(member);
                }
                Some(_) => {}
            }
        }
    }
    Ok((excluded, diagnostics))
}
