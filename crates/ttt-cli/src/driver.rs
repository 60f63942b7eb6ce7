//! Pipeline driver: (region, year, batch) fan-out on a thread pool, deep
//! merge, then artifacts, cards and card combination per (region, year).

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use ttt_core::{Diagnostics, Era, Error, ErrorKind, ErrorRecord, Presence, Result};
use ttt_datacard::{CardBuilder, CardPiece, DataCard, ShapeWriter, combine_cards};
use ttt_frame::{NtupleFile, SourceKind};
use ttt_hist::{
    GraphSpec, HistogramBuilder, HistogramSet, MemberSource, ScaleChain, ShapeTemplates,
    check_systematics_lists, yield_table,
};
use ttt_syst::{GroupKind, ProcessGroups, SystematicCatalog};

use crate::config::{NtupleConfig, RegionConfig, RunConfig};

/// Directory under the workdir holding the run-wide card.
pub const COMBINE_DIR: &str = "combine";

/// Failure log inside [`COMBINE_DIR`].
pub const FAILURES_LOG: &str = "failures.log";

/// Command line choices for one run.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Eras to process.
    pub years: Vec<Era>,
    /// Root of every output.
    pub workdir: PathBuf,
    /// Ntuple descriptor name.
    pub ntuple: String,
    /// Fill and write shape systematics.
    pub systematics: bool,
    /// Synthesise `data_obs` from the background sum.
    pub blinded: bool,
    /// Worker threads.
    pub cores: usize,
    /// Run the fitter on the final card.
    pub fit: bool,
}

/// What a run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// Every record of the run.
    pub diagnostics: Diagnostics,
    /// Per-(region, year) cards written.
    pub cards: Vec<PathBuf>,
    /// Run-wide card, when at least one region produced a card.
    pub final_card: Option<PathBuf>,
    /// Where the records were appended.
    pub failures_log: PathBuf,
}

struct Task<'a> {
    region: usize,
    era: Era,
    file: NtupleFile,
    excluded: &'a BTreeSet<String>,
}

/// The (region, year) key space of a run.
type Key = (usize, Era);

/// Orchestrates one run.
pub struct PipelineDriver<'a> {
    config: &'a RunConfig,
    ntuple: &'a NtupleConfig,
    options: DriverOptions,
    groups: ProcessGroups,
    catalog: SystematicCatalog,
    graphs: Vec<GraphSpec>,
    scales: ScaleChain,
}

impl std::fmt::Debug for PipelineDriver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("options", &self.options)
            .field("graphs", &self.graphs.iter().map(|g| g.name.as_str()).collect::<Vec<_>>())
            .field("scales", &self.scales)
            .finish()
    }
}

impl<'a> PipelineDriver<'a> {
    /// Validate the configuration and load everything shared by the tasks.
    /// Any failure here is a configuration error.
    pub fn new(config: &'a RunConfig, options: DriverOptions) -> Result<Self> {
        config.validate(&options.ntuple)?;
        if options.years.is_empty() {
            return Err(Error::Configuration("no years selected".into()));
        }
        let ntuple = config.ntuple(&options.ntuple)?;
        Ok(Self {
            config,
            ntuple,
            groups: config.process_groups()?,
            catalog: config.catalog()?,
            graphs: config.graph_specs()?,
            scales: config.scale_chain()?,
            options,
        })
    }

    fn region(&self, idx: usize) -> &RegionConfig {
        &self.config.regions[idx]
    }

    fn region_dir(&self, region: &RegionConfig) -> PathBuf {
        self.options.workdir.join(&region.name)
    }

    /// Run every stage and append the records to the failure log.
    pub fn run(&self) -> Result<RunSummary> {
        let mut diagnostics = Diagnostics::new();
        let files = self.enumerate_files(&mut diagnostics)?;
        let mut tasks = Vec::new();
        for (era, batches) in &files {
            for region in 0..self.config.regions.len() {
                for (file, excluded) in batches {
                    tasks.push(Task { region, era: *era, file: file.clone(), excluded });
                }
            }
        }
        tracing::info!(tasks = tasks.len(), cores = self.options.cores, "starting histogram tasks");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.cores.max(1))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build thread pool: {e}")))?;
        let results: Vec<Result<(HistogramSet, Diagnostics)>> =
            pool.install(|| tasks.par_iter().map(|t| self.run_task(t)).collect());

        let mut merged = self.merge_results(&tasks, results, &mut diagnostics);

        let mut cards = Vec::new();
        let mut region_cards: BTreeMap<usize, BTreeMap<String, Vec<(Era, DataCard)>>> = BTreeMap::new();
        for ((region, era), set) in merged.iter_mut() {
            let fixed = set.fix_negative(self.config.negative_bins);
            if fixed > 0 {
                tracing::debug!(region = %self.region(*region).name, %era, bins = fixed, "fixed negative bins");
            }
            match self.write_region_year(*region, *era, set, &mut diagnostics) {
                Ok(written) => {
                    for (graph, path, card) in written {
                        cards.push(path);
                        region_cards.entry(*region).or_default().entry(graph).or_default().push((*era, card));
                    }
                }
                Err(e) => diagnostics.push(
                    ErrorRecord::from_error(&e).region(self.region(*region).name.as_str()).year(*era),
                ),
            }
        }

        let fit_graph = self.config.fit_graph_name(&self.graphs);
        let mut final_pieces = Vec::new();
        for (region, per_graph) in &region_cards {
            let region = self.region(*region);
            for (graph, era_cards) in per_graph {
                match self.combine_region(region, graph, era_cards) {
                    Ok(card) if fit_graph.as_deref() == Some(graph.as_str()) => {
                        final_pieces.push(CardPiece::new(&region.name, card).in_dir(&format!("../{}", region.name)));
                    }
                    Ok(_) => {}
                    Err(e) => diagnostics.push(ErrorRecord::from_error(&e).region(region.name.as_str())),
                }
            }
        }

        let combine_dir = self.options.workdir.join(COMBINE_DIR);
        std::fs::create_dir_all(&combine_dir)?;
        let final_card = match self.write_final(&combine_dir, &final_pieces) {
            Ok(path) => path,
            Err(e) => {
                diagnostics.push(ErrorRecord::from_error(&e));
                None
            }
        };
        if let Some(card) = &final_card
            && self.options.fit
        {
            self.fit(card, &combine_dir, &mut diagnostics)?;
        }

        let failures_log = combine_dir.join(FAILURES_LOG);
        append_failures(&failures_log, &diagnostics)?;
        Ok(RunSummary { diagnostics, cards, final_card, failures_log })
    }

    /// Batch files per era, with the members each file must skip because its
    /// Systematics list disagrees with the first file.
    fn enumerate_files(&self, diagnostics: &mut Diagnostics) -> Result<Vec<(Era, Vec<(NtupleFile, BTreeSet<String>)>)>> {
        let mut out = Vec::new();
        for &era in &self.options.years {
            let dir = self.config.ntuple_dir(self.ntuple, era);
            let files = match list_batches(&dir)? {
                Presence::Present(files) => files,
                Presence::Absent(reason) => {
                    diagnostics.push(ErrorRecord::new(ErrorKind::MissingInput, reason).year(era));
                    continue;
                }
            };
            let (excluded, records) = check_systematics_lists(&files)?;
            diagnostics.extend(records);
            tracing::info!(%era, dir = %dir.display(), batches = files.len(), "found batch files");
            out.push((era, files.into_iter().zip(excluded).collect()));
        }
        Ok(out)
    }

    fn sources(&self, groups: &ProcessGroups, tree: &str, task: &Task<'_>) -> Result<Vec<MemberSource>> {
        let mut out = Vec::new();
        for a in self.ntuple.layout.assignments(groups, tree)? {
            if task.excluded.contains(&a.member) {
                continue;
            }
            let kind = match a.kind {
                GroupKind::Simulation => SourceKind::Simulation { xsec_scale: self.config.xsec_scale(&a.member, task.era)? },
                GroupKind::Data => SourceKind::Data,
                GroupKind::DataDriven => SourceKind::DataDriven,
            };
            out.push(MemberSource::new(&a.group, &a.member, kind));
        }
        Ok(out)
    }

    /// One (region, year, batch): every tree of the region, every member.
    fn run_task(&self, task: &Task<'_>) -> Result<(HistogramSet, Diagnostics)> {
        let region = self.region(task.region);
        let groups = self.groups.without(&region.remove);
        let cuts: Vec<&str> = self.ntuple.cut.iter().chain(region.mask.iter()).map(String::as_str).collect();
        let mut builder = HistogramBuilder::new(&self.catalog, &self.graphs, &self.scales, task.era, &region.name)
            .with_cuts(&cuts)?
            .with_merges(&self.ntuple.merges);
        if !self.options.systematics {
            builder = builder.without_systematics();
        }
        let options = self.config.frame_options();
        for tree in self.config.region_trees(self.ntuple, region) {
            let sources = self.sources(&groups, tree, task)?;
            builder.run(&task.file, tree, &sources, &options)?;
        }
        tracing::debug!(region = %region.name, era = %task.era, file = %task.file.path().display(), "task done");
        Ok(builder.into_parts())
    }

    /// Deep merge per (region, year). A failed task drops its whole key.
    fn merge_results(
        &self,
        tasks: &[Task<'_>],
        results: Vec<Result<(HistogramSet, Diagnostics)>>,
        diagnostics: &mut Diagnostics,
    ) -> BTreeMap<Key, HistogramSet> {
        let mut merged: BTreeMap<Key, HistogramSet> = BTreeMap::new();
        let mut failed: BTreeSet<Key> = BTreeSet::new();
        for (task, result) in tasks.iter().zip(results) {
            let key = (task.region, task.era);
            let region = self.region(task.region).name.as_str();
            let outcome = result.and_then(|(set, records)| {
                diagnostics.extend(records);
                if failed.contains(&key) {
                    return Ok(());
                }
                merged.entry(key).or_default().merge(set)
            });
            if let Err(e) = outcome {
                tracing::error!(region, era = %task.era, file = %task.file.path().display(), error = %e, "task failed");
                diagnostics.push(ErrorRecord::from_error(&e).region(region).year(task.era));
                failed.insert(key);
                merged.remove(&key);
            }
        }
        merged
    }

    /// Smooth, write the artifact, yield table and card of every graph.
    fn write_region_year(
        &self,
        region: usize,
        era: Era,
        set: &HistogramSet,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<(String, PathBuf, DataCard)>> {
        let region = self.region(region);
        let dir = self.region_dir(region);
        std::fs::create_dir_all(&dir)?;
        let groups = self.groups.without(&region.remove);
        let writer = ShapeWriter::new(&groups, self.options.blinded);
        let mut card_builder = CardBuilder::new(&self.catalog, &groups)
            .with_rate_params(&self.config.rate_params)
            .with_auto_mc_threshold(self.config.auto_mc_threshold);
        if !self.options.systematics {
            card_builder = card_builder.without_systematics();
        }

        let mut out = Vec::new();
        for graph in &self.graphs {
            let mut templates = match ShapeTemplates::build(set, &graph.name, &self.catalog, era, &region.name) {
                Ok(t) => t,
                Err(e) if e.kind() == ErrorKind::MissingInput => {
                    diagnostics.push(ErrorRecord::from_error(&e).region(region.name.as_str()).year(era));
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.options.systematics {
                self.config.smoothing.apply(&mut templates)?;
            }
            let stem = format!("{}_{era}_{}", graph.name, region.name);
            let artifact_file = format!("{stem}.json");
            let artifact = writer.write(&templates, &dir.join(&artifact_file))?;
            std::fs::write(dir.join(format!("{stem}_yields.txt")), yield_table(set, &graph.name))?;

            let card = card_builder.build(era, &region.name, &artifact_file, &artifact)?;
            let card_file = format!("{stem}_card.txt");
            let card_path = dir.join(&card_file);
            card.write(&card_path)?;
            tracing::info!(region = %region.name, %era, graph = %graph.name, path = %card_path.display(), "wrote card");

            if self.options.fit && self.config.fit_each_card {
                match self.config.fitter.run(Path::new(&card_file), &dir) {
                    Ok(log) => std::fs::write(dir.join(format!("{stem}_fit.log")), log)?,
                    Err(e) if e.kind() == ErrorKind::FitterInvocation => {
                        // the card stays on disk but does not enter the combination
                        diagnostics.push(ErrorRecord::from_error(&e).region(region.name.as_str()).year(era));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            out.push((graph.name.clone(), card_path, card));
        }
        Ok(out)
    }

    /// Per-year cards of one region and graph combined into
    /// `<graph>_all_<region>_card.txt`.
    fn combine_region(&self, region: &RegionConfig, graph: &str, cards: &[(Era, DataCard)]) -> Result<DataCard> {
        let pieces: Vec<CardPiece> = cards
            .iter()
            .map(|(era, card)| CardPiece::new(&format!("yr{era}_{}", region.name), card.clone()))
            .collect();
        let combined = combine_cards(&pieces)?;
        let path = self.region_dir(region).join(format!("{graph}_all_{}_card.txt", region.name));
        combined.write(&path)?;
        tracing::info!(region = %region.name, graph, years = cards.len(), path = %path.display(), "combined years");
        Ok(combined)
    }

    fn write_final(&self, combine_dir: &Path, pieces: &[CardPiece]) -> Result<Option<PathBuf>> {
        if pieces.is_empty() {
            tracing::warn!("no region produced a card; skipping the run-wide card");
            return Ok(None);
        }
        let name = if self.options.systematics { "final_card.txt" } else { "final_nosyst_card.txt" };
        let path = combine_dir.join(name);
        combine_cards(pieces)?.write(&path)?;
        tracing::info!(path = %path.display(), regions = pieces.len(), "wrote run-wide card");
        Ok(Some(path))
    }

    fn fit(&self, card: &Path, combine_dir: &Path, diagnostics: &mut Diagnostics) -> Result<()> {
        let Some(name) = card.file_name() else { return Ok(()) };
        match self.config.fitter.run(Path::new(name), combine_dir) {
            Ok(log) => {
                std::fs::write(combine_dir.join("fit.log"), log)?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::FitterInvocation => {
                diagnostics.push(ErrorRecord::from_error(&e));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Batch files of one era directory: its sub-directories in name order, or
/// the directory itself when it directly holds members.
fn list_batches(dir: &Path) -> Result<Presence<Vec<NtupleFile>>> {
    if !dir.is_dir() {
        return Ok(Presence::Absent(format!("ntuple directory {} does not exist", dir.display())));
    }
    let here = NtupleFile::open(dir)?;
    if !here.members()?.is_empty() {
        return Ok(Presence::Present(vec![here]));
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            paths.push(path);
        }
    }
    paths.sort();
    let files: Vec<NtupleFile> = paths.iter().map(NtupleFile::open).collect::<Result<_>>()?;
    if files.is_empty() {
        return Ok(Presence::Absent(format!("no batch files in {}", dir.display())));
    }
    Ok(Presence::Present(files))
}

/// Append one line per record and the summary.
fn append_failures(path: &Path, diagnostics: &Diagnostics) -> Result<()> {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    for r in diagnostics.records() {
        writeln!(f, "{}", r.to_line())?;
    }
    writeln!(f, "{}", diagnostics.summary())?;
    Ok(())
}
