//! Histograms filled from written batch files, one builder per batch, merged.

use std::path::{Path, PathBuf};

use approx::assert_relative_eq;
use ttt_core::{Era, ErrorKind};
use ttt_frame::{EventTable, FrameOptions, MemberMeta, NtupleFile, NtupleWriter, SourceKind, WeightTable};
use ttt_hist::{
    Axis, GraphSpec, HistogramBuilder, HistogramSet, MemberSource, NegativeBinPolicy, ScaleChain,
    ShapeTemplates, check_systematics_lists,
};
use ttt_syst::{Magnitude, Systematic, SystematicCatalog};

fn tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("ttt_hist_{tag}_{}_{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn jer_meta() -> MemberMeta {
    MemberMeta::new(vec!["Nominal".into(), "Jet_JER_up".into(), "Jet_JER_down".into()])
        .with_sumweight(vec![4.0])
}

fn table(nominal: Vec<f64>, ht: Vec<f64>) -> EventTable {
    let n = nominal.len();
    let up: Vec<f64> = nominal.iter().map(|w| w * 1.2).collect();
    let down: Vec<f64> = nominal.iter().map(|w| w * 0.8).collect();
    EventTable::new(WeightTable::from_columns(&[nominal, up, down]).unwrap())
        .with_scalar("HT", ht)
        .with_scalar("passZVeto", vec![1.0; n])
}

/// Batch A: ttz in the dilepton tree, ttw only in the multilepton tree.
/// Batch B: ttz with a different Systematics list, ttw in the dilepton tree.
fn write_batches(root: &Path) -> (NtupleFile, NtupleFile) {
    let a = NtupleWriter::create(root.join("batch_a")).unwrap();
    let ttz = table(vec![1.0, 2.0, 3.0], vec![50.0, 150.0, 250.0]);
    a.write_member("ttz", &jer_meta(), &[("Signal_Dilepton", &ttz)]).unwrap();
    a.write_member("ttw", &jer_meta(), &[("Signal_Multi", &table(vec![1.0], vec![50.0]))]).unwrap();

    let b = NtupleWriter::create(root.join("batch_b")).unwrap();
    let short = MemberMeta::new(vec!["Nominal".into()]).with_sumweight(vec![4.0]);
    let t = EventTable::new(WeightTable::from_columns(&[vec![1.0]]).unwrap())
        .with_scalar("HT", vec![50.0])
        .with_scalar("passZVeto", vec![1.0]);
    b.write_member("ttz", &short, &[("Signal_Dilepton", &t)]).unwrap();
    b.write_member("ttw", &jer_meta(), &[("Signal_Dilepton", &table(vec![4.0], vec![350.0]))]).unwrap();

    (NtupleFile::open(a.root()).unwrap(), NtupleFile::open(b.root()).unwrap())
}

fn catalog() -> SystematicCatalog {
    SystematicCatalog::from_systematics([
        Systematic::shape("Jet_JER").add_all_years(Magnitude::Symmetric(1.0), &["ttz", "ttw"])
    ])
    .unwrap()
}

const MC: SourceKind = SourceKind::Simulation { xsec_scale: 2.0 };

fn fill(
    file: &NtupleFile,
    sources: &[MemberSource],
    catalog: &SystematicCatalog,
    graphs: &[GraphSpec],
) -> (HistogramSet, ttt_core::Diagnostics) {
    let scales = ScaleChain::new();
    let mut b = HistogramBuilder::new(catalog, graphs, &scales, Era::Y2018, "Dilepton")
        .with_cuts(&["passZVeto == 1"])
        .unwrap();
    b.run(file, "Signal_Dilepton", sources, &FrameOptions::default()).unwrap();
    b.finish(NegativeBinPolicy::Abs)
}

#[test]
fn batches_merge_to_normalised_yields() {
    let root = tmp_dir("merge");
    let (a, b) = write_batches(&root);
    let files = vec![a, b];

    let (excluded, check) = check_systematics_lists(&files).unwrap();
    assert!(excluded[0].is_empty());
    assert_eq!(excluded[1].iter().collect::<Vec<_>>(), vec!["ttz"]);
    assert_eq!(check.len(), 1);
    assert_eq!(check.records()[0].kind, ErrorKind::MissingInput);

    let catalog = catalog();
    let graphs = vec![GraphSpec::expr("HT", "H_{T}", Axis::regular(4, 0.0, 400.0).unwrap(), "HT").unwrap()];
    let all = vec![MemberSource::new("ttz", "ttz", MC), MemberSource::new("ttw", "ttw", MC)];

    let mut sets = Vec::new();
    let mut records = Vec::new();
    for (i, file) in files.iter().enumerate() {
        let sources: Vec<MemberSource> =
            all.iter().filter(|s| !excluded[i].contains(&s.member)).cloned().collect();
        let (set, diag) = fill(file, &sources, &catalog, &graphs);
        records.extend(diag.records().to_vec());
        sets.push(set);
    }
    // ttw is in batch A but lacks the dilepton tree
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].member.as_deref(), Some("ttw"));

    let mut ab = sets[0].clone();
    ab.merge(sets[1].clone()).unwrap();
    let mut ba = sets[1].clone();
    ba.merge(sets[0].clone()).unwrap();
    assert_eq!(ab, ba);

    // xsec_scale / sumweight = 0.5
    let ttz = ab.get("HT", "Nominal", "ttz").unwrap();
    assert_eq!(ttz.values(), &[0.5, 1.0, 1.5, 0.0]);
    assert_relative_eq!(ttz.integral(), 3.0);
    let ttw = ab.get("HT", "Nominal", "ttw").unwrap();
    assert_eq!(ttw.values(), &[0.0, 0.0, 0.0, 2.0]);
    assert_relative_eq!(ab.get("HT", "Jet_JER_up", "ttz").unwrap().integral(), 3.6, epsilon = 1e-12);

    let t = ShapeTemplates::build(&ab, "HT", &catalog, Era::Y2018, "Dilepton").unwrap();
    assert_eq!(t.shapes.len(), 1);
    assert_eq!(t.shapes[0].name(), "Jet_JER_2018");
    assert_eq!(t.shapes[0].groups().collect::<Vec<_>>(), vec!["ttw", "ttz"]);

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn sum_of_weights_matches_selected_events() {
    let root = tmp_dir("sumw");
    let w = NtupleWriter::create(&root).unwrap();
    let weights = vec![0.3, -0.1, 1.7, 2.2, 0.4];
    let t = table(weights, vec![10.0, 30.0, 999.0, -5.0, 260.0])
        .with_scalar("passZVeto", vec![1.0, 1.0, 0.0, 1.0, 1.0]);
    w.write_member("ttz", &jer_meta(), &[("Signal_Dilepton", &t)]).unwrap();
    let file = NtupleFile::open(&root).unwrap();

    let catalog = catalog();
    let graphs = vec![GraphSpec::expr("HT", "H_{T}", Axis::regular(4, 0.0, 400.0).unwrap(), "HT").unwrap()];
    let (set, diag) = fill(&file, &[MemberSource::new("ttz", "ttz", MC)], &catalog, &graphs);
    assert!(diag.is_empty());
    let expected: f64 = [0.3, -0.1, 2.2, 0.4].iter().map(|w| w * 0.5).sum();
    let h = set.get("HT", "Nominal", "ttz").unwrap();
    // the underflow entry lands in the first bin, which stays positive
    assert_relative_eq!(h.integral(), expected, epsilon = 1e-12);
    assert_eq!(h.breakdown()["ttz"].entries, 4);

    std::fs::remove_dir_all(&root).unwrap();
}
