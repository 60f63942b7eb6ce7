//! Templates → artifact on disk → card, checked against each other.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ttt_core::Era;
use ttt_datacard::{CardBuilder, DataCard, ShapeArtifact, ShapeWriter};
use ttt_hist::{Axis, Histogram, ShapeTemplate, ShapeTemplates};
use ttt_syst::{DATA_OBS, GroupKind, Magnitude, ProcessGroup, ProcessGroups, Systematic, SystematicCatalog};

fn tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("ttt_datacard_{tag}_{}_{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn h(values: &[f64], variances: &[f64]) -> Histogram {
    let axis = Axis::regular(values.len(), 0.0, 1.0).unwrap();
    Histogram::from_contents(vec![axis], values.to_vec(), variances.to_vec()).unwrap()
}

fn groups() -> ProcessGroups {
    ProcessGroups::new(vec![
        ProcessGroup::simulation("ttt", &["tttj", "tttw"]).signal().combine_as("tttt_sig"),
        ProcessGroup::simulation("ttz", &["ttz"]),
        ProcessGroup::simulation("ttw", &["ttw"]),
        ProcessGroup::simulation("nonprompt", &["data"]).kind(GroupKind::DataDriven),
        ProcessGroup::simulation("data", &["data"]).kind(GroupKind::Data),
    ])
    .unwrap()
}

fn catalog() -> SystematicCatalog {
    SystematicCatalog::from_systematics([
        Systematic::lnn("lumi").add_all_years(Magnitude::Symmetric(1.025), &[] as &[&str]),
        Systematic::shape("Jet_JER").smooth().add_all_years(Magnitude::Symmetric(1.0), &["ttw", "ttt"]),
        Systematic::shape("Nonprompt").correlated().add_all_years(Magnitude::Symmetric(1.0), &["nonprompt"]),
    ])
    .unwrap()
}

/// Backgrounds sum to [5, 3, 1].
fn templates() -> ShapeTemplates {
    let nominal = BTreeMap::from([
        ("ttt".to_string(), h(&[0.1, 0.30000000000000004, 0.7], &[0.01, 0.02, 0.03])),
        ("ttz".to_string(), h(&[2.0, 1.5, 0.5], &[0.1, 0.1, 0.1])),
        ("ttw".to_string(), h(&[2.5, 1.0, 0.25], &[0.1, 0.1, 0.1])),
        ("nonprompt".to_string(), h(&[0.5, 0.5, 0.25], &[0.2, 0.2, 0.2])),
        ("data".to_string(), h(&[6.0, 2.0, 1.0], &[6.0, 2.0, 1.0])),
    ]);
    let jer = ShapeTemplate {
        syst: "Jet_JER".into(),
        raw_name: "Jet_JER_2018".into(),
        smoothed_name: Some("Jet_JER_2018_lowess".into()),
        smoothed: true,
        up: BTreeMap::from([
            ("ttw".to_string(), h(&[2.75, 1.1, 0.275], &[0.1, 0.1, 0.1])),
            ("ttt".to_string(), h(&[0.11, 0.33, 0.77], &[0.01, 0.02, 0.03])),
        ]),
        down: BTreeMap::from([
            ("ttw".to_string(), h(&[2.25, 0.9, 0.225], &[0.1, 0.1, 0.1])),
            ("ttt".to_string(), h(&[0.09, 0.27, 0.63], &[0.01, 0.02, 0.03])),
        ]),
    };
    ShapeTemplates {
        graph: "Signal".into(),
        era: Era::Y2018,
        region: "Dilepton".into(),
        nominal,
        shapes: vec![jer],
    }
}

#[test]
fn artifact_round_trips_bit_identically() {
    let dir = tmp_dir("roundtrip");
    let g = groups();
    let path = dir.join("Signal_2018_Dilepton.json");
    let written = ShapeWriter::new(&g, true).write(&templates(), &path).unwrap();
    let read = ShapeArtifact::read(&path).unwrap();
    assert_eq!(read, written);
    for (name, hist) in &read.histograms {
        let orig = &written.histograms[name];
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&hist.values), bits(&orig.values));
    }
    assert_eq!(read.histograms["tttt_sig"].values[1], 0.30000000000000004);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn blinded_data_obs_sums_backgrounds() {
    let g = groups();
    let a = ShapeWriter::new(&g, true).assemble(&templates()).unwrap();
    assert_eq!(a.histograms[DATA_OBS].values, vec![5.0, 3.0, 1.0]);
    assert_eq!(a.histograms[DATA_OBS].variances, vec![5.0, 3.0, 1.0]);
}

#[test]
fn card_references_resolve_in_artifact() {
    let dir = tmp_dir("card");
    let (g, c) = (groups(), catalog());
    let file = "Signal_2018_Dilepton.json";
    let artifact = ShapeWriter::new(&g, true).write(&templates(), &dir.join(file)).unwrap();
    let card = CardBuilder::new(&c, &g)
        .with_rate_params(&["ttz"])
        .build(Era::Y2018, "Dilepton", file, &artifact)
        .unwrap();
    let card_path = dir.join("Signal_2018_Dilepton_card.txt");
    card.write(&card_path).unwrap();
    let parsed = DataCard::read(&card_path).unwrap();
    assert_eq!(parsed, card);

    assert_eq!(parsed.process_names(), vec!["tttt_sig", "ttz", "ttw", "nonprompt"]);
    // Nonprompt has no templates, so no row
    assert!(parsed.nuisance("Nonprompt").is_none());
    let jer = parsed.nuisance("Jet_JER_2018_lowess").unwrap();
    assert_eq!(jer.cells, vec!["1", "-", "1", "-"]);
    for n in parsed.nuisances.iter().filter(|n| n.kind == "shape") {
        for (cell, p) in n.cells.iter().zip(&parsed.processes) {
            if cell != "-" {
                assert!(artifact.has_shape(&n.name, &p.process), "{} / {}", n.name, p.process);
            }
        }
    }
    for r in &parsed.rate_params {
        assert!(artifact.histograms.contains_key(&r.process));
    }
    let text = std::fs::read_to_string(&card_path).unwrap();
    assert_eq!(text.matches("rateParam").count(), 1);
    assert!(text.contains("shapes * * Signal_2018_Dilepton.json $PROCESS $SYSTEMATIC/$PROCESS"));
    std::fs::remove_dir_all(&dir).unwrap();
}
