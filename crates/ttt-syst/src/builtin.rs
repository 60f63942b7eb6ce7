//! The three-top nuisance model.

use ttt_core::{Era, Result};

use crate::catalog::SystematicCatalog;
use crate::systematic::{Magnitude, Systematic};

/// Simulated groups every detector and theory nuisance applies to.
pub const MC_SAMPLES: [&str; 10] =
    ["ttt", "xg", "ttw", "tth", "ttz", "ttXY", "rare", "4top", "tttj", "tttw"];

/// Name of the placeholder nuisance written when systematics are disabled.
pub const DUMMY_NAME: &str = "dummy";

/// Magnitude of the placeholder nuisance.
pub const DUMMY_MAGNITUDE: f64 = 1.0001;

fn per_year(name: &str, values: [(Era, f64); 4]) -> Systematic {
    values
        .into_iter()
        .fold(Systematic::lnn(name), |s, (era, v)| s.add(Magnitude::Symmetric(v), &MC_SAMPLES, &[era]))
}

fn shape(name: &str, dname: Option<&str>, correlated: bool) -> Systematic {
    let s = Systematic::shape(name).with_correlated(correlated);
    let s = match dname {
        Some(d) => s.dname(d),
        None => s,
    };
    s.add_all_years(Magnitude::Symmetric(1.0), &MC_SAMPLES)
}

fn jet_energy(name: &str, dname: &str, correlated: bool) -> Systematic {
    shape(name, Some(dname), correlated).smooth()
}

/// The full catalog: luminosity, theory, b-tagging, lepton and jet ID, jet
/// energy scale and resolution, pileup and the data-driven estimates.
pub fn default_catalog() -> Result<SystematicCatalog> {
    let unit = Magnitude::Symmetric(1.0);
    SystematicCatalog::from_systematics([
        per_year(
            "LUMI_RUN2",
            [(Era::Y2016Pre, 1.006), (Era::Y2016Post, 1.006), (Era::Y2017, 1.009), (Era::Y2018, 1.020)],
        )
        .correlated(),
        Systematic::lnn("LUMI_17_18")
            .correlated()
            .add(Magnitude::Symmetric(1.006), &MC_SAMPLES, &[Era::Y2017])
            .add(Magnitude::Symmetric(1.002), &MC_SAMPLES, &[Era::Y2018]),
        per_year(
            "LUMI_",
            [(Era::Y2016Pre, 1.010), (Era::Y2016Post, 1.010), (Era::Y2017, 1.020), (Era::Y2018, 1.015)],
        ),
        // theory
        shape("LHE_muF", Some("MUF"), true),
        shape("LHE_muR", Some("MUR"), true),
        shape("PDF_unc", Some("PDF"), true),
        shape("PDF_alphaZ", Some("ALPHAS"), true),
        shape("PS_ISR", Some("ISR"), true),
        shape("PS_FSR", Some("FSR"), true),
        // b-tagging
        shape("BJet_Shape_lf", Some("LF"), true),
        shape("BJet_Shape_lfstats1", Some("LFSTATS1"), false),
        shape("BJet_Shape_lfstats2", Some("LFSTATS2"), false),
        shape("BJet_Shape_hf", Some("HF"), true),
        shape("BJet_Shape_hfstats1", Some("HFSTATS1"), false),
        shape("BJet_Shape_hfstats2", Some("HFSTATS2"), false),
        shape("BJet_Shape_cferr1", Some("CFERR1"), true),
        shape("BJet_Shape_cferr2", Some("CFERR2"), true),
        // lepton and jet identification
        shape("Muon_Scale", Some("ID_MU_"), false),
        shape("Electron_Scale", Some("ID_EL_"), false),
        shape("Muon_tthMVA", None, false),
        shape("Electron_tthMVA", None, false),
        shape("Jet_PUID", Some("PILEUPJETID"), true),
        // jet energy
        jet_energy("Jet_JER", "JER", false),
        jet_energy("Jet_JEC_Absolute", "JECABSOLUTE", false),
        jet_energy("Jet_JEC_Absolute_corr", "JECABSOLUTE", true),
        jet_energy("Jet_JEC_BBEC1", "JECBBEC1", false),
        jet_energy("Jet_JEC_BBEC1_corr", "JECBBEC1", true),
        jet_energy("Jet_JEC_EC2", "JECEC2", false),
        jet_energy("Jet_JEC_EC2_corr", "JECEC2", true),
        jet_energy("Jet_JEC_HF", "JECHF", false),
        jet_energy("Jet_JEC_HF_corr", "JECHF", true),
        jet_energy("Jet_JEC_AbsoluteBal", "JECRELATIVEBAL", true),
        jet_energy("Jet_JEC_AbsoluteSample", "JECRELATIVESAMPLE", false),
        jet_energy("Jet_JEC_FlavorQCD", "JECFLAVORQCD", true),
        // other
        shape("Prefire", Some("PREFIRE"), false),
        shape("TriggerSF", None, false),
        shape("Pileup", Some("PILEUP"), true),
        // data-driven estimates
        Systematic::shape("ChargeMisId_stat").add_all_years(unit, &["charge_flip"]),
        Systematic::shape("Nonprompt_Mu_stat").add_all_years(unit, &["nonprompt"]),
        Systematic::shape("Nonprompt_El_stat").add_all_years(unit, &["nonprompt"]),
        Systematic::lnn("Nonprompt_closure").add_all_years(Magnitude::Symmetric(1.3), &["nonprompt"]),
        Systematic::lnn("ChargeMisId_closure").add_all_years(Magnitude::Symmetric(1.2), &["charge_flip"]),
    ])
}

/// Placeholder lnN nuisance that keeps a card without systematics valid.
pub fn dummy_systematic(group: &str) -> Systematic {
    Systematic::lnn(DUMMY_NAME).correlated().add_all_years(Magnitude::Symmetric(DUMMY_MAGNITUDE), &[group])
}
