//! Line-based model cards.
//!
//! ```text
//! imax * number of channels
//! jmax * number of processes minus 1
//! kmax * number of nuisance parameters
//! --------------------------------------------------
//! shapes * * Signal_2018_Dilepton.json $PROCESS $SYSTEMATIC/$PROCESS
//! --------------------------------------------------
//! bin          Dilepton
//! observation  -1
//! --------------------------------------------------
//! bin          Dilepton  Dilepton
//! process      ttt       ttz
//! process      0         1
//! rate         -1        -1
//! --------------------------------------------------
//! lumi_2018    lnN       1.025     1.025
//! syst_error group = lumi_2018
//! rate_ttz rateParam * ttz 1.0
//! * autoMCStats 0
//! ```

use std::fmt::Write;

use ttt_core::{Error, Result};

/// Section separator.
pub const SEPARATOR_WIDTH: usize = 50;

/// Pattern of nominal templates inside the artifact.
pub const NOMINAL_PATTERN: &str = "$PROCESS";

/// Pattern of variation templates inside the artifact.
pub const SYSTEMATIC_PATTERN: &str = "$SYSTEMATIC/$PROCESS";

/// A `shapes` line.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapesLine {
    /// Process (`*` for all).
    pub process: String,
    /// Channel (`*` for all).
    pub channel: String,
    /// Artifact path, relative to the card.
    pub file: String,
    /// Nominal pattern.
    pub nominal: String,
    /// Variation pattern.
    pub systematic: String,
}

impl ShapesLine {
    /// The usual wildcard line binding every process of every channel to `file`.
    pub fn wildcard(file: &str) -> Self {
        Self {
            process: "*".into(),
            channel: "*".into(),
            file: file.to_string(),
            nominal: NOMINAL_PATTERN.into(),
            systematic: SYSTEMATIC_PATTERN.into(),
        }
    }
}

/// One column of the process table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessColumn {
    /// Channel.
    pub bin: String,
    /// Process name.
    pub process: String,
    /// Index: signals ≤ 0, backgrounds > 0.
    pub index: i32,
    /// Expected rate, `-1` to take it from the artifact.
    pub rate: f64,
}

/// One nuisance row.
#[derive(Debug, Clone, PartialEq)]
pub struct NuisanceRow {
    /// Rendered name.
    pub name: String,
    /// `lnN`, `shape`, ...
    pub kind: String,
    /// One cell per process column; `-` when it does not apply.
    pub cells: Vec<String>,
}

/// A `rateParam` line.
#[derive(Debug, Clone, PartialEq)]
pub struct RateParam {
    /// Parameter name.
    pub name: String,
    /// Channel (`*` for all).
    pub bin: String,
    /// Process.
    pub process: String,
    /// Initial value.
    pub value: f64,
}

/// A parsed or built card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataCard {
    /// `shapes` lines.
    pub shapes: Vec<ShapesLine>,
    /// Channels with their observation (`-1`: from the artifact).
    pub observations: Vec<(String, f64)>,
    /// Process table.
    pub processes: Vec<ProcessColumn>,
    /// Nuisance rows.
    pub nuisances: Vec<NuisanceRow>,
    /// `group` declarations.
    pub groups: Vec<(String, Vec<String>)>,
    /// `rateParam` lines.
    pub rate_params: Vec<RateParam>,
    /// `autoMCStats` channels (`*` for all) with their event threshold.
    pub auto_mc_stats: Vec<(String, u32)>,
}

fn fmt_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn table(rows: &[Vec<String>]) -> String {
    let n = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0; n];
    for row in rows {
        for (i, c) in row.iter().enumerate() {
            widths[i] = widths[i].max(c.len());
        }
    }
    let mut out = String::new();
    for row in rows {
        let cells: Vec<String> =
            row.iter().enumerate().map(|(i, c)| format!("{c:<w$}", w = widths[i])).collect();
        out.push_str(cells.join("  ").trim_end());
        out.push('\n');
    }
    out
}

impl DataCard {
    /// Process names in table order.
    pub fn process_names(&self) -> Vec<&str> {
        self.processes.iter().map(|p| p.process.as_str()).collect()
    }

    /// Nuisance row by name.
    pub fn nuisance(&self, name: &str) -> Option<&NuisanceRow> {
        self.nuisances.iter().find(|n| n.name == name)
    }

    /// Channel names.
    pub fn bins(&self) -> Vec<&str> {
        self.observations.iter().map(|(b, _)| b.as_str()).collect()
    }

    /// Check that every nuisance row has one cell per process column.
    pub fn validate(&self) -> Result<()> {
        for n in &self.nuisances {
            if n.cells.len() != self.processes.len() {
                return Err(Error::Validation(format!(
                    "nuisance '{}' has {} cells for {} processes",
                    n.name,
                    n.cells.len(),
                    self.processes.len()
                )));
            }
        }
        Ok(())
    }

    /// Card text.
    pub fn render(&self) -> String {
        let sep = "-".repeat(SEPARATOR_WIDTH);
        let mut out = String::new();
        out.push_str("imax * number of channels\n");
        out.push_str("jmax * number of processes minus 1\n");
        out.push_str("kmax * number of nuisance parameters\n");
        let _ = writeln!(out, "{sep}");
        for s in &self.shapes {
            let _ = writeln!(
                out,
                "shapes {} {} {} {} {}",
                s.process, s.channel, s.file, s.nominal, s.systematic
            );
        }
        let _ = writeln!(out, "{sep}");

        let mut obs = vec![vec!["bin".to_string()], vec!["observation".to_string()]];
        for (b, o) in &self.observations {
            obs[0].push(b.clone());
            obs[1].push(fmt_number(*o));
        }
        out.push_str(&table(&obs));
        let _ = writeln!(out, "{sep}");

        let mut rows: Vec<Vec<String>> = vec![
            vec!["bin".into(), String::new()],
            vec!["process".into(), String::new()],
            vec!["process".into(), String::new()],
            vec!["rate".into(), String::new()],
        ];
        for p in &self.processes {
            rows[0].push(p.bin.clone());
            rows[1].push(p.process.clone());
            rows[2].push(p.index.to_string());
            rows[3].push(fmt_number(p.rate));
        }
        let table_end = rows.len();
        for n in &self.nuisances {
            let mut row = vec![n.name.clone(), n.kind.clone()];
            row.extend(n.cells.iter().cloned());
            rows.push(row);
        }
        let text = table(&rows);
        for (i, line) in text.lines().enumerate() {
            if i == table_end {
                let _ = writeln!(out, "{sep}");
            }
            let _ = writeln!(out, "{line}");
        }
        if self.nuisances.is_empty() {
            let _ = writeln!(out, "{sep}");
        }

        for (g, names) in &self.groups {
            let _ = writeln!(out, "{g} group = {}", names.join(" "));
        }
        for r in &self.rate_params {
            let _ = writeln!(out, "{} rateParam {} {} {:.1}", r.name, r.bin, r.process, r.value);
        }
        for (b, t) in &self.auto_mc_stats {
            let _ = writeln!(out, "{b} autoMCStats {t}");
        }
        out
    }

    /// Parse card text.
    ///
    /// Understands the subset [`render`](Self::render) writes: wildcard
    /// counts, `shapes`, the observation block, the process table, nuisance
    /// rows, `group`, `rateParam` and `autoMCStats` lines.
    pub fn parse(text: &str) -> Result<Self> {
        let mut card = DataCard::default();
        let mut bins: Option<Vec<String>> = None;
        let mut table_bins: Option<Vec<String>> = None;
        let mut names: Option<Vec<String>> = None;
        let mut indices: Option<Vec<i32>> = None;

        for (no, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() || line.starts_with('-') {
                continue;
            }
            let tok: Vec<&str> = line.split_whitespace().collect();
            let err = |msg: &str| Error::Validation(format!("card line {}: {msg}: '{line}'", no + 1));
            match tok.as_slice() {
                ["imax" | "jmax" | "kmax", ..] => {}
                ["shapes", process, channel, file, nominal, rest @ ..] => card.shapes.push(ShapesLine {
                    process: process.to_string(),
                    channel: channel.to_string(),
                    file: file.to_string(),
                    nominal: nominal.to_string(),
                    systematic: rest.first().map_or_else(String::new, |s| s.to_string()),
                }),
                ["bin", rest @ ..] if bins.is_none() => {
                    bins = Some(rest.iter().map(|s| s.to_string()).collect());
                }
                ["observation", rest @ ..] => {
                    let b = bins.as_ref().ok_or_else(|| err("observation before bin"))?;
                    if rest.len() != b.len() {
                        return Err(err("observation count does not match bins"));
                    }
                    for (b, o) in b.iter().zip(rest) {
                        let o: f64 = o.parse().map_err(|_| err("bad observation"))?;
                        card.observations.push((b.clone(), o));
                    }
                }
                ["bin", rest @ ..] => table_bins = Some(rest.iter().map(|s| s.to_string()).collect()),
                ["process", rest @ ..] if names.is_none() => {
                    names = Some(rest.iter().map(|s| s.to_string()).collect());
                }
                ["process", rest @ ..] => {
                    let parsed: std::result::Result<Vec<i32>, _> = rest.iter().map(|s| s.parse()).collect();
                    indices = Some(parsed.map_err(|_| err("bad process index"))?);
                }
                ["rate", rest @ ..] => {
                    let (Some(b), Some(n), Some(i)) = (&table_bins, &names, &indices) else {
                        return Err(err("rate before the process table"));
                    };
                    if [b.len(), n.len(), i.len()].iter().any(|l| *l != rest.len()) {
                        return Err(err("process table columns do not line up"));
                    }
                    for (k, r) in rest.iter().enumerate() {
                        card.processes.push(ProcessColumn {
                            bin: b[k].clone(),
                            process: n[k].clone(),
                            index: i[k],
                            rate: r.parse().map_err(|_| err("bad rate"))?,
                        });
                    }
                }
                [name, "group", "=", members @ ..] => {
                    card.groups.push((name.to_string(), members.iter().map(|s| s.to_string()).collect()));
                }
                [name, "rateParam", bin, process, value, ..] => card.rate_params.push(RateParam {
                    name: name.to_string(),
                    bin: bin.to_string(),
                    process: process.to_string(),
                    value: value.parse().map_err(|_| err("bad rateParam value"))?,
                }),
                [bin, "autoMCStats", threshold, ..] => card
                    .auto_mc_stats
                    .push((bin.to_string(), threshold.parse().map_err(|_| err("bad autoMCStats threshold"))?)),
                [name, kind, cells @ ..] if !card.processes.is_empty() => {
                    if cells.len() != card.processes.len() {
                        return Err(err("nuisance row does not match the process table"));
                    }
                    card.nuisances.push(NuisanceRow {
                        name: name.to_string(),
                        kind: kind.to_string(),
                        cells: cells.iter().map(|s| s.to_string()).collect(),
                    });
                }
                _ => return Err(err("unrecognised line")),
            }
        }
        Ok(card)
    }

    /// Read a card file.
    pub fn read(path: &std::path::Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Write the card text.
    pub fn write(&self, path: &std::path::Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> DataCard {
        DataCard {
            shapes: vec![ShapesLine::wildcard("Signal_2018_Dilepton.json")],
            observations: vec![("Dilepton".into(), -1.0)],
            processes: vec![
                ProcessColumn { bin: "Dilepton".into(), process: "ttt".into(), index: 0, rate: -1.0 },
                ProcessColumn { bin: "Dilepton".into(), process: "ttz".into(), index: 1, rate: -1.0 },
            ],
            nuisances: vec![
                NuisanceRow { name: "lumi_2018".into(), kind: "lnN".into(), cells: vec!["1.025".into(), "1.025".into()] },
                NuisanceRow { name: "Jet_JER_2018".into(), kind: "shape".into(), cells: vec!["-".into(), "1".into()] },
            ],
            groups: vec![("syst_error".into(), vec!["lumi_2018".into(), "Jet_JER_2018".into()])],
            rate_params: vec![RateParam { name: "rate_ttz".into(), bin: "*".into(), process: "ttz".into(), value: 1.0 }],
            auto_mc_stats: vec![("*".into(), 0)],
        }
    }

    #[test]
    fn renders_sections_in_order() {
        let text = card().render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "imax * number of channels");
        assert_eq!(lines[3], "-".repeat(50));
        assert_eq!(lines[4], "shapes * * Signal_2018_Dilepton.json $PROCESS $SYSTEMATIC/$PROCESS");
        assert!(lines[6].starts_with("bin") && lines[6].ends_with("Dilepton"));
        assert!(lines[7].starts_with("observation") && lines[7].ends_with("-1"));
        assert!(lines[10].starts_with("process") && lines[10].contains("ttt") && lines[10].ends_with("ttz"));
        assert!(lines[11].ends_with('1'));
        assert_eq!(lines[13], "-".repeat(50));
        assert!(lines[14].starts_with("lumi_2018") && lines[14].contains("lnN"));
        assert!(text.contains("\nsyst_error group = lumi_2018 Jet_JER_2018\n"));
        assert!(text.contains("\nrate_ttz rateParam * ttz 1.0\n"));
        assert!(text.ends_with("* autoMCStats 0\n"));
    }

    #[test]
    fn parse_inverts_render() {
        let c = card();
        assert_eq!(DataCard::parse(&c.render()).unwrap(), c);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let mut c = card();
        c.nuisances[1].cells.push("1".into());
        assert!(c.validate().is_err());
        let bad = format!("{}extra lnN 1.1\n", card().render());
        assert!(DataCard::parse(&bad).is_err());
    }
}
