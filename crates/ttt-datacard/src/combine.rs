//! Native card combination with channel prefixes.

use std::collections::BTreeMap;
use std::path::Path;

use ttt_core::{Error, Result};

use crate::card::{DataCard, NuisanceRow, ProcessColumn, RateParam, ShapesLine};

/// One card entering a combination.
#[derive(Debug, Clone)]
pub struct CardPiece {
    /// Channel prefix (`yr2018_Dilepton`, `Multi`, ...).
    pub prefix: String,
    /// The card.
    pub card: DataCard,
    /// Directory of the piece relative to the combined card; prepended to
    /// relative artifact paths.
    pub dir: String,
}

impl CardPiece {
    /// Piece living in the same directory as the combined card.
    pub fn new(prefix: &str, card: DataCard) -> Self {
        Self { prefix: prefix.to_string(), card, dir: String::new() }
    }

    /// Set the relative directory.
    pub fn in_dir(mut self, dir: &str) -> Self {
        self.dir = dir.to_string();
        self
    }

    fn rename(&self, bin: &str) -> String {
        if self.card.observations.len() == 1 {
            self.prefix.clone()
        } else {
            format!("{}_{bin}", self.prefix)
        }
    }

    fn relocate(&self, file: &str) -> String {
        if self.dir.is_empty() || Path::new(file).is_absolute() {
            file.to_string()
        } else {
            Path::new(&self.dir).join(file).to_string_lossy().into_owned()
        }
    }
}

/// Concatenate cards.
///
/// Channels are renamed to the piece prefix (or `<prefix>_<channel>` for
/// multi-channel pieces). Process indices are reassigned: signals keep
/// non-positive indices, backgrounds positive ones, consistently across
/// pieces. Nuisances are merged by name with `-` for pieces lacking them;
/// group members, rate parameters and `autoMCStats` lines are merged without
/// duplicates.
pub fn combine_cards(pieces: &[CardPiece]) -> Result<DataCard> {
    if pieces.is_empty() {
        return Err(Error::Validation("nothing to combine".into()));
    }
    let mut out = DataCard::default();

    let mut signals: Vec<String> = Vec::new();
    let mut backgrounds: Vec<String> = Vec::new();
    for p in pieces {
        for c in &p.card.processes {
            let list = if c.index <= 0 { &mut signals } else { &mut backgrounds };
            if !list.contains(&c.process) {
                list.push(c.process.clone());
            }
        }
    }
    if let Some(both) = signals.iter().find(|s| backgrounds.contains(s)) {
        return Err(Error::Validation(format!("'{both}' is signal in one card and background in another")));
    }
    let index_of = |name: &str| -> i32 {
        match signals.iter().position(|s| s == name) {
            Some(i) => -(i as i32),
            None => backgrounds.iter().position(|b| b == name).map_or(0, |i| i as i32 + 1),
        }
    };

    let mut kinds: BTreeMap<String, String> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for p in pieces {
        for n in &p.card.nuisances {
            match kinds.get(&n.name) {
                Some(k) if *k != n.kind => {
                    return Err(Error::Validation(format!(
                        "nuisance '{}' is {k} in one card and {} in another",
                        n.name, n.kind
                    )));
                }
                Some(_) => {}
                None => {
                    kinds.insert(n.name.clone(), n.kind.clone());
                    order.push(n.name.clone());
                }
            }
        }
    }
    let mut rows: Vec<NuisanceRow> = order
        .iter()
        .map(|n| NuisanceRow { name: n.clone(), kind: kinds[n].clone(), cells: Vec::new() })
        .collect();

    for p in pieces {
        p.card.validate()?;
        for s in &p.card.shapes {
            let channels: Vec<String> = if s.channel == "*" {
                p.card.observations.iter().map(|(b, _)| p.rename(b)).collect()
            } else {
                vec![p.rename(&s.channel)]
            };
            for channel in channels {
                out.shapes.push(ShapesLine { channel, file: p.relocate(&s.file), ..s.clone() });
            }
        }
        for (b, o) in &p.card.observations {
            out.observations.push((p.rename(b), *o));
        }
        for c in &p.card.processes {
            out.processes.push(ProcessColumn {
                bin: p.rename(&c.bin),
                process: c.process.clone(),
                index: index_of(&c.process),
                rate: c.rate,
            });
        }
        for row in &mut rows {
            match p.card.nuisance(&row.name) {
                Some(n) => row.cells.extend(n.cells.iter().cloned()),
                None => row.cells.extend(std::iter::repeat_n("-".to_string(), p.card.processes.len())),
            }
        }
        for (g, names) in &p.card.groups {
            match out.groups.iter_mut().find(|(name, _)| name == g) {
                Some((_, existing)) => {
                    for n in names {
                        if !existing.contains(n) {
                            existing.push(n.clone());
                        }
                    }
                }
                None => out.groups.push((g.clone(), names.clone())),
            }
        }
        for r in &p.card.rate_params {
            let bin = if r.bin == "*" { r.bin.clone() } else { p.rename(&r.bin) };
            let r = RateParam { bin, ..r.clone() };
            if !out.rate_params.contains(&r) {
                out.rate_params.push(r);
            }
        }
        for (b, t) in &p.card.auto_mc_stats {
            let entry = (if b == "*" { b.clone() } else { p.rename(b) }, *t);
            if !out.auto_mc_stats.contains(&entry) {
                out.auto_mc_stats.push(entry);
            }
        }
    }
    out.nuisances = rows;
    out.validate()?;
    tracing::debug!(
        pieces = pieces.len(),
        channels = out.observations.len(),
        nuisances = out.nuisances.len(),
        "combined cards"
    );
    Ok(out)
}
