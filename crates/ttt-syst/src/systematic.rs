//! Systematic descriptors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use ttt_core::{Direction, Era, Error, Result};

/// Wildcard group key: applies to every group without its own entry.
pub const ALL_GROUPS: &str = "all";

/// Suffix marking the smoothed twin of a shape nuisance.
pub const SMOOTHED_SUFFIX: &str = "_lowess";

/// Nuisance kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystKind {
    /// Log-normal rate uncertainty.
    #[serde(rename = "lnN")]
    LnN,
    /// Template (up/down) shape uncertainty.
    #[serde(rename = "shape")]
    Shape,
}

impl SystKind {
    /// Label used in the card.
    pub fn as_str(self) -> &'static str {
        match self {
            SystKind::LnN => "lnN",
            SystKind::Shape => "shape",
        }
    }
}

impl fmt::Display for SystKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size of a nuisance for one (group, year).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MagnitudeRepr", into = "MagnitudeRepr")]
pub enum Magnitude {
    /// One factor, e.g. `1.02`.
    Symmetric(f64),
    /// Asymmetric `down/up` pair, e.g. `0.95/1.04`.
    Asymmetric {
        /// Factor applied for the downward variation.
        down: f64,
        /// Factor applied for the upward variation.
        up: f64,
    },
}

impl Magnitude {
    /// Card cell text.
    pub fn render(&self) -> String {
        match self {
            Magnitude::Symmetric(v) => format!("{v}"),
            Magnitude::Asymmetric { down, up } => format!("{down}/{up}"),
        }
    }
}

impl fmt::Display for Magnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for Magnitude {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |t: &str| {
            t.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| Error::Configuration(format!("invalid magnitude '{s}'")))
        };
        match s.split_once('/') {
            Some((d, u)) => Ok(Magnitude::Asymmetric { down: parse(d)?, up: parse(u)? }),
            None => Ok(Magnitude::Symmetric(parse(s)?)),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MagnitudeRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<MagnitudeRepr> for Magnitude {
    type Error = Error;

    fn try_from(r: MagnitudeRepr) -> Result<Self> {
        match r {
            MagnitudeRepr::Number(v) if v.is_finite() && v > 0.0 => Ok(Magnitude::Symmetric(v)),
            MagnitudeRepr::Number(v) => {
                Err(Error::Configuration(format!("invalid magnitude {v}")))
            }
            MagnitudeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<Magnitude> for MagnitudeRepr {
    fn from(m: Magnitude) -> Self {
        match m {
            Magnitude::Symmetric(v) => MagnitudeRepr::Number(v),
            m @ Magnitude::Asymmetric { .. } => MagnitudeRepr::Text(m.render()),
        }
    }
}

/// One nuisance definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Systematic {
    name: String,
    kind: SystKind,
    correlated: bool,
    dname: Option<String>,
    smooth: bool,
    up_column: String,
    down_column: String,
    channels: Option<BTreeSet<String>>,
    entries: BTreeMap<Era, BTreeMap<String, Magnitude>>,
}

impl Systematic {
    /// New descriptor. Shape columns default to `<name>_up` / `<name>_down`.
    pub fn new(name: impl Into<String>, kind: SystKind) -> Self {
        let name = name.into();
        Self {
            up_column: format!("{name}{}", Direction::Up.column_suffix()),
            down_column: format!("{name}{}", Direction::Down.column_suffix()),
            name,
            kind,
            correlated: false,
            dname: None,
            smooth: false,
            channels: None,
            entries: BTreeMap::new(),
        }
    }

    /// Log-normal nuisance.
    pub fn lnn(name: impl Into<String>) -> Self {
        Self::new(name, SystKind::LnN)
    }

    /// Shape nuisance.
    pub fn shape(name: impl Into<String>) -> Self {
        Self::new(name, SystKind::Shape)
    }

    /// Correlate across years (no year suffix in the rendered name).
    pub fn correlated(mut self) -> Self {
        self.correlated = true;
        self
    }

    /// Set the correlation flag.
    pub fn with_correlated(mut self, correlated: bool) -> Self {
        self.correlated = correlated;
        self
    }

    /// External display name (defaults to the logical name).
    pub fn dname(mut self, dname: impl Into<String>) -> Self {
        self.dname = Some(dname.into());
        self
    }

    /// Mark the shape for LOWESS smoothing.
    pub fn smooth(mut self) -> Self {
        self.smooth = true;
        self
    }

    /// Set the smoothing flag.
    pub fn with_smooth(mut self, smooth: bool) -> Self {
        self.smooth = smooth;
        self
    }

    /// Override the variation columns.
    pub fn columns(mut self, up: impl Into<String>, down: impl Into<String>) -> Self {
        self.up_column = up.into();
        self.down_column = down.into();
        self
    }

    /// Restrict to some channels.
    pub fn channels<S: AsRef<str>>(mut self, channels: &[S]) -> Self {
        self.channels = Some(channels.iter().map(|c| c.as_ref().to_string()).collect());
        self
    }

    /// Add a magnitude for some groups in some years.
    ///
    /// An empty `groups` slice means every group ([`ALL_GROUPS`]).
    pub fn add<S: AsRef<str>>(mut self, magnitude: Magnitude, groups: &[S], eras: &[Era]) -> Self {
        for era in eras {
            let slot = self.entries.entry(*era).or_default();
            if groups.is_empty() {
                slot.insert(ALL_GROUPS.to_string(), magnitude);
            } else {
                for g in groups {
                    slot.insert(g.as_ref().to_string(), magnitude);
                }
            }
        }
        self
    }

    /// [`add`](Self::add) for every era.
    pub fn add_all_years<S: AsRef<str>>(self, magnitude: Magnitude, groups: &[S]) -> Self {
        self.add(magnitude, groups, &Era::ALL)
    }

    /// Logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind.
    pub fn kind(&self) -> SystKind {
        self.kind
    }

    /// `true` for shape nuisances.
    pub fn is_shape(&self) -> bool {
        self.kind == SystKind::Shape
    }

    /// Correlated across years.
    pub fn is_correlated(&self) -> bool {
        self.correlated
    }

    /// Marked for smoothing.
    pub fn is_smoothed(&self) -> bool {
        self.smooth
    }

    /// Up variation column.
    pub fn up_column(&self) -> &str {
        &self.up_column
    }

    /// Down variation column.
    pub fn down_column(&self) -> &str {
        &self.down_column
    }

    /// Column of one direction.
    pub fn column(&self, dir: Direction) -> &str {
        match dir {
            Direction::Up => &self.up_column,
            Direction::Down => &self.down_column,
        }
    }

    /// Base of the external label.
    pub fn base_name(&self) -> &str {
        self.dname.as_deref().unwrap_or(&self.name)
    }

    /// Channels the nuisance is restricted to (`None`: every channel).
    pub fn channel_set(&self) -> Option<&BTreeSet<String>> {
        self.channels.as_ref()
    }

    /// Magnitude for a group in a year: the group's own entry, else the wildcard.
    pub fn magnitude(&self, group: &str, era: Era) -> Option<Magnitude> {
        let slot = self.entries.get(&era)?;
        slot.get(group).or_else(|| slot.get(ALL_GROUPS)).copied()
    }

    /// Groups named explicitly for a year.
    pub fn groups_in(&self, era: Era) -> impl Iterator<Item = &str> {
        self.entries.get(&era).into_iter().flat_map(|m| m.keys().map(String::as_str))
    }

    /// Whether the nuisance enters the model for (group, year, channel).
    pub fn applies_to(&self, group: &str, era: Era, channel: &str) -> bool {
        if let Some(ch) = &self.channels
            && !ch.contains(channel)
        {
            return false;
        }
        self.magnitude(group, era).is_some()
    }

    /// Whether the nuisance is defined at all in a year and channel.
    pub fn active_in(&self, era: Era, channel: &str) -> bool {
        let channel_ok = self.channels.as_ref().is_none_or(|c| c.contains(channel));
        channel_ok && self.entries.get(&era).is_some_and(|m| !m.is_empty())
    }

    /// Direction of a column of this nuisance.
    pub fn direction_of(&self, column: &str) -> Option<Direction> {
        if column == self.up_column {
            Some(Direction::Up)
        } else if column == self.down_column {
            Some(Direction::Down)
        } else {
            None
        }
    }
}
