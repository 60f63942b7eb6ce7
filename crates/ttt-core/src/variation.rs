//! Systematic variation names.
//!
//! Weight columns in the ntuples are named `Nominal` or `<syst>_up` /
//! `<syst>_down`. The fitter expects `<rendered>Up` / `<rendered>Down`.

use std::fmt;

/// Name of the central weight column.
pub const NOMINAL: &str = "Nominal";

/// Direction of a one-sided shape variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Upward shift.
    Up,
    /// Downward shift.
    Down,
}

impl Direction {
    /// Both directions, up first.
    pub const BOTH: [Direction; 2] = [Direction::Up, Direction::Down];

    /// Suffix used in ntuple column names.
    pub fn column_suffix(self) -> &'static str {
        match self {
            Direction::Up => "_up",
            Direction::Down => "_down",
        }
    }

    /// Suffix used in artifact directories and card names.
    pub fn fitter_suffix(self) -> &'static str {
        match self {
            Direction::Up => "Up",
            Direction::Down => "Down",
        }
    }

    /// The other direction.
    pub fn flip(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// A parsed variation column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Variation {
    /// The central value.
    Nominal,
    /// One half of an up/down pair.
    Shift {
        /// Base name without the direction suffix.
        base: String,
        /// Direction of the shift.
        dir: Direction,
    },
    /// A column that follows neither convention.
    Other(String),
}

impl Variation {
    /// Classify a weight column name.
    pub fn parse(name: &str) -> Variation {
        if name == NOMINAL {
            return Variation::Nominal;
        }
        if let Some((base, tail)) = name.rsplit_once('_')
            && !base.is_empty()
        {
            let dir = match tail {
                "up" | "Up" => Some(Direction::Up),
                "down" | "Down" => Some(Direction::Down),
                _ => None,
            };
            if let Some(dir) = dir {
                return Variation::Shift { base: base.to_string(), dir };
            }
        }
        Variation::Other(name.to_string())
    }

    /// Column name for this variation.
    pub fn column(&self) -> String {
        match self {
            Variation::Nominal => NOMINAL.to_string(),
            Variation::Shift { base, dir } => format!("{base}{}", dir.column_suffix()),
            Variation::Other(s) => s.clone(),
        }
    }

    /// `true` for the central value.
    pub fn is_nominal(&self) -> bool {
        matches!(self, Variation::Nominal)
    }
}

impl fmt::Display for Variation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.column())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_column_names() {
        assert_eq!(Variation::parse("Nominal"), Variation::Nominal);
        assert_eq!(
            Variation::parse("Jet_JER_up"),
            Variation::Shift { base: "Jet_JER".into(), dir: Direction::Up }
        );
        assert_eq!(
            Variation::parse("LHE_muF_down"),
            Variation::Shift { base: "LHE_muF".into(), dir: Direction::Down }
        );
        assert_eq!(Variation::parse("weird"), Variation::Other("weird".into()));
        assert_eq!(Variation::parse("_up"), Variation::Other("_up".into()));
    }

    #[test]
    fn column_round_trip() {
        for name in ["Nominal", "PU_up", "BJet_Eff_down", "custom"] {
            assert_eq!(Variation::parse(name).column(), name);
        }
        assert_eq!(Direction::Up.flip(), Direction::Down);
    }
}
