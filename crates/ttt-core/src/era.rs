//! Data-taking eras.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One data-taking period with its own calibration and luminosity.
///
/// Serialised as its label. Integer labels (`2018` unquoted in YAML) are
/// accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "EraRepr", into = "String")]
pub enum Era {
    /// 2016, pre-VFP.
    Y2016Pre,
    /// 2016, post-VFP.
    Y2016Post,
    /// 2017.
    Y2017,
    /// 2018.
    Y2018,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EraRepr {
    Label(String),
    Number(u64),
}

impl TryFrom<EraRepr> for Era {
    type Error = Error;

    fn try_from(r: EraRepr) -> Result<Self> {
        match r {
            EraRepr::Label(s) => s.parse(),
            EraRepr::Number(n) => n.to_string().parse(),
        }
    }
}

impl From<Era> for String {
    fn from(e: Era) -> Self {
        e.as_str().to_string()
    }
}

impl Era {
    /// Every era in chronological order.
    pub const ALL: [Era; 4] = [Era::Y2016Pre, Era::Y2016Post, Era::Y2017, Era::Y2018];

    /// Label used in file names and rendered nuisance names.
    pub fn as_str(self) -> &'static str {
        match self {
            Era::Y2016Pre => "2016pre",
            Era::Y2016Post => "2016post",
            Era::Y2017 => "2017",
            Era::Y2018 => "2018",
        }
    }

    /// Integrated luminosity in fb^-1 used when the run config does not override it.
    pub fn default_lumi(self) -> f64 {
        match self {
            Era::Y2016Pre => 19.52,
            Era::Y2016Post => 16.81,
            Era::Y2017 => 41.48,
            Era::Y2018 => 59.83,
        }
    }
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Era {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "2016pre" => Ok(Era::Y2016Pre),
            "2016post" => Ok(Era::Y2016Post),
            "2017" => Ok(Era::Y2017),
            "2018" => Ok(Era::Y2018),
            other => Err(Error::Configuration(format!("unknown year '{other}'"))),
        }
    }
}

/// Parse a `--years` argument: `all` or a comma separated list.
///
/// Duplicates are removed and the result is in chronological order.
pub fn parse_years(arg: &str) -> Result<Vec<Era>> {
    if arg.trim().eq_ignore_ascii_case("all") {
        return Ok(Era::ALL.to_vec());
    }
    let mut out = Vec::new();
    for tok in arg.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let era: Era = tok.parse()?;
        if !out.contains(&era) {
            out.push(era);
        }
    }
    if out.is_empty() {
        return Err(Error::Configuration("no years selected".into()));
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_and_lists() {
        assert_eq!(parse_years("all").unwrap(), Era::ALL.to_vec());
        assert_eq!(parse_years("2018, 2016pre,2018").unwrap(), vec![Era::Y2016Pre, Era::Y2018]);
        assert!(parse_years("2015").is_err());
        assert!(parse_years(" , ").is_err());
    }

    #[test]
    fn serde_uses_labels() {
        let s = serde_json::to_string(&Era::Y2016Post).unwrap();
        assert_eq!(s, "\"2016post\"");
        let e: Era = serde_json::from_str("\"2017\"").unwrap();
        assert_eq!(e, Era::Y2017);
        let e: Vec<Era> = serde_yaml_ng::from_str("[2018, 2016pre]").unwrap();
        assert_eq!(e, vec![Era::Y2018, Era::Y2016Pre]);
        assert!(serde_json::from_str::<Era>("2015").is_err());
    }
}
