//! Process groups: which members make up each model process, and which
//! (member, tree) pairs feed each group.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use ttt_core::{Error, Result};

/// Name the fitter expects for the observed data template.
pub const DATA_OBS: &str = "data_obs";

/// How a group's events are weighted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Simulated samples.
    #[default]
    Simulation,
    /// Collision data.
    Data,
    /// Estimate drawn from a control tree with stored transfer weights.
    DataDriven,
}

/// One model process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessGroup {
    /// Logical name.
    pub name: String,
    /// Dataset tags. `@other` pulls in every member of group `other`.
    #[serde(default)]
    pub members: Vec<String>,
    /// Label in the artifact and card (defaults to `name`).
    #[serde(default)]
    pub combine_name: Option<String>,
    /// Weighting.
    #[serde(default)]
    pub kind: GroupKind,
    /// Signal process (non-positive process index).
    #[serde(default)]
    pub signal: bool,
}

impl ProcessGroup {
    /// Simulated group.
    pub fn simulation<S: AsRef<str>>(name: &str, members: &[S]) -> Self {
        Self {
            name: name.to_string(),
            members: members.iter().map(|m| m.as_ref().to_string()).collect(),
            combine_name: None,
            kind: GroupKind::Simulation,
            signal: false,
        }
    }

    /// Mark as signal.
    pub fn signal(mut self) -> Self {
        self.signal = true;
        self
    }

    /// Set the weighting kind.
    pub fn kind(mut self, kind: GroupKind) -> Self {
        self.kind = kind;
        self
    }

    /// Rename for the fitter.
    pub fn combine_as(mut self, name: &str) -> Self {
        self.combine_name = Some(name.to_string());
        self
    }
}

/// The ordered set of process groups of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessGroups {
    groups: Vec<ProcessGroup>,
}

impl ProcessGroups {
    /// Validate and wrap a group list.
    ///
    /// Names and combine names must be unique, `data_obs` is reserved and
    /// composite references must resolve without cycles.
    pub fn new(groups: Vec<ProcessGroup>) -> Result<Self> {
        let mut names = BTreeSet::new();
        let mut labels = BTreeSet::new();
        for g in &groups {
            if !names.insert(g.name.as_str()) {
                return Err(Error::Configuration(format!("process group '{}' defined twice", g.name)));
            }
            let label = g.combine_name.as_deref().unwrap_or(&g.name);
            if label == DATA_OBS {
                return Err(Error::Configuration(format!(
                    "process group '{}' uses the reserved name '{DATA_OBS}'",
                    g.name
                )));
            }
            if !labels.insert(label) {
                return Err(Error::Configuration(format!("combine name '{label}' used twice")));
            }
            if g.signal && g.kind == GroupKind::Data {
                return Err(Error::Configuration(format!("data group '{}' cannot be signal", g.name)));
            }
        }
        let out = Self { groups };
        for g in &out.groups {
            out.members(&g.name)?;
        }
        Ok(out)
    }

    /// Groups in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessGroup> {
        self.groups.iter()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// `true` when there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group by name.
    pub fn get(&self, name: &str) -> Option<&ProcessGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Whether a group exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Fitter label of a group.
    pub fn combine_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.get(name).and_then(|g| g.combine_name.as_deref()).unwrap_or(name)
    }

    /// Whether a group is signal.
    pub fn is_signal(&self, name: &str) -> bool {
        self.get(name).is_some_and(|g| g.signal)
    }

    /// Kind of a group.
    pub fn kind_of(&self, name: &str) -> Option<GroupKind> {
        self.get(name).map(|g| g.kind)
    }

    /// Names of the signal groups.
    pub fn signals(&self) -> Vec<&str> {
        self.groups.iter().filter(|g| g.signal).map(|g| g.name.as_str()).collect()
    }

    /// Names of the background groups (neither signal nor data).
    pub fn backgrounds(&self) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| !g.signal && g.kind != GroupKind::Data)
            .map(|g| g.name.as_str())
            .collect()
    }

    /// The collision-data group, if any.
    pub fn data_group(&self) -> Option<&ProcessGroup> {
        self.groups.iter().find(|g| g.kind == GroupKind::Data)
    }

    /// Members of a group with composite references expanded.
    pub fn members(&self, name: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.expand(name, &mut Vec::new(), &mut out)?;
        Ok(out)
    }

    fn expand<'a>(&'a self, name: &'a str, stack: &mut Vec<&'a str>, out: &mut Vec<String>) -> Result<()> {
        if stack.contains(&name) {
            return Err(Error::Configuration(format!(
                "composite group cycle: {} -> {name}",
                stack.join(" -> ")
            )));
        }
        let group = self
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown process group '{name}'")))?;
        stack.push(name);
        for m in &group.members {
            match m.strip_prefix('@') {
                Some(other) => self.expand(other, stack, out)?,
                None if !out.contains(m) => out.push(m.clone()),
                None => {}
            }
        }
        stack.pop();
        Ok(())
    }

    /// Copy without the named groups. Unknown names are ignored.
    pub fn without<S: AsRef<str>>(&self, removed: &[S]) -> Self {
        Self {
            groups: self
                .groups
                .iter()
                .filter(|g| !removed.iter().any(|r| r.as_ref() == g.name))
                .cloned()
                .collect(),
        }
    }
}

/// One (group, member) read from a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeAssignment {
    /// Process group.
    pub group: String,
    /// Member directory to read.
    pub member: String,
    /// Weighting of the events.
    pub kind: GroupKind,
}

/// Which groups live on which trees of an ntuple.
///
/// Trees listed in `changes` hold data-driven estimates: only the groups
/// named there are read, from the given member. Every other tree feeds the
/// regular (non data-driven) groups from their own members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeLayout {
    /// Region trees to read.
    pub trees: Vec<String>,
    /// `tree → group → member` overrides.
    #[serde(default)]
    pub changes: BTreeMap<String, BTreeMap<String, String>>,
    /// Groups this ntuple never provides.
    #[serde(default)]
    pub remove: Vec<String>,
}

impl TreeLayout {
    /// (group, member) pairs to read from `tree`.
    pub fn assignments(&self, groups: &ProcessGroups, tree: &str) -> Result<Vec<TreeAssignment>> {
        let removed = |g: &str| self.remove.iter().any(|r| r == g);
        let mut out = Vec::new();
        if let Some(changes) = self.changes.get(tree) {
            for g in groups.iter().filter(|g| !removed(&g.name)) {
                if let Some(member) = changes.get(&g.name) {
                    out.push(TreeAssignment { group: g.name.clone(), member: member.clone(), kind: g.kind });
                }
            }
            return Ok(out);
        }
        for g in groups.iter().filter(|g| !removed(&g.name) && g.kind != GroupKind::DataDriven) {
            for member in groups.members(&g.name)? {
                out.push(TreeAssignment { group: g.name.clone(), member, kind: g.kind });
            }
        }
        Ok(out)
    }

    /// Check that every tree change names a known group.
    pub fn validate(&self, groups: &ProcessGroups) -> Result<()> {
        for (tree, changes) in &self.changes {
            if !self.trees.contains(tree) {
                return Err(Error::Configuration(format!("tree change for unlisted tree '{tree}'")));
            }
            if let Some(g) = changes.keys().find(|g| !groups.contains(g)) {
                return Err(Error::Configuration(format!(
                    "tree change on '{tree}' names unknown group '{g}'"
                )));
            }
        }
        Ok(())
    }
}
