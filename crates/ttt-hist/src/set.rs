//! The builder's output: histograms keyed by (graph, variation, group).

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use ttt_core::{NOMINAL, Result};

use crate::histogram::{Histogram, NegativeBinPolicy};

type ByGroup = BTreeMap<String, Histogram>;

/// `graph → variation → group → histogram`, plus the (group, variation)
/// pairs some contributing member could not provide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSet {
    hists: BTreeMap<String, BTreeMap<String, ByGroup>>,
    incomplete: BTreeSet<(String, String)>,
}

impl HistogramSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of histograms.
    pub fn len(&self) -> usize {
        self.hists.values().flat_map(|v| v.values()).map(BTreeMap::len).sum()
    }

    /// `true` when nothing was filled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One histogram.
    pub fn get(&self, graph: &str, variation: &str, group: &str) -> Option<&Histogram> {
        self.hists.get(graph)?.get(variation)?.get(group)
    }

    /// Histogram for a key, created with `empty` on first use.
    pub fn entry(
        &mut self,
        graph: &str,
        variation: &str,
        group: &str,
        empty: impl FnOnce() -> Result<Histogram>,
    ) -> Result<&mut Histogram> {
        let by_group = self
            .hists
            .entry(graph.to_string())
            .or_default()
            .entry(variation.to_string())
            .or_default();
        match by_group.entry(group.to_string()) {
            Entry::Occupied(o) => Ok(o.into_mut()),
            Entry::Vacant(v) => Ok(v.insert(empty()?)),
        }
    }

    /// Graph names.
    pub fn graphs(&self) -> impl Iterator<Item = &str> {
        self.hists.keys().map(String::as_str)
    }

    /// Variations filled for a graph.
    pub fn variations(&self, graph: &str) -> impl Iterator<Item = &str> {
        self.hists.get(graph).into_iter().flat_map(|v| v.keys().map(String::as_str))
    }

    /// Nominal histograms of a graph by group.
    pub fn nominal(&self, graph: &str) -> Option<&BTreeMap<String, Histogram>> {
        self.hists.get(graph)?.get(NOMINAL)
    }

    /// Record that a member of `group` lacks `variation`.
    pub fn mark_incomplete(&mut self, group: &str, variation: &str) {
        self.incomplete.insert((group.to_string(), variation.to_string()));
    }

    /// Whether every member of `group` provided `variation`.
    pub fn is_complete(&self, group: &str, variation: &str) -> bool {
        !self.incomplete.contains(&(group.to_string(), variation.to_string()))
    }

    /// Deep merge: histograms under the same key are added.
    pub fn merge(&mut self, other: HistogramSet) -> Result<()> {
        for (graph, by_var) in other.hists {
            let mine = self.hists.entry(graph).or_default();
            for (var, by_group) in by_var {
                let mine = mine.entry(var).or_default();
                for (group, h) in by_group {
                    match mine.get_mut(&group) {
                        Some(existing) => existing.add(&h)?,
                        None => {
                            mine.insert(group, h);
                        }
                    }
                }
            }
        }
        self.incomplete.extend(other.incomplete);
        Ok(())
    }

    /// Apply the negative-bin policy everywhere. Returns the bins changed.
    pub fn fix_negative(&mut self, policy: NegativeBinPolicy) -> usize {
        self.hists
            .values_mut()
            .flat_map(|v| v.values_mut())
            .flat_map(|g| g.values_mut())
            .map(|h| h.fix_negative(policy))
            .sum()
    }
}
