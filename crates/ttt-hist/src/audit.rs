//! Plain-text yield tables.

use std::fmt::Write;

use crate::set::HistogramSet;

/// Nominal yields of one graph per group and member.
///
/// ```text
/// group        member                           yield       stat    entries
/// ttz          ttz_m1-10                      12.3456     0.8123        421
/// ttz          (total)                        20.0000     1.0000        700
/// ```
pub fn yield_table(set: &HistogramSet, graph: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<28} {:>12} {:>10} {:>10}", "group", "member", "yield", "stat", "entries");
    let Some(nominal) = set.nominal(graph) else {
        return out;
    };
    for (group, hist) in nominal {
        let mut entries = 0;
        for (member, p) in hist.breakdown() {
            let _ = writeln!(
                out,
                "{group:<12} {member:<28} {:>12.4} {:>10.4} {:>10}",
                p.sumw,
                p.sumw2.sqrt(),
                p.entries
            );
            entries += p.entries;
        }
        let _ = writeln!(
            out,
            "{group:<12} {:<28} {:>12.4} {:>10.4} {:>10}",
            "(total)",
            hist.integral(),
            hist.variance_total().sqrt(),
            entries
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use crate::histogram::Histogram;

    #[test]
    fn lists_members_and_totals() {
        let mut set = HistogramSet::new();
        let h = set
            .entry("HT", "Nominal", "ttz", || Histogram::new_1d(Axis::regular(2, 0.0, 2.0)?))
            .unwrap();
        h.fill(&[0.5, 1.5], &[2.0, 2.0], "ttz_a").unwrap();
        h.fill(&[0.5], &[1.0], "ttz_b").unwrap();
        let t = yield_table(&set, "HT");
        let lines: Vec<&str> = t.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("ttz") && lines[1].contains("ttz_a") && lines[1].contains("4.0000"));
        assert!(lines[3].contains("(total)") && lines[3].contains("5.0000"));
        assert_eq!(yield_table(&set, "MET").lines().count(), 1);
    }
}
