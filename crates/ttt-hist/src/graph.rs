//! Histogram recipes.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ttt_core::{Error, Result};
use ttt_frame::{CompiledExpr, EventFrame, Fill, ParticleIndex};

use crate::axis::Axis;
use crate::histogram::Histogram;

/// Values and weights produced by a graph for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphFill {
    /// One value per entry.
    OneD(Fill),
    /// Two values per entry.
    TwoD {
        /// First-axis values.
        x: Vec<f64>,
        /// Second-axis values.
        y: Vec<f64>,
        /// Weights.
        weights: Vec<f64>,
    },
}

impl GraphFill {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            GraphFill::OneD(f) => f.len(),
            GraphFill::TwoD { weights, .. } => weights.len(),
        }
    }

    /// `true` when there is nothing to fill.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill into a histogram.
    pub fn fill_into(&self, hist: &mut Histogram, member: &str) -> Result<()> {
        match self {
            GraphFill::OneD(f) => hist.fill(&f.values, &f.weights, member),
            GraphFill::TwoD { x, y, weights } => hist.fill_2d(x, y, weights, member),
        }
    }
}

/// Value function of a graph.
pub type GraphFn = Arc<dyn Fn(&mut EventFrame) -> Result<GraphFill> + Send + Sync>;

/// A histogram recipe: name, title, binning and value function.
#[derive(Clone)]
pub struct GraphSpec {
    /// Graph name (artifact file stem).
    pub name: String,
    /// Axis title.
    pub title: String,
    /// One or two axes.
    pub axes: Vec<Axis>,
    value: GraphFn,
}

impl fmt::Debug for GraphSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphSpec")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("axes", &self.axes)
            .finish()
    }
}

impl GraphSpec {
    /// Graph from an arbitrary value function.
    pub fn new(name: &str, title: &str, axes: Vec<Axis>, value: GraphFn) -> Result<Self> {
        if axes.is_empty() || axes.len() > 2 {
            return Err(Error::Configuration(format!("graph '{name}' needs 1 or 2 axes")));
        }
        for a in &axes {
            a.validate()?;
        }
        Ok(Self { name: name.to_string(), title: title.to_string(), axes, value })
    }

    /// One value per selected event from an expression.
    pub fn expr(name: &str, title: &str, axis: Axis, expr: &str) -> Result<Self> {
        let e = CompiledExpr::compile(expr)?;
        Self::new(
            name,
            title,
            vec![axis],
            Arc::new(move |frame: &mut EventFrame| -> Result<GraphFill> {
                let values = frame.eval(&e)?;
                Ok(GraphFill::OneD(frame.event_fill(values)?))
            }),
        )
    }

    /// Two expressions on two axes.
    pub fn expr_2d(
        name: &str,
        title: &str,
        x: Axis,
        y: Axis,
        x_expr: &str,
        y_expr: &str,
    ) -> Result<Self> {
        let ex = CompiledExpr::compile(x_expr)?;
        let ey = CompiledExpr::compile(y_expr)?;
        Self::new(
            name,
            title,
            vec![x, y],
            Arc::new(move |frame: &mut EventFrame| -> Result<GraphFill> {
                let x = frame.eval(&ex)?;
                let y = frame.eval(&ey)?;
                Ok(GraphFill::TwoD { x, y, weights: frame.weights() })
            }),
        )
    }

    /// A particle field: every selected particle, or the `i`-th one.
    pub fn particle(
        name: &str,
        title: &str,
        axis: Axis,
        collection: &str,
        field: &str,
        index: Option<usize>,
    ) -> Result<Self> {
        let (coll, field) = (collection.to_string(), field.to_string());
        let index = index.map_or(ParticleIndex::All, ParticleIndex::At);
        Self::new(
            name,
            title,
            vec![axis],
            Arc::new(move |frame: &mut EventFrame| -> Result<GraphFill> {
                Ok(GraphFill::OneD(frame.particle(&coll, &field, index)?))
            }),
        )
    }

    /// The BDT discriminant with the high-multiplicity events moved to an
    /// extra bin above 1.
    pub fn signal(name: &str) -> Result<Self> {
        let axis = Axis::variable(vec![0.0, 0.15, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.94, 1.0, 1.1])?;
        Self::expr(
            name,
            "BDT_{signal}",
            axis,
            "select(NJets >= 8 || NmediumBJets >= 5 || (NJets >= 7 && NmediumBJets >= 3), 1.01, Signal)",
        )
    }

    /// Evaluate on a frame.
    pub fn evaluate(&self, frame: &mut EventFrame) -> Result<GraphFill> {
        let fill = (self.value)(frame)?;
        let want_2d = self.axes.len() == 2;
        if want_2d != matches!(fill, GraphFill::TwoD { .. }) {
            return Err(Error::Validation(format!(
                "graph '{}' produced values of the wrong dimension",
                self.name
            )));
        }
        Ok(fill)
    }

    /// An empty histogram with this graph's binning.
    pub fn empty_histogram(&self) -> Result<Histogram> {
        Histogram::new(self.axes.clone())
    }
}

/// Source of a configured graph's values.
///
/// In YAML: `signal`, `{expr: "HT"}`, `{expr2d: [x, y]}` or
/// `{particle: {collection: Jets, field: pt, index: 0}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SourceRepr", into = "SourceRepr")]
pub enum GraphSource {
    /// Per-event expression.
    Expr(String),
    /// Two per-event expressions (2-D).
    Expr2d(String, String),
    /// Particle field.
    Particle {
        /// Collection.
        collection: String,
        /// Field.
        field: String,
        /// Particle index; all particles when absent.
        index: Option<usize>,
    },
    /// The signal-region discriminant.
    Signal,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SourceRepr {
    Named(String),
    Map(SourceMap),
}

#[derive(Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expr2d: Option<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    particle: Option<ParticleRepr>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParticleRepr {
    collection: String,
    field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
}

impl TryFrom<SourceRepr> for GraphSource {
    type Error = Error;

    fn try_from(repr: SourceRepr) -> Result<Self> {
        match repr {
            SourceRepr::Named(n) if n == "signal" => Ok(GraphSource::Signal),
            SourceRepr::Named(n) => {
                Err(Error::Configuration(format!("unknown graph source '{n}'")))
            }
            SourceRepr::Map(SourceMap { expr: Some(e), expr2d: None, particle: None }) => {
                Ok(GraphSource::Expr(e))
            }
            SourceRepr::Map(SourceMap { expr: None, expr2d: Some((x, y)), particle: None }) => {
                Ok(GraphSource::Expr2d(x, y))
            }
            SourceRepr::Map(SourceMap { expr: None, expr2d: None, particle: Some(p) }) => {
                Ok(GraphSource::Particle { collection: p.collection, field: p.field, index: p.index })
            }
            SourceRepr::Map(_) => Err(Error::Configuration(
                "graph source needs exactly one of `expr`, `expr2d` or `particle`".into(),
            )),
        }
    }
}

impl From<GraphSource> for SourceRepr {
    fn from(source: GraphSource) -> Self {
        let map = match source {
            GraphSource::Signal => return SourceRepr::Named("signal".into()),
            GraphSource::Expr(e) => SourceMap { expr: Some(e), ..SourceMap::default() },
            GraphSource::Expr2d(x, y) => SourceMap { expr2d: Some((x, y)), ..SourceMap::default() },
            GraphSource::Particle { collection, field, index } => SourceMap {
                particle: Some(ParticleRepr { collection, field, index }),
                ..SourceMap::default()
            },
        };
        SourceRepr::Map(map)
    }
}

/// A graph as written in the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphConfig {
    /// Name.
    pub name: String,
    /// Axis title.
    #[serde(default)]
    pub title: String,
    /// Binning (one axis, or two for `expr2d`).
    #[serde(default)]
    pub axes: Vec<Axis>,
    /// Values.
    pub source: GraphSource,
}

impl GraphConfig {
    /// Build the graph.
    pub fn build(&self) -> Result<GraphSpec> {
        let title = if self.title.is_empty() { &self.name } else { &self.title };
        let one = || -> Result<Axis> {
            match self.axes.as_slice() {
                [a] => Ok(a.clone()),
                _ => Err(Error::Configuration(format!("graph '{}' needs exactly one axis", self.name))),
            }
        };
        match &self.source {
            GraphSource::Expr(e) => GraphSpec::expr(&self.name, title, one()?, e),
            GraphSource::Expr2d(x, y) => match self.axes.as_slice() {
                [ax, ay] => GraphSpec::expr_2d(&self.name, title, ax.clone(), ay.clone(), x, y),
                _ => Err(Error::Configuration(format!("graph '{}' needs two axes", self.name))),
            },
            GraphSource::Particle { collection, field, index } => {
                GraphSpec::particle(&self.name, title, one()?, collection, field, *index)
            }
            GraphSource::Signal if self.axes.is_empty() => GraphSpec::signal(&self.name),
            GraphSource::Signal => Err(Error::Configuration(format!(
                "graph '{}' uses the fixed signal binning and takes no axes",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ttt_frame::{CollectionData, EventTable, FrameOptions, Jagged, MemberMeta, SourceKind, WeightTable};

    fn frame() -> EventFrame {
        let w = WeightTable::from_columns(&[vec![1.0, 2.0, 0.5]]).unwrap();
        let t = EventTable::new(w)
            .with_scalar("HT", vec![150.0, 350.0, 600.0])
            .with_scalar("NJets", vec![8.0, 4.0, 7.0])
            .with_scalar("NmediumBJets", vec![1.0, 2.0, 3.0])
            .with_scalar("Signal", vec![0.2, 0.5, 0.9])
            .with_collection(
                "Jets",
                CollectionData::new().with_field("pt", Jagged::from_rows(&[vec![90.0, 50.0], vec![], vec![40.0]])),
            );
        EventFrame::open(
            Box::new(t),
            MemberMeta::new(vec!["Nominal".into()]).with_sumweight(vec![1.0]),
            "ttz",
            "Signal_Dilepton",
            SourceKind::Simulation { xsec_scale: 1.0 },
            FrameOptions::default(),
            "Nominal",
        )
        .unwrap()
    }

    #[test]
    fn expression_graph() {
        let g = GraphSpec::expr("HT", "H_T", Axis::variable(vec![0.0, 200.0, 400.0]).unwrap(), "HT").unwrap();
        let mut f = frame();
        let fill = g.evaluate(&mut f).unwrap();
        let mut h = g.empty_histogram().unwrap();
        fill.fill_into(&mut h, "ttz").unwrap();
        assert_eq!(h.values(), &[1.0, 2.5]);
    }

    #[test]
    fn signal_graph_moves_high_multiplicity() {
        let g = GraphSpec::signal("signal").unwrap();
        let mut f = frame();
        let GraphFill::OneD(fill) = g.evaluate(&mut f).unwrap() else { panic!("1-D expected") };
        assert_eq!(fill.values, vec![1.01, 0.5, 1.01]);
    }

    #[test]
    fn particle_graph_flattens() {
        let g = GraphSpec::particle("jet_pt", "p_T", Axis::regular(2, 0.0, 100.0).unwrap(), "Jets", "pt", None).unwrap();
        let mut f = frame();
        let fill = g.evaluate(&mut f).unwrap();
        assert_eq!(fill.len(), 3);
        let lead = GraphSpec::particle("j1", "p_T", Axis::regular(2, 0.0, 100.0).unwrap(), "Jets", "pt", Some(0)).unwrap();
        assert_eq!(lead.evaluate(&mut f).unwrap().len(), 2);
    }

    #[test]
    fn config_graphs() {
        let yaml = r#"
- name: ZMass
  axes: [{regular: {bins: 15, lo: 75, hi: 105}}]
  source: {expr: "HT / 10"}
- name: signal
  source: signal
- name: jets
  axes: [{regular: {bins: 4, lo: 0, hi: 200}}]
  source: {particle: {collection: Jets, field: pt, index: 0}}
"#;
        let cfgs: Vec<GraphConfig> = serde_yaml_ng::from_str(yaml).unwrap();
        let graphs: Vec<GraphSpec> = cfgs.iter().map(|c| c.build().unwrap()).collect();
        assert_eq!(graphs[0].title, "ZMass");
        assert_eq!(graphs[1].axes[0].n_bins(), 12);
        assert!(serde_yaml_ng::from_str::<GraphSource>("bogus").is_err());
        assert!(serde_yaml_ng::from_str::<GraphSource>("{expr: HT, particle: {collection: Jets, field: pt}}").is_err());
        let two: GraphSource = serde_yaml_ng::from_str("{expr2d: [HT, MET]}").unwrap();
        assert_eq!(two, GraphSource::Expr2d("HT".into(), "MET".into()));
        let bad = GraphConfig { name: "x".into(), title: String::new(), axes: vec![], source: GraphSource::Expr("HT".into()) };
        assert!(bad.build().is_err());
    }
}
