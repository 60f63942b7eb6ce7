//! # ttt-hist
//!
//! Systematic-aware histogramming for the three-top analysis.
//!
//! [`HistogramBuilder`] reads event frames of one (region, era), walks every
//! variation a process group needs, applies the [`ScaleChain`] and fills each
//! [`GraphSpec`]. The resulting [`HistogramSet`] is merged across batch
//! files, cut into per-graph [`ShapeTemplates`] and optionally passed
//! through the LOWESS [`ShapeSmoother`].
//!
//! ```no_run
//! use ttt_core::Era;
//! use ttt_frame::{FrameOptions, NtupleFile, SourceKind};
//! use ttt_hist::{GraphSpec, HistogramBuilder, MemberSource, NegativeBinPolicy, ScaleChain};
//!
//! # fn main() -> ttt_core::Result<()> {
//! let catalog = ttt_syst::default_catalog()?;
//! let graphs = vec![GraphSpec::signal("Signal")?];
//! let scales = ScaleChain::new();
//! let mut builder = HistogramBuilder::new(&catalog, &graphs, &scales, Era::Y2018, "Dilepton")
//!     .with_cuts(&["passZVeto == 1"])?;
//! let file = NtupleFile::open("ntuples/2018/batch_0")?;
//! let kind = SourceKind::Simulation { xsec_scale: 0.86 * 59.83 * 1000.0 };
//! builder.run(&file, "Signal_Dilepton", &[MemberSource::new("ttz", "ttz", kind)], &FrameOptions::default())?;
//! let (set, diagnostics) = builder.finish(NegativeBinPolicy::Abs);
//! println!("{} histograms, {}", set.len(), diagnostics.summary());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod axis;
pub mod builder;
pub mod graph;
pub mod histogram;
pub mod scale;
pub mod set;
pub mod smoother;
pub mod templates;

pub use audit::yield_table;
pub use axis::Axis;
pub use builder::{HistogramBuilder, MemberSource, check_systematics_lists};
pub use graph::{GraphConfig, GraphFill, GraphFn, GraphSource, GraphSpec};
pub use histogram::{Histogram, NegativeBinPolicy, Provenance};
pub use scale::{BtagJetLep, ScaleApplier, ScaleChain, ScaleContext, ScaleOptions, TheoryRescale, WzScale};
pub use set::HistogramSet;
pub use smoother::ShapeSmoother;
pub use templates::{ShapeTemplate, ShapeTemplates};
