//! # ttt-syst
//!
//! Nuisance definitions and process bookkeeping.
//!
//! A [`Systematic`] carries a logical name (the weight-column stem in the
//! ntuples), a kind, a year-correlation flag and per-year, per-group
//! magnitudes. The [`SystematicCatalog`] renders the externally visible name
//! for each year and builds the card rows; [`ProcessGroups`] maps model
//! processes to dataset members and [`TreeLayout`] decides which members
//! are read from which tree.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builtin;
pub mod catalog;
pub mod process;
pub mod systematic;

pub use builtin::{DUMMY_MAGNITUDE, DUMMY_NAME, MC_SAMPLES, default_catalog, dummy_systematic};
pub use catalog::{RenderedName, ShapeVariation, SystematicCatalog};
pub use process::{DATA_OBS, GroupKind, ProcessGroup, ProcessGroups, TreeAssignment, TreeLayout};
pub use systematic::{ALL_GROUPS, Magnitude, SMOOTHED_SUFFIX, SystKind, Systematic};
