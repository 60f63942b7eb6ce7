//! # ttt-datacard
//!
//! From filled templates to a statistical model: the JSON shape artifact
//! ([`ShapeWriter`], [`ShapeArtifact`]), the line-based model card
//! ([`DataCard`], [`CardBuilder`]), native card combination
//! ([`combine_cards`]) and the optional external [`Fitter`] run.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod builder;
pub mod card;
pub mod combine;
pub mod fitter;

pub use artifact::{ARTIFACT_FORMAT, HistData, ShapeArtifact, ShapeWriter};
pub use builder::{CardBuilder, SYST_GROUP};
pub use card::{DataCard, NuisanceRow, ProcessColumn, RateParam, ShapesLine};
pub use combine::{CardPiece, combine_cards};
pub use fitter::{CARD_PLACEHOLDER, Fitter};
