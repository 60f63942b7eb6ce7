//! # ttt-frame
//!
//! Event frames over systematic-aware ntuples.
//!
//! An ntuple batch stores, per process member and region tree, scalar
//! columns, jagged particle collections, a dense weight table with one
//! column per systematic variation, and selection bitmaps telling which
//! events and particles survive each variation. [`EventFrame`] presents one
//! (member, tree) under one active variation at a time.
//!
//! ```no_run
//! use ttt_frame::{FrameOptions, NtupleFile, ParticleIndex, SourceKind};
//!
//! # fn main() -> ttt_core::Result<()> {
//! let file = NtupleFile::open("ntuples/2018/batch_0")?;
//! let kind = SourceKind::Simulation { xsec_scale: 0.86 * 59.83 * 1000.0 };
//! if let Some(mut frame) =
//!     file.open_frame("ttz", "Signal_Dilepton", kind, &FrameOptions::default(), "Nominal")?.ok()
//! {
//!     let lead = frame.particle("Jets", "pt", ParticleIndex::At(0))?;
//!     println!("{} entries", lead.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod expr;
pub mod frame;
pub mod jagged;
pub mod ntuple;
pub mod parquet;
pub mod source;

pub use expr::{CompiledExpr, VarRef};
pub use frame::{Collection, EventFrame, Fill, FrameOptions, ParticleIndex, SourceKind};
pub use jagged::{Jagged, WeightTable};
pub use ntuple::{MemberMeta, NtupleFile, NtupleWriter, sumweight_slot};
pub use parquet::{ParquetSource, write_event_table};
pub use source::{CollectionData, Column, EventSource, EventTable, ShiftKind};
