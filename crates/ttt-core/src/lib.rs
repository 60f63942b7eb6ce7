//! # ttt-core
//!
//! Shared vocabulary for the three-top shape pipeline: the error type,
//! data-taking eras, systematic variation names and the per-task error
//! records collected by the driver.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod diagnostics;
pub mod era;
pub mod error;
pub mod variation;

pub use diagnostics::{Diagnostics, ErrorRecord};
pub use era::{Era, parse_years};
pub use error::{Error, ErrorKind, Presence, Result};
pub use variation::{Direction, NOMINAL, Variation};
