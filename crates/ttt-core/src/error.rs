//! Error types for the ttt pipeline

use std::fmt;

use thiserror::Error;

/// Pipeline error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Unknown region, year or systematic, or an inconsistent configuration.
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An expected tree, column or systematic column is absent from an input.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A scale-factor table does not cover the requested (group, year).
    #[error("scale table miss: {0}")]
    ScaleTableMiss(String),

    /// A produced template contains non-finite or negative values.
    #[error("shape artifact error: {0}")]
    ShapeArtifact(String),

    /// The external fitter returned a non-zero status.
    #[error("fitter invocation failed ({command}, status {status:?}): {output}")]
    FitterInvocation {
        /// Command line that was run.
        command: String,
        /// Exit code, `None` when killed by a signal.
        status: Option<i32>,
        /// Captured stdout+stderr.
        output: String,
    },

    /// Arrow / Parquet decoding error
    #[error("ntuple error: {0}")]
    Ntuple(String),

    /// Expression compile or evaluation error
    #[error("expression error: {0}")]
    Expression(String),

    /// Logic error in the caller (unknown field, mismatched lengths, ...)
    #[error("validation error: {0}")]
    Validation(String),
}

/// Error kind as reported in the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// See [`Error::Configuration`].
    Configuration,
    /// See [`Error::MissingInput`].
    MissingInput,
    /// See [`Error::ScaleTableMiss`].
    ScaleTableMiss,
    /// See [`Error::ShapeArtifact`].
    ShapeArtifact,
    /// See [`Error::FitterInvocation`].
    FitterInvocation,
    /// Everything else (I/O, decoding, logic errors).
    Internal,
}

impl ErrorKind {
    /// Stable name used in machine-parseable output.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::MissingInput => "MissingInputError",
            ErrorKind::ScaleTableMiss => "ScaleTableMissError",
            ErrorKind::ShapeArtifact => "ShapeArtifactError",
            ErrorKind::FitterInvocation => "FitterInvocationError",
            ErrorKind::Internal => "InternalError",
        }
    }

    /// Whether the pipeline may continue after this kind of error.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::MissingInput | ErrorKind::ScaleTableMiss | ErrorKind::FitterInvocation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::MissingInput(_) => ErrorKind::MissingInput,
            Error::ScaleTableMiss(_) => ErrorKind::ScaleTableMiss,
            Error::ShapeArtifact(_) => ErrorKind::ShapeArtifact,
            Error::FitterInvocation { .. } => ErrorKind::FitterInvocation,
            Error::Yaml(_) => ErrorKind::Configuration,
            Error::Io(_)
            | Error::Json(_)
            | Error::Ntuple(_)
            | Error::Expression(_)
            | Error::Validation(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of looking up optional input data.
///
/// Together with `Result` this gives the three states needed when reading
/// analysis inputs: present, absent (skip with a warning) and absent-fatal
/// (`Err`).
#[derive(Debug, Clone, PartialEq)]
pub enum Presence<T> {
    /// The requested item exists.
    Present(T),
    /// The item is missing; the caller should skip it.
    Absent(String),
}

impl<T> Presence<T> {
    /// Convert to an `Option`, dropping the reason.
    pub fn ok(self) -> Option<T> {
        match self {
            Presence::Present(v) => Some(v),
            Presence::Absent(_) => None,
        }
    }

    /// `true` when the item exists.
    pub fn is_present(&self) -> bool {
        matches!(self, Presence::Present(_))
    }

    /// Map the present value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Presence<U> {
        match self {
            Presence::Present(v) => Presence::Present(f(v)),
            Presence::Absent(r) => Presence::Absent(r),
        }
    }

    /// Turn an absence into a fatal [`Error::MissingInput`].
    pub fn required(self) -> Result<T> {
        match self {
            Presence::Present(v) => Ok(v),
            Presence::Absent(r) => Err(Error::MissingInput(r)),
        }
    }
}
