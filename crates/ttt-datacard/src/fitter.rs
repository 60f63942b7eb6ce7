//! External fitter invocation.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use ttt_core::{Error, Result};

/// Placeholder replaced by the card path in the fitter arguments.
pub const CARD_PLACEHOLDER: &str = "{card}";

/// Fitter command line, e.g. `combine -M AsymptoticLimits -d {card}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fitter {
    command: Vec<String>,
}

impl Default for Fitter {
    fn default() -> Self {
        Self::new(["combine", "-M", "AsymptoticLimits", "-d", CARD_PLACEHOLDER])
    }
}

impl Fitter {
    /// Fitter from a program and its arguments.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { command: command.into_iter().map(Into::into).collect() }
    }

    /// Command line with the card substituted.
    pub fn command_line(&self, card: &Path) -> Vec<String> {
        let card = card.to_string_lossy();
        self.command.iter().map(|a| a.replace(CARD_PLACEHOLDER, &card)).collect()
    }

    /// Run the fitter on `card` inside `workdir`, blocking until it exits.
    ///
    /// Returns the captured output. A non-zero exit, a signal, or a program
    /// that cannot be started is an [`Error::FitterInvocation`].
    pub fn run(&self, card: &Path, workdir: &Path) -> Result<String> {
        let args = self.command_line(card);
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::Configuration("empty fitter command".into()));
        };
        let command = args.join(" ");
        tracing::info!(%command, workdir = %workdir.display(), "running fitter");
        let output = Command::new(program).args(rest).current_dir(workdir).output().map_err(|e| {
            Error::FitterInvocation { command: command.clone(), status: None, output: e.to_string() }
        })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::FitterInvocation { command, status: output.status.code(), output: text });
        }
        Ok(text)
    }
}
