//! Fully-resolved process launches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A single process launch. The overlay is applied on top of the inherited
/// environment of the spawned child only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommand {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl StageCommand {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn display_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(key, value)| format!("{key}={}", shell_quote(value)))
            .collect();
        parts.extend(self.argv().iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

/// Stages run in order; stage `i`'s stdout feeds stage `i + 1`'s stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub stages: Vec<StageCommand>,
}

impl Invocation {
    pub fn single(stage: StageCommand) -> Self {
        Self {
            stages: vec![stage],
        }
    }

    pub fn piped(first: StageCommand, second: StageCommand) -> Self {
        Self {
            stages: vec![first, second],
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Copy-pasteable shell rendering, stages joined with `|`.
    pub fn display_line(&self) -> String {
        self.stages
            .iter()
            .map(StageCommand::display_line)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+%@".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
