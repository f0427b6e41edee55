//! Run settings, optionally loaded from a JSON file.

use crate::builder::{DivRegionPolicy, InvocationBuilder};
use crate::tools::ToolPaths;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tcforge_matrix::{ConfigSpace, TestRegistry};
use tcforge_runner::{BoundedRunner, DeadlinePolicy, DEFAULT_CAPTURE_LIMIT};

/// Built-in registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Suite {
    #[default]
    Drivers,
    Sources,
}

impl Suite {
    pub fn registry(&self) -> TestRegistry {
        match self {
            Suite::Drivers => TestRegistry::driver_suite(),
            Suite::Sources => TestRegistry::kernel_source_suite(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub tools: ToolPaths,
    pub space: ConfigSpace,
    pub suite: Suite,
    /// Replaces the suite registry when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<TestRegistry>,
    pub timeout_secs: u64,
    /// Opt out of hang protection entirely.
    pub no_timeout: bool,
    pub poll_interval_ms: u64,
    pub capture_limit_bytes: usize,
    pub div_region_mgt: DivRegionPolicy,
    pub jobs: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_env: BTreeMap<String, String>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            space: ConfigSpace::standard(),
            suite: Suite::default(),
            registry: None,
            timeout_secs: 30,
            no_timeout: false,
            poll_interval_ms: 10,
            capture_limit_bytes: DEFAULT_CAPTURE_LIMIT,
            div_region_mgt: DivRegionPolicy::default(),
            jobs: 1,
            extra_env: BTreeMap::new(),
        }
    }
}

impl HarnessSettings {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings = serde_json::from_slice(&data)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.space.validate()?;
        ensure!(self.jobs >= 1, "jobs must be at least 1");
        ensure!(
            self.no_timeout || self.timeout_secs > 0,
            "timeout_secs must be positive; set no_timeout to disable hang protection"
        );
        Ok(())
    }

    pub fn registry(&self) -> TestRegistry {
        self.registry
            .clone()
            .unwrap_or_else(|| self.suite.registry())
    }

    pub fn deadline(&self) -> DeadlinePolicy {
        if self.no_timeout {
            DeadlinePolicy::Unbounded
        } else {
            DeadlinePolicy::Bounded(Duration::from_secs(self.timeout_secs))
        }
    }

    pub fn runner(&self) -> BoundedRunner {
        BoundedRunner::new(self.deadline())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_capture_limit(self.capture_limit_bytes)
    }

    pub fn builder(&self) -> InvocationBuilder {
        InvocationBuilder::new(self.tools.clone())
            .with_policy(self.div_region_mgt)
            .with_extra_env(self.extra_env.clone())
    }
}
