//! Maps (target, kernel, configuration) to a concrete invocation.
//!
//! Two shapes exist. A driver target becomes a single stage: the driver
//! binary is launched with the kernel name and an environment overlay that
//! the preloaded overload shim reads to rebuild the kernel through the
//! coarsening pipeline. A kernel source becomes a front-end stage whose IR is
//! piped into an optimizer stage carrying the pass flags directly.
//!
//! Building is pure: the overlay is returned as data and handed to the spawn
//! call, never written into the orchestrator's own environment.

use crate::tools::ToolPaths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tcforge_matrix::{Configuration, TargetKind, TestTarget};
use tcforge_runner::{Invocation, StageCommand};

pub const OCL_HEADER_VAR: &str = "OCL_HEADER";
pub const KERNEL_NAME_VAR: &str = "TC_KERNEL_NAME";
pub const PRELOAD_VAR: &str = "LD_PRELOAD";
pub const COMPILER_OPTIONS_VAR: &str = "OCL_COMPILER_OPTIONS";

/// How the pass handles divergent regions when replicating work-items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivRegionPolicy {
    #[default]
    Classic,
    MergeTrue,
    MergeFalse,
    Merge,
}

impl DivRegionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivRegionPolicy::Classic => "classic",
            DivRegionPolicy::MergeTrue => "merge-true",
            DivRegionPolicy::MergeFalse => "merge-false",
            DivRegionPolicy::Merge => "merge",
        }
    }
}

impl fmt::Display for DivRegionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct InvocationBuilder {
    tools: ToolPaths,
    policy: DivRegionPolicy,
    extra_env: BTreeMap<String, String>,
}

impl InvocationBuilder {
    pub fn new(tools: ToolPaths) -> Self {
        Self {
            tools,
            policy: DivRegionPolicy::default(),
            extra_env: BTreeMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: DivRegionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Extra variables for every stage. The fixed driver variables win on
    /// collision.
    pub fn with_extra_env(mut self, extra_env: BTreeMap<String, String>) -> Self {
        self.extra_env = extra_env;
        self
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn policy(&self) -> DivRegionPolicy {
        self.policy
    }

    pub fn build(&self, target: &TestTarget, kernel: &str, config: Configuration) -> Invocation {
        match target.kind() {
            TargetKind::Driver => self.driver_invocation(&target.target, kernel, config),
            TargetKind::KernelSource => self.source_invocation(&target.target, kernel, config),
        }
    }

    /// Option string handed to the shim, substituted in the order factor,
    /// direction, stride, kernel name.
    pub fn compiler_options(&self, kernel: &str, config: Configuration) -> String {
        format!(
            "-mem2reg -load {} -structurizecfg -instnamer -be -tc \
             -coarsening-factor {} -coarsening-direction {} -coarsening-stride {} \
             -div-region-mgt {} -kernel-name {} -simplifycfg",
            self.tools.plugin.display(),
            config.factor,
            config.direction,
            config.stride,
            self.policy,
            kernel
        )
    }

    fn driver_invocation(&self, target: &str, kernel: &str, config: Configuration) -> Invocation {
        let mut stage = StageCommand::new("driver", self.tools.driver_path(target)).arg(kernel);
        stage.env = self.extra_env.clone();
        let stage = stage
            .env(OCL_HEADER_VAR, self.tools.ocl_header.display().to_string())
            .env(KERNEL_NAME_VAR, kernel)
            .env(PRELOAD_VAR, self.tools.overload_shim.display().to_string())
            .env(COMPILER_OPTIONS_VAR, self.compiler_options(kernel, config));
        Invocation::single(stage)
    }

    fn source_invocation(&self, target: &str, kernel: &str, config: Configuration) -> Invocation {
        let tools = &self.tools;

        let mut clang = StageCommand::new("clang", &tools.clang).args([
            "-x".to_string(),
            tools.language.clone(),
            "-target".to_string(),
            tools.target_triple.clone(),
            "-include".to_string(),
            tools.ocl_header.display().to_string(),
            tools.optimization_level.clone(),
            tools.kernel_source_path(target).display().to_string(),
            "-S".to_string(),
            "-emit-llvm".to_string(),
            "-fno-builtin".to_string(),
            "-o".to_string(),
            "-".to_string(),
        ]);
        clang.env = self.extra_env.clone();

        let mut opt = StageCommand::new("opt", &tools.opt).args([
            "-mem2reg".to_string(),
            "-instnamer".to_string(),
            "-load".to_string(),
            tools.plugin.display().to_string(),
            "-structurizecfg".to_string(),
            "-be".to_string(),
            "-tc".to_string(),
            "-coarsening-factor".to_string(),
            config.factor.to_string(),
            "-coarsening-direction".to_string(),
            config.direction.to_string(),
            "-coarsening-stride".to_string(),
            config.stride.to_string(),
            "-div-region-mgt".to_string(),
            self.policy.to_string(),
            "-kernel-name".to_string(),
            kernel.to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
        ]);
        opt.env = self.extra_env.clone();

        Invocation::piped(clang, opt)
    }
}
