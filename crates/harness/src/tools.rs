//! Locations of the external toolchain.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// OpenCL front-end.
    pub clang: PathBuf,
    /// Optimizer driver that loads the coarsening plugin.
    pub opt: PathBuf,
    /// Shared object providing the coarsening pass.
    pub plugin: PathBuf,
    pub ocl_header: PathBuf,
    /// Preloaded into driver binaries to reroute kernel compilation.
    pub overload_shim: PathBuf,
    /// Directory the precompiled drivers are resolved against.
    pub driver_prefix: PathBuf,
    /// Directory the `.cl` sources are resolved against.
    pub kernels_dir: PathBuf,
    pub optimization_level: String,
    pub language: String,
    pub target_triple: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ToolPaths {
    /// Conventional build layout under `home`.
    pub fn from_home(home: &Path) -> Self {
        Self {
            clang: PathBuf::from("clang"),
            opt: PathBuf::from("opt"),
            plugin: home.join("root").join("lib").join("libThrud.so"),
            ocl_header: home
                .join("src")
                .join("coarsening_pass")
                .join("thrud")
                .join("include")
                .join("opencl_spir.h"),
            overload_shim: home
                .join("build")
                .join("coarsening_pass")
                .join("opencl_tools")
                .join("function_overload")
                .join("libaxtorwrapper.so"),
            driver_prefix: home.join("build").join("coarsening_pass").join("tests"),
            kernels_dir: PathBuf::from("kernels"),
            optimization_level: "-O0".to_string(),
            language: "cl".to_string(),
            target_triple: "spir".to_string(),
        }
    }

    /// Layout under `$HOME`, or the working directory when it is unset.
    pub fn from_env() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_home(&home)
    }

    pub fn driver_path(&self, target: &str) -> PathBuf {
        self.driver_prefix.join(target)
    }

    pub fn kernel_source_path(&self, target: &str) -> PathBuf {
        self.kernels_dir.join(target)
    }
}
