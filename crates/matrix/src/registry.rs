//! Registry of test targets and the kernels each one exposes.

use crate::config::ConfigSpace;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a target is turned into an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    #[default]
    /// Precompiled host driver that builds its kernels through the overload shim.
    Driver,
    /// OpenCL source compiled by the front-end and piped into the optimizer.
    KernelSource,
}

impl TargetKind {
    /// `.cl` files are kernel sources; everything else is a driver binary.
    pub fn infer(target: &str) -> Self {
        if target.ends_with(".cl") {
            TargetKind::KernelSource
        } else {
            TargetKind::Driver
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Driver => f.write_str("driver"),
            TargetKind::KernelSource => f.write_str("kernel-source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTarget {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TargetKind>,
    pub kernels: Vec<String>,
}

impl TestTarget {
    pub fn new<I, S>(target: impl Into<String>, kernels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            kind: None,
            kernels: kernels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_kind(mut self, kind: TargetKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn kind(&self) -> TargetKind {
        self.kind.unwrap_or_else(|| TargetKind::infer(&self.target))
    }
}

/// Ordered collection of targets. Order only matters for report layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestRegistry {
    targets: Vec<TestTarget>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
        }
    }

    pub fn from_targets(targets: Vec<TestTarget>) -> Self {
        Self { targets }
    }

    pub fn register(&mut self, target: TestTarget) {
        self.targets.push(target);
    }

    pub fn with(mut self, target: TestTarget) -> Self {
        self.register(target);
        self
    }

    pub fn targets(&self) -> &[TestTarget] {
        &self.targets
    }

    pub fn find(&self, target: &str) -> Option<&TestTarget> {
        self.targets.iter().find(|entry| entry.target == target)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn kernel_count(&self) -> usize {
        self.targets.iter().map(|entry| entry.kernels.len()).sum()
    }

    /// Number of invocations a run over `space` performs.
    pub fn invocation_count(&self, space: &ConfigSpace) -> usize {
        self.kernel_count() * space.len()
    }

    /// Keep targets whose identifier contains any of `patterns`. An empty
    /// pattern list keeps everything.
    pub fn filter(&self, patterns: &[String]) -> Self {
        if patterns.is_empty() {
            return self.clone();
        }
        let targets = self
            .targets
            .iter()
            .filter(|entry| patterns.iter().any(|p| entry.target.contains(p.as_str())))
            .cloned()
            .collect();
        Self { targets }
    }

    /// Precompiled drivers built under the test prefix.
    pub fn driver_suite() -> Self {
        Self::from_targets(vec![
            TestTarget::new("memset/memset", ["memset1", "memset2"]),
            TestTarget::new("memcpy/memcpy", ["rmrrmw", "cmrcmw"]),
            TestTarget::new("mm/mm", ["mm"]),
            TestTarget::new("mt/mt", ["mt"]),
            TestTarget::new(
                "mv/mv",
                [
                    "MatVecMulUncoalesced0",
                    "MatVecMulUncoalesced1",
                    "MatVecMulCoalesced0",
                ],
            ),
            TestTarget::new("divRegion/divRegion", ["divRegion"]),
            TestTarget::new("polybench/OpenCL/2DCONV/2DCONV", ["Convolution2D_kernel"]),
            TestTarget::new("polybench/OpenCL/2MM/2MM", ["mm2_kernel1"]),
            TestTarget::new("polybench/OpenCL/3DCONV/3DCONV", ["Convolution3D_kernel"]),
            TestTarget::new("polybench/OpenCL/3MM/3MM", ["mm3_kernel1"]),
            TestTarget::new("polybench/OpenCL/ATAX/ATAX", ["atax_kernel1", "atax_kernel2"]),
            TestTarget::new("polybench/OpenCL/BICG/BICG", ["bicgKernel1"]),
            TestTarget::new(
                "polybench/OpenCL/CORR/CORR",
                ["mean_kernel", "std_kernel", "reduce_kernel"],
            ),
            TestTarget::new(
                "polybench/OpenCL/COVAR/COVAR",
                ["mean_kernel", "reduce_kernel", "covar_kernel"],
            ),
            TestTarget::new(
                "polybench/OpenCL/FDTD-2D/FDTD-2D",
                ["fdtd_kernel1", "fdtd_kernel2", "fdtd_kernel3"],
            ),
            TestTarget::new("polybench/OpenCL/GEMM/GEMM", ["gemm"]),
            TestTarget::new("polybench/OpenCL/GESUMMV/GESUMMV", ["gesummv_kernel"]),
            TestTarget::new(
                "polybench/OpenCL/GRAMSCHM/GRAMSCHM",
                [
                    "gramschmidt_kernel1",
                    "gramschmidt_kernel2",
                    "gramschmidt_kernel3",
                ],
            ),
            TestTarget::new("polybench/OpenCL/MVT/MVT", ["mvt_kernel1"]),
            TestTarget::new("polybench/OpenCL/SYR2K/SYR2K", ["syr2k_kernel"]),
            TestTarget::new("polybench/OpenCL/SYRK/SYRK", ["syrk_kernel"]),
        ])
    }

    /// OpenCL sources compiled through clang and opt.
    pub fn kernel_source_suite() -> Self {
        Self::from_targets(vec![
            TestTarget::new("memset.cl", ["memset1", "memset2"]),
            TestTarget::new("mm.cl", ["mm"]),
            TestTarget::new("mt.cl", ["mt"]),
            TestTarget::new("2DConvolution.cl", ["Convolution2D_kernel"]),
            TestTarget::new("2mm.cl", ["mm2_kernel1"]),
            TestTarget::new("3DConvolution.cl", ["Convolution3D_kernel"]),
            TestTarget::new("3mm.cl", ["mm3_kernel1"]),
            TestTarget::new("atax.cl", ["atax_kernel1", "atax_kernel2"]),
            TestTarget::new("bicg.cl", ["bicgKernel1"]),
            TestTarget::new(
                "correlation.cl",
                ["mean_kernel", "std_kernel", "reduce_kernel", "corr_kernel"],
            ),
            TestTarget::new(
                "covariance.cl",
                ["mean_kernel", "reduce_kernel", "covar_kernel"],
            ),
            TestTarget::new(
                "fdtd2d.cl",
                ["fdtd_kernel1", "fdtd_kernel2", "fdtd_kernel3"],
            ),
            TestTarget::new("gemm.cl", ["gemm"]),
            TestTarget::new("gesummv.cl", ["gesummv_kernel"]),
            TestTarget::new(
                "gramschmidt.cl",
                [
                    "gramschmidt_kernel1",
                    "gramschmidt_kernel2",
                    "gramschmidt_kernel3",
                ],
            ),
            TestTarget::new("mm2metersKernel.cl", ["mm2metersKernel"]),
            TestTarget::new("mvt.cl", ["mvt_kernel1"]),
            TestTarget::new("syr2k.cl", ["syr2k_kernel"]),
            TestTarget::new("syrk.cl", ["syrk_kernel"]),
            TestTarget::new("spmv.cl", ["spmv_jds_naive"]),
            TestTarget::new("stencil.cl", ["naive_kernel"]),
        ])
    }
}
