//! Target descriptors.
//!
//! Lowering only consults the target to decide whether vectorize and GPU
//! directives are legal; no code is generated for it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Optional capabilities of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Feature {
    Cuda,
    OpenCl,
    Metal,
    /// Bounds-check every access at runtime (informational)
    Debug,
}

impl Feature {
    /// True for features that provide a device API.
    pub fn is_device_api(self) -> bool {
        matches!(self, Feature::Cuda | Feature::OpenCl | Feature::Metal)
    }
}

/// The machine a pipeline is lowered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Width of the vector unit in bits; 0 if there is none
    pub vector_bits: u32,
    pub features: BTreeSet<Feature>,
}

impl Target {
    /// A host CPU with a 128-bit vector unit and no device.
    pub fn host() -> Self {
        Self { vector_bits: 128, features: BTreeSet::new() }
    }

    /// A host CPU without a vector unit.
    pub fn host_no_simd() -> Self {
        Self { vector_bits: 0, features: BTreeSet::new() }
    }

    /// Host plus CUDA.
    pub fn cuda() -> Self {
        Self::host().with_feature(Feature::Cuda)
    }

    /// Host plus OpenCL.
    pub fn opencl() -> Self {
        Self::host().with_feature(Feature::OpenCl)
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn has_vector_unit(&self) -> bool {
        self.vector_bits > 0
    }

    pub fn has_gpu_feature(&self) -> bool {
        self.features.iter().any(|f| f.is_device_api())
    }

    /// Parse a target name: `host`, `host-no-simd`, `cuda` or `opencl`,
    /// optionally followed by `-debug`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (base, debug) = match name.strip_suffix("-debug") {
            Some(b) => (b, true),
            None => (name, false),
        };
        let target = match base {
            "host" => Self::host(),
            "host-no-simd" => Self::host_no_simd(),
            "cuda" => Self::cuda(),
            "opencl" => Self::opencl(),
            _ => return None,
        };
        Some(if debug { target.with_feature(Feature::Debug) } else { target })
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", if self.vector_bits > 0 { "host" } else { "host-no-simd" })?;
        for feature in &self.features {
            let name = match feature {
                Feature::Cuda => "cuda",
                Feature::OpenCl => "opencl",
                Feature::Metal => "metal",
                Feature::Debug => "debug",
            };
            write!(f, "-{}", name)?;
        }
        Ok(())
    }
}
