// src/config/settings.rs - Engine settings and integration parameters
// Tree location: ./src/config/settings.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::gpu::GpuVendor;
use crate::{Result, Xrpd1dError};

/// Kernel source shipped with the crate
pub const DEFAULT_KERNEL_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/gpu/kernels/xrpd1d.cl");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
/// Ambient settings for the integration engine
pub struct Settings {
    /// Path of the OpenCL kernel source used by `configure(None)`
    pub kernel_path: PathBuf,
    /// Substring of the platform name to select (OpenCL backend)
    pub platform_hint: Option<String>,
    /// Device index within the selected platform
    pub device_index: Option<usize>,
    /// Platform vendor preference order
    pub vendor_preference: Vec<GpuVendor>,
    /// Keep the device context alive when the integrator is dropped
    pub preserve_context_on_drop: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from(DEFAULT_KERNEL_PATH),
            platform_hint: None,
            device_index: None,
            vendor_preference: vec![
                GpuVendor::Nvidia,
                GpuVendor::Amd,
                GpuVendor::Intel,
                GpuVendor::Unknown,
            ],
            preserve_context_on_drop: false,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings: Settings = serde_json::from_str(&text)?;
        tracing::debug!("🔧 Loaded settings from {}", path.as_ref().display());
        Ok(settings)
    }

    /// Apply `XRPD1D_KERNEL_PATH`, `XRPD1D_PLATFORM` and `XRPD1D_DEVICE`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup("XRPD1D_KERNEL_PATH") {
            self.kernel_path = PathBuf::from(path);
        }
        if let Some(platform) = lookup("XRPD1D_PLATFORM") {
            self.platform_hint = Some(platform);
        }
        if let Some(device) = lookup("XRPD1D_DEVICE") {
            let index = device.trim().parse::<usize>().map_err(|e| {
                Xrpd1dError::Config(format!("XRPD1D_DEVICE must be an index, got '{}': {}", device, e))
            })?;
            self.device_index = Some(index);
        }
        Ok(self)
    }
}

/// Size and precision parameters of one integration configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationConfig {
    /// Image row stride (Nx)
    pub image_stride: usize,
    /// Number of pixels (Nimage)
    pub image_size: usize,
    /// Number of output bins (Nbins)
    pub bin_count: usize,
    /// Use 64-bit fixed-point accumulators
    pub use_double_precision: bool,
}

impl IntegrationConfig {
    /// Build a configuration, rejecting zero or negative sizes
    pub fn new(
        image_stride: i64,
        image_size: i64,
        bin_count: i64,
        use_double_precision: bool,
    ) -> Result<Self> {
        let positive = |name: &str, value: i64| -> Result<usize> {
            if value <= 0 {
                return Err(Xrpd1dError::InvalidArgument(format!(
                    "{} must be strictly positive, got {}",
                    name, value
                )));
            }
            usize::try_from(value)
                .map_err(|_| Xrpd1dError::InvalidArgument(format!("{} out of range: {}", name, value)))
        };

        Ok(Self {
            image_stride: positive("image_stride", image_stride)?,
            image_size: positive("image_size", image_size)?,
            bin_count: positive("bin_count", bin_count)?,
            use_double_precision,
        })
    }

    /// Check the invariants of an already-built (e.g. deserialized) configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("image_stride", self.image_stride),
            ("image_size", self.image_size),
            ("bin_count", self.bin_count),
        ] {
            if value == 0 {
                return Err(Xrpd1dError::InvalidArgument(format!(
                    "{} must be strictly positive",
                    name
                )));
            }
        }
        Ok(())
    }
}
