// src/gpu/opencl/platform.rs - OpenCL Platform Detection and Device Selection
// Tree location: ./src/gpu/opencl/platform.rs

//! OpenCL platform detection and device selection
//!
//! Enumerates every platform and device, ranks platforms by vendor preference
//! and then by the memory of their largest device, and builds a context for
//! the selected device.
//!
//! # Version History
//! - 0.1.0: Initial platform detection with multi-vendor support
//! - 0.1.1: Platform and device hints from settings
//! - 0.2.0: Device capabilities shared with the backend abstraction

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{Context, Device, Platform};

use crate::gpu::backend::{BackendError, BackendResult, DeviceCapabilities, GpuVendor};

/// One platform and its usable devices
#[derive(Debug, Clone)]
pub struct PlatformCapabilities {
    /// Platform vendor
    pub vendor: GpuVendor,
    /// Platform name string
    pub name: String,
    /// OpenCL version supported
    pub version: String,
    /// Usable devices, indexed as on the platform
    pub devices: Vec<(usize, DeviceCapabilities)>,
    /// Platform priority: GB of memory of the best device
    pub priority: u32,
}

/// Context on one selected device
pub struct SelectedDevice {
    /// OpenCL platform
    pub platform: Platform,
    /// Selected device
    pub device: Device,
    /// Context holding only that device
    pub context: Context,
    /// Device capabilities
    pub capabilities: DeviceCapabilities,
}

/// Platform detection and selection
pub struct PlatformDetector {
    platforms: Vec<PlatformCapabilities>,
    vendor_preference: Vec<GpuVendor>,
}

fn platform_error(reason: impl Into<String>) -> BackendError {
    BackendError::Device { operation: "platform detection", reason: reason.into() }
}

impl PlatformDetector {
    /// Detect platforms with the default preference (NVIDIA, AMD, Intel)
    pub fn new() -> BackendResult<Self> {
        Self::with_vendor_preference(vec![
            GpuVendor::Nvidia,
            GpuVendor::Amd,
            GpuVendor::Intel,
            GpuVendor::Unknown,
        ])
    }

    /// Detect platforms with a custom vendor preference
    pub fn with_vendor_preference(preference: Vec<GpuVendor>) -> BackendResult<Self> {
        let mut detector = Self { platforms: Vec::new(), vendor_preference: preference };
        detector.detect_platforms()?;
        Ok(detector)
    }

    fn detect_platforms(&mut self) -> BackendResult<()> {
        let platforms = Platform::list();
        if platforms.is_empty() {
            return Err(platform_error("No OpenCL platforms found. Please install GPU drivers."));
        }

        tracing::info!("🔍 Detecting OpenCL platforms...");
        for (platform_idx, platform) in platforms.iter().enumerate() {
            match Self::analyze_platform(platform) {
                Ok(capabilities) => {
                    tracing::info!(
                        "✅ Platform {}: {} ({} devices)",
                        platform_idx,
                        capabilities.name,
                        capabilities.devices.len()
                    );
                    self.platforms.push(capabilities);
                }
                Err(e) => tracing::warn!("⚠️  Platform {} detection failed: {}", platform_idx, e),
            }
        }

        if self.platforms.is_empty() {
            return Err(platform_error("No usable OpenCL platforms found"));
        }

        let preference = &self.vendor_preference;
        let rank = |vendor: GpuVendor| preference.iter().position(|v| *v == vendor).unwrap_or(usize::MAX);
        self.platforms
            .sort_by(|a, b| rank(a.vendor).cmp(&rank(b.vendor)).then(b.priority.cmp(&a.priority)));
        Ok(())
    }

    fn analyze_platform(platform: &Platform) -> BackendResult<PlatformCapabilities> {
        let name = platform.name().map_err(|e| platform_error(format!("Failed to get platform name: {}", e)))?;
        let version = platform
            .version()
            .map_err(|e| platform_error(format!("Failed to get platform version: {}", e)))?;
        let vendor = GpuVendor::detect(&name);

        tracing::debug!("🔧 Analyzing platform: {} ({})", name, version);

        let devices =
            Device::list_all(platform).map_err(|e| platform_error(format!("Failed to list devices: {}", e)))?;

        let mut usable = Vec::new();
        for (device_idx, device) in devices.iter().enumerate() {
            match Self::analyze_device(device, vendor) {
                Ok(caps) => {
                    tracing::debug!(
                        "  📱 Device {}: {} ({:.1}GB, {} CUs)",
                        device_idx,
                        caps.name,
                        caps.global_memory as f64 / (1024.0 * 1024.0 * 1024.0),
                        caps.compute_units
                    );
                    usable.push((device_idx, caps));
                }
                Err(e) => tracing::debug!("Device {} analysis failed: {}", device_idx, e),
            }
        }

        if usable.is_empty() {
            return Err(platform_error("No usable devices found on platform"));
        }

        let max_memory = usable.iter().map(|(_, caps)| caps.global_memory).max().unwrap_or(0);
        Ok(PlatformCapabilities {
            vendor,
            name,
            version,
            devices: usable,
            priority: (max_memory / (1024 * 1024 * 1024)) as u32,
        })
    }

    /// Query the capabilities of one device
    pub fn analyze_device(device: &Device, vendor: GpuVendor) -> BackendResult<DeviceCapabilities> {
        let name = match device.info(DeviceInfo::Name) {
            Ok(DeviceInfoResult::Name(s)) => s,
            _ => return Err(platform_error("Failed to get device name")),
        };
        let global_memory = match device.info(DeviceInfo::GlobalMemSize) {
            Ok(DeviceInfoResult::GlobalMemSize(v)) => v,
            _ => 0,
        };
        let max_alloc_size = match device.info(DeviceInfo::MaxMemAllocSize) {
            Ok(DeviceInfoResult::MaxMemAllocSize(v)) => v,
            _ => 0,
        };
        let max_work_group_size = match device.info(DeviceInfo::MaxWorkGroupSize) {
            Ok(DeviceInfoResult::MaxWorkGroupSize(v)) => v,
            _ => return Err(platform_error("Failed to get max work group size")),
        };
        let compute_units = match device.info(DeviceInfo::MaxComputeUnits) {
            Ok(DeviceInfoResult::MaxComputeUnits(v)) => v,
            _ => 0,
        };

        let vendor = if vendor == GpuVendor::Unknown { GpuVendor::detect(&name) } else { vendor };

        Ok(DeviceCapabilities {
            name,
            vendor,
            global_memory,
            max_alloc_size,
            max_work_group_size,
            compute_units,
            backend: "OpenCL".to_string(),
        })
    }

    /// Build a context on the hinted or highest-ranked device
    pub fn create_context(
        &self,
        platform_hint: Option<&str>,
        device_hint: Option<usize>,
    ) -> BackendResult<SelectedDevice> {
        let platform_caps = match platform_hint {
            Some(hint) => self.select_platform_by_name(hint)?,
            None => self.platforms.first().ok_or_else(|| platform_error("No platforms available"))?,
        };

        let (device_idx, capabilities) = match device_hint {
            Some(index) => platform_caps
                .devices
                .iter()
                .find(|(idx, _)| *idx == index)
                .ok_or_else(|| platform_error(format!("Device {} not found on {}", index, platform_caps.name)))?,
            None => platform_caps
                .devices
                .first()
                .ok_or_else(|| platform_error(format!("No devices on {}", platform_caps.name)))?,
        };

        let platform = Platform::list()
            .into_iter()
            .find(|p| p.name().map(|n| n == platform_caps.name).unwrap_or(false))
            .ok_or_else(|| platform_error(format!("Platform '{}' disappeared", platform_caps.name)))?;

        let device = Device::list_all(platform)
            .map_err(|e| platform_error(format!("Failed to list devices: {}", e)))?
            .get(*device_idx)
            .copied()
            .ok_or_else(|| platform_error("Device not found"))?;

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| BackendError::Device { operation: "context creation", reason: e.to_string() })?;

        tracing::info!(
            "🎯 Selected: {} {} ({:.1}GB)",
            capabilities.vendor,
            capabilities.name,
            capabilities.global_memory as f64 / (1024.0 * 1024.0 * 1024.0)
        );

        Ok(SelectedDevice { platform, device, context, capabilities: capabilities.clone() })
    }

    fn select_platform_by_name(&self, name: &str) -> BackendResult<&PlatformCapabilities> {
        let wanted = name.to_lowercase();
        self.platforms
            .iter()
            .find(|p| p.name.to_lowercase().contains(&wanted))
            .ok_or_else(|| platform_error(format!("Platform '{}' not found", name)))
    }

    /// All detected platforms in preference order
    pub fn list_all(&self) -> &[PlatformCapabilities] {
        &self.platforms
    }
}
