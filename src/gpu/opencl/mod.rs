// src/gpu/opencl/mod.rs - OpenCL Module Organization and Public API
// Tree location: ./src/gpu/opencl/mod.rs

//! OpenCL backend for the integrator
//!
//! Enabled with the `opencl` feature. Selects a platform and device
//! (NVIDIA, AMD, Intel) and implements [`ComputeBackend`](crate::gpu::ComputeBackend)
//! over the resulting context.
//!
//! # Version History
//! - 0.1.0: Initial OpenCL backend with platform detection
//! - 0.2.0: Backend trait implementation with typed buffers and profiling events
//!
//! # Module Organization
//! - `platform`: GPU detection and OpenCL context creation
//! - `device`: queue, buffer, program and kernel primitives
//!
//! # Usage Example
//! ```no_run
//! use std::sync::Arc;
//! use xrpd1d::gpu::opencl::OpenClDevice;
//! use xrpd1d::{ContextOwnership, Integrator, Settings};
//!
//! # fn main() -> xrpd1d::Result<()> {
//! let settings = Settings::default().with_env_overrides()?;
//! let device = Arc::new(OpenClDevice::from_settings(&settings)?);
//! let integrator = Integrator::new(device, ContextOwnership::Owned, settings);
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod platform;

pub use device::{ClBuffer, ClKernel, OpenClDevice};
pub use platform::{PlatformCapabilities, PlatformDetector, SelectedDevice};

/// Check OpenCL platform availability
pub fn opencl_available() -> bool {
    PlatformDetector::new().is_ok()
}
