// src/gpu/mod.rs - GPU Module Organization and Public API
// Tree location: ./src/gpu/mod.rs

//! Compute devices for the integrator
//!
//! [`ComputeBackend`] is the seam between the integrator and a device.
//! [`HostDevice`] runs the integration program on the CPU and records every
//! handle it hands out; the OpenCL backend sits behind the `opencl` feature.

/// Backend trait, handle guards and device descriptions
pub mod backend;

/// CPU reference device
pub mod host;

/// OpenCL backend
#[cfg(feature = "opencl")]
pub mod opencl;

pub use backend::{
    ArgKind, BackendError, BackendResult, BufferSpec, ComputeBackend, DeviceCapabilities, DeviceGuard,
    ElementType, GpuVendor, MemAccess,
};
pub use host::{HostDevice, HostDeviceBuilder, LaunchRecord};

#[cfg(feature = "opencl")]
pub use opencl::OpenClDevice;
