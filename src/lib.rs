// src/lib.rs - Main library file for the xrpd1d integration engine
// Tree location: ./src/lib.rs

//! xrpd1d - GPU histogram-based 1D azimuthal integration
//!
//! Maps every pixel of a detector image to one or more two-theta bins,
//! applies optional per-pixel corrections and accumulates intensity and
//! weight sums per bin on a compute device.
//!
//! # Version History
//! - 0.1.0: Initial OpenCL integrator with fixed-point accumulation
//! - 0.2.0: Added correction pipeline (solid angle, dark, flat, polarization, mask)
//! - 0.3.0: **MAJOR**: Backend trait with owning device guards, host reference device
//! - 0.3.1: Added restricted range and dummy value support
//! - 0.4.0: Status-code surface and settings file support
//!
//! # Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use xrpd1d::{ContextOwnership, HostDevice, Integrator, IntegrationConfig, Settings};
//!
//! # fn main() -> xrpd1d::Result<()> {
//! let device = Arc::new(HostDevice::new());
//! let mut integrator = Integrator::new(device, ContextOwnership::Owned, Settings::default());
//! integrator.get_configuration(IntegrationConfig::new(100, 10_000, 100, true)?)?;
//! integrator.configure(None)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
// Kernel argument binding through `ocl` needs unchecked setters
#![allow(unsafe_code)]

/// Configuration module for engine settings
pub mod config;
/// Compute backends and device resource ownership
pub mod gpu;
/// Integration lifecycle, buffers, kernels and execution
pub mod integrator;

pub use config::{IntegrationConfig, Settings};
pub use gpu::{BackendError, ComputeBackend, DeviceCapabilities, HostDevice};
pub use integrator::{
    ContextOwnership, ExecutionProfile, Integrator, Stage, Timings, Toggle,
};

use thiserror::Error;

/// Main error type for xrpd1d
#[derive(Error, Debug)]
pub enum Xrpd1dError {
    /// Operation called in the wrong lifecycle stage
    #[error("{operation} not allowed: {reason}")]
    Precondition {
        /// Operation that was rejected
        operation: &'static str,
        /// What has to happen first
        reason: String,
    },

    /// Caller-supplied argument out of range or of the wrong length
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration does not fit in device memory
    #[error("Not enough device memory for buffers ({required} requested, {available} available)")]
    InsufficientMemory {
        /// Bytes required by the buffer set
        required: u64,
        /// Total global memory reported by the device
        available: u64,
    },

    /// Device-level failure
    #[error("Device error: {0}")]
    Device(#[from] BackendError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Xrpd1dError {
    /// Integer status code of this error (`-1` fatal, `-2` precondition)
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Precondition { .. } | Self::InvalidArgument(_) | Self::Config(_) => {
                status::PRECONDITION
            }
            Self::InsufficientMemory { .. }
            | Self::Device(_)
            | Self::Io(_)
            | Self::Serialization(_) => status::FATAL,
        }
    }

    pub(crate) fn precondition(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Precondition { operation, reason: reason.into() }
    }
}

/// Status codes shared by every public operation
pub mod status {
    use super::{Result, Toggle};

    /// Operation completed
    pub const SUCCESS: i32 = 0;
    /// Device-level or allocation failure
    pub const FATAL: i32 = -1;
    /// Lifecycle precondition or argument violation
    pub const PRECONDITION: i32 = -2;
    /// Redundant unset, nothing to do
    pub const NOOP: i32 = 1;

    /// Collapse a result into its status code
    pub fn of<T>(result: &Result<T>) -> i32 {
        match result {
            Ok(_) => SUCCESS,
            Err(e) => e.status_code(),
        }
    }

    /// Status code of a toggle result, distinguishing the no-op case
    pub fn of_toggle(result: &Result<Toggle>) -> i32 {
        match result {
            Ok(toggle) => toggle.status_code(),
            Err(e) => e.status_code(),
        }
    }
}

/// Result type alias for xrpd1d operations
pub type Result<T> = std::result::Result<T, Xrpd1dError>;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Library name from Cargo.toml
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Library description from Cargo.toml
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Install the `RUST_LOG`-driven tracing subscriber
///
/// A second call (or a subscriber installed by the host application) is not an error.
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} v{} - {}", NAME, VERSION, DESCRIPTION);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let pre = Xrpd1dError::precondition("execute", "no tth loaded");
        assert_eq!(pre.status_code(), status::PRECONDITION);

        let mem = Xrpd1dError::InsufficientMemory { required: 10, available: 5 };
        assert_eq!(mem.status_code(), status::FATAL);

        let dev = Xrpd1dError::from(BackendError::Device {
            operation: "launch",
            reason: "lost".into(),
        });
        assert_eq!(dev.status_code(), status::FATAL);

        assert_eq!(status::of(&Ok::<(), Xrpd1dError>(())), status::SUCCESS);
        assert_eq!(status::of_toggle(&Ok(Toggle::AlreadyClear)), status::NOOP);
    }

    #[test]
    fn test_init_twice() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }
}
