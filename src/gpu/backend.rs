// src/gpu/backend.rs - Compute backend abstraction and device resource guards
// Tree location: ./src/gpu/backend.rs

//! Compute backend abstraction
//!
//! The integrator talks to a device only through [`ComputeBackend`]. Each
//! backend exposes opaque handle types for queues, buffers, programs,
//! kernels and profiling events; the integrator wraps every handle in a
//! [`DeviceGuard`] so it is released exactly once on every exit path.
//!
//! # Version History
//! - 0.1.0: Extracted from the OpenCL buffer and kernel managers
//! - 0.1.1: Typed buffer specs and kernel argument signatures
//! - 0.1.2: Owning guards with best-effort release logging

use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Device-level errors reported by a backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Buffer creation failed
    #[error("Buffer '{buffer}' allocation failed: {reason}")]
    Allocation {
        /// Name of the buffer that failed
        buffer: String,
        /// Device-reported reason
        reason: String,
    },

    /// Program compilation failed
    #[error("Program build failed: {0}")]
    Build(String),

    /// Kernel creation failed
    #[error("Kernel '{kernel}' creation failed: {reason}")]
    KernelCreation {
        /// Entry point name
        kernel: String,
        /// Device-reported reason
        reason: String,
    },

    /// Any other device operation failed
    #[error("{operation} failed: {reason}")]
    Device {
        /// Failing operation
        operation: &'static str,
        /// Device-reported reason
        reason: String,
    },

    /// Buffer element type does not match the operation
    #[error("Type mismatch on '{buffer}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Buffer involved
        buffer: String,
        /// Element type the operation needs
        expected: ElementType,
        /// Element type of the buffer
        found: ElementType,
    },

    /// Host slice length does not match the device buffer
    #[error("Size mismatch on '{buffer}': buffer holds {expected} elements, host slice has {found}")]
    SizeMismatch {
        /// Buffer involved
        buffer: String,
        /// Buffer length in elements
        expected: usize,
        /// Host slice length
        found: usize,
    },

    /// Kernel launched with an unbound argument slot
    #[error("Kernel '{kernel}' argument {slot} is not bound")]
    Unbound {
        /// Entry point name
        kernel: String,
        /// Argument index
        slot: u32,
    },
}

/// Result alias for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Element type of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// 32-bit floating point
    F32,
    /// 32-bit signed integer
    I32,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
}

impl ElementType {
    /// Get size in bytes
    pub fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "float"),
            Self::I32 => write!(f, "int"),
            Self::U32 => write!(f, "uint"),
            Self::U64 => write!(f, "ulong"),
        }
    }
}

/// Kernel-side access pattern of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    /// Uploaded by the host, only read by kernels
    ReadOnly,
    /// Written by kernels, only read back by the host
    WriteOnly,
    /// Read and written by kernels
    ReadWrite,
}

#[cfg(feature = "opencl")]
impl MemAccess {
    /// Convert to OpenCL memory flags
    pub fn to_mem_flags(self) -> ocl::flags::MemFlags {
        use ocl::flags::MemFlags;
        match self {
            Self::ReadOnly => MemFlags::READ_ONLY,
            Self::WriteOnly => MemFlags::WRITE_ONLY,
            Self::ReadWrite => MemFlags::READ_WRITE,
        }
    }
}

/// Buffer specification for creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Buffer name for identification and logging
    pub name: &'static str,
    /// Element type
    pub element_type: ElementType,
    /// Length in elements
    pub len: usize,
    /// Kernel access pattern
    pub access: MemAccess,
}

impl BufferSpec {
    /// Size in bytes
    pub fn bytes(&self) -> u64 {
        (self.len * self.element_type.size_bytes()) as u64
    }
}

/// Kind of one kernel argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Global memory pointer to elements of the given type
    Buffer(ElementType),
    /// `uint` scalar
    Uint,
}

/// GPU vendor identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    /// NVIDIA GPUs
    Nvidia,
    /// AMD GPUs
    Amd,
    /// Intel GPUs
    Intel,
    /// Unknown or other vendors
    Unknown,
}

impl GpuVendor {
    /// Detect vendor from a platform or device name
    pub fn detect(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("nvidia") || lower.contains("cuda") {
            Self::Nvidia
        } else if lower.contains("amd")
            || lower.contains("advanced micro devices")
            || lower.contains("rocm")
        {
            Self::Amd
        } else if lower.contains("intel") {
            Self::Intel
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nvidia => write!(f, "NVIDIA"),
            Self::Amd => write!(f, "AMD"),
            Self::Intel => write!(f, "Intel"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Capabilities of the device behind a backend
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    /// Name of the device
    pub name: String,
    /// Vendor of the device
    pub vendor: GpuVendor,
    /// Total global memory in bytes (0 when unknown)
    pub global_memory: u64,
    /// Maximum single allocation in bytes
    pub max_alloc_size: u64,
    /// Maximum work group size
    pub max_work_group_size: usize,
    /// Number of compute units
    pub compute_units: u32,
    /// Backend type (e.g., "OpenCL")
    pub backend: String,
}

/// Device primitives consumed by the integrator
///
/// Every enqueue is issued on one in-order queue. Transfers are blocking.
/// Events carry the device-side duration of the command that produced them
/// and are released when passed to [`ComputeBackend::elapsed_ns`].
pub trait ComputeBackend {
    /// Command queue handle
    type Queue;
    /// Device buffer handle
    type Buffer;
    /// Compiled program handle
    type Program;
    /// Kernel handle with its bound arguments
    type Kernel;
    /// Profiling event
    type Event;

    /// Device description
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Create a profiling-enabled in-order queue
    fn create_queue(&self) -> BackendResult<Self::Queue>;

    /// Allocate an uninitialized buffer
    fn create_buffer(&self, queue: &Self::Queue, spec: &BufferSpec) -> BackendResult<Self::Buffer>;

    /// Compile the program at `source` with build `options`
    fn build_program(
        &self,
        source: &Path,
        options: &str,
        block_size: usize,
    ) -> BackendResult<Self::Program>;

    /// Create a kernel for entry point `name` with the given argument slots
    fn create_kernel(
        &self,
        program: &Self::Program,
        queue: &Self::Queue,
        name: &str,
        signature: &[ArgKind],
    ) -> BackendResult<Self::Kernel>;

    /// Bind a buffer to argument `slot`
    fn set_buffer_arg(
        &self,
        kernel: &mut Self::Kernel,
        slot: u32,
        buffer: &Self::Buffer,
    ) -> BackendResult<()>;

    /// Bind a `uint` scalar to argument `slot`
    fn set_uint_arg(&self, kernel: &mut Self::Kernel, slot: u32, value: u32) -> BackendResult<()>;

    /// Blocking upload of `f32` data
    fn write_f32(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        data: &[f32],
    ) -> BackendResult<Self::Event>;

    /// Blocking upload of `i32` data
    fn write_i32(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        data: &[i32],
    ) -> BackendResult<Self::Event>;

    /// Blocking download of `f32` data
    fn read_f32(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [f32],
    ) -> BackendResult<Self::Event>;

    /// Enqueue a 1-D range of `global` lanes in groups of `local`
    fn launch(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global: usize,
        local: usize,
    ) -> BackendResult<Self::Event>;

    /// Wait until every enqueued command has completed
    fn finish(&self, queue: &Self::Queue) -> BackendResult<()>;

    /// Device-side duration of the event's command, releasing the event
    fn elapsed_ns(&self, event: Self::Event) -> BackendResult<u64>;

    /// Release a buffer
    fn release_buffer(&self, buffer: Self::Buffer) -> BackendResult<()>;
    /// Release a kernel
    fn release_kernel(&self, kernel: Self::Kernel) -> BackendResult<()>;
    /// Release a program
    fn release_program(&self, program: Self::Program) -> BackendResult<()>;
    /// Release a queue
    fn release_queue(&self, queue: Self::Queue) -> BackendResult<()>;

    /// Release the device context
    fn teardown(&self) -> BackendResult<()>;
}

/// Owning guard around one device handle
///
/// Dropping the guard hands the handle back to the backend's release
/// function. Release failures are logged and never abort the caller.
pub struct DeviceGuard<B: ComputeBackend, T> {
    backend: Arc<B>,
    label: &'static str,
    handle: ManuallyDrop<T>,
    release: fn(&B, T) -> BackendResult<()>,
}

impl<B: ComputeBackend, T> DeviceGuard<B, T> {
    /// Take ownership of `handle`
    pub fn new(
        backend: &Arc<B>,
        label: &'static str,
        handle: T,
        release: fn(&B, T) -> BackendResult<()>,
    ) -> Self {
        Self {
            backend: Arc::clone(backend),
            label,
            handle: ManuallyDrop::new(handle),
            release,
        }
    }
}

impl<B: ComputeBackend, T> Deref for DeviceGuard<B, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.handle
    }
}

impl<B: ComputeBackend, T> DerefMut for DeviceGuard<B, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.handle
    }
}

impl<B: ComputeBackend, T> Drop for DeviceGuard<B, T> {
    fn drop(&mut self) {
        // SAFETY: the handle is taken exactly once, here, and never touched afterwards.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        match (self.release)(&self.backend, handle) {
            Ok(()) => tracing::trace!("🧹 Released {}", self.label),
            Err(e) => tracing::warn!("⚠️  Failed to release {}: {}", self.label, e),
        }
    }
}

impl<B: ComputeBackend, T> fmt::Debug for DeviceGuard<B, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGuard").field("label", &self.label).finish()
    }
}
