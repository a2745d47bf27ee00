// src/integrator/buffers.rs - Device buffer set of one configuration
// Tree location: ./src/integrator/buffers.rs

//! Buffer allocator
//!
//! Every configuration owns the same fixed set of named buffers, sized from
//! the image size and bin count. The memory budget is checked against the
//! device's total global memory before anything is allocated; buffers are
//! then created one at a time in [`BufferRole::ALL`] order.
//!
//! # Buffer Layout
//! - Image sized: tth, tth_delta, image, solid_angle, dark, flat,
//!   polarization, span_ranges, mask (int)
//! - Bin sized: histogram, weights (float), uhistogram, uweights
//!   (fixed point, 32 or 64 bit)
//! - Scalars: tth_min_max (2), tth_range (2), dummy_value (1), dummy_delta (1)

use std::sync::Arc;

use super::kernels::BLOCK_SIZE;
use crate::config::IntegrationConfig;
use crate::gpu::{BufferSpec, ComputeBackend, DeviceGuard, ElementType, MemAccess};
use crate::{Result, Xrpd1dError};

/// Logical role of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Two-theta centre of each pixel
    Tth,
    /// Image intensities (corrected in place)
    Image,
    /// Solid-angle coefficients
    SolidAngle,
    /// Floating-point histogram output
    Histogram,
    /// Fixed-point histogram accumulator
    AccumHistogram,
    /// Floating-point weight output
    Weights,
    /// Fixed-point weight accumulator
    AccumWeights,
    /// Per-pixel span in bins, grouped per work-group
    SpanRanges,
    /// Full two-theta range `[min, max]`
    TthMinMax,
    /// Two-theta half-width of each pixel
    TthDelta,
    /// Pixel mask, nonzero excludes
    Mask,
    /// Dummy value
    DummyValue,
    /// Dummy tolerance
    DummyDelta,
    /// Restricted two-theta range `[lo, hi]`
    TthRange,
    /// Dark-field image
    Dark,
    /// Flat-field image
    Flat,
    /// Polarization factors
    Polarization,
}

impl BufferRole {
    /// Allocation order
    pub const ALL: [BufferRole; 17] = [
        BufferRole::Tth,
        BufferRole::Image,
        BufferRole::SolidAngle,
        BufferRole::Histogram,
        BufferRole::AccumHistogram,
        BufferRole::Weights,
        BufferRole::AccumWeights,
        BufferRole::SpanRanges,
        BufferRole::TthMinMax,
        BufferRole::TthDelta,
        BufferRole::Mask,
        BufferRole::DummyValue,
        BufferRole::DummyDelta,
        BufferRole::TthRange,
        BufferRole::Dark,
        BufferRole::Flat,
        BufferRole::Polarization,
    ];

    /// Buffer name used for logging and lookup
    pub fn name(self) -> &'static str {
        match self {
            BufferRole::Tth => "tth",
            BufferRole::Image => "image",
            BufferRole::SolidAngle => "solid_angle",
            BufferRole::Histogram => "histogram",
            BufferRole::AccumHistogram => "uhistogram",
            BufferRole::Weights => "weights",
            BufferRole::AccumWeights => "uweights",
            BufferRole::SpanRanges => "span_ranges",
            BufferRole::TthMinMax => "tth_min_max",
            BufferRole::TthDelta => "tth_delta",
            BufferRole::Mask => "mask",
            BufferRole::DummyValue => "dummy_value",
            BufferRole::DummyDelta => "dummy_delta",
            BufferRole::TthRange => "tth_range",
            BufferRole::Dark => "dark",
            BufferRole::Flat => "flat",
            BufferRole::Polarization => "polarization",
        }
    }

    /// Element type; accumulators follow the configured precision
    pub fn element_type(self, use_double_precision: bool) -> ElementType {
        match self {
            BufferRole::AccumHistogram | BufferRole::AccumWeights => {
                if use_double_precision {
                    ElementType::U64
                } else {
                    ElementType::U32
                }
            }
            BufferRole::Mask => ElementType::I32,
            _ => ElementType::F32,
        }
    }

    /// Creation spec for `config`
    pub fn spec(self, config: &IntegrationConfig) -> BufferSpec {
        let (len, access) = match self {
            BufferRole::Tth
            | BufferRole::TthDelta
            | BufferRole::SolidAngle
            | BufferRole::Dark
            | BufferRole::Flat
            | BufferRole::Polarization => (config.image_size, MemAccess::ReadOnly),
            BufferRole::Image | BufferRole::SpanRanges | BufferRole::Mask => {
                (config.image_size, MemAccess::ReadWrite)
            }
            BufferRole::Histogram | BufferRole::Weights => (config.bin_count, MemAccess::WriteOnly),
            BufferRole::AccumHistogram | BufferRole::AccumWeights => {
                (config.bin_count, MemAccess::ReadWrite)
            }
            BufferRole::TthMinMax | BufferRole::TthRange => (2, MemAccess::ReadOnly),
            BufferRole::DummyValue | BufferRole::DummyDelta => (1, MemAccess::ReadOnly),
        };
        BufferSpec {
            name: self.name(),
            element_type: self.element_type(config.use_double_precision),
            len,
            access,
        }
    }
}

/// Total device bytes needed by the buffer set of `config`
pub fn required_bytes(config: &IntegrationConfig) -> u64 {
    BufferRole::ALL.iter().map(|role| role.spec(config).bytes()).sum()
}

/// Buffers of one configuration, indexed by role
pub struct BufferSet<B: ComputeBackend> {
    slots: Vec<DeviceGuard<B, B::Buffer>>,
}

impl<B: ComputeBackend> BufferSet<B> {
    /// Check the budget and allocate every buffer
    ///
    /// On failure, buffers created so far are released in acquisition order.
    pub fn allocate(backend: &Arc<B>, queue: &B::Queue, config: &IntegrationConfig) -> Result<Self> {
        if config.image_size < BLOCK_SIZE {
            tracing::error!(
                "❌ Image size ({}) must be >= BLOCK_SIZE ({})",
                config.image_size,
                BLOCK_SIZE
            );
            return Err(Xrpd1dError::InvalidArgument(format!(
                "image size {} is smaller than the work-group size {}",
                config.image_size, BLOCK_SIZE
            )));
        }

        let required = required_bytes(config);
        let available = backend.capabilities().global_memory;
        if available == 0 {
            tracing::warn!(
                "⚠️  Device reports no global memory size; skipping budget check for {} bytes",
                required
            );
        } else if required >= available {
            tracing::error!(
                "❌ Not enough device memory for buffers ({} requested, {} available)",
                required,
                available
            );
            return Err(Xrpd1dError::InsufficientMemory { required, available });
        }

        tracing::debug!(
            "📦 Allocating {} buffers ({:.2} MB)",
            BufferRole::ALL.len(),
            required as f64 / (1024.0 * 1024.0)
        );

        let mut slots = Vec::with_capacity(BufferRole::ALL.len());
        for role in BufferRole::ALL {
            let spec = role.spec(config);
            match backend.create_buffer(queue, &spec) {
                Ok(buffer) => {
                    slots.push(DeviceGuard::new(backend, spec.name, buffer, B::release_buffer));
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Buffer {} allocation failed: {}; releasing {} allocated buffers",
                        spec.name,
                        e,
                        slots.len()
                    );
                    drop(slots);
                    return Err(e.into());
                }
            }
        }

        Ok(Self { slots })
    }

    /// Buffer for `role`
    pub fn get(&self, role: BufferRole) -> &B::Buffer {
        &self.slots[role as usize]
    }

    /// Number of buffers held
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no buffer is held
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostDevice;

    fn config(image_size: usize, bin_count: usize, fp64: bool) -> IntegrationConfig {
        IntegrationConfig { image_stride: 16, image_size, bin_count, use_double_precision: fp64 }
    }

    #[test]
    fn test_role_order_matches_discriminants() {
        for (index, role) in BufferRole::ALL.iter().enumerate() {
            assert_eq!(*role as usize, index);
        }
    }

    #[test]
    fn test_required_bytes_closed_form() {
        let n = 10_000u64;
        let b = 100u64;
        assert_eq!(required_bytes(&config(10_000, 100, true)), 9 * 4 * n + 2 * 4 * b + 2 * 8 * b + 6 * 4);
        assert_eq!(required_bytes(&config(10_000, 100, false)), 9 * 4 * n + 2 * 4 * b + 2 * 4 * b + 6 * 4);
    }

    #[test]
    fn test_accumulator_precision() {
        assert_eq!(BufferRole::AccumWeights.element_type(true), ElementType::U64);
        assert_eq!(BufferRole::AccumHistogram.element_type(false), ElementType::U32);
        assert_eq!(BufferRole::Mask.element_type(true), ElementType::I32);
        assert_eq!(BufferRole::Dark.spec(&config(256, 10, false)).len, 256);
    }

    #[test]
    fn test_allocate_full_set() {
        let device = Arc::new(HostDevice::new());
        let queue = device.create_queue().unwrap();
        let set = BufferSet::allocate(&device, &queue, &config(256, 10, false)).unwrap();
        assert_eq!(set.len(), 17);
        assert_eq!(device.live_buffers(), 17);
        assert_eq!(device.allocated_bytes(), required_bytes(&config(256, 10, false)));

        drop(set);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_partial_failure_releases_everything() {
        let device = Arc::new(HostDevice::builder().fail_buffer("mask").build());
        let queue = device.create_queue().unwrap();
        let result = BufferSet::allocate(&device, &queue, &config(256, 10, true));
        assert_eq!(result.err().map(|e| e.status_code()), Some(crate::status::FATAL));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_budget_check() {
        let device = Arc::new(HostDevice::builder().global_memory(1024).build());
        let queue = device.create_queue().unwrap();
        let result = BufferSet::allocate(&device, &queue, &config(256, 10, false));
        assert!(matches!(result, Err(Xrpd1dError::InsufficientMemory { available: 1024, .. })));
        assert_eq!(device.live_buffers(), 0);

        // unknown memory size: warn and carry on
        let device = Arc::new(HostDevice::builder().global_memory(0).build());
        let queue = device.create_queue().unwrap();
        assert!(BufferSet::allocate(&device, &queue, &config(256, 10, false)).is_ok());
    }

    #[test]
    fn test_image_smaller_than_block_is_rejected() {
        let device = Arc::new(HostDevice::new());
        let queue = device.create_queue().unwrap();
        let result = BufferSet::allocate(&device, &queue, &config(BLOCK_SIZE - 1, 10, false));
        assert_eq!(result.err().map(|e| e.status_code()), Some(crate::status::PRECONDITION));
        assert_eq!(device.live_buffers(), 0);
    }
}
