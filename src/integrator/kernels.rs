// src/integrator/kernels.rs - Program compilation and kernel argument binding
// Tree location: ./src/integrator/kernels.rs

//! Kernel binder
//!
//! Compiles the integration program with size-specialized macros, creates
//! the eight kernels by entry-point name and binds their argument slots to
//! the buffers of the configuration.
//!
//! # Version History
//! - 0.1.0: Kernel creation and fixed argument binding
//! - 0.1.1: Active-range slot rebind for restricted ranges
//! - 0.1.2: Correction flags passed as a `uint` argument

use std::path::Path;
use std::sync::Arc;

use super::buffers::{BufferRole, BufferSet};
use crate::config::IntegrationConfig;
use crate::gpu::{ArgKind, ComputeBackend, DeviceGuard};
use crate::Result;

/// Work-group width every kernel is launched with
pub const BLOCK_SIZE: usize = 128;

/// Argument slot of the binning kernel holding the active two-theta range
pub const RANGE_SLOT: u32 = 8;

/// Argument slot of the correction kernel holding the flag word
pub const FLAGS_SLOT: u32 = 5;

/// Global work size for `n` lanes
///
/// Full blocks plus one block per remainder lane; always a multiple of
/// [`BLOCK_SIZE`], padding lanes exit early in the kernels.
pub fn work_size(n: usize) -> usize {
    (n / BLOCK_SIZE) * BLOCK_SIZE + (n % BLOCK_SIZE) * BLOCK_SIZE
}

/// Build options specializing the program for `config`
pub fn build_options(config: &IntegrationConfig) -> String {
    let mut options = format!(
        " -D BINS={} -D NX={} -D NN={} ",
        config.bin_count, config.image_stride, config.image_size
    );
    if config.use_double_precision {
        options.push_str("-D ENABLE_FP64");
    }
    options
}

/// One argument slot binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Buffer of the given role
    Buffer(BufferRole),
    /// Correction flag word
    Flags,
}

/// Which size a kernel's range covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkRange {
    /// One lane per pixel
    Image,
    /// One lane per bin
    Bins,
}

/// The eight kernels of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelName {
    /// Histogram binning
    Integrate,
    /// Zero both fixed-point accumulators
    ResetAccumulators,
    /// Zero the mask
    ResetMask,
    /// Fixed point to float conversion
    Convert,
    /// Per-pixel span in bins
    GetSpans,
    /// Work-group maximum of the spans
    GroupSpans,
    /// Dark, flat, solid-angle and polarization corrections
    Corrections,
    /// Dummy value flagging
    DummyValue,
}

impl KernelName {
    /// Creation order
    pub const ALL: [KernelName; 8] = [
        KernelName::Integrate,
        KernelName::ResetAccumulators,
        KernelName::ResetMask,
        KernelName::Convert,
        KernelName::GetSpans,
        KernelName::GroupSpans,
        KernelName::Corrections,
        KernelName::DummyValue,
    ];

    /// Entry point in the program source
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelName::Integrate => "create_histo_binarray",
            KernelName::ResetAccumulators => "uimemset2",
            KernelName::ResetMask => "imemset",
            KernelName::Convert => "ui2f2",
            KernelName::GetSpans => "get_spans",
            KernelName::GroupSpans => "group_spans",
            KernelName::Corrections => "solidangle_correction",
            KernelName::DummyValue => "dummyval_correction",
        }
    }

    /// Argument slots in signature order
    pub fn bindings(self) -> &'static [Binding] {
        use BufferRole::*;
        match self {
            KernelName::Integrate => &[
                Binding::Buffer(Tth),
                Binding::Buffer(TthDelta),
                Binding::Buffer(AccumWeights),
                Binding::Buffer(TthMinMax),
                Binding::Buffer(Image),
                Binding::Buffer(AccumHistogram),
                Binding::Buffer(SpanRanges),
                Binding::Buffer(Mask),
                Binding::Buffer(TthMinMax),
            ],
            KernelName::ResetAccumulators => {
                &[Binding::Buffer(AccumWeights), Binding::Buffer(AccumHistogram)]
            }
            KernelName::ResetMask => &[Binding::Buffer(Mask)],
            KernelName::Convert => &[
                Binding::Buffer(AccumWeights),
                Binding::Buffer(AccumHistogram),
                Binding::Buffer(Weights),
                Binding::Buffer(Histogram),
            ],
            KernelName::GetSpans => &[
                Binding::Buffer(TthDelta),
                Binding::Buffer(TthMinMax),
                Binding::Buffer(SpanRanges),
            ],
            KernelName::GroupSpans => &[Binding::Buffer(SpanRanges)],
            KernelName::Corrections => &[
                Binding::Buffer(Image),
                Binding::Buffer(SolidAngle),
                Binding::Buffer(Dark),
                Binding::Buffer(Flat),
                Binding::Buffer(Polarization),
                Binding::Flags,
            ],
            KernelName::DummyValue => &[
                Binding::Buffer(Image),
                Binding::Buffer(DummyValue),
                Binding::Buffer(DummyDelta),
            ],
        }
    }

    /// Argument kinds for the configured precision
    pub fn signature(self, use_double_precision: bool) -> Vec<ArgKind> {
        self.bindings()
            .iter()
            .map(|binding| match binding {
                Binding::Buffer(role) => ArgKind::Buffer(role.element_type(use_double_precision)),
                Binding::Flags => ArgKind::Uint,
            })
            .collect()
    }

    /// Range the kernel is launched over
    pub fn range(self) -> WorkRange {
        match self {
            KernelName::ResetAccumulators | KernelName::Convert => WorkRange::Bins,
            _ => WorkRange::Image,
        }
    }

    /// Global work size for `config`
    pub fn global_size(self, config: &IntegrationConfig) -> usize {
        match self.range() {
            WorkRange::Image => work_size(config.image_size),
            WorkRange::Bins => work_size(config.bin_count),
        }
    }
}

/// Compile the program at `source` for `config`
pub fn build_program<B: ComputeBackend>(
    backend: &Arc<B>,
    source: &Path,
    config: &IntegrationConfig,
) -> Result<DeviceGuard<B, B::Program>> {
    let options = build_options(config);
    tracing::debug!("🔧 Compiling {} with options '{}'", source.display(), options.trim());
    let program = backend.build_program(source, &options, BLOCK_SIZE).map_err(|e| {
        tracing::error!("❌ Program compilation failed: {}", e);
        e
    })?;
    Ok(DeviceGuard::new(backend, "program", program, B::release_program))
}

/// Kernels of one configuration, indexed by [`KernelName`]
pub struct KernelSet<B: ComputeBackend> {
    kernels: Vec<DeviceGuard<B, B::Kernel>>,
    config: IntegrationConfig,
}

impl<B: ComputeBackend> KernelSet<B> {
    /// Create all eight kernels; any failure releases those already created
    pub fn create(
        backend: &Arc<B>,
        program: &B::Program,
        queue: &B::Queue,
        config: &IntegrationConfig,
    ) -> Result<Self> {
        let mut kernels = Vec::with_capacity(KernelName::ALL.len());
        for name in KernelName::ALL {
            let signature = name.signature(config.use_double_precision);
            let kernel = backend
                .create_kernel(program, queue, name.entry_point(), &signature)
                .map_err(|e| {
                    tracing::error!("❌ Kernel {} creation failed: {}", name.entry_point(), e);
                    e
                })?;
            kernels.push(DeviceGuard::new(backend, name.entry_point(), kernel, B::release_kernel));
        }
        tracing::debug!("✅ Created {} kernels", kernels.len());
        Ok(Self { kernels, config: *config })
    }

    /// Kernel handle for `name`
    pub fn get(&self, name: KernelName) -> &B::Kernel {
        &self.kernels[name as usize]
    }

    /// Bind every buffer slot; the flag word starts at zero
    pub fn bind_all(&mut self, backend: &B, buffers: &BufferSet<B>) -> Result<()> {
        for name in KernelName::ALL {
            let kernel = &mut self.kernels[name as usize];
            for (slot, binding) in name.bindings().iter().enumerate() {
                match binding {
                    Binding::Buffer(role) => {
                        backend.set_buffer_arg(kernel, slot as u32, buffers.get(*role))?
                    }
                    Binding::Flags => backend.set_uint_arg(kernel, slot as u32, 0)?,
                }
            }
        }
        Ok(())
    }

    /// Point the binning kernel's active range at the restricted or full range
    pub fn rebind_range(&mut self, backend: &B, buffers: &BufferSet<B>, restricted: bool) -> Result<()> {
        let role = if restricted { BufferRole::TthRange } else { BufferRole::TthMinMax };
        let kernel = &mut self.kernels[KernelName::Integrate as usize];
        backend.set_buffer_arg(kernel, RANGE_SLOT, buffers.get(role))?;
        tracing::debug!("🔧 Active range bound to {}", role.name());
        Ok(())
    }

    /// Set the correction kernel's flag word
    pub fn set_correction_flags(&mut self, backend: &B, flags: u32) -> Result<()> {
        let kernel = &mut self.kernels[KernelName::Corrections as usize];
        backend.set_uint_arg(kernel, FLAGS_SLOT, flags)?;
        Ok(())
    }

    /// Enqueue `name` over its range
    pub fn launch(&self, backend: &B, queue: &B::Queue, name: KernelName) -> Result<B::Event> {
        let global = name.global_size(&self.config);
        tracing::trace!(
            "--{} workdim {} threadim {} -- Blocks:{}",
            name.entry_point(),
            global,
            BLOCK_SIZE,
            global / BLOCK_SIZE
        );
        let event = backend.launch(queue, self.get(name), global, BLOCK_SIZE).map_err(|e| {
            tracing::error!("❌ {} launch failed: {}", name.entry_point(), e);
            e
        })?;
        Ok(event)
    }
}
