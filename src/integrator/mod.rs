// src/integrator/mod.rs - Lifecycle controller and public operations
// Tree location: ./src/integrator/mod.rs

//! Histogram integrator
//!
//! [`Integrator`] drives one device context through the lifecycle
//! `NoContext → ContextActive → ParametersSet → Configured → TthLoaded`.
//! Every operation checks its stage before touching the device; a rejected
//! call leaves all state unchanged.
//!
//! # Version History
//! - 0.1.0: configure / loadTth / execute / clean
//! - 0.1.1: Solid angle, dark and mask corrections
//! - 0.2.0: Independent flat and polarization corrections
//! - 0.2.1: Restricted range and dummy value options
//! - 0.3.0: **MAJOR**: Owning device guards, rollback on partial configure
//!
//! # Module Organization
//! - `tracker`: lifecycle stage and held device resources
//! - `buffers`: named buffer set and memory budget
//! - `kernels`: program build options, kernel creation and argument binding
//! - `corrections`: correction flags consumed by execute
//! - `engine`: the execute pipeline and timing accounting

pub mod buffers;
pub mod corrections;
pub mod engine;
pub mod kernels;
pub mod tracker;

pub use buffers::{required_bytes, BufferRole, BufferSet};
pub use corrections::{Correction, CorrectionState, Toggle};
pub use engine::{ExecutionProfile, Timings};
pub use kernels::{work_size, KernelName, BLOCK_SIZE};
pub use tracker::{Capabilities, Capability, Stage};

use std::path::Path;
use std::sync::Arc;

use crate::config::{IntegrationConfig, Settings};
use crate::gpu::{ComputeBackend, DeviceGuard};
use crate::{Result, Xrpd1dError};
use kernels::KernelSet;
use tracker::DeviceResources;

/// Whether the integrator tears the context down on a full clean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOwnership {
    /// The integrator releases the context on `clean(false)` and on drop
    Owned,
    /// The caller keeps the context; the integrator only detaches
    Shared,
}

/// Per-pixel data uploaded by a correction setter
enum Upload<'a> {
    Floats(&'a [f32]),
    Ints(&'a [i32]),
}

impl Upload<'_> {
    fn len(&self) -> usize {
        match self {
            Upload::Floats(values) => values.len(),
            Upload::Ints(values) => values.len(),
        }
    }
}

/// GPU histogram integrator over one compute context
pub struct Integrator<B: ComputeBackend> {
    backend: Option<Arc<B>>,
    ownership: ContextOwnership,
    settings: Settings,
    stage: Stage,
    params: Option<IntegrationConfig>,
    active: Option<IntegrationConfig>,
    resources: DeviceResources<B>,
    corrections: CorrectionState,
    timings: Timings,
    last_profile: Option<ExecutionProfile>,
}

impl<B: ComputeBackend> Integrator<B> {
    /// Integrator over an established context
    pub fn new(backend: Arc<B>, ownership: ContextOwnership, settings: Settings) -> Self {
        let caps = backend.capabilities();
        tracing::info!(
            "🎯 Integrator on {} {} ({:.1} GB, {})",
            caps.vendor,
            caps.name,
            caps.global_memory as f64 / (1024.0 * 1024.0 * 1024.0),
            caps.backend
        );
        Self {
            backend: Some(backend),
            ownership,
            settings,
            stage: Stage::ContextActive,
            params: None,
            active: None,
            resources: DeviceResources::default(),
            corrections: CorrectionState::default(),
            timings: Timings::default(),
            last_profile: None,
        }
    }

    /// Integrator without a context; call [`Integrator::attach_context`] first
    pub fn detached(settings: Settings) -> Self {
        Self {
            backend: None,
            ownership: ContextOwnership::Shared,
            settings,
            stage: Stage::NoContext,
            params: None,
            active: None,
            resources: DeviceResources::default(),
            corrections: CorrectionState::default(),
            timings: Timings::default(),
            last_profile: None,
        }
    }

    /// Attach a context after construction or after a full clean
    pub fn attach_context(&mut self, backend: Arc<B>, ownership: ContextOwnership) -> Result<()> {
        if self.backend.is_some() {
            tracing::error!("❌ attach_context(): a context is already active (Hint: run clean(false))");
            return Err(Xrpd1dError::precondition("attach_context", "a context is already active"));
        }
        tracing::info!("🔗 Attached context: {}", backend.capabilities().name);
        self.backend = Some(backend);
        self.ownership = ownership;
        self.stage = Stage::ContextActive;
        Ok(())
    }

    /// Validate and store integration parameters
    ///
    /// While configured, the new parameters take effect at the next `configure`.
    pub fn get_configuration(&mut self, config: IntegrationConfig) -> Result<()> {
        self.stage.require(Stage::ContextActive, "get_configuration", "attach a context")?;
        if let Err(e) = config.validate() {
            tracing::error!(
                "❌ get_configuration() parameters make no sense {{{} {} {}}}",
                config.image_stride,
                config.image_size,
                config.bin_count
            );
            return Err(e);
        }

        self.params = Some(config);
        if self.stage == Stage::ContextActive {
            self.stage = Stage::ParametersSet;
        } else if self.stage >= Stage::Configured {
            tracing::debug!("🔧 New parameters stored; they take effect at the next configure()");
        }
        tracing::debug!(
            "🔧 Parameters: Nx={} Nimage={} Nbins={} fp64={}",
            config.image_stride,
            config.image_size,
            config.bin_count,
            config.use_double_precision
        );
        Ok(())
    }

    /// Allocate buffers, compile the program and bind the kernels
    ///
    /// Any previous configuration is released first. `kernel_path` defaults to
    /// the settings' kernel path.
    pub fn configure(&mut self, kernel_path: Option<&Path>) -> Result<()> {
        self.stage.require(Stage::ContextActive, "configure", "attach a context")?;
        self.stage.require(Stage::ParametersSet, "configure", "run get_configuration()")?;
        let backend = self.context("configure")?;
        let config = self
            .params
            .ok_or_else(|| Xrpd1dError::precondition("configure", "parameters not set"))?;
        let path = kernel_path.unwrap_or(self.settings.kernel_path.as_path()).to_path_buf();

        self.release_configuration();

        match self.build_configuration(&backend, &config, &path) {
            Ok(()) => {
                self.active = Some(config);
                self.stage = Stage::Configured;
                tracing::info!(
                    "✅ Configured: {} pixels, {} bins, {} accumulators",
                    config.image_size,
                    config.bin_count,
                    if config.use_double_precision { "64-bit" } else { "32-bit" }
                );
                Ok(())
            }
            Err(e) => {
                let released = self.resources.release_all();
                tracing::error!("❌ configure() failed: {} (rolled back: {})", e, released);
                self.params = None;
                self.stage = Stage::ContextActive;
                Err(e)
            }
        }
    }

    fn build_configuration(&mut self, backend: &Arc<B>, config: &IntegrationConfig, path: &Path) -> Result<()> {
        let queue = backend.create_queue().map_err(|e| {
            tracing::error!("❌ Command queue creation failed: {}", e);
            e
        })?;
        let queue: &B::Queue =
            self.resources.queue.insert(DeviceGuard::new(backend, "queue", queue, B::release_queue));

        let buffers: &BufferSet<B> = self.resources.buffers.insert(BufferSet::allocate(backend, queue, config)?);

        let program: &B::Program = self.resources.program.insert(kernels::build_program(backend, path, config)?);

        let kernel_set = self.resources.kernels.insert(KernelSet::create(backend, program, queue, config)?);
        kernel_set.bind_all(backend, buffers)?;

        let event = kernel_set.launch(backend, queue, KernelName::ResetMask)?;
        backend.finish(queue)?;
        let ns = engine::timed(backend.as_ref(), event, "Reset Mask")?;
        self.timings.add_exec(ns);
        Ok(())
    }

    /// Upload the two-theta centre and half-width arrays and their range
    ///
    /// A call that fails after the first upload leaves the engine
    /// `Configured`: `execute` is refused until a load succeeds.
    pub fn load_tth(&mut self, tth: &[f32], dtth: &[f32], tth_min: f32, tth_max: f32) -> Result<()> {
        let config = self.require_configured("load_tth")?;
        Self::check_len("tth", tth.len(), config.image_size)?;
        Self::check_len("dtth", dtth.len(), config.image_size)?;
        if !(tth_min.is_finite() && tth_max.is_finite() && tth_min < tth_max) {
            tracing::error!("❌ load_tth(): invalid two-theta range [{}, {}]", tth_min, tth_max);
            return Err(Xrpd1dError::InvalidArgument(format!(
                "two-theta range [{}, {}] is empty or not finite",
                tth_min, tth_max
            )));
        }

        let backend = self.context("load_tth")?;
        let parts = self.resources.parts("load_tth")?;
        // the previous arrays are overwritten from here on
        self.stage = Stage::Configured;
        let (transfer_ns, exec_ns) = engine::load_tth(backend.as_ref(), parts, tth, dtth, [tth_min, tth_max])?;
        self.timings.add_transfer(transfer_ns);
        self.timings.add_exec(exec_ns);
        self.stage = Stage::TthLoaded;
        tracing::debug!("✅ Two-theta arrays loaded ([{}, {}])", tth_min, tth_max);
        Ok(())
    }

    /// Enable solid-angle correction with the given coefficients
    pub fn set_solid_angle(&mut self, values: &[f32]) -> Result<()> {
        self.set_correction(Correction::SolidAngle, "set_solid_angle", Upload::Floats(values))
    }

    /// Disable solid-angle correction
    pub fn unset_solid_angle(&mut self) -> Result<Toggle> {
        self.unset_correction(Correction::SolidAngle, "unset_solid_angle")
    }

    /// Enable dark-field subtraction
    pub fn set_dark(&mut self, values: &[f32]) -> Result<()> {
        self.set_correction(Correction::Dark, "set_dark", Upload::Floats(values))
    }

    /// Disable dark-field subtraction
    pub fn unset_dark(&mut self) -> Result<Toggle> {
        self.unset_correction(Correction::Dark, "unset_dark")
    }

    /// Enable flat-field correction
    pub fn set_flat(&mut self, values: &[f32]) -> Result<()> {
        self.set_correction(Correction::Flat, "set_flat", Upload::Floats(values))
    }

    /// Disable flat-field correction
    pub fn unset_flat(&mut self) -> Result<Toggle> {
        self.unset_correction(Correction::Flat, "unset_flat")
    }

    /// Enable polarization correction
    pub fn set_polarization(&mut self, values: &[f32]) -> Result<()> {
        self.set_correction(Correction::Polarization, "set_polarization", Upload::Floats(values))
    }

    /// Disable polarization correction
    pub fn unset_polarization(&mut self) -> Result<Toggle> {
        self.unset_correction(Correction::Polarization, "unset_polarization")
    }

    /// Exclude pixels whose mask value is nonzero
    pub fn set_mask(&mut self, mask: &[i32]) -> Result<()> {
        self.set_correction(Correction::Mask, "set_mask", Upload::Ints(mask))
    }

    /// Stop masking and reset the mask buffer to zero
    pub fn unset_mask(&mut self) -> Result<Toggle> {
        self.unset_correction(Correction::Mask, "unset_mask")
    }

    fn set_correction(&mut self, correction: Correction, operation: &'static str, data: Upload<'_>) -> Result<()> {
        tracing::debug!("Setting {:?}", correction);
        let config = self.require_configured(operation)?;
        Self::check_len(correction.role().name(), data.len(), config.image_size)?;

        let backend = self.context(operation)?;
        let parts = self.resources.parts(operation)?;
        let buffer = parts.buffers.get(correction.role());
        let event = match data {
            Upload::Floats(values) => backend.write_f32(parts.queue, buffer, values)?,
            Upload::Ints(values) => backend.write_i32(parts.queue, buffer, values)?,
        };
        let ns = engine::timed(backend.as_ref(), event, correction.role().name())?;
        self.timings.add_transfer(ns);
        self.corrections.enable(correction);
        Ok(())
    }

    fn unset_correction(&mut self, correction: Correction, operation: &'static str) -> Result<Toggle> {
        tracing::debug!("Unsetting {:?}", correction);
        if !self.corrections.is_enabled(correction) {
            tracing::debug!("{}(): {:?} was not set, nothing to do", operation, correction);
            return Ok(Toggle::AlreadyClear);
        }

        if correction == Correction::Mask {
            let backend = self.context(operation)?;
            let parts = self.resources.parts(operation)?;
            let event = parts.kernels.launch(backend.as_ref(), parts.queue, KernelName::ResetMask)?;
            backend.finish(parts.queue)?;
            let ns = engine::timed(backend.as_ref(), event, "Reset Mask to 0")?;
            self.timings.add_transfer(ns);
        }

        Ok(self.corrections.disable(correction))
    }

    /// Restrict binning to `[lo, hi]`
    pub fn set_range(&mut self, lo: f32, hi: f32) -> Result<()> {
        self.require_configured("set_range")?;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(Xrpd1dError::InvalidArgument(format!("range [{}, {}] is empty or not finite", lo, hi)));
        }

        let backend = self.context("set_range")?;
        let parts = self.resources.parts("set_range")?;
        let event = backend.write_f32(parts.queue, parts.buffers.get(BufferRole::TthRange), &[lo, hi])?;
        let ns = engine::timed(backend.as_ref(), event, "Load Tth range")?;
        parts.kernels.rebind_range(backend.as_ref(), parts.buffers, true)?;
        self.timings.add_transfer(ns);
        self.corrections.set_range(Some((lo, hi)));
        Ok(())
    }

    /// Bin over the full two-theta range again
    pub fn unset_range(&mut self) -> Result<Toggle> {
        if self.corrections.range().is_none() {
            return Ok(Toggle::AlreadyClear);
        }
        let backend = self.context("unset_range")?;
        let parts = self.resources.parts("unset_range")?;
        parts.kernels.rebind_range(backend.as_ref(), parts.buffers, false)?;
        Ok(self.corrections.set_range(None))
    }

    /// Skip pixels within `delta` of `dummy`
    pub fn set_dummy_value(&mut self, dummy: f32, delta: f32) -> Result<()> {
        self.require_configured("set_dummy_value")?;
        if !(dummy.is_finite() && delta.is_finite() && delta >= 0.0) {
            return Err(Xrpd1dError::InvalidArgument(format!(
                "dummy value {} with tolerance {} is not usable",
                dummy, delta
            )));
        }

        let backend = self.context("set_dummy_value")?;
        let parts = self.resources.parts("set_dummy_value")?;
        let mut ns = engine::timed(
            backend.as_ref(),
            backend.write_f32(parts.queue, parts.buffers.get(BufferRole::DummyValue), &[dummy])?,
            "Load Dummy",
        )?;
        ns += engine::timed(
            backend.as_ref(),
            backend.write_f32(parts.queue, parts.buffers.get(BufferRole::DummyDelta), &[delta])?,
            "Load Dummy delta",
        )?;
        self.timings.add_transfer(ns);
        self.corrections.set_dummy(Some((dummy, delta)));
        Ok(())
    }

    /// Stop flagging dummy pixels
    pub fn unset_dummy_value(&mut self) -> Result<Toggle> {
        Ok(self.corrections.set_dummy(None))
    }

    /// Integrate `image` into `out_histogram` and `out_weights`
    pub fn execute(&mut self, image: &[f32], out_histogram: &mut [f32], out_weights: &mut [f32]) -> Result<()> {
        self.stage.require(Stage::ContextActive, "execute", "attach a context")?;
        self.stage.require(Stage::Configured, "execute", "run configure()")?;
        self.stage.require(Stage::TthLoaded, "execute", "run load_tth()")?;
        let config = self.require_configured("execute")?;
        Self::check_len("image", image.len(), config.image_size)?;
        Self::check_len("histogram", out_histogram.len(), config.bin_count)?;
        Self::check_len("weights", out_weights.len(), config.bin_count)?;

        tracing::trace!("--Integration nr. {}", self.timings.exec_count() + 1);
        let backend = self.context("execute")?;
        let parts = self.resources.parts("execute")?;
        let profile = engine::execute(
            backend.as_ref(),
            parts,
            &self.corrections,
            image,
            out_histogram,
            out_weights,
        )?;
        self.timings.record(&profile);
        self.last_profile = Some(profile);
        Ok(())
    }

    /// Release the configuration and, unless preserved, the context
    ///
    /// Idempotent: resources that are not held are skipped.
    pub fn clean(&mut self, preserve_context: bool) -> Result<()> {
        self.release_configuration();

        if !preserve_context {
            if let Some(backend) = self.backend.take() {
                if self.ownership == ContextOwnership::Owned {
                    match backend.teardown() {
                        Ok(()) => tracing::debug!("--released context"),
                        Err(e) => tracing::warn!("⚠️  Context teardown failed: {}", e),
                    }
                } else {
                    tracing::debug!("--detached shared context");
                }
            }
            self.params = None;
            self.stage = Stage::NoContext;
        }
        Ok(())
    }

    fn release_configuration(&mut self) {
        let released = self.resources.release_all();
        if !released.is_empty() {
            tracing::debug!("🧹 Released configuration ({})", released);
        }
        self.active = None;
        self.corrections = CorrectionState::default();
        self.timings.reset();
        self.last_profile = None;
        self.stage = match (&self.backend, &self.params) {
            (None, _) => Stage::NoContext,
            (Some(_), None) => Stage::ContextActive,
            (Some(_), Some(_)) => Stage::ParametersSet,
        };
    }

    /// Zero the timing accumulators and the execute counter
    pub fn reset_time(&mut self) {
        self.timings.reset();
    }

    /// Current lifecycle stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Device resource categories currently held
    pub fn capabilities(&self) -> Capabilities {
        self.resources.held()
    }

    /// Parameters of the live configuration
    pub fn configuration(&self) -> Option<&IntegrationConfig> {
        self.active.as_ref()
    }

    /// Parameters for the next configure
    pub fn parameters(&self) -> Option<&IntegrationConfig> {
        self.params.as_ref()
    }

    /// Correction flags and options
    pub fn corrections(&self) -> &CorrectionState {
        &self.corrections
    }

    /// Accumulated device times
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Total kernel time in milliseconds
    pub fn exec_time_ms(&self) -> f64 {
        self.timings.exec_time_ms()
    }

    /// Total transfer time in milliseconds
    pub fn transfer_time_ms(&self) -> f64 {
        self.timings.transfer_time_ms()
    }

    /// Successful execute calls since the last reset
    pub fn exec_count(&self) -> u64 {
        self.timings.exec_count()
    }

    /// Step times of the last execute call
    pub fn last_profile(&self) -> Option<&ExecutionProfile> {
        self.last_profile.as_ref()
    }

    /// Attached context
    pub fn backend(&self) -> Option<&Arc<B>> {
        self.backend.as_ref()
    }

    /// Engine settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn context(&self, operation: &'static str) -> Result<Arc<B>> {
        self.backend.clone().ok_or_else(|| {
            tracing::error!("❌ You may not call {}() at this point. There is no active context.", operation);
            Xrpd1dError::precondition(operation, "there is no active context")
        })
    }

    fn require_configured(&self, operation: &'static str) -> Result<IntegrationConfig> {
        self.stage.require(Stage::ContextActive, operation, "attach a context")?;
        self.stage.require(Stage::Configured, operation, "run configure()")?;
        self.active
            .ok_or_else(|| Xrpd1dError::precondition(operation, "no live configuration"))
    }

    fn check_len(what: &str, found: usize, expected: usize) -> Result<()> {
        if found != expected {
            tracing::error!("❌ {} has {} elements, expected {}", what, found, expected);
            return Err(Xrpd1dError::InvalidArgument(format!(
                "{} has {} elements, expected {}",
                what, found, expected
            )));
        }
        Ok(())
    }
}

impl<B: ComputeBackend> Drop for Integrator<B> {
    fn drop(&mut self) {
        let preserve = self.settings.preserve_context_on_drop;
        if let Err(e) = self.clean(preserve) {
            tracing::warn!("⚠️  Cleanup on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostDevice;
    use crate::status;

    fn integrator() -> (Arc<HostDevice>, Integrator<HostDevice>) {
        let device = Arc::new(HostDevice::new());
        let integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
        (device, integrator)
    }

    fn params(image_size: i64, bin_count: i64, fp64: bool) -> IntegrationConfig {
        IntegrationConfig::new(16, image_size, bin_count, fp64).unwrap()
    }

    #[test]
    fn test_stage_progression() {
        let (_device, mut integrator) = integrator();
        assert_eq!(integrator.stage(), Stage::ContextActive);

        integrator.get_configuration(params(256, 10, false)).unwrap();
        assert_eq!(integrator.stage(), Stage::ParametersSet);

        integrator.configure(None).unwrap();
        assert_eq!(integrator.stage(), Stage::Configured);
        assert!(integrator.capabilities().is_complete());

        let tth: Vec<f32> = (0..256).map(|i| i as f32 / 25.6).collect();
        integrator.load_tth(&tth, &vec![0.0; 256], 0.0, 10.0).unwrap();
        assert_eq!(integrator.stage(), Stage::TthLoaded);
        assert!(integrator.stage().is_executable());
    }

    #[test]
    fn test_configure_without_parameters() {
        let (device, mut integrator) = integrator();
        let result = integrator.configure(None);
        assert_eq!(status::of(&result), status::PRECONDITION);
        assert_eq!(device.live_queues(), 0);
        assert_eq!(integrator.stage(), Stage::ContextActive);
    }

    #[test]
    fn test_detached_integrator_rejects_everything() {
        let mut integrator: Integrator<HostDevice> = Integrator::detached(Settings::default());
        assert_eq!(integrator.stage(), Stage::NoContext);
        let result = integrator.get_configuration(params(256, 10, false));
        assert_eq!(status::of(&result), status::PRECONDITION);
        assert_eq!(integrator.parameters(), None);

        let device = Arc::new(HostDevice::new());
        integrator.attach_context(Arc::clone(&device), ContextOwnership::Shared).unwrap();
        assert_eq!(integrator.stage(), Stage::ContextActive);
        assert!(integrator.attach_context(device, ContextOwnership::Shared).is_err());
    }

    #[test]
    fn test_setters_require_configuration() {
        let (device, mut integrator) = integrator();
        integrator.get_configuration(params(256, 10, false)).unwrap();
        assert_eq!(status::of(&integrator.set_solid_angle(&[1.0; 256])), status::PRECONDITION);
        assert_eq!(status::of(&integrator.set_mask(&[0; 256])), status::PRECONDITION);
        assert_eq!(status::of(&integrator.set_range(0.0, 1.0)), status::PRECONDITION);
        assert_eq!(device.transfer_count(), 0);
    }

    #[test]
    fn test_wrong_lengths_are_rejected() {
        let (device, mut integrator) = integrator();
        integrator.get_configuration(params(256, 10, false)).unwrap();
        integrator.configure(None).unwrap();
        let before = device.transfer_count();

        assert_eq!(status::of(&integrator.set_dark(&[0.0; 255])), status::PRECONDITION);
        assert_eq!(status::of(&integrator.load_tth(&[0.0; 256], &[0.0; 256], 1.0, 1.0)), status::PRECONDITION);
        assert_eq!(device.transfer_count(), before);
    }

    #[test]
    fn test_new_parameters_wait_for_configure() {
        let (_device, mut integrator) = integrator();
        integrator.get_configuration(params(256, 10, false)).unwrap();
        integrator.configure(None).unwrap();

        integrator.get_configuration(params(512, 20, true)).unwrap();
        assert_eq!(integrator.stage(), Stage::Configured);
        assert_eq!(integrator.configuration().map(|c| c.bin_count), Some(10));
        assert_eq!(integrator.parameters().map(|c| c.bin_count), Some(20));

        integrator.configure(None).unwrap();
        assert_eq!(integrator.configuration().map(|c| c.bin_count), Some(20));
    }

    #[test]
    fn test_drop_tears_down_owned_context() {
        let device = Arc::new(HostDevice::new());
        {
            let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
            integrator.get_configuration(params(256, 10, false)).unwrap();
            integrator.configure(None).unwrap();
        }
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_kernels(), 0);
        assert!(device.is_torn_down());
    }

    #[test]
    fn test_shared_context_survives_full_clean() {
        let device = Arc::new(HostDevice::new());
        let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Shared, Settings::default());
        integrator.get_configuration(params(256, 10, false)).unwrap();
        integrator.configure(None).unwrap();
        integrator.clean(false).unwrap();

        assert_eq!(integrator.stage(), Stage::NoContext);
        assert!(!device.is_torn_down());
        assert_eq!(device.live_buffers(), 0);
    }
}
