// src/integrator/engine.rs - Integration hot path and timing accounting
// Tree location: ./src/integrator/engine.rs

//! Execution engine
//!
//! One call of [`execute`] issues, on the configuration's in-order queue:
//! image upload, accumulator reset, dummy flagging (optional), corrections
//! (optional), binning, fixed-point conversion and the two downloads. The
//! queue is drained before the per-step device times are read.
//!
//! Every profiling event is owned by this module until its elapsed time has
//! been read; events of a failed call are dropped with the call.

use super::buffers::BufferRole;
use super::corrections::CorrectionState;
use super::kernels::KernelName;
use super::tracker::Parts;
use crate::gpu::ComputeBackend;
use crate::Result;

/// Device times of one execute call, in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionProfile {
    /// Image upload
    pub upload_ns: u64,
    /// Accumulator reset
    pub reset_ns: u64,
    /// Dummy value flagging, when enabled
    pub dummy_ns: Option<u64>,
    /// Correction kernel, when any correction is enabled
    pub correction_ns: Option<u64>,
    /// Binning kernel
    pub integrate_ns: u64,
    /// Fixed point to float conversion
    pub convert_ns: u64,
    /// Weight and histogram downloads
    pub download_ns: u64,
}

impl ExecutionProfile {
    /// Kernel time
    pub fn exec_ns(&self) -> u64 {
        self.reset_ns
            + self.dummy_ns.unwrap_or(0)
            + self.correction_ns.unwrap_or(0)
            + self.integrate_ns
            + self.convert_ns
    }

    /// Transfer time
    pub fn transfer_ns(&self) -> u64 {
        self.upload_ns + self.download_ns
    }
}

/// Running device-time totals, reset whenever resources are cleaned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    exec_ns: u64,
    transfer_ns: u64,
    exec_count: u64,
}

impl Timings {
    /// Total kernel time in milliseconds
    pub fn exec_time_ms(&self) -> f64 {
        self.exec_ns as f64 / 1.0e6
    }

    /// Total transfer time in milliseconds
    pub fn transfer_time_ms(&self) -> f64 {
        self.transfer_ns as f64 / 1.0e6
    }

    /// Total kernel time in nanoseconds
    pub fn exec_ns(&self) -> u64 {
        self.exec_ns
    }

    /// Total transfer time in nanoseconds
    pub fn transfer_ns(&self) -> u64 {
        self.transfer_ns
    }

    /// Successful execute calls since the last reset
    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    pub(crate) fn add_exec(&mut self, ns: u64) {
        self.exec_ns += ns;
    }

    pub(crate) fn add_transfer(&mut self, ns: u64) {
        self.transfer_ns += ns;
    }

    pub(crate) fn record(&mut self, profile: &ExecutionProfile) {
        self.exec_ns += profile.exec_ns();
        self.transfer_ns += profile.transfer_ns();
        self.exec_count += 1;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Upload,
    Reset,
    Dummy,
    Correction,
    Integrate,
    Convert,
    Download,
}

/// Device time of a blocking transfer or single launch, releasing its event
pub(crate) fn timed<B: ComputeBackend>(backend: &B, event: B::Event, label: &str) -> Result<u64> {
    let ns = backend.elapsed_ns(event)?;
    tracing::trace!("{:<16} {:.3} ms", label, ns as f64 / 1.0e6);
    Ok(ns)
}

/// Upload the two-theta arrays and compute the per-pixel spans
///
/// Returns `(transfer_ns, exec_ns)`.
pub(crate) fn load_tth<B: ComputeBackend>(
    backend: &B,
    parts: Parts<'_, B>,
    tth: &[f32],
    dtth: &[f32],
    min_max: [f32; 2],
) -> Result<(u64, u64)> {
    let Parts { kernels, queue, buffers } = parts;

    let mut transfer_ns = 0;
    transfer_ns += timed(backend, backend.write_f32(queue, buffers.get(BufferRole::Tth), tth)?, "Load Tth")?;
    transfer_ns += timed(backend, backend.write_f32(queue, buffers.get(BufferRole::TthDelta), dtth)?, "Load dTth")?;
    transfer_ns += timed(
        backend,
        backend.write_f32(queue, buffers.get(BufferRole::TthMinMax), &min_max)?,
        "Load Tth min/max",
    )?;

    let spans = kernels.launch(backend, queue, KernelName::GetSpans)?;
    let grouped = kernels.launch(backend, queue, KernelName::GroupSpans)?;
    backend.finish(queue)?;
    let exec_ns = timed(backend, spans, "Get Spans")? + timed(backend, grouped, "Group Spans")?;

    Ok((transfer_ns, exec_ns))
}

/// Run one integration
pub(crate) fn execute<B: ComputeBackend>(
    backend: &B,
    parts: Parts<'_, B>,
    corrections: &CorrectionState,
    image: &[f32],
    out_histogram: &mut [f32],
    out_weights: &mut [f32],
) -> Result<ExecutionProfile> {
    let Parts { kernels, queue, buffers } = parts;
    let mut events: Vec<(Step, B::Event)> = Vec::with_capacity(8);

    events.push((Step::Upload, backend.write_f32(queue, buffers.get(BufferRole::Image), image)?));
    events.push((Step::Reset, kernels.launch(backend, queue, KernelName::ResetAccumulators)?));

    if corrections.dummy().is_some() {
        events.push((Step::Dummy, kernels.launch(backend, queue, KernelName::DummyValue)?));
    }

    if corrections.needs_correction_kernel() {
        kernels.set_correction_flags(backend, corrections.kernel_flags())?;
        events.push((Step::Correction, kernels.launch(backend, queue, KernelName::Corrections)?));
    }

    events.push((Step::Integrate, kernels.launch(backend, queue, KernelName::Integrate)?));
    events.push((Step::Convert, kernels.launch(backend, queue, KernelName::Convert)?));

    events.push((
        Step::Download,
        backend.read_f32(queue, buffers.get(BufferRole::Weights), out_weights)?,
    ));
    events.push((
        Step::Download,
        backend.read_f32(queue, buffers.get(BufferRole::Histogram), out_histogram)?,
    ));

    tracing::trace!("--Waiting for the command queue to finish");
    backend.finish(queue)?;

    let mut profile = ExecutionProfile::default();
    for (step, event) in events {
        let ns = backend.elapsed_ns(event)?;
        match step {
            Step::Upload => profile.upload_ns += ns,
            Step::Reset => profile.reset_ns += ns,
            Step::Dummy => profile.dummy_ns = Some(ns),
            Step::Correction => profile.correction_ns = Some(ns),
            Step::Integrate => profile.integrate_ns += ns,
            Step::Convert => profile.convert_ns += ns,
            Step::Download => profile.download_ns += ns,
        }
    }

    tracing::trace!(
        "CopyIn {} ns, MemSet {} ns, Integration {} ns, Convert {} ns, CopyOut {} ns",
        profile.upload_ns,
        profile.reset_ns,
        profile.integrate_ns,
        profile.convert_ns,
        profile.download_ns
    );

    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_sums() {
        let profile = ExecutionProfile {
            upload_ns: 10,
            reset_ns: 1,
            dummy_ns: None,
            correction_ns: Some(5),
            integrate_ns: 100,
            convert_ns: 2,
            download_ns: 20,
        };
        assert_eq!(profile.exec_ns(), 108);
        assert_eq!(profile.transfer_ns(), 30);
    }

    #[test]
    fn test_timings_record_and_reset() {
        let mut timings = Timings::default();
        let profile = ExecutionProfile { upload_ns: 2_000_000, integrate_ns: 3_000_000, ..Default::default() };
        timings.record(&profile);
        timings.record(&profile);
        timings.add_transfer(1_000_000);

        assert_eq!(timings.exec_count(), 2);
        assert_eq!(timings.exec_time_ms(), 6.0);
        assert_eq!(timings.transfer_time_ms(), 5.0);

        timings.reset();
        assert_eq!(timings, Timings::default());
    }
}
