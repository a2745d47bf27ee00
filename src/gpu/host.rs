// src/gpu/host.rs - Host reference device
// Tree location: ./src/gpu/host.rs

//! Host reference implementation of [`ComputeBackend`]
//!
//! Runs the entry points of `xrpd1d.cl` on the CPU with the same fixed-point
//! arithmetic, so the integrator can be exercised on machines without an
//! OpenCL driver. The program source is still read and scanned for entry
//! points, and the `-D` macros passed at build time drive the kernels.
//!
//! Durations are deterministic: a launch takes `global` ns, a transfer takes
//! one ns per byte.
//!
//! # Version History
//! - 0.1.0: Reference kernels for binning and accumulator conversion
//! - 0.1.1: Correction and dummy value kernels
//! - 0.1.2: Fault injection and live handle accounting
//! - 0.1.3: Release faults, counted launch faults, bounded launch log

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::backend::{
    ArgKind, BackendError, BackendResult, BufferSpec, ComputeBackend, DeviceCapabilities,
    ElementType, GpuVendor,
};

const CORRECT_SOLID_ANGLE: u32 = 1;
const CORRECT_DARK: u32 = 2;
const CORRECT_FLAT: u32 = 4;
const CORRECT_POLARIZATION: u32 = 8;

/// Launches kept by a device unless the builder says otherwise
pub const DEFAULT_LAUNCH_LOG: usize = 1024;

/// One recorded kernel launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    /// Entry point name
    pub kernel: String,
    /// Global work size
    pub global: usize,
    /// Local work size
    pub local: usize,
}

/// Queue handle of the host device
#[derive(Debug)]
pub struct HostQueue {
    id: u64,
}

/// Buffer handle of the host device
#[derive(Debug)]
pub struct HostBuffer {
    id: u64,
    name: &'static str,
    element_type: ElementType,
    len: usize,
}

/// Program handle of the host device
#[derive(Debug)]
pub struct HostProgram {
    id: u64,
    defs: ProgramDefs,
    entry_points: Vec<String>,
}

/// Kernel handle of the host device
#[derive(Debug)]
pub struct HostKernel {
    id: u64,
    entry: Entry,
    defs: ProgramDefs,
    signature: Vec<ArgKind>,
    args: Vec<Option<BoundArg>>,
}

/// Profiling event of the host device
#[derive(Debug)]
pub struct HostEvent {
    elapsed_ns: u64,
    live: Arc<AtomicUsize>,
}

impl HostEvent {
    fn new(elapsed_ns: u64, live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { elapsed_ns, live: Arc::clone(live) }
    }
}

impl Drop for HostEvent {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
enum BoundArg {
    Buffer { id: u64 },
    Uint(u32),
}

/// Macros the program was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgramDefs {
    bins: usize,
    nx: usize,
    nn: usize,
    fp64: bool,
    block_size: usize,
}

impl ProgramDefs {
    fn parse(options: &str, block_size: usize) -> BackendResult<Self> {
        let mut defines: HashMap<String, Option<String>> = HashMap::new();
        let mut tokens = options.split_whitespace();
        while let Some(token) = tokens.next() {
            let define = if token == "-D" {
                tokens.next()
            } else {
                token.strip_prefix("-D")
            };
            if let Some(define) = define {
                match define.split_once('=') {
                    Some((key, value)) => defines.insert(key.to_string(), Some(value.to_string())),
                    None => defines.insert(define.to_string(), None),
                };
            }
        }

        let number = |key: &str| -> BackendResult<usize> {
            defines
                .get(key)
                .and_then(|v| v.as_deref())
                .ok_or_else(|| BackendError::Build(format!("missing -D {}", key)))?
                .parse::<usize>()
                .map_err(|e| BackendError::Build(format!("bad value for {}: {}", key, e)))
        };

        Ok(Self {
            bins: number("BINS")?,
            nx: number("NX")?,
            nn: number("NN")?,
            fp64: defines.contains_key("ENABLE_FP64"),
            block_size,
        })
    }

    fn uacc(&self) -> f32 {
        if self.fp64 {
            1.0e8
        } else {
            100.0
        }
    }
}

/// Entry points the host device can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Integrate,
    ResetAccumulators,
    ResetMask,
    Convert,
    GetSpans,
    GroupSpans,
    Corrections,
    DummyValue,
}

impl Entry {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "create_histo_binarray" => Self::Integrate,
            "uimemset2" => Self::ResetAccumulators,
            "imemset" => Self::ResetMask,
            "ui2f2" => Self::Convert,
            "get_spans" => Self::GetSpans,
            "group_spans" => Self::GroupSpans,
            "solidangle_correction" => Self::Corrections,
            "dummyval_correction" => Self::DummyValue,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Self::Integrate => 9,
            Self::ResetAccumulators => 2,
            Self::ResetMask => 1,
            Self::Convert => 4,
            Self::GetSpans => 3,
            Self::GroupSpans => 1,
            Self::Corrections => 6,
            Self::DummyValue => 3,
        }
    }
}

#[derive(Debug, Clone)]
enum Storage {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl Storage {
    fn zeroed(element_type: ElementType, len: usize) -> Self {
        match element_type {
            ElementType::F32 => Self::F32(vec![0.0; len]),
            ElementType::I32 => Self::I32(vec![0; len]),
            ElementType::U32 => Self::U32(vec![0; len]),
            ElementType::U64 => Self::U64(vec![0; len]),
        }
    }

    fn element_type(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::F32,
            Self::I32(_) => ElementType::I32,
            Self::U32(_) => ElementType::U32,
            Self::U64(_) => ElementType::U64,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::U64(v) => v.len(),
        }
    }

    fn zero(&mut self, count: usize) {
        match self {
            Self::F32(v) => v.iter_mut().take(count).for_each(|x| *x = 0.0),
            Self::I32(v) => v.iter_mut().take(count).for_each(|x| *x = 0),
            Self::U32(v) => v.iter_mut().take(count).for_each(|x| *x = 0),
            Self::U64(v) => v.iter_mut().take(count).for_each(|x| *x = 0),
        }
    }

    /// Two's complement fixed-point add, as `atomic_add` does on the device
    fn accumulate(&mut self, index: usize, fixed: i64) {
        match self {
            Self::U64(v) => v[index] = v[index].wrapping_add(fixed as u64),
            Self::U32(v) => v[index] = v[index].wrapping_add(fixed as i32 as u32),
            Self::F32(_) | Self::I32(_) => {}
        }
    }

    fn to_float(&self, index: usize, uacc: f32) -> f32 {
        match self {
            Self::U64(v) => (v[index] as i64) as f32 / uacc,
            Self::U32(v) => (v[index] as i32) as f32 / uacc,
            Self::F32(v) => v[index],
            Self::I32(v) => v[index] as f32,
        }
    }
}

#[derive(Debug)]
struct Allocation {
    name: &'static str,
    storage: Storage,
}

#[derive(Debug, Default)]
struct HostState {
    next_id: u64,
    buffers: HashMap<u64, Allocation>,
    queues: HashSet<u64>,
    programs: HashSet<u64>,
    kernels: HashSet<u64>,
    launches: VecDeque<LaunchRecord>,
    launch_counts: HashMap<&'static str, usize>,
    transfers: usize,
    torn_down: bool,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_alive(&self, operation: &'static str) -> BackendResult<()> {
        if self.torn_down {
            return Err(BackendError::Device {
                operation,
                reason: "context has been torn down".into(),
            });
        }
        Ok(())
    }

    fn check_queue(&self, operation: &'static str, queue: &HostQueue) -> BackendResult<()> {
        self.check_alive(operation)?;
        if !self.queues.contains(&queue.id) {
            return Err(BackendError::Device { operation, reason: "invalid command queue".into() });
        }
        Ok(())
    }

    fn allocation(&self, operation: &'static str, id: u64) -> BackendResult<&Allocation> {
        self.buffers
            .get(&id)
            .ok_or_else(|| BackendError::Device { operation, reason: "invalid mem object".into() })
    }

    fn allocation_mut(&mut self, operation: &'static str, id: u64) -> BackendResult<&mut Allocation> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| BackendError::Device { operation, reason: "invalid mem object".into() })
    }

    fn floats(&self, id: u64) -> BackendResult<Vec<f32>> {
        match &self.allocation("launch", id)?.storage {
            Storage::F32(v) => Ok(v.clone()),
            other => Err(self.type_error(id, ElementType::F32, other.element_type())),
        }
    }

    fn ints(&self, id: u64) -> BackendResult<Vec<i32>> {
        match &self.allocation("launch", id)?.storage {
            Storage::I32(v) => Ok(v.clone()),
            other => Err(self.type_error(id, ElementType::I32, other.element_type())),
        }
    }

    fn store_floats(&mut self, id: u64, values: Vec<f32>) -> BackendResult<()> {
        self.allocation_mut("launch", id)?.storage = Storage::F32(values);
        Ok(())
    }

    fn type_error(&self, id: u64, expected: ElementType, found: ElementType) -> BackendError {
        let buffer = self.buffers.get(&id).map(|a| a.name).unwrap_or("?").to_string();
        BackendError::TypeMismatch { buffer, expected, found }
    }

    fn ensure_len(&self, id: u64, needed: usize) -> BackendResult<()> {
        let allocation = self.allocation("launch", id)?;
        if allocation.storage.len() < needed {
            return Err(BackendError::SizeMismatch {
                buffer: allocation.name.to_string(),
                expected: needed,
                found: allocation.storage.len(),
            });
        }
        Ok(())
    }
}

/// Builder for [`HostDevice`] with fault injection
#[derive(Debug, Clone)]
pub struct HostDeviceBuilder {
    capabilities: DeviceCapabilities,
    fail_buffers: Vec<String>,
    fail_kernels: Vec<String>,
    fail_launches: Vec<(String, usize)>,
    fail_releases: Vec<String>,
    launch_log: usize,
}

impl HostDeviceBuilder {
    /// Total global memory reported to the integrator (0 means unknown)
    pub fn global_memory(mut self, bytes: u64) -> Self {
        self.capabilities.global_memory = bytes;
        self
    }

    /// Largest single buffer the device accepts
    pub fn max_alloc_size(mut self, bytes: u64) -> Self {
        self.capabilities.max_alloc_size = bytes;
        self
    }

    /// Make allocation of the buffer called `name` fail
    pub fn fail_buffer(mut self, name: &str) -> Self {
        self.fail_buffers.push(name.to_string());
        self
    }

    /// Make creation of the kernel `name` fail
    pub fn fail_kernel(mut self, name: &str) -> Self {
        self.fail_kernels.push(name.to_string());
        self
    }

    /// Make every launch of the kernel `name` fail
    pub fn fail_launch(self, name: &str) -> Self {
        self.fail_launch_after(name, 0)
    }

    /// Let `successes` launches of the kernel `name` through, then fail the rest
    pub fn fail_launch_after(mut self, name: &str, successes: usize) -> Self {
        self.fail_launches.push((name.to_string(), successes));
        self
    }

    /// Make releasing the handle called `name` fail
    ///
    /// Kernels and buffers go by their own names, the program by `"program"`
    /// and the queue by `"queue"`. A handle whose release fails stays live.
    pub fn fail_release(mut self, name: &str) -> Self {
        self.fail_releases.push(name.to_string());
        self
    }

    /// Keep only the newest `capacity` launch records
    pub fn launch_log(mut self, capacity: usize) -> Self {
        self.launch_log = capacity;
        self
    }

    /// Build the device
    pub fn build(self) -> HostDevice {
        HostDevice {
            capabilities: self.capabilities,
            fail_buffers: self.fail_buffers,
            fail_kernels: self.fail_kernels,
            fail_launches: self.fail_launches,
            fail_releases: self.fail_releases,
            launch_log: self.launch_log,
            state: Mutex::new(HostState::default()),
            live_events: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Reference device executing the kernels on the host
#[derive(Debug)]
pub struct HostDevice {
    capabilities: DeviceCapabilities,
    fail_buffers: Vec<String>,
    fail_kernels: Vec<String>,
    fail_launches: Vec<(String, usize)>,
    fail_releases: Vec<String>,
    launch_log: usize,
    state: Mutex<HostState>,
    live_events: Arc<AtomicUsize>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    /// Device with 1 GiB of reported memory and no injected faults
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a device
    pub fn builder() -> HostDeviceBuilder {
        HostDeviceBuilder {
            capabilities: DeviceCapabilities {
                name: "Host Reference Device".to_string(),
                vendor: GpuVendor::Unknown,
                global_memory: 1 << 30,
                max_alloc_size: 1 << 28,
                max_work_group_size: 1024,
                compute_units: 1,
                backend: "Host".to_string(),
            },
            fail_buffers: Vec::new(),
            fail_kernels: Vec::new(),
            fail_launches: Vec::new(),
            fail_releases: Vec::new(),
            launch_log: DEFAULT_LAUNCH_LOG,
        }
    }

    /// Number of live buffers
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of live queues
    pub fn live_queues(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Number of live programs
    pub fn live_programs(&self) -> usize {
        self.state.lock().programs.len()
    }

    /// Number of live kernels
    pub fn live_kernels(&self) -> usize {
        self.state.lock().kernels.len()
    }

    /// Number of profiling events not yet released
    pub fn live_events(&self) -> usize {
        self.live_events.load(Ordering::SeqCst)
    }

    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> u64 {
        self.state
            .lock()
            .buffers
            .values()
            .map(|a| (a.storage.len() * a.storage.element_type().size_bytes()) as u64)
            .sum()
    }

    /// Recent launches, oldest first
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().launches.iter().cloned().collect()
    }

    /// Forget recorded launches
    pub fn clear_launches(&self) {
        self.state.lock().launches.clear();
    }

    /// Number of host/device transfers
    pub fn transfer_count(&self) -> usize {
        self.state.lock().transfers
    }

    /// Whether `teardown` has been called
    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    /// Contents of the newest live `float` buffer called `name`
    pub fn buffer_f32(&self, name: &str) -> Option<Vec<f32>> {
        let state = self.state.lock();
        let (_, allocation) = state
            .buffers
            .iter()
            .filter(|(_, a)| a.name == name)
            .max_by_key(|(id, _)| **id)?;
        match &allocation.storage {
            Storage::F32(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Contents of the newest live `int` buffer called `name`
    pub fn buffer_i32(&self, name: &str) -> Option<Vec<i32>> {
        let state = self.state.lock();
        let (_, allocation) = state
            .buffers
            .iter()
            .filter(|(_, a)| a.name == name)
            .max_by_key(|(id, _)| **id)?;
        match &allocation.storage {
            Storage::I32(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn event(&self, elapsed_ns: u64) -> HostEvent {
        HostEvent::new(elapsed_ns, &self.live_events)
    }

    fn check_release(&self, operation: &'static str, name: &str) -> BackendResult<()> {
        if self.fail_releases.iter().any(|n| n == name) {
            return Err(BackendError::Device { operation, reason: format!("{}: CL_INVALID_VALUE", name) });
        }
        Ok(())
    }

    fn check_transfer(
        &self,
        buffer: &HostBuffer,
        expected: ElementType,
        host_len: usize,
    ) -> BackendResult<()> {
        if buffer.element_type != expected {
            return Err(BackendError::TypeMismatch {
                buffer: buffer.name.to_string(),
                expected,
                found: buffer.element_type,
            });
        }
        if buffer.len != host_len {
            return Err(BackendError::SizeMismatch {
                buffer: buffer.name.to_string(),
                expected: buffer.len,
                found: host_len,
            });
        }
        Ok(())
    }

    fn bound(kernel: &HostKernel) -> BackendResult<Vec<BoundArg>> {
        kernel
            .args
            .iter()
            .enumerate()
            .map(|(slot, arg)| {
                arg.ok_or_else(|| BackendError::Unbound {
                    kernel: format!("{:?}", kernel.entry),
                    slot: slot as u32,
                })
            })
            .collect()
    }

    fn execute(state: &mut HostState, kernel: &HostKernel, global: usize, local: usize) -> BackendResult<()> {
        let args = Self::bound(kernel)?;
        let buffer = |slot: usize| -> BackendResult<u64> {
            match args[slot] {
                BoundArg::Buffer { id, .. } => Ok(id),
                BoundArg::Uint(_) => Err(BackendError::Device {
                    operation: "launch",
                    reason: format!("argument {} is not a buffer", slot),
                }),
            }
        };
        let defs = kernel.defs;
        let pixels = global.min(defs.nn);
        let bins = global.min(defs.bins);

        match kernel.entry {
            Entry::ResetAccumulators => {
                for slot in 0..2 {
                    let id = buffer(slot)?;
                    state.ensure_len(id, bins)?;
                    state.allocation_mut("launch", id)?.storage.zero(bins);
                }
            }
            Entry::ResetMask => {
                let id = buffer(0)?;
                state.ensure_len(id, pixels)?;
                state.allocation_mut("launch", id)?.storage.zero(pixels);
            }
            Entry::Convert => {
                let (uw, uh, w, h) = (buffer(0)?, buffer(1)?, buffer(2)?, buffer(3)?);
                for id in [uw, uh, w, h] {
                    state.ensure_len(id, bins)?;
                }
                let uacc = defs.uacc();
                let mut weights = state.floats(w)?;
                let mut histogram = state.floats(h)?;
                {
                    let acc_w = &state.allocation("launch", uw)?.storage;
                    let acc_h = &state.allocation("launch", uh)?.storage;
                    for bin in 0..bins {
                        weights[bin] = acc_w.to_float(bin, uacc);
                        histogram[bin] = acc_h.to_float(bin, uacc);
                    }
                }
                state.store_floats(w, weights)?;
                state.store_floats(h, histogram)?;
            }
            Entry::GetSpans => {
                let (dtth_id, minmax_id, spans_id) = (buffer(0)?, buffer(1)?, buffer(2)?);
                state.ensure_len(dtth_id, pixels)?;
                state.ensure_len(minmax_id, 2)?;
                state.ensure_len(spans_id, pixels)?;
                let dtth = state.floats(dtth_id)?;
                let minmax = state.floats(minmax_id)?;
                let mut spans = state.floats(spans_id)?;
                let width = (minmax[1] - minmax[0]) / defs.bins as f32;
                for gid in 0..pixels {
                    spans[gid] = (2.0 * dtth[gid]) / width;
                }
                state.store_floats(spans_id, spans)?;
            }
            Entry::GroupSpans => {
                let spans_id = buffer(0)?;
                state.ensure_len(spans_id, pixels)?;
                let mut spans = state.floats(spans_id)?;
                let lanes = global;
                let group = local.max(1);
                let mut start = 0;
                while start < lanes {
                    let end = (start + group).min(lanes);
                    let valid_end = end.min(defs.nn);
                    let mut block_max = if end > defs.nn { 0.0f32 } else { f32::NEG_INFINITY };
                    for gid in start..valid_end {
                        block_max = block_max.max(spans[gid]);
                    }
                    for gid in start..valid_end {
                        spans[gid] = block_max;
                    }
                    start = end;
                }
                state.store_floats(spans_id, spans)?;
            }
            Entry::Corrections => {
                let ids = [buffer(0)?, buffer(1)?, buffer(2)?, buffer(3)?, buffer(4)?];
                let flags = match args[5] {
                    BoundArg::Uint(v) => v,
                    BoundArg::Buffer { .. } => {
                        return Err(BackendError::Device {
                            operation: "launch",
                            reason: "argument 5 is not a uint".into(),
                        })
                    }
                };
                for id in ids {
                    state.ensure_len(id, pixels)?;
                }
                let mut image = state.floats(ids[0])?;
                let solid_angle = state.floats(ids[1])?;
                let dark = state.floats(ids[2])?;
                let flat = state.floats(ids[3])?;
                let polarization = state.floats(ids[4])?;
                for gid in 0..pixels {
                    let mut value = image[gid];
                    let mut divisor = 1.0f32;
                    if flags & CORRECT_DARK != 0 {
                        value -= dark[gid];
                    }
                    if flags & CORRECT_FLAT != 0 {
                        divisor *= flat[gid];
                    }
                    if flags & CORRECT_SOLID_ANGLE != 0 {
                        divisor *= solid_angle[gid];
                    }
                    if flags & CORRECT_POLARIZATION != 0 {
                        divisor *= polarization[gid];
                    }
                    image[gid] = value / divisor;
                }
                state.store_floats(ids[0], image)?;
            }
            Entry::DummyValue => {
                let (image_id, dummy_id, delta_id) = (buffer(0)?, buffer(1)?, buffer(2)?);
                state.ensure_len(image_id, pixels)?;
                state.ensure_len(dummy_id, 1)?;
                state.ensure_len(delta_id, 1)?;
                let mut image = state.floats(image_id)?;
                let dummy = state.floats(dummy_id)?[0];
                let delta = state.floats(delta_id)?[0];
                for value in image.iter_mut().take(pixels) {
                    if (*value - dummy).abs() <= delta {
                        *value = f32::NAN;
                    }
                }
                state.store_floats(image_id, image)?;
            }
            Entry::Integrate => {
                let ids: Vec<u64> = (0..9).map(&buffer).collect::<BackendResult<_>>()?;
                for &slot in &[0usize, 1, 4, 6, 7] {
                    state.ensure_len(ids[slot], pixels)?;
                }
                state.ensure_len(ids[2], defs.bins)?;
                state.ensure_len(ids[5], defs.bins)?;
                state.ensure_len(ids[8], 2)?;

                let tth = state.floats(ids[0])?;
                let dtth = state.floats(ids[1])?;
                let image = state.floats(ids[4])?;
                let spans = state.floats(ids[6])?;
                let mask = state.ints(ids[7])?;
                let range = state.floats(ids[8])?;

                let mut contributions = Vec::new();
                for gid in 0..pixels {
                    bin_pixel(
                        &defs,
                        (range[0], range[1]),
                        tth[gid],
                        dtth[gid],
                        spans[gid],
                        mask[gid],
                        image[gid],
                        &mut contributions,
                    );
                }

                let uacc = defs.uacc();
                let weights = &mut state.allocation_mut("launch", ids[2])?.storage;
                for &(bin, frac, _) in &contributions {
                    weights.accumulate(bin, to_fixed(frac, uacc));
                }

                let histogram = &mut state.allocation_mut("launch", ids[5])?.storage;
                for &(bin, frac, value) in &contributions {
                    histogram.accumulate(bin, to_fixed(frac * value, uacc));
                }
            }
        }
        Ok(())
    }
}

fn to_fixed(value: f32, uacc: f32) -> i64 {
    (value * uacc).round() as i64
}

/// Split one pixel over the bins of the active range
#[allow(clippy::too_many_arguments)]
fn bin_pixel(
    defs: &ProgramDefs,
    (lo, hi): (f32, f32),
    tth: f32,
    dtth: f32,
    span: f32,
    mask: i32,
    value: f32,
    out: &mut Vec<(usize, f32, f32)>,
) {
    if mask != 0 || !value.is_finite() || !tth.is_finite() || !dtth.is_finite() {
        return;
    }
    let bins = defs.bins as i64;
    let width = (hi - lo) / defs.bins as f32;
    let t_lo = tth - dtth;
    let t_hi = tth + dtth;
    if t_hi < lo || t_lo > hi {
        return;
    }

    if dtth <= 0.0 {
        let bin = (((tth - lo) / width).floor() as i64).clamp(0, bins - 1);
        out.push((bin as usize, 1.0, value));
        return;
    }

    let pos_lo = (t_lo - lo) / width;
    let pos_hi = (t_hi - lo) / width;
    let total = pos_hi - pos_lo;
    // walk clamped to the bins of the range
    let walk_hi = (pos_lo.floor() + span.ceil()).max(pos_hi.floor());
    let first = pos_lo.floor().max(0.0) as i64;
    let last = walk_hi.min((bins - 1) as f32) as i64;

    for bin in first..=last {
        let left = pos_lo.max(bin as f32);
        let right = pos_hi.min((bin + 1) as f32);
        if right <= left {
            continue;
        }
        out.push((bin as usize, (right - left) / total, value));
    }
}

/// Entry point names declared with `__kernel` in an OpenCL source
fn scan_entry_points(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut tokens = source
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|t| !t.is_empty());
    while let Some(token) = tokens.next() {
        if token == "__kernel" {
            let _return_type = tokens.next();
            if let Some(name) = tokens.next() {
                names.push(name.to_string());
            }
        }
    }
    names
}

impl ComputeBackend for HostDevice {
    type Queue = HostQueue;
    type Buffer = HostBuffer;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Event = HostEvent;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_queue(&self) -> BackendResult<HostQueue> {
        let mut state = self.state.lock();
        state.check_alive("create_queue")?;
        let id = state.next_id();
        state.queues.insert(id);
        Ok(HostQueue { id })
    }

    fn create_buffer(&self, queue: &HostQueue, spec: &BufferSpec) -> BackendResult<HostBuffer> {
        let mut state = self.state.lock();
        state.check_queue("create_buffer", queue)?;
        if self.fail_buffers.iter().any(|n| n == spec.name) {
            return Err(BackendError::Allocation {
                buffer: spec.name.to_string(),
                reason: "CL_MEM_OBJECT_ALLOCATION_FAILURE".into(),
            });
        }
        if spec.bytes() > self.capabilities.max_alloc_size {
            return Err(BackendError::Allocation {
                buffer: spec.name.to_string(),
                reason: format!(
                    "{} bytes exceeds max allocation {}",
                    spec.bytes(),
                    self.capabilities.max_alloc_size
                ),
            });
        }
        let id = state.next_id();
        state.buffers.insert(
            id,
            Allocation { name: spec.name, storage: Storage::zeroed(spec.element_type, spec.len) },
        );
        Ok(HostBuffer { id, name: spec.name, element_type: spec.element_type, len: spec.len })
    }

    fn build_program(&self, source: &Path, options: &str, block_size: usize) -> BackendResult<HostProgram> {
        let text = std::fs::read_to_string(source)
            .map_err(|e| BackendError::Build(format!("cannot read {}: {}", source.display(), e)))?;
        let defs = ProgramDefs::parse(options, block_size)?;
        let entry_points = scan_entry_points(&text);
        if entry_points.is_empty() {
            return Err(BackendError::Build(format!("no __kernel entry points in {}", source.display())));
        }

        let mut state = self.state.lock();
        state.check_alive("build_program")?;
        let id = state.next_id();
        state.programs.insert(id);
        tracing::trace!(
            "Host program built: BINS={} NX={} NN={} fp64={} block={}",
            defs.bins,
            defs.nx,
            defs.nn,
            defs.fp64,
            defs.block_size
        );
        Ok(HostProgram { id, defs, entry_points })
    }

    fn create_kernel(
        &self,
        program: &HostProgram,
        queue: &HostQueue,
        name: &str,
        signature: &[ArgKind],
    ) -> BackendResult<HostKernel> {
        let mut state = self.state.lock();
        state.check_queue("create_kernel", queue)?;
        let creation_error = |reason: &str| BackendError::KernelCreation {
            kernel: name.to_string(),
            reason: reason.to_string(),
        };
        if !state.programs.contains(&program.id) {
            return Err(creation_error("invalid program"));
        }
        if self.fail_kernels.iter().any(|n| n == name) {
            return Err(creation_error("CL_OUT_OF_RESOURCES"));
        }
        if !program.entry_points.iter().any(|e| e == name) {
            return Err(creation_error("CL_INVALID_KERNEL_NAME"));
        }
        let entry = Entry::from_name(name).ok_or_else(|| creation_error("no host implementation"))?;
        if entry.arity() != signature.len() {
            return Err(creation_error(&format!(
                "expects {} arguments, signature has {}",
                entry.arity(),
                signature.len()
            )));
        }

        let id = state.next_id();
        state.kernels.insert(id);
        Ok(HostKernel {
            id,
            entry,
            defs: program.defs,
            signature: signature.to_vec(),
            args: vec![None; signature.len()],
        })
    }

    fn set_buffer_arg(&self, kernel: &mut HostKernel, slot: u32, buffer: &HostBuffer) -> BackendResult<()> {
        match kernel.signature.get(slot as usize) {
            Some(ArgKind::Buffer(expected)) if *expected == buffer.element_type => {
                kernel.args[slot as usize] = Some(BoundArg::Buffer { id: buffer.id });
                Ok(())
            }
            Some(ArgKind::Buffer(expected)) => Err(BackendError::TypeMismatch {
                buffer: buffer.name.to_string(),
                expected: *expected,
                found: buffer.element_type,
            }),
            _ => Err(BackendError::Device {
                operation: "set_kernel_arg",
                reason: format!("slot {} does not take a buffer", slot),
            }),
        }
    }

    fn set_uint_arg(&self, kernel: &mut HostKernel, slot: u32, value: u32) -> BackendResult<()> {
        match kernel.signature.get(slot as usize) {
            Some(ArgKind::Uint) => {
                kernel.args[slot as usize] = Some(BoundArg::Uint(value));
                Ok(())
            }
            _ => Err(BackendError::Device {
                operation: "set_kernel_arg",
                reason: format!("slot {} does not take a uint", slot),
            }),
        }
    }

    fn write_f32(&self, queue: &HostQueue, buffer: &HostBuffer, data: &[f32]) -> BackendResult<HostEvent> {
        self.check_transfer(buffer, ElementType::F32, data.len())?;
        let mut state = self.state.lock();
        state.check_queue("write_buffer", queue)?;
        state.allocation_mut("write_buffer", buffer.id)?.storage = Storage::F32(data.to_vec());
        state.transfers += 1;
        Ok(self.event((data.len() * 4) as u64))
    }

    fn write_i32(&self, queue: &HostQueue, buffer: &HostBuffer, data: &[i32]) -> BackendResult<HostEvent> {
        self.check_transfer(buffer, ElementType::I32, data.len())?;
        let mut state = self.state.lock();
        state.check_queue("write_buffer", queue)?;
        state.allocation_mut("write_buffer", buffer.id)?.storage = Storage::I32(data.to_vec());
        state.transfers += 1;
        Ok(self.event((data.len() * 4) as u64))
    }

    fn read_f32(&self, queue: &HostQueue, buffer: &HostBuffer, out: &mut [f32]) -> BackendResult<HostEvent> {
        self.check_transfer(buffer, ElementType::F32, out.len())?;
        let mut state = self.state.lock();
        state.check_queue("read_buffer", queue)?;
        match &state.allocation("read_buffer", buffer.id)?.storage {
            Storage::F32(v) => out.copy_from_slice(v),
            other => {
                return Err(BackendError::TypeMismatch {
                    buffer: buffer.name.to_string(),
                    expected: ElementType::F32,
                    found: other.element_type(),
                })
            }
        }
        state.transfers += 1;
        Ok(self.event((out.len() * 4) as u64))
    }

    fn launch(&self, queue: &HostQueue, kernel: &HostKernel, global: usize, local: usize) -> BackendResult<HostEvent> {
        let name = entry_name(kernel.entry);
        let mut state = self.state.lock();
        state.check_queue("enqueue_kernel", queue)?;
        if !state.kernels.contains(&kernel.id) {
            return Err(BackendError::Device { operation: "enqueue_kernel", reason: "invalid kernel".into() });
        }
        if local == 0 || global == 0 || global % local != 0 || local > self.capabilities.max_work_group_size {
            return Err(BackendError::Device {
                operation: "enqueue_kernel",
                reason: format!("invalid work size {} / {}", global, local),
            });
        }
        let done = state.launch_counts.get(name).copied().unwrap_or(0);
        if self.fail_launches.iter().any(|(n, successes)| n == name && done >= *successes) {
            return Err(BackendError::Device {
                operation: "enqueue_kernel",
                reason: format!("{}: CL_OUT_OF_RESOURCES", name),
            });
        }

        Self::execute(&mut state, kernel, global, local)?;
        *state.launch_counts.entry(name).or_insert(0) += 1;
        if self.launch_log > 0 {
            if state.launches.len() >= self.launch_log {
                state.launches.pop_front();
            }
            state.launches.push_back(LaunchRecord { kernel: name.to_string(), global, local });
        }
        Ok(self.event(global as u64))
    }

    fn finish(&self, queue: &HostQueue) -> BackendResult<()> {
        self.state.lock().check_queue("finish", queue)
    }

    fn elapsed_ns(&self, event: HostEvent) -> BackendResult<u64> {
        Ok(event.elapsed_ns)
    }

    fn release_buffer(&self, buffer: HostBuffer) -> BackendResult<()> {
        self.check_release("release_buffer", buffer.name)?;
        self.state
            .lock()
            .buffers
            .remove(&buffer.id)
            .map(|_| ())
            .ok_or_else(|| BackendError::Device { operation: "release_buffer", reason: "invalid mem object".into() })
    }

    fn release_kernel(&self, kernel: HostKernel) -> BackendResult<()> {
        self.check_release("release_kernel", entry_name(kernel.entry))?;
        if self.state.lock().kernels.remove(&kernel.id) {
            return Ok(());
        }
        Err(BackendError::Device { operation: "release_kernel", reason: "invalid kernel".into() })
    }

    fn release_program(&self, program: HostProgram) -> BackendResult<()> {
        self.check_release("release_program", "program")?;
        if self.state.lock().programs.remove(&program.id) {
            return Ok(());
        }
        Err(BackendError::Device { operation: "release_program", reason: "invalid program".into() })
    }

    fn release_queue(&self, queue: HostQueue) -> BackendResult<()> {
        self.check_release("release_queue", "queue")?;
        if self.state.lock().queues.remove(&queue.id) {
            return Ok(());
        }
        Err(BackendError::Device { operation: "release_queue", reason: "invalid command queue".into() })
    }

    fn teardown(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_alive("teardown")?;
        state.torn_down = true;
        Ok(())
    }
}

fn entry_name(entry: Entry) -> &'static str {
    match entry {
        Entry::Integrate => "create_histo_binarray",
        Entry::ResetAccumulators => "uimemset2",
        Entry::ResetMask => "imemset",
        Entry::Convert => "ui2f2",
        Entry::GetSpans => "get_spans",
        Entry::GroupSpans => "group_spans",
        Entry::Corrections => "solidangle_correction",
        Entry::DummyValue => "dummyval_correction",
    }
}
