// src/gpu/opencl/device.rs - OpenCL implementation of the compute backend
// Tree location: ./src/gpu/opencl/device.rs

//! OpenCL compute backend
//!
//! Wraps one `ocl` context. Handles are owned `ocl` objects, so releasing a
//! handle is dropping it; the context itself is released when the last
//! reference to the device goes away.

use std::path::Path;

use ocl::enums::{ArgVal, ProfilingInfo};
use ocl::flags::CommandQueueProperties;
use ocl::{Buffer, Context, Device, Event, Kernel, Platform, Program, Queue};

use super::platform::PlatformDetector;
use crate::config::Settings;
use crate::gpu::backend::{
    ArgKind, BackendError, BackendResult, BufferSpec, ComputeBackend, DeviceCapabilities, ElementType,
};

/// Typed OpenCL buffer
pub enum ClBuffer {
    /// `float` buffer
    F32(Buffer<f32>, &'static str),
    /// `int` buffer
    I32(Buffer<i32>, &'static str),
    /// `uint` buffer
    U32(Buffer<u32>, &'static str),
    /// `ulong` buffer
    U64(Buffer<u64>, &'static str),
}

impl ClBuffer {
    fn name(&self) -> &'static str {
        match self {
            ClBuffer::F32(_, name) | ClBuffer::I32(_, name) | ClBuffer::U32(_, name) | ClBuffer::U64(_, name) => *name,
        }
    }

    fn element_type(&self) -> ElementType {
        match self {
            ClBuffer::F32(..) => ElementType::F32,
            ClBuffer::I32(..) => ElementType::I32,
            ClBuffer::U32(..) => ElementType::U32,
            ClBuffer::U64(..) => ElementType::U64,
        }
    }

    fn mismatch(&self, expected: ElementType) -> BackendError {
        BackendError::TypeMismatch { buffer: self.name().to_string(), expected, found: self.element_type() }
    }
}

/// OpenCL kernel with its entry-point name
pub struct ClKernel {
    kernel: Kernel,
    name: String,
}

/// Compute backend over one OpenCL device
pub struct OpenClDevice {
    platform: Platform,
    device: Device,
    context: Context,
    capabilities: DeviceCapabilities,
}

impl OpenClDevice {
    /// Select a device following `settings` and create its context
    pub fn from_settings(settings: &Settings) -> BackendResult<Self> {
        let detector = PlatformDetector::with_vendor_preference(settings.vendor_preference.clone())?;
        let selected = detector.create_context(settings.platform_hint.as_deref(), settings.device_index)?;
        Ok(Self {
            platform: selected.platform,
            device: selected.device,
            context: selected.context,
            capabilities: selected.capabilities,
        })
    }

    /// Platform the context lives on
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Raw OpenCL context
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn build_buffer<T: ocl::OclPrm>(&self, queue: &Queue, spec: &BufferSpec) -> BackendResult<Buffer<T>> {
        Buffer::<T>::builder()
            .queue(queue.clone())
            .flags(spec.access.to_mem_flags())
            .len(spec.len)
            .build()
            .map_err(|e| BackendError::Allocation { buffer: spec.name.to_string(), reason: e.to_string() })
    }
}

fn cl_error<E: std::fmt::Display>(operation: &'static str) -> impl FnOnce(E) -> BackendError {
    move |e| BackendError::Device { operation, reason: e.to_string() }
}

fn check_len(name: &str, expected: usize, found: usize) -> BackendResult<()> {
    if expected != found {
        return Err(BackendError::SizeMismatch { buffer: name.to_string(), expected, found });
    }
    Ok(())
}

impl ComputeBackend for OpenClDevice {
    type Queue = Queue;
    type Buffer = ClBuffer;
    type Program = Program;
    type Kernel = ClKernel;
    type Event = Event;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_queue(&self) -> BackendResult<Queue> {
        Queue::new(&self.context, self.device, Some(CommandQueueProperties::PROFILING_ENABLE))
            .map_err(|e| BackendError::Device { operation: "queue creation", reason: e.to_string() })
    }

    fn create_buffer(&self, queue: &Queue, spec: &BufferSpec) -> BackendResult<ClBuffer> {
        Ok(match spec.element_type {
            ElementType::F32 => ClBuffer::F32(self.build_buffer(queue, spec)?, spec.name),
            ElementType::I32 => ClBuffer::I32(self.build_buffer(queue, spec)?, spec.name),
            ElementType::U32 => ClBuffer::U32(self.build_buffer(queue, spec)?, spec.name),
            ElementType::U64 => ClBuffer::U64(self.build_buffer(queue, spec)?, spec.name),
        })
    }

    fn build_program(&self, source: &Path, options: &str, block_size: usize) -> BackendResult<Program> {
        let kernel_source = std::fs::read_to_string(source)
            .map_err(|e| BackendError::Build(format!("Failed to read {}: {}", source.display(), e)))?;
        Program::builder()
            .devices(self.device)
            .src(kernel_source)
            .cmplr_opt(format!("-D BLOCK_SIZE={} {}", block_size, options))
            .build(&self.context)
            .map_err(|e| BackendError::Build(e.to_string()))
    }

    fn create_kernel(
        &self,
        program: &Program,
        queue: &Queue,
        name: &str,
        signature: &[ArgKind],
    ) -> BackendResult<ClKernel> {
        let mut builder = Kernel::builder();
        builder.name(name).program(program).queue(queue.clone());
        for arg in signature {
            match arg {
                ArgKind::Buffer(ElementType::F32) => builder.arg(None::<&Buffer<f32>>),
                ArgKind::Buffer(ElementType::I32) => builder.arg(None::<&Buffer<i32>>),
                ArgKind::Buffer(ElementType::U32) => builder.arg(None::<&Buffer<u32>>),
                ArgKind::Buffer(ElementType::U64) => builder.arg(None::<&Buffer<u64>>),
                ArgKind::Uint => builder.arg(0u32),
            };
        }
        let kernel = builder
            .build()
            .map_err(|e| BackendError::KernelCreation { kernel: name.to_string(), reason: e.to_string() })?;
        Ok(ClKernel { kernel, name: name.to_string() })
    }

    fn set_buffer_arg(&self, kernel: &mut ClKernel, slot: u32, buffer: &ClBuffer) -> BackendResult<()> {
        // SAFETY: slot kinds were declared at creation and every buffer outlives its kernel
        let result = unsafe {
            match buffer {
                ClBuffer::F32(b, _) => kernel.kernel.set_arg_unchecked(slot, ArgVal::mem(b)),
                ClBuffer::I32(b, _) => kernel.kernel.set_arg_unchecked(slot, ArgVal::mem(b)),
                ClBuffer::U32(b, _) => kernel.kernel.set_arg_unchecked(slot, ArgVal::mem(b)),
                ClBuffer::U64(b, _) => kernel.kernel.set_arg_unchecked(slot, ArgVal::mem(b)),
            }
        };
        result.map_err(|e| BackendError::Device { operation: "set kernel arg", reason: format!("{}: {}", kernel.name, e) })
    }

    fn set_uint_arg(&self, kernel: &mut ClKernel, slot: u32, value: u32) -> BackendResult<()> {
        // SAFETY: the slot was declared as `uint` at creation
        let result = unsafe { kernel.kernel.set_arg_unchecked(slot, ArgVal::scalar(&value)) };
        result.map_err(|e| BackendError::Device { operation: "set kernel arg", reason: format!("{}: {}", kernel.name, e) })
    }

    fn write_f32(&self, queue: &Queue, buffer: &ClBuffer, data: &[f32]) -> BackendResult<Event> {
        let ClBuffer::F32(b, name) = buffer else { return Err(buffer.mismatch(ElementType::F32)) };
        check_len(name, b.len(), data.len())?;
        let mut event = Event::empty();
        b.cmd().queue(queue).write(data).enew(&mut event).enq().map_err(cl_error("transfer"))?;
        Ok(event)
    }

    fn write_i32(&self, queue: &Queue, buffer: &ClBuffer, data: &[i32]) -> BackendResult<Event> {
        let ClBuffer::I32(b, name) = buffer else { return Err(buffer.mismatch(ElementType::I32)) };
        check_len(name, b.len(), data.len())?;
        let mut event = Event::empty();
        b.cmd().queue(queue).write(data).enew(&mut event).enq().map_err(cl_error("transfer"))?;
        Ok(event)
    }

    fn read_f32(&self, queue: &Queue, buffer: &ClBuffer, out: &mut [f32]) -> BackendResult<Event> {
        let ClBuffer::F32(b, name) = buffer else { return Err(buffer.mismatch(ElementType::F32)) };
        check_len(name, b.len(), out.len())?;
        let mut event = Event::empty();
        b.cmd().queue(queue).read(out).enew(&mut event).enq().map_err(cl_error("transfer"))?;
        Ok(event)
    }

    fn launch(&self, queue: &Queue, kernel: &ClKernel, global: usize, local: usize) -> BackendResult<Event> {
        let mut event = Event::empty();
        // SAFETY: every argument slot was bound by the integrator before the first launch
        let result = unsafe {
            kernel
                .kernel
                .cmd()
                .queue(queue)
                .global_work_size(global)
                .local_work_size(local)
                .enew(&mut event)
                .enq()
        };
        result.map_err(|e| BackendError::Device { operation: "kernel launch", reason: format!("{}: {}", kernel.name, e) })?;
        Ok(event)
    }

    fn finish(&self, queue: &Queue) -> BackendResult<()> {
        queue.finish().map_err(cl_error("queue finish"))
    }

    fn elapsed_ns(&self, event: Event) -> BackendResult<u64> {
        let start = event
            .profiling_info(ProfilingInfo::Start)
            .map_err(cl_error("profiling"))?
            .time()
            .map_err(cl_error("profiling"))?;
        let end = event
            .profiling_info(ProfilingInfo::End)
            .map_err(cl_error("profiling"))?
            .time()
            .map_err(cl_error("profiling"))?;
        Ok(end.saturating_sub(start))
    }

    fn release_buffer(&self, buffer: ClBuffer) -> BackendResult<()> {
        drop(buffer);
        Ok(())
    }

    fn release_kernel(&self, kernel: ClKernel) -> BackendResult<()> {
        drop(kernel);
        Ok(())
    }

    fn release_program(&self, program: Program) -> BackendResult<()> {
        drop(program);
        Ok(())
    }

    fn release_queue(&self, queue: Queue) -> BackendResult<()> {
        queue.finish().map_err(cl_error("queue release"))
    }

    fn teardown(&self) -> BackendResult<()> {
        tracing::debug!("🧹 OpenCL context on {} released with the device", self.capabilities.name);
        Ok(())
    }
}
