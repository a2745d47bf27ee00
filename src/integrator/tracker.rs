// src/integrator/tracker.rs - Lifecycle stage and held device resources
// Tree location: ./src/integrator/tracker.rs

//! Resource tracker
//!
//! [`Stage`] is the single lifecycle state of an integrator. The device
//! handles of one configuration live in [`DeviceResources`], whose
//! [`Capabilities`] record which of them are currently held.

use std::fmt;

use super::buffers::BufferSet;
use super::kernels::KernelSet;
use crate::gpu::{ComputeBackend, DeviceGuard};
use crate::{Result, Xrpd1dError};

/// Lifecycle stage, each a precondition for the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// No device context attached
    NoContext,
    /// Context attached, no integration parameters
    ContextActive,
    /// Parameters accepted, nothing allocated
    ParametersSet,
    /// Buffers, program and kernels ready
    Configured,
    /// Two-theta arrays loaded; `execute` may run
    TthLoaded,
}

impl Stage {
    /// Whether `execute` may run
    pub fn is_executable(self) -> bool {
        self == Stage::TthLoaded
    }

    /// Reject `operation` unless this stage is at least `needed`
    pub fn require(self, needed: Stage, operation: &'static str, hint: &str) -> Result<()> {
        if self >= needed {
            return Ok(());
        }
        let reason = match needed {
            Stage::NoContext | Stage::ContextActive => "there is no active context",
            Stage::ParametersSet => "image and histogram parameters are not set",
            Stage::Configured => "the required buffers are not allocated",
            Stage::TthLoaded => "there is no two-theta array loaded",
        };
        tracing::error!("❌ You may not call {}() at this point, {}. (Hint: {})", operation, reason, hint);
        Err(Xrpd1dError::precondition(operation, format!("{} (hint: {})", reason, hint)))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::NoContext => "no context",
            Stage::ContextActive => "context active",
            Stage::ParametersSet => "parameters set",
            Stage::Configured => "configured",
            Stage::TthLoaded => "tth loaded",
        };
        write!(f, "{}", name)
    }
}

/// One category of device resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Command queue
    Queue,
    /// Buffer set
    Buffers,
    /// Compiled program
    Program,
    /// Kernel set
    Kernels,
}

impl Capability {
    const ALL: [Capability; 4] =
        [Capability::Queue, Capability::Buffers, Capability::Program, Capability::Kernels];

    fn bit(self) -> u8 {
        1 << self as u8
    }

    fn name(self) -> &'static str {
        match self {
            Capability::Queue => "queue",
            Capability::Buffers => "buffers",
            Capability::Program => "program",
            Capability::Kernels => "kernels",
        }
    }
}

/// Set of held resource categories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Whether `capability` is held
    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Mark `capability` as held
    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    /// Nothing held
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Every category held
    pub fn is_complete(self) -> bool {
        Capability::ALL.iter().all(|c| self.contains(*c))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> =
            Capability::ALL.iter().filter(|c| self.contains(**c)).map(|c| c.name()).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Device handles owned by the current configuration
///
/// Field order is release order: kernels, program, queue, buffers.
pub(crate) struct DeviceResources<B: ComputeBackend> {
    pub(crate) kernels: Option<KernelSet<B>>,
    pub(crate) program: Option<DeviceGuard<B, B::Program>>,
    pub(crate) queue: Option<DeviceGuard<B, B::Queue>>,
    pub(crate) buffers: Option<BufferSet<B>>,
}

/// Borrowed view of a complete configuration
pub(crate) struct Parts<'a, B: ComputeBackend> {
    pub(crate) kernels: &'a mut KernelSet<B>,
    pub(crate) queue: &'a B::Queue,
    pub(crate) buffers: &'a BufferSet<B>,
}

impl<B: ComputeBackend> Default for DeviceResources<B> {
    fn default() -> Self {
        Self { kernels: None, program: None, queue: None, buffers: None }
    }
}

impl<B: ComputeBackend> DeviceResources<B> {
    /// Categories currently held
    pub(crate) fn held(&self) -> Capabilities {
        let mut held = Capabilities::default();
        if self.queue.is_some() {
            held.insert(Capability::Queue);
        }
        if self.buffers.is_some() {
            held.insert(Capability::Buffers);
        }
        if self.program.is_some() {
            held.insert(Capability::Program);
        }
        if self.kernels.is_some() {
            held.insert(Capability::Kernels);
        }
        held
    }

    /// Release everything held, kernels first; returns what was released
    pub(crate) fn release_all(&mut self) -> Capabilities {
        let released = self.held();
        if let Some(kernels) = self.kernels.take() {
            drop(kernels);
            tracing::debug!("--released kernels");
        }
        if let Some(program) = self.program.take() {
            drop(program);
            tracing::debug!("--released program");
        }
        if let Some(queue) = self.queue.take() {
            drop(queue);
            tracing::debug!("--released queue");
        }
        if let Some(buffers) = self.buffers.take() {
            let count = buffers.len();
            drop(buffers);
            tracing::debug!("--released {} buffers", count);
        }
        released
    }

    /// Borrow kernels, queue and buffers together
    pub(crate) fn parts(&mut self, operation: &'static str) -> Result<Parts<'_, B>> {
        let held = self.held();
        match (self.kernels.as_mut(), self.queue.as_deref(), self.buffers.as_ref()) {
            (Some(kernels), Some(queue), Some(buffers)) => Ok(Parts { kernels, queue, buffers }),
            _ => Err(Xrpd1dError::precondition(
                operation,
                format!("device resources incomplete (held: {})", held),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::NoContext < Stage::ContextActive);
        assert!(Stage::ParametersSet < Stage::Configured);
        assert!(Stage::Configured < Stage::TthLoaded);
        assert!(Stage::TthLoaded.is_executable());
        assert!(!Stage::Configured.is_executable());
    }

    #[test]
    fn test_require() {
        assert!(Stage::Configured.require(Stage::Configured, "set_mask", "run configure()").is_ok());
        let err = Stage::Configured
            .require(Stage::TthLoaded, "execute", "run load_tth()")
            .unwrap_err();
        assert_eq!(err.status_code(), crate::status::PRECONDITION);
    }

    #[test]
    fn test_capabilities() {
        let mut held = Capabilities::default();
        assert!(held.is_empty());
        assert_eq!(held.to_string(), "none");

        held.insert(Capability::Queue);
        held.insert(Capability::Buffers);
        assert!(held.contains(Capability::Queue));
        assert!(!held.contains(Capability::Kernels));
        assert!(!held.is_complete());
        assert_eq!(held.to_string(), "queue, buffers");

        held.insert(Capability::Program);
        held.insert(Capability::Kernels);
        assert!(held.is_complete());
    }
}
