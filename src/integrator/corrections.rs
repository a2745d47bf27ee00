// src/integrator/corrections.rs - Correction toggles consumed by execute
// Tree location: ./src/integrator/corrections.rs

use super::buffers::BufferRole;
use crate::status;

/// An optional per-pixel correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correction {
    /// Divide by solid-angle coefficients
    SolidAngle,
    /// Subtract a dark-field image
    Dark,
    /// Divide by a flat-field image
    Flat,
    /// Divide by polarization factors
    Polarization,
    /// Exclude masked pixels
    Mask,
}

impl Correction {
    /// Buffer the correction data is uploaded to
    pub fn role(self) -> BufferRole {
        match self {
            Correction::SolidAngle => BufferRole::SolidAngle,
            Correction::Dark => BufferRole::Dark,
            Correction::Flat => BufferRole::Flat,
            Correction::Polarization => BufferRole::Polarization,
            Correction::Mask => BufferRole::Mask,
        }
    }

    /// Bit in the correction kernel's flag word (the mask has none)
    pub fn kernel_flag(self) -> u32 {
        match self {
            Correction::SolidAngle => 1,
            Correction::Dark => 2,
            Correction::Flat => 4,
            Correction::Polarization => 8,
            Correction::Mask => 0,
        }
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Outcome of an unset operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// The option was active and is now cleared
    Cleared,
    /// The option was not active, nothing done
    AlreadyClear,
}

impl Toggle {
    /// `0` when cleared, [`status::NOOP`] otherwise
    pub fn status_code(self) -> i32 {
        match self {
            Toggle::Cleared => status::SUCCESS,
            Toggle::AlreadyClear => status::NOOP,
        }
    }
}

/// Correction flags and per-configuration options
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrectionState {
    enabled: u8,
    populated: u8,
    dummy: Option<(f32, f32)>,
    range: Option<(f32, f32)>,
}

impl CorrectionState {
    /// Whether `correction` is applied by execute
    pub fn is_enabled(&self, correction: Correction) -> bool {
        self.enabled & correction.bit() != 0
    }

    /// Whether the buffer of `correction` has been uploaded
    pub fn is_populated(&self, correction: Correction) -> bool {
        self.populated & correction.bit() != 0
    }

    pub(crate) fn enable(&mut self, correction: Correction) {
        self.enabled |= correction.bit();
        self.populated |= correction.bit();
    }

    pub(crate) fn disable(&mut self, correction: Correction) -> Toggle {
        if !self.is_enabled(correction) {
            return Toggle::AlreadyClear;
        }
        self.enabled &= !correction.bit();
        Toggle::Cleared
    }

    /// Flag word for the correction kernel
    pub fn kernel_flags(&self) -> u32 {
        [Correction::SolidAngle, Correction::Dark, Correction::Flat, Correction::Polarization]
            .iter()
            .filter(|c| self.is_enabled(**c))
            .fold(0, |flags, c| flags | c.kernel_flag())
    }

    /// Whether execute must run the correction kernel
    pub fn needs_correction_kernel(&self) -> bool {
        self.kernel_flags() != 0
    }

    /// Active dummy value and tolerance
    pub fn dummy(&self) -> Option<(f32, f32)> {
        self.dummy
    }

    pub(crate) fn set_dummy(&mut self, dummy: Option<(f32, f32)>) -> Toggle {
        let previous = std::mem::replace(&mut self.dummy, dummy);
        if previous.is_some() {
            Toggle::Cleared
        } else {
            Toggle::AlreadyClear
        }
    }

    /// Active restricted two-theta range
    pub fn range(&self) -> Option<(f32, f32)> {
        self.range
    }

    pub(crate) fn set_range(&mut self, range: Option<(f32, f32)>) -> Toggle {
        let previous = std::mem::replace(&mut self.range, range);
        if previous.is_some() {
            Toggle::Cleared
        } else {
            Toggle::AlreadyClear
        }
    }
}
