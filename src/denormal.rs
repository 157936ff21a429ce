//! Denormal prevention.
//!
//! Recursive filters decay into the denormal range when fed silence,
//! which is extremely slow on most processors. The policies here keep
//! filter states out of that range; see Laurent de Soras, "Denormal
//! numbers in floating point signal processing applications".

use crate::math::Real;

/// A policy applied to a filter state after every update.
pub trait DenormalPrevention<F: Real>: Clone + Default + Send {
    fn prevent_denormals(&mut self, value: &mut F);
}

/// Leave values untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPrevention;

impl<F: Real> DenormalPrevention<F> for NoPrevention {
    #[inline]
    fn prevent_denormals(&mut self, _value: &mut F) {}
}

/// Add a tiny DC offset.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dc;

impl<F: Real> DenormalPrevention<F> for Dc {
    #[inline]
    fn prevent_denormals(&mut self, value: &mut F) {
        *value += F::ANTI_DENORMAL;
    }
}

/// Add a tiny component alternating in sign between adjacent samples,
/// i.e. a sine at the Nyquist frequency. Default for the DCA filters.
#[derive(Clone, Copy, Debug)]
pub struct Ac<F: Real> {
    anti_denormal: F,
}

impl<F: Real> Default for Ac<F> {
    fn default() -> Self {
        Self {
            anti_denormal: F::ANTI_DENORMAL,
        }
    }
}

impl<F: Real> DenormalPrevention<F> for Ac<F> {
    #[inline]
    fn prevent_denormals(&mut self, value: &mut F) {
        self.anti_denormal = -self.anti_denormal;
        *value += self.anti_denormal;
    }
}

/// Quantize away the low mantissa bits by adding and subtracting the
/// same tiny constant.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quantization;

impl<F: Real> DenormalPrevention<F> for Quantization {
    #[inline]
    fn prevent_denormals(&mut self, value: &mut F) {
        *value += F::ANTI_DENORMAL;
        *value -= F::ANTI_DENORMAL;
    }
}

/// Detect denormals and replace them with zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetZero;

impl<F: Real> DenormalPrevention<F> for SetZero {
    #[inline]
    fn prevent_denormals(&mut self, value: &mut F) {
        if value.abs() < F::MIN_NORMAL {
            *value = F::zero();
        }
    }
}

/// Scope guard that enables flush-to-zero and denormals-are-zero on the
/// current thread and restores the previous control word when dropped.
///
/// On non-x86 targets this is a no-op.
#[derive(Debug)]
pub struct FlushToZeroGuard {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    saved_csr: u32,
}

impl FlushToZeroGuard {
    pub fn new() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            #[cfg(target_arch = "x86_64")]
            #[allow(deprecated)]
            use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};

            #[cfg(target_arch = "x86")]
            #[allow(deprecated)]
            use std::arch::x86::{_mm_getcsr, _mm_setcsr};

            // FTZ is bit 15, DAZ is bit 6 of MXCSR.
            #[allow(deprecated)]
            let saved_csr = unsafe { _mm_getcsr() };
            #[allow(deprecated)]
            unsafe {
                _mm_setcsr(saved_csr | (1 << 15) | (1 << 6))
            };
            Self { saved_csr }
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            Self {}
        }
    }
}

impl Default for FlushToZeroGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FlushToZeroGuard {
    fn drop(&mut self) {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            #[cfg(target_arch = "x86_64")]
            #[allow(deprecated)]
            use std::arch::x86_64::_mm_setcsr;

            #[cfg(target_arch = "x86")]
            #[allow(deprecated)]
            use std::arch::x86::_mm_setcsr;

            #[allow(deprecated)]
            unsafe {
                _mm_setcsr(self.saved_csr)
            };
        }
    }
}
