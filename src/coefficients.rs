//! Per-mode IIR coefficients for the DCA renderer.
//!
//! The analog prototypes from [`crate::laplace`] are scaled once per
//! block according to the source distance and model, then discretized
//! with the bilinear transform. Numerator and denominator share the same
//! prototype rows: the numerator is scaled by the source curvature
//! `c / distance` (point sources only), the denominator always by the
//! array curvature `c / array_radius`.

use crate::biquad::{bilinear, LaplaceCoefficients, SosCoefficients};
use crate::laplace::{sections_for_mode, table_start, LAPLACE_COEFFS, MAX_MODE};
use crate::SetupError;

/// Frequency prewarping point of the bilinear transform in Hz.
const PREWARP_FREQUENCY: f64 = 1000.0;

/// Wavefront curvature model of a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceType {
    #[default]
    PointSource,
    PlaneWave,
}

/// One mode's discrete filter coefficients, recomputed whenever the
/// source distance or model changes.
#[derive(Clone, Debug)]
pub struct DcaCoefficients {
    sections: Vec<SosCoefficients<f64>>,
    table_offset: usize,
    sample_rate: u32,
    array_radius: f32,
    speed_of_sound: f32,
}

impl DcaCoefficients {
    /// Create the coefficient set for one mode. All sections start at
    /// zero; call [`reset`](Self::reset) before first use.
    ///
    /// Fails if the prototype table does not cover `mode_number`.
    pub fn new(
        mode_number: usize,
        sample_rate: u32,
        array_radius: f32,
        speed_of_sound: f32,
    ) -> Result<Self, SetupError> {
        if mode_number > MAX_MODE {
            return Err(SetupError::UnsupportedOrder(mode_number));
        }
        Ok(Self {
            sections: vec![SosCoefficients::default(); sections_for_mode(mode_number)],
            table_offset: table_start(mode_number),
            sample_rate,
            array_radius,
            speed_of_sound,
        })
    }

    /// Number of second-order sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// The sections computed by the last [`reset`](Self::reset).
    pub fn sections(&self) -> &[SosCoefficients<f64>] {
        &self.sections
    }

    /// Recompute all sections for a source at `distance` meters.
    ///
    /// The caller clamps focused sources to the array radius beforehand;
    /// plane waves ignore `distance` in the numerator entirely.
    pub fn reset(&mut self, distance: f32, source_type: SourceType) {
        let source_scale = (self.speed_of_sound / distance) as f64;
        let array_scale = (self.speed_of_sound / self.array_radius) as f64;

        for (section, row) in self
            .sections
            .iter_mut()
            .zip(&LAPLACE_COEFFS[self.table_offset..])
        {
            let mut analog = LaplaceCoefficients::new(row[0], row[1], 0.0, 0.0);
            if source_type == SourceType::PointSource {
                analog.b1 *= source_scale;
                analog.b2 *= source_scale * source_scale;
            }
            // The denominator scaling does not depend on the source.
            analog.a1 = row[0] * array_scale;
            analog.a2 = row[1] * array_scale * array_scale;

            *section = bilinear(analog, self.sample_rate, PREWARP_FREQUENCY);
        }
    }

    /// Zero all sections, as freshly constructed.
    pub fn clear(&mut self) {
        self.sections.fill(SosCoefficients::default());
    }

    /// Exchange contents with `other`, keeping the previous block's
    /// coefficient set around for the interpolation path.
    pub fn swap(&mut self, other: &mut DcaCoefficients) {
        debug_assert_eq!(self.table_offset, other.table_offset);
        debug_assert_eq!(self.sections.len(), other.sections.len());
        std::mem::swap(&mut self.sections, &mut other.sections);
    }
}
