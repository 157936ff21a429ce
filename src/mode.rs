//! Per-mode filtering and the mode-pair work unit.
//!
//! Each source drives `order + 1` modes; mode `k` filters the source
//! signal through its own cascade of second-order sections and carries
//! the rotation scalars the accumulators apply. Modes are grouped into
//! pairs of roughly equal total filter length so the worker partitions
//! stay balanced: mode 0 is nearly free while mode `order` runs the
//! longest cascade.

use crate::biquad::{Cascade, SosCoefficients};
use crate::coefficients::DcaCoefficients;
use crate::source::SourceSnapshot;
use crate::{SetupError, SPEED_OF_SOUND};

/// How the accumulator treats one mode this block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InterpolationMode {
    /// Weighting factor is zero in both the old and the new block;
    /// nothing to add.
    #[default]
    Nothing,
    /// No parameter changed; apply constant rotation and weight.
    Constant,
    /// Something changed; cross-fade rotation and weight per sample.
    Change,
}

/// One angular mode of one source.
#[derive(Clone)]
pub struct Mode {
    mode_number: usize,
    filter: Cascade<f64>,
    coefficients: DcaCoefficients,
    old_coefficients: DcaCoefficients,
    output: Vec<f32>,
    pub rotation1: f32,
    pub rotation2: f32,
    pub old_rotation1: f32,
    pub old_rotation2: f32,
    pub interpolation: InterpolationMode,
}

impl Mode {
    pub fn new(
        mode_number: usize,
        block_size: usize,
        sample_rate: u32,
        array_radius: f32,
    ) -> Result<Self, SetupError> {
        let coefficients =
            DcaCoefficients::new(mode_number, sample_rate, array_radius, SPEED_OF_SOUND)?;
        let old_coefficients = coefficients.clone();
        Ok(Self {
            mode_number,
            filter: Cascade::new(coefficients.len()),
            coefficients,
            old_coefficients,
            output: vec![0.0; block_size],
            rotation1: 0.0,
            rotation2: 0.0,
            old_rotation1: 0.0,
            old_rotation2: 0.0,
            interpolation: InterpolationMode::Nothing,
        })
    }

    pub fn mode_number(&self) -> usize {
        self.mode_number
    }

    /// This block's filtered signal.
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    /// Clear filter state, coefficients and rotations, as freshly built.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.filter
            .set(std::iter::repeat(SosCoefficients::default()).take(self.filter.len()));
        self.coefficients.clear();
        self.old_coefficients.clear();
        self.output.fill(0.0);
        self.rotation1 = 0.0;
        self.rotation2 = 0.0;
        self.old_rotation1 = 0.0;
        self.old_rotation2 = 0.0;
        self.interpolation = InterpolationMode::Nothing;
    }

    /// Filter one block of the source signal and update the rotation
    /// scalars and interpolation mode.
    pub fn process(&mut self, input: &[f32], source: &SourceSnapshot, array_radius: f32) {
        if !source.distance.changed() && !source.source_type.changed() {
            // Coefficients are unchanged: run the cascade over the whole
            // block as-is.
            self.filter.execute(input, &mut self.output);
        } else {
            self.old_coefficients.swap(&mut self.coefficients);

            // Focused sources are clamped to the array radius.
            let distance = source.distance.get().max(array_radius);
            self.coefficients.reset(distance, source.source_type.get());

            // Each sample is computed separately: the first sample still
            // uses the old coefficients and after the last sample the
            // filter holds the new ones for the next block.
            let block_size = input.len() as f64;
            for (index, (&x, y)) in input.iter().zip(self.output.iter_mut()).enumerate() {
                *y = self.filter.process(f64::from(x)) as f32;

                let t = (index + 1) as f64 / block_size;
                let old = self.old_coefficients.sections();
                let new = self.coefficients.sections();
                self.filter
                    .set(old.iter().zip(new).map(|(o, n)| o.step(&n.delta(o), t)));
            }
        }

        // Rotations must be shifted whenever angle or weighting factor
        // may have changed.
        self.old_rotation1 = self.rotation1;
        self.old_rotation2 = self.rotation2;

        if source.angle.changed() {
            let k = self.mode_number as f32;
            self.rotation1 = (-k * source.angle.get()).cos();
            // The factor for the imaginary parts has negative mode number.
            self.rotation2 = (k * source.angle.get()).sin();
        }

        self.interpolation = if source.weighting_factor.both_eq(0.0) {
            InterpolationMode::Nothing
        } else if source.weighting_factor.changed()
            || source.angle.changed()
            || source.distance.changed()
            || source.source_type.changed()
        {
            InterpolationMode::Change
        } else {
            InterpolationMode::Constant
        };
    }
}

/// Two modes combined into one work unit of roughly constant cost.
///
/// Pair `j` holds modes `{j, order - j}`; when the number of modes is
/// odd the first pair holds only mode `order` and the later pairs shift
/// down by one.
#[derive(Clone)]
pub struct ModePair {
    first: Option<Mode>,
    second: Mode,
}

impl ModePair {
    pub fn new(
        pair_index: usize,
        order: usize,
        block_size: usize,
        sample_rate: u32,
        array_radius: f32,
    ) -> Result<Self, SetupError> {
        let second = Mode::new(order - pair_index, block_size, sample_rate, array_radius)?;
        // With an even order there is an odd number of modes and the
        // first pair keeps its single long mode.
        let lone_first = order % 2 == 0;
        let first = if pair_index == 0 && lone_first {
            None
        } else {
            Some(Mode::new(
                pair_index - usize::from(lone_first),
                block_size,
                sample_rate,
                array_radius,
            )?)
        };
        Ok(Self { first, second })
    }

    pub fn first(&self) -> Option<&Mode> {
        self.first.as_ref()
    }

    pub fn second(&self) -> &Mode {
        &self.second
    }

    pub fn process(&mut self, input: &[f32], source: &SourceSnapshot, array_radius: f32) {
        if let Some(first) = self.first.as_mut() {
            first.process(input, source, array_radius);
        }
        self.second.process(input, source, array_radius);
    }

    pub fn reset(&mut self) {
        if let Some(first) = self.first.as_mut() {
            first.reset();
        }
        self.second.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_parameter::BlockParameter;
    use crate::coefficients::SourceType;

    fn snapshot(distance: f32, angle: f32, weight: f32) -> SourceSnapshot {
        let mut s = SourceSnapshot {
            distance: BlockParameter::new(-1.0),
            angle: BlockParameter::new(f32::INFINITY),
            source_type: BlockParameter::new(SourceType::PlaneWave),
            weighting_factor: BlockParameter::new(0.0),
        };
        s.distance.set(distance);
        s.angle.set(angle);
        s.source_type.set(SourceType::PointSource);
        s.weighting_factor.set(weight);
        s
    }

    fn settle(s: &mut SourceSnapshot) {
        s.distance.set(s.distance.get());
        s.angle.set(s.angle.get());
        s.source_type.set(s.source_type.get());
        s.weighting_factor.set(s.weighting_factor.get());
    }

    #[test]
    fn pair_layout_even_order() {
        // order 4: pairs {4}, {0, 3}, {1, 2}
        let numbers: Vec<Vec<usize>> = (0..=2)
            .map(|j| {
                let pair = ModePair::new(j, 4, 8, 44100, 1.0).unwrap();
                let mut modes = Vec::new();
                if let Some(first) = pair.first() {
                    modes.push(first.mode_number());
                }
                modes.push(pair.second().mode_number());
                modes
            })
            .collect();
        assert_eq!(numbers, vec![vec![4], vec![0, 3], vec![1, 2]]);
    }

    #[test]
    fn pair_layout_odd_order() {
        // order 5: pairs {0, 5}, {1, 4}, {2, 3}
        let numbers: Vec<Vec<usize>> = (0..=2)
            .map(|j| {
                let pair = ModePair::new(j, 5, 8, 44100, 1.0).unwrap();
                vec![
                    pair.first().unwrap().mode_number(),
                    pair.second().mode_number(),
                ]
            })
            .collect();
        assert_eq!(numbers, vec![vec![0, 5], vec![1, 4], vec![2, 3]]);
    }

    #[test]
    fn mode_zero_passes_signal_through_on_the_radius() {
        // A point source on the array radius has a flat mode-0 filter.
        let mut mode = Mode::new(0, 8, 44100, 1.5).unwrap();
        let mut s = snapshot(1.5, 0.0, 1.0);
        let input = [1.0, 0.0, -0.5, 0.25, 0.0, 0.0, 0.0, 0.0];
        mode.process(&input, &s, 1.5);

        // Second block with settled parameters: pure pass-through.
        settle(&mut s);
        mode.process(&input, &s, 1.5);
        for (x, y) in input.iter().zip(mode.output()) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn rotation_scalars() {
        let mut mode = Mode::new(2, 4, 44100, 1.0).unwrap();
        let angle = 0.5_f32;
        let s = snapshot(2.0, angle, 1.0);
        mode.process(&[0.0; 4], &s, 1.0);
        assert!((mode.rotation1 - (-2.0 * angle).cos()).abs() < 1e-6);
        assert!((mode.rotation2 - (2.0 * angle).sin()).abs() < 1e-6);
        assert_eq!(mode.interpolation, InterpolationMode::Change);
    }

    #[test]
    fn interpolation_mode_transitions() {
        let mut mode = Mode::new(1, 4, 44100, 1.0).unwrap();
        let mut s = snapshot(2.0, 0.3, 1.0);
        mode.process(&[0.0; 4], &s, 1.0);
        assert_eq!(mode.interpolation, InterpolationMode::Change);

        settle(&mut s);
        mode.process(&[0.0; 4], &s, 1.0);
        assert_eq!(mode.interpolation, InterpolationMode::Constant);

        s.weighting_factor.set(0.0);
        mode.process(&[0.0; 4], &s, 1.0);
        assert_eq!(mode.interpolation, InterpolationMode::Change);

        s.weighting_factor.set(0.0);
        mode.process(&[0.0; 4], &s, 1.0);
        assert_eq!(mode.interpolation, InterpolationMode::Nothing);
    }
}
