//! Mode accumulation: sum every source's contribution to one mode
//! number into the rows of the mode matrix.
//!
//! Each accumulator owns two rows, one for the positive and one for the
//! negative mode. Mode 0 has no negative partner, and neither has the
//! highest mode when the number of loudspeakers is even; the second
//! channel is simply discarded then.

use crate::block_parameter::BlockParameter;
use crate::math::LinearInterpolator;
use crate::mode::{InterpolationMode, Mode};

/// Sums all modes of one mode number into the mode matrix.
#[derive(Clone, Debug)]
pub struct ModeAccumulator {
    mode_number: usize,
    positive_row: usize,
    negative_row: Option<usize>,
}

impl ModeAccumulator {
    pub fn new(mode_number: usize, positive_row: usize, negative_row: Option<usize>) -> Self {
        Self {
            mode_number,
            positive_row,
            negative_row,
        }
    }

    pub fn mode_number(&self) -> usize {
        self.mode_number
    }

    pub fn positive_row(&self) -> usize {
        self.positive_row
    }

    pub fn negative_row(&self) -> Option<usize> {
        self.negative_row
    }

    /// Accumulate one block. `modes` yields every source's mode of this
    /// accumulator's mode number together with the source's weighting
    /// factor; `positive` and `negative` are the owned matrix rows.
    ///
    /// `volume_correction` is a global scale applied to every source
    /// contribution.
    pub fn process<'a, I>(
        &self,
        modes: I,
        volume_correction: f32,
        positive: &mut [f32],
        mut negative: Option<&mut [f32]>,
    ) where
        I: Iterator<Item = (&'a Mode, BlockParameter<f32>)>,
    {
        positive.fill(0.0);
        if let Some(negative) = negative.as_deref_mut() {
            negative.fill(0.0);
        }

        let block_size = positive.len() as f32;

        for (mode, weighting_factor) in modes {
            debug_assert_eq!(mode.mode_number(), self.mode_number);

            match mode.interpolation {
                InterpolationMode::Nothing => {}
                InterpolationMode::Constant => {
                    let rotation1 = mode.rotation1 * weighting_factor.get();
                    let rotation2 = mode.rotation2 * weighting_factor.get();
                    for (index, &sample) in mode.output().iter().enumerate() {
                        let sample = sample * volume_correction;
                        positive[index] += sample * rotation1;
                        if let Some(negative) = negative.as_deref_mut() {
                            negative[index] += sample * rotation2;
                        }
                    }
                }
                InterpolationMode::Change => {
                    // Cross-fade rotation and weighting together: the
                    // first sample is one step past the old values and
                    // the last sample lands on the new ones.
                    let mut interpolator1 = LinearInterpolator::default();
                    let mut interpolator2 = LinearInterpolator::default();
                    interpolator1.set(
                        mode.old_rotation1 * weighting_factor.old(),
                        mode.rotation1 * weighting_factor.get(),
                        block_size,
                    );
                    interpolator2.set(
                        mode.old_rotation2 * weighting_factor.old(),
                        mode.rotation2 * weighting_factor.get(),
                        block_size,
                    );
                    for (index, &sample) in mode.output().iter().enumerate() {
                        let t = (index + 1) as f32;
                        let sample = sample * volume_correction;
                        positive[index] += sample * interpolator1.get(t);
                        if let Some(negative) = negative.as_deref_mut() {
                            negative[index] += sample * interpolator2.get(t);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::SourceType;
    use crate::source::SourceSnapshot;

    fn active_mode(mode_number: usize, block_size: usize) -> (Mode, BlockParameter<f32>) {
        let mut mode = Mode::new(mode_number, block_size, 44100, 1.0).unwrap();
        let mut snapshot = SourceSnapshot {
            distance: BlockParameter::new(-1.0),
            angle: BlockParameter::new(f32::INFINITY),
            source_type: BlockParameter::new(SourceType::PlaneWave),
            weighting_factor: BlockParameter::new(0.0),
        };
        snapshot.distance.set(1.0);
        snapshot.angle.set(0.0);
        snapshot.source_type.set(SourceType::PointSource);
        snapshot.weighting_factor.set(1.0);
        // Two blocks so the parameters settle to constant.
        let input = vec![1.0; block_size];
        mode.process(&input, &snapshot, 1.0);
        snapshot.distance.set(1.0);
        snapshot.angle.set(0.0);
        snapshot.source_type.set(SourceType::PointSource);
        snapshot.weighting_factor.set(1.0);
        mode.process(&input, &snapshot, 1.0);
        (mode, snapshot.weighting_factor)
    }

    #[test]
    fn silent_mode_leaves_rows_zero() {
        let accumulator = ModeAccumulator::new(0, 0, None);
        let mode = Mode::new(0, 4, 44100, 1.0).unwrap();
        let weighting = BlockParameter::new(0.0);
        let mut positive = vec![1.0; 4];
        accumulator.process(
            std::iter::once((&mode, weighting)),
            0.1,
            &mut positive,
            None,
        );
        assert_eq!(positive, vec![0.0; 4]);
    }

    #[test]
    fn constant_accumulation_scales_by_rotation_and_weight() {
        let (mode, weighting) = active_mode(0, 4);
        let accumulator = ModeAccumulator::new(0, 0, None);
        let mut positive = vec![0.0; 4];
        accumulator.process(
            std::iter::once((&mode, weighting)),
            1.0,
            &mut positive,
            None,
        );
        // Mode 0 on the radius passes the unit signal through and has
        // rotation1 = cos(0) = 1.
        for y in &positive {
            assert!((y - 1.0).abs() < 1e-4, "{y}");
        }
    }

    #[test]
    fn contributions_accumulate_across_sources() {
        let (mode_a, weight_a) = active_mode(0, 4);
        let (mode_b, weight_b) = active_mode(0, 4);
        let accumulator = ModeAccumulator::new(0, 0, None);
        let mut positive = vec![0.0; 4];
        accumulator.process(
            vec![(&mode_a, weight_a), (&mode_b, weight_b)].into_iter(),
            1.0,
            &mut positive,
            None,
        );
        for y in &positive {
            assert!((y - 2.0).abs() < 1e-4, "{y}");
        }
    }
}
