//! The per-source stage of the DCA renderer.
//!
//! Once per block, each source derives its distance, angle and wavefront
//! model from the scene geometry, computes its weighting factor, and
//! copies its input channel into an internal buffer (hosts may reuse
//! input buffers as outputs, so the modes never read host memory
//! directly). All derived values are block parameters so the downstream
//! stages can interpolate across the block.

use crate::block_parameter::BlockParameter;
use crate::coefficients::SourceType;
use crate::geometry::{Orientation, Position};
use crate::math::deg2rad;
use crate::mode::{Mode, ModePair};
use crate::rtlist::RtNode;
use crate::scene::SourceModel;
use crate::SetupError;

/// Global values the source stage reads at the start of each block.
/// Updated only at block boundaries from queued commands.
#[derive(Clone, Copy, Debug)]
pub struct RenderState {
    pub reference_position: Position,
    pub reference_orientation: Orientation,
    pub reference_offset_position: Position,
    pub reference_offset_orientation: Orientation,
    pub master_volume: f32,
    pub master_mute: bool,
    pub amplitude_reference_distance: f32,
    pub decay_exponent: f32,
    pub processing: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            reference_position: Position::default(),
            reference_orientation: Orientation::new(90.0),
            reference_offset_position: Position::default(),
            reference_offset_orientation: Orientation::default(),
            master_volume: 1.0,
            master_mute: false,
            amplitude_reference_distance: 3.0,
            decay_exponent: 1.0,
            processing: true,
        }
    }
}

/// Copy of one source's block parameters, handed to the mode stage.
#[derive(Clone, Copy, Debug)]
pub struct SourceSnapshot {
    pub distance: BlockParameter<f32>,
    pub angle: BlockParameter<f32>,
    pub source_type: BlockParameter<SourceType>,
    pub weighting_factor: BlockParameter<f32>,
}

/// A sound source as seen by the real-time renderer.
#[derive(Clone, Default)]
pub struct SourceNode {
    id: u32,
    /// Which host input channel this source reads.
    pub input_channel: usize,
    // Control inputs, updated at block boundaries.
    pub position: Position,
    pub rotation: Orientation,
    pub model: SourceModel,
    pub gain: f32,
    pub mute: bool,
    // Derived once per block.
    pub distance: BlockParameter<f32>,
    pub angle: BlockParameter<f32>,
    pub source_type: BlockParameter<SourceType>,
    pub weighting_factor: BlockParameter<f32>,
    buffer: Vec<f32>,
    pairs: Vec<ModePair>,
    /// Mode number -> (pair index, second slot?) for the accumulators.
    mode_index: Vec<(usize, bool)>,
}

impl SourceNode {
    /// Build a complete source for an array of the given order. This
    /// allocates all mode filters and buffers and therefore runs on the
    /// control plane, never on the audio thread.
    pub fn new(
        id: u32,
        input_channel: usize,
        block_size: usize,
        order: usize,
        sample_rate: u32,
        array_radius: f32,
    ) -> Result<Self, SetupError> {
        let mut pairs = Vec::with_capacity(order / 2 + 1);
        for pair_index in 0..=order / 2 {
            pairs.push(ModePair::new(
                pair_index,
                order,
                block_size,
                sample_rate,
                array_radius,
            )?);
        }

        let mut mode_index = vec![(0, false); order + 1];
        for (pair_index, pair) in pairs.iter().enumerate() {
            if let Some(first) = pair.first() {
                mode_index[first.mode_number()] = (pair_index, false);
            }
            mode_index[pair.second().mode_number()] = (pair_index, true);
        }

        Ok(Self {
            id,
            input_channel,
            position: Position::default(),
            rotation: Orientation::default(),
            model: SourceModel::Point,
            gain: 1.0,
            mute: false,
            // Impossible values force a full update in the first block.
            distance: BlockParameter::new(-1.0),
            angle: BlockParameter::new(f32::INFINITY),
            source_type: BlockParameter::new(SourceType::PlaneWave),
            weighting_factor: BlockParameter::new(0.0),
            buffer: vec![0.0; block_size],
            pairs,
            mode_index,
        })
    }

    /// The block's copy of this source's input signal.
    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Split the node into the parts the mode stage needs: the input
    /// buffer to read, this block's parameters, and the pairs to
    /// filter. The borrows are disjoint so the pairs can be handed to
    /// different workers while they all read the same buffer.
    pub(crate) fn mode_stage_parts(&mut self) -> (&[f32], SourceSnapshot, &mut [ModePair]) {
        let snapshot = SourceSnapshot {
            distance: self.distance,
            angle: self.angle,
            source_type: self.source_type,
            weighting_factor: self.weighting_factor,
        };
        (&self.buffer, snapshot, &mut self.pairs)
    }

    /// Clear all filter states and force a full parameter update in the
    /// next block, as on first use.
    pub fn reset(&mut self) {
        self.distance = BlockParameter::new(-1.0);
        self.angle = BlockParameter::new(f32::INFINITY);
        self.source_type = BlockParameter::new(SourceType::PlaneWave);
        self.weighting_factor = BlockParameter::new(0.0);
        self.buffer.fill(0.0);
        for pair in &mut self.pairs {
            pair.reset();
        }
    }

    /// The mode with the given mode number.
    pub fn mode(&self, mode_number: usize) -> &Mode {
        let (pair, second) = self.mode_index[mode_number];
        if second {
            self.pairs[pair].second()
        } else {
            self.pairs[pair]
                .first()
                .expect("mode index refers to an occupied slot")
        }
    }

    /// The source stage: derive this block's parameters and copy the
    /// input. `input` is this source's host channel, or an empty slice
    /// when the channel does not exist.
    pub fn process(&mut self, input: &[f32], state: &RenderState) {
        let reference_position = state.reference_position + state.reference_offset_position;
        let reference_orientation =
            state.reference_orientation + state.reference_offset_orientation;

        // Distance is only meaningful for point sources but is updated
        // for all models, so a later model switch interpolates cleanly.
        let offset = self.position - reference_position;
        self.distance.set(offset.length());

        let source_orientation;
        match self.model {
            SourceModel::Point => {
                self.source_type.set(SourceType::PointSource);
                source_orientation = offset.orientation();
            }
            SourceModel::Plane => {
                self.source_type.set(SourceType::PlaneWave);
                source_orientation = self.rotation - Orientation::new(180.0);
            }
            SourceModel::Unknown => {
                // Keep the previous model; the control plane has already
                // warned about the value.
                self.source_type.set(self.source_type.get());
                source_orientation = offset.orientation();
            }
        }

        self.angle.set(deg2rad(
            180.0 + (source_orientation - reference_orientation).azimuth,
        ));

        self.weighting_factor.set(self.compute_weighting(state));

        let copied = input.len().min(self.buffer.len());
        self.buffer[..copied].copy_from_slice(&input[..copied]);
        self.buffer[copied..].fill(0.0);
    }

    fn compute_weighting(&self, state: &RenderState) -> f32 {
        if self.mute || state.master_mute || !state.processing {
            return 0.0;
        }
        let attenuation = match self.source_type.get() {
            SourceType::PointSource => {
                // Clamp very close sources so the gain stays bounded.
                let distance = self.distance.get().max(0.5);
                (state.amplitude_reference_distance / distance).powf(state.decay_exponent)
            }
            // No distance attenuation for plane waves.
            SourceType::PlaneWave => 1.0,
        };
        state.master_volume * self.gain * attenuation
    }
}

impl RtNode for SourceNode {
    fn id(&self) -> u32 {
        self.id
    }
}
