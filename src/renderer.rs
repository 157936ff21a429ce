//! The Distance-Coded Ambisonics renderer.
//!
//! One renderer owns the whole real-time graph: the source list, the
//! mode pairs, the mode accumulators, the inverse-transform stages and
//! the output copies. The host drives it through
//! [`audio_callback`](DcaRenderer::audio_callback); the control plane
//! talks to it exclusively through [`RendererControls`].
//!
//! Per block the node lists run strictly in order (sources, mode
//! pairs, accumulators, transpose, inverse transform, outputs) with
//! the items of each list partitioned over the worker pool.

use crate::accumulator::ModeAccumulator;
use crate::command::Command;
use crate::geometry::{Orientation, Position};
use crate::laplace::MAX_MODE;
use crate::mode::ModePair;
use crate::output::{transpose, FftStage, Matrix};
use crate::parameter_map::ParameterMap;
use crate::processor::{default_threads, WorkerPool};
use crate::queue::{command_ring, CommandReceiver, CommandSender, DEFAULT_CAPACITY};
use crate::rtlist::{RtList, RtListHandle};
use crate::scene::{SourceRecord, Transport};
use crate::source::{RenderState, SourceNode, SourceSnapshot};
use crate::SetupError;
use realfft::RealFftPlanner;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Loudspeaker kind in a reproduction setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoudspeakerModel {
    #[default]
    Normal,
    Subwoofer,
}

/// One loudspeaker of the reproduction setup.
#[derive(Clone, Copy, Debug, Default)]
pub struct Loudspeaker {
    pub position: Position,
    pub orientation: Orientation,
    pub model: LoudspeakerModel,
}

/// The loudspeaker arrangement, fixed after loading.
///
/// The DCA renderer expects a roughly circular, counterclockwise
/// arrangement around the origin; the mean distance from the origin
/// defines the array radius.
#[derive(Clone, Debug, Default)]
pub struct ReproductionSetup {
    pub loudspeakers: Vec<Loudspeaker>,
}

impl ReproductionSetup {
    pub fn new(loudspeakers: Vec<Loudspeaker>) -> Self {
        Self { loudspeakers }
    }

    /// A regular counterclockwise circle of `count` loudspeakers at
    /// `radius` meters, each facing the origin.
    pub fn circular(count: usize, radius: f32) -> Self {
        let loudspeakers = (0..count)
            .map(|i| {
                let azimuth = 360.0 * i as f32 / count as f32;
                let rad = azimuth.to_radians();
                Loudspeaker {
                    position: Position::new(radius * rad.cos(), radius * rad.sin()),
                    orientation: Orientation::new(azimuth + 180.0),
                    model: LoudspeakerModel::Normal,
                }
            })
            .collect();
        Self { loudspeakers }
    }
}

/// Read side of the master level meter.
#[derive(Clone, Debug, Default)]
pub struct LevelMeter {
    bits: Arc<AtomicU32>,
}

impl LevelMeter {
    /// Peak magnitude of the last processed block, linear.
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineState {
    Constructed,
    Loaded,
    Active,
    Deactivated,
}

/// Everything needed to build a [`SourceNode`] off the audio thread.
#[derive(Clone, Copy, Debug)]
struct SourceBlueprint {
    block_size: usize,
    sample_rate: u32,
    order: usize,
    array_radius: f32,
}

/// Control-plane handle of a renderer: queues commands and structural
/// changes, builds source nodes, reclaims removed ones.
pub struct RendererControls {
    commands: CommandSender<Command>,
    sources: RtListHandle<SourceNode>,
    blueprint: SourceBlueprint,
    level: LevelMeter,
}

impl RendererControls {
    /// Queue a scene command; it takes effect at the next block boundary.
    pub fn send(&self, command: Command) -> bool {
        self.commands.push(command)
    }

    /// Build a source for the scene record and queue its insertion.
    pub fn add_source(
        &self,
        record: &SourceRecord,
        input_channel: usize,
    ) -> Result<bool, SetupError> {
        let mut node = SourceNode::new(
            record.id,
            input_channel,
            self.blueprint.block_size,
            self.blueprint.order,
            self.blueprint.sample_rate,
            self.blueprint.array_radius,
        )?;
        node.position = record.position;
        node.rotation = record.orientation;
        node.model = record.model;
        node.gain = record.gain;
        node.mute = record.mute;
        Ok(self.sources.add(Box::new(node)))
    }

    /// Queue the removal of a source's node.
    pub fn remove_source(&self, id: u32) -> bool {
        self.sources.remove(id)
    }

    /// Queue the removal of every source node.
    pub fn remove_all_sources(&self) -> bool {
        self.sources.clear()
    }

    /// Drop nodes the audio thread has relinquished.
    pub fn reclaim(&self) -> usize {
        self.sources.reclaim()
    }

    /// Read side of the master level meter.
    pub fn level_meter(&self) -> LevelMeter {
        self.level.clone()
    }
}

/// One pair's work for the mode stage, assembled fresh each block.
#[derive(Clone, Copy)]
struct PairJob {
    pair: *mut ModePair,
    buffer: *const f32,
    buffer_len: usize,
    snapshot: SourceSnapshot,
}

// Jobs reference nodes owned by the renderer for the duration of one
// dispatch; every `pair` pointer in the table is unique.
unsafe impl Send for PairJob {}
unsafe impl Sync for PairJob {}

/// Shared raw base pointer for partitioned item access. Workers receive
/// disjoint indices, so no element is referenced twice concurrently.
struct ItemsPtr<T>(*mut T);

impl<T> Clone for ItemsPtr<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<T> Copy for ItemsPtr<T> {}

unsafe impl<T: Send> Send for ItemsPtr<T> {}
unsafe impl<T: Send> Sync for ItemsPtr<T> {}

impl<T> ItemsPtr<T> {
    /// # Safety
    /// `index` must be in bounds and handed to at most one worker.
    unsafe fn item_mut(&self, index: usize) -> &mut T {
        unsafe { &mut *self.0.add(index) }
    }
}

/// The renderer.
pub struct DcaRenderer {
    block_size: usize,
    sample_rate: u32,
    threads: usize,
    state: EngineState,
    /// Ambisonics order, `loudspeakers / 2` rounded down.
    order: usize,
    array_radius: f32,
    loudspeakers: Vec<Loudspeaker>,
    /// Global scale applied to every source contribution. A single
    /// tunable, 0.1 by default.
    pub volume_correction: f32,
    render_state: RenderState,
    transport: Transport,
    sources: RtList<SourceNode>,
    controls: Option<RendererControls>,
    commands: CommandReceiver<Command>,
    accumulators: Vec<ModeAccumulator>,
    fft_stages: Vec<FftStage>,
    mode_matrix: Matrix,
    fft_matrix: Matrix,
    pair_jobs: Vec<PairJob>,
    pool: Option<WorkerPool>,
    level_bits: Arc<AtomicU32>,
}

impl DcaRenderer {
    /// Create a renderer from the configuration map. Recognized keys:
    /// `sample_rate`, `block_size`, `threads`.
    pub fn new(params: &ParameterMap) -> Result<Self, SetupError> {
        let block_size = params.get_or("block_size", 512usize);
        let sample_rate = params.get_or("sample_rate", crate::DEFAULT_SAMPLE_RATE);
        let threads = params.get_or("threads", default_threads());
        if block_size == 0 {
            return Err(SetupError::InvalidBlockSize);
        }

        let (sources, source_handle) = RtList::with_capacity(64);
        let (command_tx, command_rx) = command_ring(DEFAULT_CAPACITY);
        let level_bits = Arc::new(AtomicU32::new(0));

        let mut renderer = Self {
            block_size,
            sample_rate,
            threads,
            state: EngineState::Constructed,
            order: 0,
            array_radius: 0.0,
            loudspeakers: Vec::new(),
            volume_correction: 0.1,
            render_state: RenderState::default(),
            transport: Transport::default(),
            sources,
            controls: None,
            commands: command_rx,
            accumulators: Vec::new(),
            fft_stages: Vec::new(),
            mode_matrix: Matrix::default(),
            fft_matrix: Matrix::default(),
            pair_jobs: Vec::new(),
            pool: None,
            level_bits: level_bits.clone(),
        };
        renderer.controls = Some(RendererControls {
            commands: command_tx,
            sources: source_handle,
            blueprint: SourceBlueprint {
                block_size,
                sample_rate,
                order: 0,
                array_radius: 0.0,
            },
            level: LevelMeter { bits: level_bits },
        });
        Ok(renderer)
    }

    /// Load the loudspeaker arrangement. Must be called exactly once,
    /// before activation.
    pub fn load_reproduction_setup(&mut self, setup: &ReproductionSetup) -> Result<(), SetupError> {
        if self.state != EngineState::Constructed {
            return Err(SetupError::InvalidState {
                expected: "constructed",
                action: "load a reproduction setup",
            });
        }
        if setup.loudspeakers.is_empty() {
            return Err(SetupError::EmptySetup);
        }
        if setup
            .loudspeakers
            .iter()
            .any(|ls| ls.model == LoudspeakerModel::Subwoofer)
        {
            return Err(SetupError::SubwooferPresent);
        }

        let count = setup.loudspeakers.len();
        let total: f32 = setup
            .loudspeakers
            .iter()
            .map(|ls| ls.position.length())
            .sum();
        self.array_radius = total / count as f32;
        self.order = count / 2;
        if self.order > MAX_MODE {
            return Err(SetupError::UnsupportedOrder(self.order));
        }

        log::info!(
            "loading {count} loudspeakers with a mean distance of {} m, \
             assuming a circular counterclockwise setup",
            self.array_radius
        );

        self.loudspeakers = setup.loudspeakers.clone();
        self.mode_matrix = Matrix::new(count, self.block_size);
        self.fft_matrix = Matrix::new(self.block_size, count);

        // One accumulator per mode number. Mode 0 has no negative row;
        // with an even loudspeaker count neither has the highest mode.
        self.accumulators = (0..=self.order)
            .map(|k| {
                let negative = if k == 0 || (k == self.order && count % 2 == 0) {
                    None
                } else {
                    Some(count - k)
                };
                ModeAccumulator::new(k, k, negative)
            })
            .collect();

        // One inverse transform per time sample, all sharing one plan.
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_inverse(count);
        self.fft_stages = (0..self.block_size)
            .map(|_| FftStage::new(plan.clone()))
            .collect();

        if let Some(controls) = self.controls.as_mut() {
            controls.blueprint.order = self.order;
            controls.blueprint.array_radius = self.array_radius;
        }

        self.state = EngineState::Loaded;
        Ok(())
    }

    /// Take the control-plane handle. Available once, and only after the
    /// reproduction setup is loaded (source blueprints depend on it).
    pub fn take_controls(&mut self) -> Option<RendererControls> {
        if self.state == EngineState::Constructed {
            return None;
        }
        self.controls.take()
    }

    /// Start the worker pool and begin accepting audio callbacks.
    /// All node states are cleared, so a fresh activation of the same
    /// graph reproduces the same output.
    pub fn activate(&mut self) -> Result<(), SetupError> {
        match self.state {
            EngineState::Loaded | EngineState::Deactivated => {
                for node in self.sources.items_mut() {
                    node.reset();
                }
                self.pool = Some(WorkerPool::new(self.threads));
                self.state = EngineState::Active;
                Ok(())
            }
            _ => Err(SetupError::InvalidState {
                expected: "loaded or deactivated",
                action: "activate",
            }),
        }
    }

    /// Stop the worker pool. Idempotent; a renderer that was never
    /// activated is left alone.
    pub fn deactivate(&mut self) {
        if self.state == EngineState::Active {
            self.pool = None; // joins the workers
            self.state = EngineState::Deactivated;
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of output channels, one per loudspeaker.
    pub fn output_channels(&self) -> usize {
        self.loudspeakers.len()
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn array_radius(&self) -> f32 {
        self.array_radius
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// The host audio callback. `frames` must equal the block size;
    /// `input` holds one non-interleaved buffer per host channel and
    /// `output` one buffer per loudspeaker.
    pub fn audio_callback(&mut self, frames: usize, input: &[&[f32]], output: &mut [&mut [f32]]) {
        if self.state != EngineState::Active || frames != self.block_size {
            for channel in output.iter_mut() {
                channel.fill(0.0);
            }
            return;
        }

        // Structural changes first so commands can address new nodes.
        self.sources.apply_changes();
        while let Some(command) = self.commands.try_pop() {
            self.apply_command(command);
        }
        if self.transport.playing {
            self.transport.frame += frames as u64;
        }

        self.process_block(input, output);

        let mut peak: f32 = 0.0;
        for channel in output.iter() {
            for &sample in channel.iter() {
                peak = peak.max(sample.abs());
            }
        }
        self.level_bits.store(peak.to_bits(), Ordering::Relaxed);
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Nothing => {}
            Command::SetSourcePosition { id, position } => {
                if let Some(node) = self.sources.get_mut(id) {
                    node.position = position;
                }
            }
            Command::SetSourceOrientation { id, orientation } => {
                if let Some(node) = self.sources.get_mut(id) {
                    node.rotation = orientation;
                }
            }
            Command::SetSourceGain { id, gain } => {
                if let Some(node) = self.sources.get_mut(id) {
                    node.gain = gain;
                }
            }
            Command::SetSourceMute { id, mute } => {
                if let Some(node) = self.sources.get_mut(id) {
                    node.mute = mute;
                }
            }
            Command::SetSourceModel { id, model } => {
                if let Some(node) = self.sources.get_mut(id) {
                    node.model = model;
                }
            }
            Command::SetReferencePosition(position) => {
                self.render_state.reference_position = position;
            }
            Command::SetReferenceOrientation(orientation) => {
                self.render_state.reference_orientation = orientation;
            }
            Command::SetReferenceOffsetPosition(position) => {
                self.render_state.reference_offset_position = position;
            }
            Command::SetReferenceOffsetOrientation(orientation) => {
                self.render_state.reference_offset_orientation = orientation;
            }
            Command::SetMasterVolume(volume) => {
                self.render_state.master_volume = volume;
            }
            Command::SetMasterMute(mute) => {
                self.render_state.master_mute = mute;
            }
            Command::SetAmplitudeReferenceDistance(distance) => {
                self.render_state.amplitude_reference_distance = distance;
            }
            Command::SetDecayExponent(exponent) => {
                self.render_state.decay_exponent = exponent;
            }
            Command::SetTransportPlaying(playing) => {
                self.transport.playing = playing;
            }
            Command::SetProcessing(processing) => {
                self.render_state.processing = processing;
            }
        }
    }

    fn process_block(&mut self, input: &[&[f32]], output: &mut [&mut [f32]]) {
        let pool = match self.pool.as_ref() {
            Some(pool) => pool,
            None => return,
        };
        let block_size = self.block_size;
        let array_radius = self.array_radius;
        let volume_correction = self.volume_correction;
        let render_state = self.render_state;
        let loudspeaker_count = self.loudspeakers.len();

        // Source stage: geometry, weighting factors, input copies.
        let source_count = self.sources.len();
        {
            let items = ItemsPtr(self.sources.items_mut().as_mut_ptr());
            pool.dispatch(source_count, &|i| {
                // Each index belongs to exactly one worker.
                let node = unsafe { items.item_mut(i) };
                let channel = input
                    .get(node.input_channel)
                    .copied()
                    .unwrap_or(&[]);
                node.process(channel, &render_state);
            });
        }

        // Mode stage: assemble the flat pair-job table, then filter.
        // Splitting a source into per-pair jobs keeps the worker load
        // even; the pairs themselves are sized for that.
        self.pair_jobs.clear();
        self.pair_jobs
            .reserve(source_count * (self.order / 2 + 1));
        for node in self.sources.items_mut() {
            let (buffer, snapshot, pairs) = node.mode_stage_parts();
            let buffer_ptr = buffer.as_ptr();
            let buffer_len = buffer.len();
            for pair in pairs {
                self.pair_jobs.push(PairJob {
                    pair: pair as *mut ModePair,
                    buffer: buffer_ptr,
                    buffer_len,
                    snapshot,
                });
            }
        }
        {
            let jobs = &self.pair_jobs;
            pool.dispatch(jobs.len(), &|i| {
                let job = jobs[i];
                // The job table holds one unique pointer per pair and the
                // source buffers are read-only during this stage.
                let pair = unsafe { &mut *job.pair };
                let buffer = unsafe { std::slice::from_raw_parts(job.buffer, job.buffer_len) };
                pair.process(buffer, &job.snapshot, array_radius);
            });
        }

        // Accumulator stage: one worker item per mode number, writing
        // that mode's rows of the mode matrix.
        {
            let sources = self.sources.items();
            let accumulators = &self.accumulators;
            let rows = self.mode_matrix.rows_ptr();
            pool.dispatch(accumulators.len(), &|k| {
                let accumulator = &accumulators[k];
                // Row indices are unique across accumulators.
                let positive = unsafe { rows.row_mut(accumulator.positive_row()) };
                let negative = accumulator
                    .negative_row()
                    .map(|row| unsafe { rows.row_mut(row) });
                let modes = sources
                    .iter()
                    .map(|s| (s.mode(accumulator.mode_number()), s.weighting_factor));
                accumulator.process(modes, volume_correction, positive, negative);
            });
        }

        // Transpose into time-major order for the inverse transform.
        transpose(&self.mode_matrix, &mut self.fft_matrix);

        // Inverse transform, one item per time sample.
        {
            let stages = ItemsPtr(self.fft_stages.as_mut_ptr());
            let rows = self.fft_matrix.rows_ptr();
            pool.dispatch(block_size, &|t| {
                let stage = unsafe { stages.item_mut(t) };
                let row = unsafe { rows.row_mut(t) };
                stage.process(row);
            });
        }

        // Output stage: copy each loudspeaker's column into its host
        // buffer.
        {
            let fft_matrix = &self.fft_matrix;
            let count = loudspeaker_count.min(output.len());
            let channels = ItemsPtr(output.as_mut_ptr());
            pool.dispatch(count, &|ls| {
                let channel = unsafe { channels.item_mut(ls) };
                for (t, sample) in channel.iter_mut().enumerate() {
                    *sample = fft_matrix.row(t)[ls];
                }
            });
        }
    }
}

impl Drop for DcaRenderer {
    fn drop(&mut self) {
        self.deactivate();
    }
}
