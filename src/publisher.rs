//! The control-plane hub: applies scene changes, forwards them to the
//! renderer and fans updates out to subscribers.
//!
//! Every mutation goes through the [`Controller`]: it validates against
//! the scene, queues the matching [`Command`] for the renderer and then
//! notifies every registered [`Subscriber`]. Errors are returned to the
//! caller (and, for network clients, serialized back over the wire)
//! without touching any state.

use crate::command::Command;
use crate::geometry::{Orientation, Position};
use crate::renderer::RendererControls;
use crate::scene::{Scene, SourceModel, SourceRecord};
use crate::CommandError;
use parking_lot::Mutex;

/// Receives scene updates. All methods default to no-ops so subscribers
/// implement only what they forward.
#[allow(unused_variables)]
pub trait Subscriber: Send {
    fn new_source(&mut self, id: u32) {}
    fn delete_source(&mut self, id: u32) {}
    fn delete_all_sources(&mut self) {}
    fn set_source_position(&mut self, id: u32, position: Position) {}
    fn set_source_position_fixed(&mut self, id: u32, fixed: bool) {}
    fn set_source_orientation(&mut self, id: u32, orientation: Orientation) {}
    fn set_source_gain(&mut self, id: u32, gain: f32) {}
    fn set_source_mute(&mut self, id: u32, mute: bool) {}
    fn set_source_model(&mut self, id: u32, model: SourceModel) {}
    fn set_reference_position(&mut self, position: Position) {}
    fn set_reference_orientation(&mut self, orientation: Orientation) {}
    fn set_reference_offset_position(&mut self, position: Position) {}
    fn set_reference_offset_orientation(&mut self, orientation: Orientation) {}
    fn set_master_volume(&mut self, volume: f32) {}
    fn set_amplitude_reference_distance(&mut self, distance: f32) {}
    fn set_decay_exponent(&mut self, exponent: f32) {}
    fn set_transport_state(&mut self, playing: bool) {}
    fn set_processing_state(&mut self, processing: bool) {}
}

struct Inner {
    scene: Scene,
    controls: RendererControls,
    subscribers: Vec<(u64, Box<dyn Subscriber>)>,
    next_token: u64,
}

/// Handle returned by [`Controller::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriberToken(u64);

/// The publisher: owns the scene and the renderer's control handle.
pub struct Controller {
    inner: Mutex<Inner>,
}

macro_rules! notify {
    ($inner:expr, $method:ident ( $($arg:expr),* )) => {
        for (_, subscriber) in $inner.subscribers.iter_mut() {
            subscriber.$method($($arg),*);
        }
    };
}

impl Controller {
    pub fn new(controls: RendererControls) -> Self {
        Self {
            inner: Mutex::new(Inner {
                scene: Scene::new(),
                controls,
                subscribers: Vec::new(),
                next_token: 1,
            }),
        }
    }

    /// Register a subscriber and bring it up to date with the current
    /// scene.
    pub fn subscribe(&self, mut subscriber: Box<dyn Subscriber>) -> SubscriberToken {
        let mut inner = self.inner.lock();
        let scene = &inner.scene;

        // Replay the current state so late joiners see the whole scene.
        for source in scene.sources() {
            subscriber.new_source(source.id);
            subscriber.set_source_position(source.id, source.position);
            subscriber.set_source_orientation(source.id, source.orientation);
            subscriber.set_source_gain(source.id, source.gain);
            subscriber.set_source_mute(source.id, source.mute);
            subscriber.set_source_model(source.id, source.model);
        }
        subscriber.set_reference_position(scene.reference_position);
        subscriber.set_reference_orientation(scene.reference_orientation);
        subscriber.set_master_volume(scene.master_volume);
        subscriber.set_transport_state(scene.transport.playing);

        let token = SubscriberToken(inner.next_token);
        inner.next_token += 1;
        inner.subscribers.push((token.0, subscriber));
        token
    }

    pub fn unsubscribe(&self, token: SubscriberToken) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|(t, _)| *t != token.0);
    }

    /// Create a source. The input channel defaults to `id - 1`.
    pub fn new_source(
        &self,
        name: &str,
        input_channel: Option<usize>,
    ) -> Result<u32, CommandError> {
        let mut inner = self.inner.lock();
        inner.controls.reclaim();
        let id = inner.scene.new_source(name);
        let channel = input_channel.unwrap_or((id - 1) as usize);
        let record = inner.scene.source(id)?.clone();
        inner
            .controls
            .add_source(&record, channel)
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        notify!(inner, new_source(id));
        Ok(id)
    }

    pub fn delete_source(&self, id: u32) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.delete_source(id)?;
        inner.controls.remove_source(id);
        notify!(inner, delete_source(id));
        Ok(())
    }

    pub fn delete_all_sources(&self) {
        let mut inner = self.inner.lock();
        inner.scene.delete_all_sources();
        inner.controls.remove_all_sources();
        notify!(inner, delete_all_sources());
    }

    pub fn set_source_position(&self, id: u32, position: Position) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.set_source_position(id, position)?;
        inner
            .controls
            .send(Command::SetSourcePosition { id, position });
        notify!(inner, set_source_position(id, position));
        Ok(())
    }

    pub fn set_source_position_fixed(&self, id: u32, fixed: bool) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.fixed = fixed;
        notify!(inner, set_source_position_fixed(id, fixed));
        Ok(())
    }

    pub fn set_source_orientation(
        &self,
        id: u32,
        orientation: Orientation,
    ) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.orientation = orientation;
        inner
            .controls
            .send(Command::SetSourceOrientation { id, orientation });
        notify!(inner, set_source_orientation(id, orientation));
        Ok(())
    }

    pub fn set_source_gain(&self, id: u32, gain: f32) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.gain = gain;
        inner.controls.send(Command::SetSourceGain { id, gain });
        notify!(inner, set_source_gain(id, gain));
        Ok(())
    }

    pub fn set_source_mute(&self, id: u32, mute: bool) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.mute = mute;
        inner.controls.send(Command::SetSourceMute { id, mute });
        notify!(inner, set_source_mute(id, mute));
        Ok(())
    }

    pub fn set_source_model(&self, id: u32, model: SourceModel) -> Result<(), CommandError> {
        if model == SourceModel::Unknown {
            log::warn!("unknown source model requested for source {id}, keeping previous");
            return Err(CommandError::InvalidValue {
                field: "model",
                value: "unknown".into(),
            });
        }
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.model = model;
        inner.controls.send(Command::SetSourceModel { id, model });
        notify!(inner, set_source_model(id, model));
        Ok(())
    }

    pub fn set_source_port_name(&self, id: u32, port_name: &str) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.port_name = Some(port_name.to_string());
        Ok(())
    }

    pub fn set_source_properties_file(&self, id: u32, path: &str) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        inner.scene.source_mut(id)?.properties_file = Some(path.to_string());
        Ok(())
    }

    pub fn set_source_file(
        &self,
        id: u32,
        file_name: &str,
        file_channel: u32,
        file_length: u64,
    ) -> Result<(), CommandError> {
        let mut inner = self.inner.lock();
        let source = inner.scene.source_mut(id)?;
        source.file_name = Some(file_name.to_string());
        source.file_channel = file_channel;
        source.file_length = file_length;
        Ok(())
    }

    pub fn set_reference_position(&self, position: Position) {
        let mut inner = self.inner.lock();
        inner.scene.reference_position = position;
        inner.controls.send(Command::SetReferencePosition(position));
        notify!(inner, set_reference_position(position));
    }

    pub fn set_reference_orientation(&self, orientation: Orientation) {
        let mut inner = self.inner.lock();
        inner.scene.reference_orientation = orientation;
        inner
            .controls
            .send(Command::SetReferenceOrientation(orientation));
        notify!(inner, set_reference_orientation(orientation));
    }

    pub fn set_reference_offset_position(&self, position: Position) {
        let mut inner = self.inner.lock();
        inner.scene.reference_offset_position = position;
        inner
            .controls
            .send(Command::SetReferenceOffsetPosition(position));
        notify!(inner, set_reference_offset_position(position));
    }

    pub fn set_reference_offset_orientation(&self, orientation: Orientation) {
        let mut inner = self.inner.lock();
        inner.scene.reference_offset_orientation = orientation;
        inner
            .controls
            .send(Command::SetReferenceOffsetOrientation(orientation));
        notify!(inner, set_reference_offset_orientation(orientation));
    }

    /// Master volume as a linear factor.
    pub fn set_master_volume(&self, volume: f32) {
        let mut inner = self.inner.lock();
        inner.scene.master_volume = volume;
        inner.controls.send(Command::SetMasterVolume(volume));
        notify!(inner, set_master_volume(volume));
    }

    pub fn set_master_mute(&self, mute: bool) {
        let mut inner = self.inner.lock();
        inner.scene.master_mute = mute;
        inner.controls.send(Command::SetMasterMute(mute));
    }

    pub fn set_amplitude_reference_distance(&self, distance: f32) {
        let mut inner = self.inner.lock();
        inner.scene.amplitude_reference_distance = distance;
        inner
            .controls
            .send(Command::SetAmplitudeReferenceDistance(distance));
        notify!(inner, set_amplitude_reference_distance(distance));
    }

    pub fn set_decay_exponent(&self, exponent: f32) {
        let mut inner = self.inner.lock();
        inner.scene.decay_exponent = exponent;
        inner.controls.send(Command::SetDecayExponent(exponent));
        notify!(inner, set_decay_exponent(exponent));
    }

    /// Start or stop the transport. A repeated request is absorbed: the
    /// renderer is not re-signalled and subscribers see exactly one
    /// update per actual change.
    pub fn set_transport_playing(&self, playing: bool) {
        let mut inner = self.inner.lock();
        if !inner.scene.set_transport_playing(playing) {
            return;
        }
        inner.controls.send(Command::SetTransportPlaying(playing));
        notify!(inner, set_transport_state(playing));
    }

    pub fn set_processing_state(&self, processing: bool) {
        let mut inner = self.inner.lock();
        inner.scene.processing = processing;
        inner.controls.send(Command::SetProcessing(processing));
        notify!(inner, set_processing_state(processing));
    }

    /// Latest master output level from the renderer's meter.
    pub fn master_level(&self) -> f32 {
        let mut inner = self.inner.lock();
        let level = inner.controls.level_meter().get();
        inner.scene.master_level = level;
        level
    }

    /// A copy of the source record, for inspection.
    pub fn source(&self, id: u32) -> Result<SourceRecord, CommandError> {
        Ok(self.inner.lock().scene.source(id)?.clone())
    }

    /// A snapshot of the whole scene.
    pub fn scene(&self) -> Scene {
        self.inner.lock().scene.clone()
    }
}
