//! Control-plane model of the sound scene.
//!
//! The scene is the authoritative copy of everything the control plane
//! knows: sources with their static properties, the reference point, the
//! master section and the transport. The real-time renderer never reads
//! it directly; changes are forwarded as [`crate::command::Command`]s
//! and applied at block boundaries.

use crate::geometry::{Orientation, Position};
use crate::CommandError;
use std::collections::BTreeMap;

/// Wavefront model of a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceModel {
    #[default]
    Point,
    Plane,
    Unknown,
}

impl SourceModel {
    /// Parse the protocol spelling. Anything unrecognized is `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "point" => SourceModel::Point,
            "plane" => SourceModel::Plane,
            _ => SourceModel::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceModel::Point => "point",
            SourceModel::Plane => "plane",
            SourceModel::Unknown => "unknown",
        }
    }
}

/// Static and mutable properties of one source.
#[derive(Clone, Debug, Default)]
pub struct SourceRecord {
    pub id: u32,
    pub name: String,
    pub model: SourceModel,
    pub position: Position,
    pub orientation: Orientation,
    /// Linear gain.
    pub gain: f32,
    pub mute: bool,
    /// A fixed source rejects position changes.
    pub fixed: bool,
    pub port_name: Option<String>,
    pub properties_file: Option<String>,
    pub file_name: Option<String>,
    pub file_channel: u32,
    pub file_length: u64,
}

/// Transport state: whether the scene is playing and the running frame
/// counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transport {
    pub playing: bool,
    pub frame: u64,
}

/// The whole scene.
#[derive(Clone, Debug)]
pub struct Scene {
    sources: BTreeMap<u32, SourceRecord>,
    next_id: u32,
    pub reference_position: Position,
    pub reference_orientation: Orientation,
    pub reference_offset_position: Position,
    pub reference_offset_orientation: Orientation,
    /// Linear master gain.
    pub master_volume: f32,
    pub master_mute: bool,
    pub amplitude_reference_distance: f32,
    pub decay_exponent: f32,
    pub transport: Transport,
    pub processing: bool,
    /// Latest master output level, linear.
    pub master_level: f32,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            next_id: 1,
            reference_position: Position::default(),
            reference_orientation: Orientation::new(90.0),
            reference_offset_position: Position::default(),
            reference_offset_orientation: Orientation::default(),
            master_volume: 1.0,
            master_mute: false,
            amplitude_reference_distance: 3.0,
            decay_exponent: 1.0,
            transport: Transport::default(),
            processing: true,
            master_level: 0.0,
        }
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new source and return its id. Ids are dense, 1-based and
    /// never reused within one scene.
    pub fn new_source(&mut self, name: &str) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.sources.insert(
            id,
            SourceRecord {
                id,
                name: name.to_string(),
                gain: 1.0,
                ..SourceRecord::default()
            },
        );
        id
    }

    pub fn delete_source(&mut self, id: u32) -> Result<SourceRecord, CommandError> {
        self.sources
            .remove(&id)
            .ok_or(CommandError::UnknownSource(id))
    }

    /// Remove every source, returning their ids.
    pub fn delete_all_sources(&mut self) -> Vec<u32> {
        let ids = self.sources.keys().copied().collect();
        self.sources.clear();
        ids
    }

    pub fn source(&self, id: u32) -> Result<&SourceRecord, CommandError> {
        self.sources.get(&id).ok_or(CommandError::UnknownSource(id))
    }

    pub fn source_mut(&mut self, id: u32) -> Result<&mut SourceRecord, CommandError> {
        self.sources
            .get_mut(&id)
            .ok_or(CommandError::UnknownSource(id))
    }

    /// Sources in id order.
    pub fn sources(&self) -> impl Iterator<Item = &SourceRecord> {
        self.sources.values()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Move a source, honoring its `fixed` flag.
    pub fn set_source_position(&mut self, id: u32, position: Position) -> Result<(), CommandError> {
        let source = self.source_mut(id)?;
        if source.fixed {
            return Err(CommandError::SourceFixed(id));
        }
        source.position = position;
        Ok(())
    }

    /// Set the transport state. Returns whether the state changed, which
    /// gates the outbound update.
    pub fn set_transport_playing(&mut self, playing: bool) -> bool {
        if self.transport.playing == playing {
            return false;
        }
        self.transport.playing = playing;
        true
    }
}
