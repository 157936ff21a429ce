//! Commands carried from the control plane to the real-time renderer.
//!
//! Every scene change that affects audio is encoded as one of these and
//! pushed onto the renderer's command ring; the renderer drains the ring
//! once per block, before any processing, so a command takes effect at
//! the first block whose processing starts after it was queued.

use crate::geometry::{Orientation, Position};
use crate::scene::SourceModel;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Command {
    /// Ring filler, never acted upon.
    #[default]
    Nothing,
    SetSourcePosition {
        id: u32,
        position: Position,
    },
    SetSourceOrientation {
        id: u32,
        orientation: Orientation,
    },
    SetSourceGain {
        id: u32,
        gain: f32,
    },
    SetSourceMute {
        id: u32,
        mute: bool,
    },
    SetSourceModel {
        id: u32,
        model: SourceModel,
    },
    SetReferencePosition(Position),
    SetReferenceOrientation(Orientation),
    SetReferenceOffsetPosition(Position),
    SetReferenceOffsetOrientation(Orientation),
    SetMasterVolume(f32),
    SetMasterMute(bool),
    SetAmplitudeReferenceDistance(f32),
    SetDecayExponent(f32),
    SetTransportPlaying(bool),
    SetProcessing(bool),
}
