//! Real-time spatial audio reproduction.
//!
//! This crate renders a time-varying scene of virtual sound sources
//! (point sources and plane waves) to a circular loudspeaker array using
//! Distance-Coded Ambisonics (also known as Near-Field-Compensated
//! Higher-Order Ambisonics). The hot path is a multichannel block
//! processor scheduled over a pool of worker threads and driven by a host
//! audio callback; the control plane feeds scene changes in through
//! lock-free command queues and fans updates out to subscribers,
//! including TCP clients speaking a line-based XML protocol.

pub mod accumulator;
pub mod biquad;
pub mod block_parameter;
pub mod coefficients;
pub mod command;
pub mod denormal;
pub mod geometry;
pub mod laplace;
pub mod math;
pub mod mode;
pub mod network;
pub mod output;
pub mod parameter_map;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod renderer;
pub mod rtlist;
pub mod scene;
pub mod source;
pub mod strings;

pub use biquad::{bilinear, BiQuad, Cascade, LaplaceCoefficients, SosCoefficients};
pub use block_parameter::BlockParameter;
pub use command::Command;
pub use geometry::{Orientation, Position};
pub use parameter_map::ParameterMap;
pub use renderer::{DcaRenderer, Loudspeaker, LoudspeakerModel, ReproductionSetup};
pub use scene::{Scene, SourceModel};

/// Speed of sound in air in meters per second.
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Default sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Errors reported while loading a reproduction setup or activating the engine.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("reproduction setup contains no loudspeakers")]
    EmptySetup,
    #[error("subwoofers are not supported by the DCA renderer")]
    SubwooferPresent,
    #[error("Ambisonics order {0} is not supported by the prototype table")]
    UnsupportedOrder(usize),
    #[error("block size must be nonzero")]
    InvalidBlockSize,
    #[error("engine is not in state {expected}, cannot {action}")]
    InvalidState {
        expected: &'static str,
        action: &'static str,
    },
}

/// Errors reported back to the submitter of a scene command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown source id {0}")]
    UnknownSource(u32),
    #[error("source {0} is fixed and cannot be moved")]
    SourceFixed(u32),
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("malformed request: {0}")]
    Malformed(String),
}
