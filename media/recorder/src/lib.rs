//! # Recorder endpoint
//!
//! [`Recorder`] drives a muxing pipeline through the STOP, START and PAUSE states. State changes
//! requested from different threads are serialized by a [`StateController`]: a request made while
//! another change is in flight blocks until that change completes (or the bounded wait expires).
//! Stopping a recorder whose muxer still has sources is deferred until the muxer reports the
//! end of stream.

mod profile;
mod recorder;
mod state_controller;

pub use profile::{MediaKind, RecordingProfile};
pub use recorder::{
    Muxer, MuxerState, Recorder, RecorderConfig, RecorderError, RecorderEvent, RecorderState,
};
pub use state_controller::{StateChange, StateController, StateControllerError};
