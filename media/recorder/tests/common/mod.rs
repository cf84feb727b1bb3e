#![allow(dead_code, unreachable_pub)]

use ezk_recorder::{MediaKind, Muxer, MuxerState};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

#[derive(Debug, Default)]
pub struct MuxerLog {
    pub state: Option<MuxerState>,
    pub states: Vec<MuxerState>,
    pub clock: Duration,
    pub inputs: Vec<MediaKind>,
    pub has_sources: bool,
    pub eos_sent: usize,
}

impl MuxerLog {
    pub fn state(&self) -> MuxerState {
        self.state.unwrap_or(MuxerState::Null)
    }
}

/// Muxer recording every call, shared with the test through the inner log
#[derive(Clone, Default)]
pub struct FakeMuxer(pub Arc<Mutex<MuxerLog>>);

impl FakeMuxer {
    pub fn with_sources() -> Self {
        let muxer = Self::default();
        muxer.0.lock().has_sources = true;
        muxer
    }

    pub fn advance(&self, by: Duration) {
        self.0.lock().clock += by;
    }
}

impl Muxer for FakeMuxer {
    fn state(&self) -> MuxerState {
        self.0.lock().state()
    }

    fn set_state(&mut self, state: MuxerState) {
        let mut log = self.0.lock();
        log.state = Some(state);
        log.states.push(state);
    }

    fn clock_time(&self) -> Duration {
        self.0.lock().clock
    }

    fn connect_input(&mut self, kind: MediaKind) {
        self.0.lock().inputs.push(kind);
    }

    fn disconnect_input(&mut self, kind: MediaKind) {
        self.0.lock().inputs.retain(|k| *k != kind);
    }

    fn send_eos(&mut self) -> bool {
        let mut log = self.0.lock();
        log.eos_sent += 1;
        log.has_sources
    }
}
