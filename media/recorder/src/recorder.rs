use crate::{
    profile::{MediaKind, RecordingProfile},
    state_controller::{StateChange, StateController, StateControllerError},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

/// State of the muxing pipeline a recorder writes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MuxerState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Muxing pipeline a [`Recorder`] writes into
pub trait Muxer: Send {
    fn state(&self) -> MuxerState;

    fn set_state(&mut self, state: MuxerState);

    /// Current time of the pipeline clock
    fn clock_time(&self) -> Duration;

    /// Connect the recorder's input of the given kind to the muxer
    fn connect_input(&mut self, kind: MediaKind);

    fn disconnect_input(&mut self, kind: MediaKind);

    /// Send end of stream into every source of the muxer
    ///
    /// Returns false if the muxer has no sources. Otherwise the muxer must call
    /// [`Recorder::on_muxer_eos`] once the end of stream reached its sink.
    fn send_eos(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Stop,
    Start,
    Pause,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecorderState::Stop => "STOP",
            RecorderState::Start => "START",
            RecorderState::Pause => "PAUSE",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    StateController(#[from] StateControllerError),
    #[error("cannot change from {from} to {to}")]
    InvalidTransition {
        from: RecorderState,
        to: RecorderState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    StateChanged(RecorderState),
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Stop recording once the inputs reach end of stream
    pub stop_on_end_of_stream: bool,
    /// Longest time a state change request waits for the one in progress
    pub state_change_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            stop_on_end_of_stream: false,
            state_change_timeout: StateController::DEFAULT_TIMEOUT,
        }
    }
}

/// Running time of the first buffer after starting
#[derive(Debug, Clone, Copy)]
struct BaseTime {
    pts: Option<Duration>,
}

struct Inner<M> {
    state: RecorderState,
    muxer: M,
    /// Total time spent paused since the recording started
    paused_time: Duration,
    /// Muxer clock time the current pause started at
    paused_start: Option<Duration>,
    base_time: Option<BaseTime>,
    /// Stop waiting for the muxer to drain, completed by `on_muxer_eos`
    pending_stop: Option<StateChange>,
    events: VecDeque<RecorderEvent>,
}

/// Recorder endpoint with STOP/START/PAUSE transitions
///
/// Transitions requested concurrently are serialized, a request blocks while another transition is
/// in progress. Stopping while the muxer has sources completes asynchronously, once the end of
/// stream drained the muxer.
pub struct Recorder<M: Muxer> {
    profile: RecordingProfile,
    config: RecorderConfig,
    controller: Arc<StateController>,
    inner: Mutex<Inner<M>>,
}

impl<M: Muxer> Recorder<M> {
    pub fn new(profile: RecordingProfile, muxer: M, config: RecorderConfig) -> Self {
        Self {
            profile,
            controller: StateController::new(config.state_change_timeout),
            config,
            inner: Mutex::new(Inner {
                state: RecorderState::Stop,
                muxer,
                paused_time: Duration::ZERO,
                paused_start: None,
                base_time: None,
                pending_stop: None,
                events: VecDeque::new(),
            }),
        }
    }

    pub fn profile(&self) -> RecordingProfile {
        self.profile
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.inner.lock().state
    }

    /// A stop is waiting for the muxer to drain
    pub fn is_stopping(&self) -> bool {
        self.inner.lock().pending_stop.is_some()
    }

    pub fn paused_time(&self) -> Duration {
        self.inner.lock().paused_time
    }

    pub fn pop_event(&self) -> Option<RecorderEvent> {
        self.inner.lock().events.pop_front()
    }

    pub fn with_muxer<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut self.inner.lock().muxer)
    }

    /// Start or resume recording
    pub fn record(&self) -> Result<(), RecorderError> {
        let change = self.controller.begin()?;
        let mut inner = self.inner.lock();

        if inner.state == RecorderState::Start {
            return Ok(());
        }

        inner.muxer.set_state(MuxerState::Playing);

        if let Some(paused_start) = inner.paused_start.take() {
            let paused = inner.muxer.clock_time().saturating_sub(paused_start);
            inner.paused_time += paused;

            log::debug!("Resuming recording after {paused:?}, paused {:?} in total", inner.paused_time);
        }

        for kind in self.profile.media_kinds() {
            inner.muxer.connect_input(kind);
        }

        inner.set_state(RecorderState::Start);
        drop(change);

        Ok(())
    }

    pub fn pause(&self) -> Result<(), RecorderError> {
        let change = self.controller.begin()?;
        let mut inner = self.inner.lock();

        match inner.state {
            RecorderState::Pause => return Ok(()),
            RecorderState::Stop => {
                return Err(RecorderError::InvalidTransition {
                    from: RecorderState::Stop,
                    to: RecorderState::Pause,
                });
            }
            RecorderState::Start => {}
        }

        inner.disconnect_inputs(self.profile);
        inner.muxer.set_state(MuxerState::Paused);
        inner.paused_start = Some(inner.muxer.clock_time());

        inner.set_state(RecorderState::Pause);
        drop(change);

        Ok(())
    }

    /// Stop recording
    ///
    /// If the muxer is running and has sources, the stop completes once they drained, until then
    /// every other transition blocks.
    pub fn stop(&self) -> Result<(), RecorderError> {
        let change = self.controller.begin()?;
        let mut inner = self.inner.lock();

        if inner.state == RecorderState::Stop {
            return Ok(());
        }

        inner.disconnect_inputs(self.profile);

        inner.base_time = None;
        inner.paused_time = Duration::ZERO;
        inner.paused_start = None;

        if inner.muxer.state() >= MuxerState::Paused {
            inner.muxer.set_state(MuxerState::Playing);

            if inner.muxer.send_eos() {
                log::debug!("Waiting for the muxer to drain before stopping");
                inner.pending_stop = Some(change);
                return Ok(());
            }
        }

        inner.muxer.set_state(MuxerState::Null);
        inner.set_state(RecorderState::Stop);
        drop(change);

        Ok(())
    }

    /// The end of stream sent by [`stop`](Self::stop) reached the muxer's sink
    pub fn on_muxer_eos(&self) {
        let mut inner = self.inner.lock();

        let Some(change) = inner.pending_stop.take() else {
            log::debug!("Ignoring end of stream, no stop in progress");
            return;
        };

        log::debug!("Received EOS in muxer, stopping");

        inner.muxer.set_state(MuxerState::Null);
        inner.set_state(RecorderState::Stop);

        drop(inner);
        drop(change);
    }

    /// The recorder's inputs reached end of stream
    pub fn on_input_eos(&self) -> Result<(), RecorderError> {
        if !self.config.stop_on_end_of_stream {
            log::debug!("Inputs reached end of stream, keep recording");
            return Ok(());
        }

        self.stop()
    }

    /// Timestamp of a buffer in the recording, `None` if it must be dropped
    ///
    /// `pts` is the buffer's running time. The first buffer after starting defines the start of the
    /// recording, time spent paused is removed.
    pub fn buffer_timestamp(&self, pts: Option<Duration>) -> Option<Duration> {
        let mut inner = self.inner.lock();

        if inner.state != RecorderState::Start {
            log::warn!("Dropping buffer received in state {}", inner.state);
            return None;
        }

        let base_time = inner.base_time.get_or_insert(BaseTime { pts });

        if base_time.pts.is_none() && pts.is_some() {
            log::debug!("Setting pts base time to {pts:?}");
            base_time.pts = pts;
        }

        let base = base_time.pts?;

        Some(pts?.saturating_sub(base + inner.paused_time))
    }
}

impl<M> Inner<M>
where
    M: Muxer,
{
    fn set_state(&mut self, state: RecorderState) {
        log::debug!("Recorder state {} -> {state}", self.state);

        self.state = state;
        self.events.push_back(RecorderEvent::StateChanged(state));
    }

    fn disconnect_inputs(&mut self, profile: RecordingProfile) {
        for kind in profile.media_kinds() {
            self.muxer.disconnect_input(kind);
        }
    }
}

impl<M: Muxer> Drop for Recorder<M> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        if inner.muxer.state() != MuxerState::Null {
            log::warn!("Recorder may have buffers to save, dropped while not stopped");
        }

        inner.muxer.set_state(MuxerState::Null);
        inner.pending_stop = None;

        if !self.controller.close() {
            log::error!("State change requests still blocked after closing the recorder");
        }
    }
}
