use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, thiserror::Error)]
pub enum StateControllerError {
    #[error("state change still in progress after {0:?}")]
    Timeout(Duration),
    #[error("state controller has been closed")]
    Closed,
}

#[derive(Default)]
struct Inner {
    changing: bool,
    waiting: usize,
    closed: bool,
}

/// Serializes state changes requested from multiple threads
///
/// At most one [`StateChange`] exists at a time. [`begin`](Self::begin) blocks while another change
/// is in progress, up to the configured timeout.
pub struct StateController {
    inner: Mutex<Inner>,
    cond: Condvar,
    timeout: Duration,
}

impl StateController {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            timeout,
        })
    }

    /// Start a state change, waiting for the one in progress to complete
    ///
    /// The change completes when the returned guard is dropped.
    pub fn begin(self: &Arc<Self>) -> Result<StateChange, StateControllerError> {
        let deadline = Instant::now() + self.timeout;
        let mut inner = self.inner.lock();

        while inner.changing && !inner.closed {
            log::warn!("Change of state is taking place, waiting");

            inner.waiting += 1;
            let result = self.cond.wait_until(&mut inner, deadline);
            inner.waiting -= 1;

            if result.timed_out() && inner.changing {
                if inner.waiting == 0 && inner.closed {
                    self.cond.notify_all();
                }

                return Err(StateControllerError::Timeout(self.timeout));
            }
        }

        if inner.closed {
            if inner.waiting == 0 {
                self.cond.notify_all();
            }

            return Err(StateControllerError::Closed);
        }

        inner.changing = true;

        Ok(StateChange {
            controller: self.clone(),
        })
    }

    pub fn is_changing(&self) -> bool {
        self.inner.lock().changing
    }

    /// Number of callers blocked in [`begin`](Self::begin)
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiting
    }

    /// Refuse new state changes and release every blocked caller
    ///
    /// Returns once no caller is blocked anymore, false if they did not leave within the timeout.
    pub fn close(&self) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut inner = self.inner.lock();

        inner.closed = true;
        self.cond.notify_all();

        while inner.waiting > 0 {
            log::warn!("Waiting for {} blocked state change requests", inner.waiting);

            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return inner.waiting == 0;
            }
        }

        true
    }

    fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.changing = false;

        if inner.waiting > 0 {
            self.cond.notify_all();
        }
    }
}

/// A state change in progress, completes on drop
pub struct StateChange {
    controller: Arc<StateController>,
}

impl Drop for StateChange {
    fn drop(&mut self) {
        self.controller.finish();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn wait_for_waiters(controller: &StateController, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);

        while controller.waiting() != n {
            assert!(Instant::now() < deadline, "waiters never arrived");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn changes_are_serialized() {
        let _ = env_logger::builder().is_test(true).try_init();

        let controller = StateController::new(Duration::from_secs(5));
        let change = controller.begin().unwrap();
        assert!(controller.is_changing());

        let waiter = thread::spawn({
            let controller = controller.clone();
            move || controller.begin().map(drop)
        });

        wait_for_waiters(&controller, 1);
        drop(change);

        waiter.join().unwrap().unwrap();
        assert!(!controller.is_changing());
        assert_eq!(controller.waiting(), 0);
    }

    #[test]
    fn bounded_wait() {
        let controller = StateController::new(Duration::from_millis(50));
        let _change = controller.begin().unwrap();

        assert!(matches!(
            controller.begin(),
            Err(StateControllerError::Timeout(_))
        ));
        assert_eq!(controller.waiting(), 0);
    }

    #[test]
    fn close_releases_waiters() {
        let _ = env_logger::builder().is_test(true).try_init();

        let controller = StateController::new(Duration::from_secs(5));
        let change = controller.begin().unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let controller = controller.clone();
                thread::spawn(move || controller.begin().map(drop))
            })
            .collect();

        wait_for_waiters(&controller, 3);

        assert!(controller.close());

        for waiter in waiters {
            assert!(matches!(
                waiter.join().unwrap(),
                Err(StateControllerError::Closed)
            ));
        }

        drop(change);
        assert!(matches!(
            controller.begin(),
            Err(StateControllerError::Closed)
        ));
    }
}
