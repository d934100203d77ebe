//! Location broadcasting collaborator interface.
//!
//! Broadcasting is a side effect owned exclusively by availability and
//! assignment transitions: it starts when the worker goes online, continues
//! across assignment stages, and stops when the worker goes offline or the
//! assignment reaches a terminal stage. No other component may start or
//! stop it.

/// Callbacks for the location service.
///
/// Implementations must be cheap and non-blocking; anything slow belongs on
/// a task the implementation spawns itself.
pub trait LocationSink: Send + Sync {
    fn on_became_active(&self);
    fn on_became_inactive(&self);
}

/// No-op sink for setups without location tracking.
pub struct NoopLocationSink;

impl LocationSink for NoopLocationSink {
    fn on_became_active(&self) {}
    fn on_became_inactive(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::LocationSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts activation flips for assertions.
    #[derive(Default)]
    pub struct RecordingLocationSink {
        pub activations: AtomicUsize,
        pub deactivations: AtomicUsize,
    }

    impl RecordingLocationSink {
        pub fn counts(&self) -> (usize, usize) {
            (
                self.activations.load(Ordering::SeqCst),
                self.deactivations.load(Ordering::SeqCst),
            )
        }
    }

    impl LocationSink for RecordingLocationSink {
        fn on_became_active(&self) {
            self.activations.fetch_add(1, Ordering::SeqCst);
        }

        fn on_became_inactive(&self) {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
        }
    }
}
