//! Engine event surface.
//!
//! The controller and workers report through an [`EngineEvents`] subscriber:
//! status lines for lifecycle transitions and error lines for faults. The
//! subscriber is held behind an `Arc` with no back-reference to the engine,
//! and delivery is gated on a disposed flag so nothing reaches an observer
//! that is being torn down.
//!
//! Callbacks are invoked from worker/controller threads; subscribers must
//! marshal to their own thread if they need one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Subscriber for engine status and error reports.
pub trait EngineEvents: Send + Sync {
    fn on_status(&self, message: &str);
    fn on_error(&self, message: &str);
}

/// Subscriber that discards everything.
pub struct NullEvents;

impl EngineEvents for NullEvents {
    fn on_status(&self, _message: &str) {}
    fn on_error(&self, _message: &str) {}
}

/// Dispatch gate in front of the subscriber.
pub(crate) struct EventDispatcher {
    sink: Arc<dyn EngineEvents>,
    disposed: AtomicBool,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EngineEvents>) -> Self {
        Self {
            sink,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn status(&self, message: &str) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        log::info!("{}", message);
        self.sink.on_status(message);
    }

    pub fn error(&self, message: &str) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        log::error!("{}", message);
        self.sink.on_error(message);
    }

    /// Suppress all further delivery. Called when engine teardown begins.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl EngineEvents for Recorder {
        fn on_status(&self, message: &str) {
            self.0.lock().push(format!("status: {}", message));
        }
        fn on_error(&self, message: &str) {
            self.0.lock().push(format!("error: {}", message));
        }
    }

    #[test]
    fn dispose_suppresses_delivery() {
        let sink = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = EventDispatcher::new(sink.clone());

        dispatcher.status("up");
        dispatcher.error("boom");
        dispatcher.dispose();
        dispatcher.status("late");
        dispatcher.error("late");

        assert_eq!(*sink.0.lock(), vec!["status: up", "error: boom"]);
    }
}
