//! # Engine State
//!
//! Shared mutable state the storage core reports into. The engine shell
//! (transactions, checkpoint, rebuild) owns one [`EngineState`] per open
//! database and consults it to decide whether the database must be closed
//! or rebuilt.
//!
//! The storage core only ever *records* here: the asynchronous log writer
//! cannot surface an I/O failure on the thread that caused it, so the
//! failure is parked on this object (and on the queue itself) until the
//! next caller trips over it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// Error-state holder shared between the engine shell and the storage core.
#[derive(Debug, Default)]
pub struct EngineState {
    disposed: AtomicBool,
    handled: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an asynchronous failure. The first error is kept verbatim;
    /// later reports only bump the counter so the original cause is not
    /// overwritten by follow-on noise.
    pub fn handle(&self, error: &eyre::Report) {
        warn!(error = %format!("{error:#}"), "asynchronous storage failure recorded");

        self.handled.fetch_add(1, Ordering::AcqRel);

        let mut last = self.last_error.lock();
        if last.is_none() {
            *last = Some(format!("{error:#}"));
        }
    }

    /// True once any asynchronous failure has been recorded.
    pub fn errored(&self) -> bool {
        self.handled.load(Ordering::Acquire) > 0
    }

    /// The first recorded failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// How many failures have been reported in total.
    pub fn handled_count(&self) -> usize {
        self.handled.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_keeps_first_error_and_counts_all() {
        let state = EngineState::new();
        assert!(!state.errored());
        assert_eq!(state.last_error(), None);

        state.handle(&eyre::eyre!("disk full"));
        state.handle(&eyre::eyre!("later noise"));

        assert!(state.errored());
        assert_eq!(state.handled_count(), 2);
        assert_eq!(state.last_error(), Some("disk full".to_string()));
    }

    #[test]
    fn dispose_is_sticky() {
        let state = EngineState::new();
        assert!(!state.disposed());
        state.dispose();
        assert!(state.disposed());
    }
}
