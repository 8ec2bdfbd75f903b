use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A level-triggered cancellation flag.
///
/// Cloning is cheap and every clone observes the same flag, so one side can
/// hold a clone to fire while the other side polls. Once fired, a token
/// stays fired.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh token that no holder ever fires.
    ///
    /// For sections that must run to completion, such as transaction
    /// finalization.
    pub fn never() -> Self {
        Self::new()
    }

    /// Fires the token. Idempotent.
    pub fn cancel(&self) {
        self.fired.store(true, Ordering::Release);
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
