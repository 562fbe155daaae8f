//! Cooperative cancellation for the transform stage (spec §5): "Between
//! transform passes, the engine observes a cancellation signal and
//! aborts with the outer context's error." Rust has no ambient context
//! object to poll the way the described system does, so this plays
//! that role explicitly: a cheap `Clone` handle over a shared flag the
//! caller can set from another thread (a signal handler, a UI cancel
//! button, a parent `select!`) while a run is in progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cooperative cancellation flag shared between a pipeline caller and
/// the transform stage. Cloning shares the same underlying flag, so a
/// clone handed to a background thread can cancel the run in progress.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Visible to every clone of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called on this token or any
    /// clone of it.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        assert!(!Cancellation::new().is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = Cancellation::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn default_is_equivalent_to_new() {
        assert!(!Cancellation::default().is_cancelled());
    }
}
