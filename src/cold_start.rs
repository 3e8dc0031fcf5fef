//! Tracks whether the execution environment has served an invocation
//! yet.

use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot flag that is cold until the first invocation marks it.
#[derive(Debug)]
pub struct ColdStart {
    cold: AtomicBool,
}

impl ColdStart {
    /// A fresh, cold flag.
    pub fn new() -> Self {
        Self {
            cold: AtomicBool::new(true),
        }
    }

    /// Whether no invocation has marked the flag yet.
    pub fn first(&self) -> bool {
        self.cold.load(Ordering::Acquire)
    }

    /// Marks the flag warm, returning whether this call was the one
    /// that observed it cold. Concurrent callers see exactly one
    /// `true`.
    pub fn mark(&self) -> bool {
        self.cold.swap(false, Ordering::AcqRel)
    }
}

impl Default for ColdStart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn only_the_first_mark_is_cold() {
        let flag = ColdStart::new();
        assert!(flag.first());
        assert!(flag.mark());
        assert!(!flag.first());
        assert!(!flag.mark());
        assert!(!flag.mark());
    }

    #[test]
    fn concurrent_marks_observe_a_single_cold_start() {
        let flag = Arc::new(ColdStart::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let flag = Arc::clone(&flag);
                thread::spawn(move || flag.mark())
            })
            .collect();
        let cold = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|&cold| cold)
            .count();
        assert_eq!(cold, 1);
    }
}
