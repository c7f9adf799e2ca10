//! Watermarks order fetch results and direct writes per query client.
//!
//! Every fetch takes a watermark when it starts, and every direct write
//! takes one when it is applied. A result is only accepted if its watermark
//! is newer than the one already stored for the key.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A point in a query client's write history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Watermark(u64);

impl Watermark {
    /// The watermark of an entry nothing has written to yet.
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn from_sequence(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }

    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.0 > other.0
    }
}

/// Monotonic watermark source.
#[derive(Debug, Default)]
pub struct WatermarkClock {
    last: AtomicU64,
}

impl WatermarkClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next watermark. Never returns [`Watermark::zero`].
    pub fn tick(&self) -> Watermark {
        Watermark(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently issued watermark.
    pub fn current(&self) -> Watermark {
        Watermark(self.last.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = WatermarkClock::new();
        assert_eq!(clock.current(), Watermark::zero());

        let a = clock.tick();
        let b = clock.tick();
        assert!(b.is_newer_than(&a));
        assert!(a.is_newer_than(&Watermark::zero()));
        assert_eq!(clock.current(), b);
    }

    #[test]
    fn test_watermark_ordering() {
        let clock = WatermarkClock::new();
        let marks: Vec<_> = (0..5).map(|_| clock.tick()).collect();
        let mut sorted = marks.clone();
        sorted.sort();
        assert_eq!(marks, sorted);
        assert_eq!(marks[4].sequence(), 5);
    }
}
