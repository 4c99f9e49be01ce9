//! Request sequence numbering.
//!
//! Every call carries a `(sgen, seq)` pair. `sgen` identifies the generator
//! (fixed per process unless configured) and `seq` increases by one per call.
//! Connections share [`SequenceGenerator::shared`] unless given their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Thread-safe source of `(generator, sequence)` pairs.
#[derive(Debug)]
pub struct SequenceGenerator {
    generator: u64,
    counter: AtomicU64,
}

impl SequenceGenerator {
    /// New generator whose first sequence number is 1.
    pub fn new(generator: u64) -> Self {
        Self {
            generator,
            counter: AtomicU64::new(0),
        }
    }

    /// The process-wide generator (id 0).
    pub fn shared() -> Arc<SequenceGenerator> {
        static SHARED: OnceLock<Arc<SequenceGenerator>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(SequenceGenerator::new(0)))
            .clone()
    }

    /// Generator id.
    pub fn generator(&self) -> u64 {
        self.generator
    }

    /// Allocate the next pair. Never hands out the same number twice.
    pub fn next(&self) -> (u64, u64) {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        (self.generator, seq)
    }
}
