//! Snowflake-style monotone 63-bit id generation.
//!
//! Layout mirrors the reference implementation's `sonyflake` usage: a
//! millisecond counter since a fixed epoch, a sequence counter for ids
//! minted within the same millisecond, and a small machine-id field so
//! multiple controller processes don't collide. Only "later id > earlier
//! id" is relied upon anywhere in the system (§4.1) — the exact bit split
//! is an implementation detail, not a wire contract.

use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const SEQUENCE_BITS: u32 = 12;
const MACHINE_ID_BITS: u32 = 8;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS;

/// Plan ids are seeded from 2024-01-01T00:00:00Z.
pub const PLAN_EPOCH_MILLIS: i64 = 1_704_067_200_000;
/// Task ids are seeded from 2022-01-01T00:00:00Z.
pub const TASK_EPOCH_MILLIS: i64 = 1_640_995_200_000;

/// A monotone id generator anchored to a fixed epoch.
///
/// Thread-safe and lock-free: a compare-and-swap loop on the last-minted
/// `(timestamp, sequence)` pair, matching the Controller's "no global
/// mutable state except the two id generators" requirement (§5).
pub struct IdGenerator {
    epoch_millis: i64,
    machine_id: i64,
    last_millis: AtomicI64,
    sequence: AtomicU16,
}

impl IdGenerator {
    pub fn new(epoch_millis: i64, machine_id: u16) -> Self {
        Self {
            epoch_millis,
            machine_id: (machine_id as i64) & ((1 << MACHINE_ID_BITS) - 1),
            last_millis: AtomicI64::new(-1),
            sequence: AtomicU16::new(0),
        }
    }

    pub fn for_plans(machine_id: u16) -> Self {
        Self::new(PLAN_EPOCH_MILLIS, machine_id)
    }

    pub fn for_tasks(machine_id: u16) -> Self {
        Self::new(TASK_EPOCH_MILLIS, machine_id)
    }

    /// Mint the next id. Strictly greater than every id this generator has
    /// previously minted.
    pub fn next_id(&self) -> i64 {
        loop {
            let now = now_millis();
            let prev = self.last_millis.load(Ordering::SeqCst);

            let (millis, seq) = if now > prev {
                (now, 0u16)
            } else {
                // Same millisecond (or clock went backwards): bump the
                // sequence within `prev` rather than going non-monotone.
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                if (seq as i64) > SEQUENCE_MASK {
                    // Sequence exhausted within this millisecond; spin to
                    // the next one.
                    continue;
                }
                (prev, seq)
            };

            if self
                .last_millis
                .compare_exchange(prev, millis, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if millis > prev {
                    self.sequence.store(0, Ordering::SeqCst);
                }
                let rel = millis - self.epoch_millis;
                return (rel << TIMESTAMP_SHIFT)
                    | (self.machine_id << MACHINE_ID_SHIFT)
                    | (seq as i64 & SEQUENCE_MASK);
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_strictly_monotone() {
        let gen = IdGenerator::for_plans(1);
        let mut last = gen.next_id();
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last, "expected {id} > {last}");
            last = id;
        }
    }

    #[test]
    fn ids_are_unique_under_concurrent_generation() {
        use std::sync::Arc;
        use std::thread;

        let gen = Arc::new(IdGenerator::for_tasks(2));
        let mut handles = vec![];
        for _ in 0..8 {
            let gen = gen.clone();
            handles.push(thread::spawn(move || {
                (0..2000).map(|_| gen.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 8 * 2000);
    }

    #[test]
    fn plan_and_task_generators_use_distinct_epochs() {
        assert!(PLAN_EPOCH_MILLIS > TASK_EPOCH_MILLIS);
    }

    #[test]
    fn fits_in_63_bits() {
        let gen = IdGenerator::for_plans(255);
        for _ in 0..100 {
            assert!(gen.next_id() >= 0);
        }
    }
}
