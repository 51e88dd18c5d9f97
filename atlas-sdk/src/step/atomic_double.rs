//! A lock-free `f64` accumulator.
//!
//! Doubles have no native atomic instruction, so the bit pattern is stored
//! in an `AtomicU64` and every read-modify-write (add, max) retries via
//! compare-and-swap, the "double as atomic long" pattern common to
//! lock-free float accumulators.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct AtomicDouble {
    bits: AtomicU64,
}

impl AtomicDouble {
    pub fn new(value: f64) -> Self {
        AtomicDouble {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Atomically swaps in `value`, returning the previous value.
    pub fn get_and_set(&self, value: f64) -> f64 {
        f64::from_bits(self.bits.swap(value.to_bits(), Ordering::Relaxed))
    }

    /// Atomically applies `f` to the current value and stores the result,
    /// retrying under contention. Used to implement both `add` (sum cells)
    /// and `max` (max cells) from the same CAS loop.
    pub fn update(&self, mut f: impl FnMut(f64) -> f64) -> f64 {
        let mut current_bits = self.bits.load(Ordering::Relaxed);
        loop {
            let current = f64::from_bits(current_bits);
            let next = f(current);
            match self.bits.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current_bits = observed,
            }
        }
    }

    pub fn add(&self, delta: f64) -> f64 {
        self.update(|current| current + delta)
    }

    pub fn max(&self, value: f64) -> f64 {
        self.update(|current| if value > current || current.is_nan() { value } else { current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_under_sequential_calls() {
        let d = AtomicDouble::new(0.0);
        d.add(1.0);
        d.add(2.5);
        assert_eq!(d.get(), 3.5);
    }

    #[test]
    fn max_tracks_largest_value_seen() {
        let d = AtomicDouble::new(f64::NAN);
        d.max(3.0);
        d.max(1.0);
        d.max(5.0);
        assert_eq!(d.get(), 5.0);
    }

    #[test]
    fn max_from_nan_establishes_first_value_regardless_of_sign() {
        let d = AtomicDouble::new(f64::NAN);
        d.max(-7.0);
        assert_eq!(d.get(), -7.0);
    }
}
