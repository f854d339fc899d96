//! Weighted traffic allocation
//!
//! The allocator draws `r` uniformly from `[0, 100)` and walks variations in
//! their stored order, returning the first whose cumulative traffic share is
//! at least `r`. It keeps no visitor state; stickiness comes from persisting
//! the result through an [`AssignmentStore`](crate::store::AssignmentStore).

use experiment_types::Variation;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::errors::{DecisionError, Result};

/// Weighted variation picker with an injectable random source
pub struct TrafficAllocator<R = StdRng> {
    rng: Mutex<R>,
}

impl TrafficAllocator<StdRng> {
    /// Allocator seeded from the operating system
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Deterministic allocator for reproducible runs
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: RngCore + Send> TrafficAllocator<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Draw a uniform value in `[0, 100)`
    pub fn draw(&self) -> f64 {
        self.rng.lock().gen_range(0.0..100.0)
    }

    /// Pick a variation for a new visitor
    pub fn select_variation<'a>(&self, variations: &'a [Variation]) -> Result<&'a Variation> {
        if variations.is_empty() {
            return Err(DecisionError::Validation(
                "Cannot allocate traffic without variations".to_string(),
            ));
        }

        let r = self.draw();
        Ok(pick(variations, r).unwrap_or(&variations[0]))
    }
}

/// First variation whose cumulative share reaches `r`
///
/// Returns `None` when the shares sum to less than `r`; callers fall back to
/// the first variation in that case.
pub fn pick(variations: &[Variation], r: f64) -> Option<&Variation> {
    let mut cumulative = 0.0;
    for variation in variations {
        cumulative += variation.traffic_percentage;
        if cumulative >= r {
            return Some(variation);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn splits(shares: &[(&str, f64)]) -> Vec<Variation> {
        shares
            .iter()
            .map(|(name, share)| Variation::new(*name, *share))
            .collect()
    }

    #[test]
    fn test_pick_boundaries() {
        let variations = splits(&[("a", 50.0), ("b", 30.0), ("c", 20.0)]);

        assert_eq!(pick(&variations, 0.0).unwrap().name, "a");
        assert_eq!(pick(&variations, 50.0).unwrap().name, "a");
        assert_eq!(pick(&variations, 50.5).unwrap().name, "b");
        assert_eq!(pick(&variations, 80.0).unwrap().name, "b");
        assert_eq!(pick(&variations, 99.9).unwrap().name, "c");
    }

    #[test]
    fn test_pick_falls_short() {
        // Shares that do not quite reach 100
        let variations = splits(&[("a", 33.3), ("b", 33.3), ("c", 33.3)]);
        assert!(pick(&variations, 99.95).is_none());
    }

    #[test]
    fn test_select_fallback_to_first() {
        struct Fixed;
        impl RngCore for Fixed {
            fn next_u32(&mut self) -> u32 {
                u32::MAX
            }
            fn next_u64(&mut self) -> u64 {
                u64::MAX
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0xff);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
                self.fill_bytes(dest);
                Ok(())
            }
        }

        let allocator = TrafficAllocator::new(Fixed);
        let variations = splits(&[("a", 10.0), ("b", 10.0)]);

        // The draw lands near 100, beyond the 20% the shares cover
        let chosen = allocator.select_variation(&variations).unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[test]
    fn test_select_empty_is_validation_error() {
        let allocator = TrafficAllocator::seeded(1);
        let err = allocator.select_variation(&[]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_seeded_sequences_are_reproducible() {
        let variations = splits(&[("a", 50.0), ("b", 30.0), ("c", 20.0)]);
        let first = TrafficAllocator::seeded(42);
        let second = TrafficAllocator::seeded(42);

        let seq_a: Vec<String> = (0..50)
            .map(|_| first.select_variation(&variations).unwrap().name.clone())
            .collect();
        let seq_b: Vec<String> = (0..50)
            .map(|_| second.select_variation(&variations).unwrap().name.clone())
            .collect();

        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_allocation_converges_to_declared_split() {
        let variations = splits(&[("a", 50.0), ("b", 30.0), ("c", 20.0)]);
        let allocator = TrafficAllocator::seeded(7);
        let draws = 100_000;

        let mut counts: HashMap<String, u64> = HashMap::new();
        for _ in 0..draws {
            let chosen = allocator.select_variation(&variations).unwrap();
            *counts.entry(chosen.name.clone()).or_default() += 1;
        }

        for variation in &variations {
            let observed = counts[&variation.name] as f64 / draws as f64 * 100.0;
            assert!(
                (observed - variation.traffic_percentage).abs() <= 2.0,
                "{} observed {:.2}% vs declared {}%",
                variation.name,
                observed,
                variation.traffic_percentage
            );
        }
    }
}
