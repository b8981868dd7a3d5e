use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::FlipPolicy;

/// Flip decisions for a stream of sample positions.
///
/// The decision for a sample is made once and applied to both frames and the label.
#[derive(Debug)]
pub struct AugmentationPolicy {
    policy: FlipPolicy,
    rng: Option<Mutex<StdRng>>,
}

impl AugmentationPolicy {
    pub fn new(policy: FlipPolicy, seed: Option<u64>) -> Self {
        Self {
            policy,
            rng: seed.map(|s| Mutex::new(StdRng::seed_from_u64(s))),
        }
    }

    pub fn policy(&self) -> FlipPolicy {
        self.policy
    }

    /// `position` is the logical stream position within the split's cycle.
    pub fn decide(&self, position: usize) -> bool {
        match self.policy {
            FlipPolicy::Disabled => false,
            FlipPolicy::Alternate => position % 2 == 1,
            FlipPolicy::Random => match &self.rng {
                Some(rng) => rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .gen_bool(0.5),
                None => rand::thread_rng().gen_bool(0.5),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_flips() {
        let p = AugmentationPolicy::new(FlipPolicy::Disabled, Some(1));
        assert!((0..64).all(|i| !p.decide(i)));
    }

    #[test]
    fn alternate_flips_odd_positions() {
        let p = AugmentationPolicy::new(FlipPolicy::Alternate, None);
        let got: Vec<bool> = (0..4).map(|i| p.decide(i)).collect();
        assert_eq!(got, vec![false, true, false, true]);
    }

    #[test]
    fn seeded_random_is_reproducible_and_mixed() {
        let a = AugmentationPolicy::new(FlipPolicy::Random, Some(7));
        let b = AugmentationPolicy::new(FlipPolicy::Random, Some(7));
        let xs: Vec<bool> = (0..256).map(|i| a.decide(i)).collect();
        let ys: Vec<bool> = (0..256).map(|i| b.decide(i)).collect();
        assert_eq!(xs, ys);
        let flips = xs.iter().filter(|f| **f).count();
        assert!((64..192).contains(&flips), "flips={flips}");
    }
}
