//! src/engine/select.rs
//!
//! Implements the gossip target selection strategies. By isolating this
//! logic, the distributions can be analyzed and tested independently of the
//! engine actor.

use crate::domain::{NodeId, PickStrategy};
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};

/// Draws one gossip target from the CORRECT peers, or `None` when there is
/// nobody left to gossip with.
///
/// # Arguments
/// * `candidates` - the CORRECT peers paired with their quiescence values.
/// * `strategy` - the probability distribution over the candidates:
///   UNIFORM ignores quiescence, LINEAR weights `q + 1`, QUADRATIC weights
///   `q² + 1`. The `+1` keeps every candidate reachable.
pub fn pick_gossip_target<R: Rng>(
    candidates: &[(NodeId, u32)],
    strategy: PickStrategy,
    rng: &mut R,
) -> Option<NodeId> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        PickStrategy::Uniform => {
            let index = rng.gen_range(0..candidates.len());
            Some(candidates[index].0.clone())
        }
        PickStrategy::Linear | PickStrategy::Quadratic => {
            let weights = candidates.iter().map(|(_, q)| {
                let q = u64::from(*q);
                match strategy {
                    PickStrategy::Linear => q + 1,
                    _ => q * q + 1,
                }
            });
            // All weights are >= 1, so the distribution is always valid.
            let distribution =
                WeightedIndex::new(weights).expect("weights are positive and non-empty");
            Some(candidates[distribution.sample(rng)].0.clone())
        }
    }
}
