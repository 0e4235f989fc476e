use evalkit_types::ScenarioId;

/// Minimal linear-congruential generator. Deterministic given a seed — the
/// whole point of §4.6's sampling requirement is that this is *not* the
/// platform's default (unseeded, non-reproducible) RNG.
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        // Avoid an all-zero state, which a multiplicative LCG can get stuck in.
        Self {
            state: seed ^ 0x9E3779B97F4A7C15,
        }
    }

    fn next_u32(&mut self) -> u32 {
        // Constants from Knuth's MMIX generator.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 32) as u32
    }

    /// Uniform value in `0..bound`. `bound` must be non-zero.
    fn gen_below(&mut self, bound: u32) -> u32 {
        self.next_u32() % bound
    }
}

fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    })
}

/// Deterministically samples scenarios via a Fisher–Yates shuffle driven by
/// a seeded LCG (§4.6, §8 property 2). `percentage` is clamped to `[1,100]`
/// by the caller (`startRun` validation); this function trusts its input.
pub fn sample_scenarios(ids: &[ScenarioId], percentage: u32, seed: Option<u64>) -> Vec<ScenarioId> {
    if ids.is_empty() {
        return Vec::new();
    }

    let target = ((ids.len() as u64 * percentage.min(100) as u64) / 100)
        .max(1)
        .min(ids.len() as u64) as usize;

    if percentage >= 100 {
        return ids.to_vec();
    }

    let mut rng = Lcg::new(resolve_seed(seed));
    let mut shuffled = ids.to_vec();
    for i in (1..shuffled.len()).rev() {
        let j = rng.gen_below((i + 1) as u32) as usize;
        shuffled.swap(i, j);
    }
    shuffled.truncate(target);
    shuffled
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids(n: usize) -> Vec<ScenarioId> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn same_seed_yields_identical_ordered_subset() {
        let scenarios = ids(4);
        let a = sample_scenarios(&scenarios, 50, Some(42));
        let b = sample_scenarios(&scenarios, 50, Some(42));
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn different_seeds_can_differ() {
        let scenarios = ids(20);
        let a = sample_scenarios(&scenarios, 50, Some(1));
        let b = sample_scenarios(&scenarios, 50, Some(2));
        assert_ne!(a, b);
    }

    #[test]
    fn cardinality_matches_formula_regardless_of_seed() {
        let scenarios = ids(7);
        let sampled = sample_scenarios(&scenarios, 30, None);
        // max(1, floor(7 * 30 / 100)) == max(1, 2) == 2
        assert_eq!(sampled.len(), 2);
    }

    #[test]
    fn at_least_one_scenario_is_always_selected() {
        let scenarios = ids(3);
        let sampled = sample_scenarios(&scenarios, 1, Some(7));
        assert_eq!(sampled.len(), 1);
    }

    #[test]
    fn full_percentage_selects_everything() {
        let scenarios = ids(5);
        let sampled = sample_scenarios(&scenarios, 100, Some(9));
        assert_eq!(sampled.len(), 5);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let sampled = sample_scenarios(&[], 50, Some(1));
        assert!(sampled.is_empty());
    }
}
