//! Destination selection
//!
//! With load balancing off, destinations are tried strictly in configured
//! order. With it on, one weighted-random draw over the eligible
//! destinations picks where to start; the rest follow in configured order as
//! failovers.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::common::{RelayError, Result};
use crate::endpoint::Endpoint;

/// Pick the first destination to try
///
/// # Returns
///
/// The chosen destination's index in `candidates` together with the
/// destination itself.
///
/// # Errors
///
/// Returns [`RelayError::NoDestination`] for an empty candidate list.
pub fn next(load_balance: bool, candidates: &[Endpoint]) -> Result<(usize, &Endpoint)> {
    select_with(&mut rand::thread_rng(), load_balance, candidates)
}

/// [`next`] with a caller-supplied random source
pub fn select_with<'a, R: Rng + ?Sized>(
    rng: &mut R,
    load_balance: bool,
    candidates: &'a [Endpoint],
) -> Result<(usize, &'a Endpoint)> {
    let first = candidates.first().ok_or(RelayError::NoDestination)?;
    if !load_balance {
        return Ok((0, first));
    }

    // Indices into `candidates`, so the caller can map back to the original list
    let eligible: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, ep)| ep.load_balance_enabled())
        .map(|(i, _)| i)
        .collect();

    if eligible.is_empty() {
        return Ok((0, first));
    }

    // Summed as u64 so any number of u32 weights fits
    let weights = eligible
        .iter()
        .map(|&i| u64::from(candidates[i].load_balance_weight()));
    let dist = match WeightedIndex::new(weights) {
        Ok(dist) => dist,
        // Weights are validated positive at parse time
        Err(_) => return Ok((0, first)),
    };

    let index = eligible[dist.sample(rng)];
    Ok((index, &candidates[index]))
}

/// Full order in which destinations are attempted for one connection
///
/// The selected destination comes first, followed by every other destination
/// in configured order.
pub fn attempt_order(load_balance: bool, candidates: &[Endpoint]) -> Result<Vec<usize>> {
    let (chosen, _) = next(load_balance, candidates)?;
    Ok(order_from(chosen, candidates.len()))
}

fn order_from(chosen: usize, len: usize) -> Vec<usize> {
    std::iter::once(chosen)
        .chain((0..len).filter(|&i| i != chosen))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn endpoints(specs: &[&str]) -> Vec<Endpoint> {
        specs.iter().map(|s| Endpoint::parse(s).unwrap()).collect()
    }

    #[test]
    fn test_disabled_always_first() {
        let candidates = endpoints(&[
            "tcp://a:1?lb_weight=1",
            "tcp://b:1?lb_weight=1000",
            "tcp://c:1?lb_weight=1000",
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let (index, chosen) = select_with(&mut rng, false, &candidates).unwrap();
            assert_eq!(index, 0);
            assert_eq!(chosen.host(), "a");
        }
    }

    #[test]
    fn test_all_opted_out_falls_back_to_first() {
        let candidates = endpoints(&["tcp://a:1?lb=false", "tcp://b:1?lb=off"]);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(select_with(&mut rng, true, &candidates).unwrap().0, 0);
        }
    }

    #[test]
    fn test_index_maps_to_original_list() {
        // Only the third destination is eligible
        let candidates = endpoints(&["tcp://a:1?lb=no", "tcp://b:1?lb=0", "tcp://c:1"]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let (index, chosen) = select_with(&mut rng, true, &candidates).unwrap();
            assert_eq!(index, 2);
            assert_eq!(chosen.host(), "c");
        }
    }

    #[test]
    fn test_weighted_draw() {
        let candidates = endpoints(&["tcp://a:1?lb_weight=1", "tcp://b:1?lb_weight=99"]);
        let mut rng = StdRng::seed_from_u64(42);
        let mut hits = [0usize; 2];
        for _ in 0..2000 {
            hits[select_with(&mut rng, true, &candidates).unwrap().0] += 1;
        }
        assert!(hits[1] > hits[0] * 10, "{:?}", hits);
    }

    #[test]
    fn test_maximum_weights() {
        let candidates = endpoints(&[
            "tcp://a:1?lb_weight=4294967295",
            "tcp://b:1?lb_weight=4294967295",
        ]);
        let mut rng = StdRng::seed_from_u64(11);
        let mut hits = [0usize; 2];
        for _ in 0..1000 {
            hits[select_with(&mut rng, true, &candidates).unwrap().0] += 1;
        }
        assert!(hits[0] > 300 && hits[1] > 300, "{:?}", hits);
    }

    #[test]
    fn test_empty() {
        assert!(matches!(next(true, &[]), Err(RelayError::NoDestination)));
    }

    #[test]
    fn test_attempt_order() {
        assert_eq!(order_from(0, 3), vec![0, 1, 2]);
        assert_eq!(order_from(2, 4), vec![2, 0, 1, 3]);

        let candidates = endpoints(&["tcp://a:1", "tcp://b:1", "tcp://c:1"]);
        assert_eq!(attempt_order(false, &candidates).unwrap(), vec![0, 1, 2]);
    }
}
