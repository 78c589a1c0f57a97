// THEORY:
// The matcher pairs features of the reference photo with features of the current
// photo purely by appearance. It never looks at positions, which is why two photos
// of different sizes can still be registered.
//
// Key architectural principles:
// 1.  **Brute Force, Two Neighbors**: Every reference descriptor is compared against
//     every current descriptor by Hamming distance, keeping only the closest two.
// 2.  **Ratio Test**: A match is trusted only if its nearest neighbor is clearly
//     closer than the runner-up. Repeated texture (bricks, tiles) produces many
//     near-identical descriptors; the ratio test is what throws those out.

use crate::core_modules::features::{Descriptor, hamming};
use rayon::prelude::*;

/// One candidate correspondence between a query (reference) feature and a
/// train (current) feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCandidate {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// The two nearest train descriptors for every query descriptor, nearest first.
/// A query gets fewer than two candidates only when `train` is that short.
pub fn knn_match(query: &[Descriptor], train: &[Descriptor]) -> Vec<Vec<MatchCandidate>> {
    query
        .par_iter()
        .enumerate()
        .map(|(query_idx, q)| {
            let mut best: Option<MatchCandidate> = None;
            let mut second: Option<MatchCandidate> = None;
            for (train_idx, t) in train.iter().enumerate() {
                let candidate = MatchCandidate {
                    query_idx,
                    train_idx,
                    distance: hamming(q, t),
                };
                match best {
                    Some(b) if candidate.distance >= b.distance => {
                        if second.is_none_or(|s| candidate.distance < s.distance) {
                            second = Some(candidate);
                        }
                    }
                    _ => {
                        second = best;
                        best = Some(candidate);
                    }
                }
            }
            best.into_iter().chain(second).collect()
        })
        .collect()
}

/// `nearest < ratio * second_nearest`.
pub fn passes_ratio_test(nearest: u32, second_nearest: u32, ratio: f32) -> bool {
    (nearest as f32) < ratio * second_nearest as f32
}

/// Keeps the nearest candidate of each query that passes the ratio test.
/// Queries with a single candidate are dropped: there is no runner-up to
/// compare against.
pub fn ratio_filter(knn: &[Vec<MatchCandidate>], ratio: f32) -> Vec<MatchCandidate> {
    knn.iter()
        .filter_map(|pair| match pair.as_slice() {
            [nearest, second, ..] if passes_ratio_test(nearest.distance, second.distance, ratio) => {
                Some(*nearest)
            }
            _ => None,
        })
        .collect()
}
