//! Deterministic hashing and bucketing.
//!
//! The hash functions here are a frozen protocol: every SDK must produce the exact same
//! numbers for the same `(seed, value, version)`. Changing the output of an existing
//! version is a breaking change for every running experiment, add a new version instead.

use crate::model::experiment::{BucketRange, Namespace};
use log::warn;
use url::Url;

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// 32-bit FNV-1a over UTF-16 code units.
fn fnv1a32(value: &str) -> u32 {
    value.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    })
}

/// Hashes `value` with `seed` into a number between 0 and 1.
///
/// Returns [`None`] for unknown hash versions.
///
/// # Examples
///
/// ```rust
/// use featgate::hash;
///
/// assert_eq!(hash("v2seed", "user123", 2), Some(0.0442));
/// assert_eq!(hash("", "a", 1), Some(0.22));
/// assert_eq!(hash("seed", "a", 99), None);
/// ```
pub fn hash(seed: &str, value: &str, version: u32) -> Option<f64> {
    match version {
        1 => {
            let n = fnv1a32(format!("{value}{seed}").as_str());
            Some(f64::from(n % 1000) / 1000.0)
        }
        2 => {
            let inner = fnv1a32(format!("{seed}{value}").as_str());
            let n = fnv1a32(inner.to_string().as_str());
            Some(f64::from(n % 10000) / 10000.0)
        }
        _ => None,
    }
}

/// Returns whether `n` is inside the half-open `range`.
pub fn in_range(n: f64, range: &BucketRange) -> bool {
    n >= range.0 && n < range.1
}

/// Returns the index of the first range containing `n`, or [`None`] if the user is not bucketed.
pub fn choose_variation(n: f64, ranges: &[BucketRange]) -> Option<usize> {
    ranges.iter().position(|range| in_range(n, range))
}

/// Returns whether the hashed `hash_value` falls inside the namespace's range.
pub fn in_namespace(hash_value: &str, namespace: &Namespace) -> bool {
    match hash(format!("__{}", namespace.id).as_str(), hash_value, 1) {
        Some(n) => n >= namespace.start && n < namespace.end,
        None => false,
    }
}

/// Splits the unit interval into `num_variations` equal weights.
pub fn get_equal_weights(num_variations: usize) -> Vec<f64> {
    if num_variations == 0 {
        return vec![];
    }
    vec![1.0 / num_variations as f64; num_variations]
}

/// Builds contiguous half-open bucket ranges from `weights`, scaled down by `coverage`.
///
/// Weights may sum to less than 1, leaving the rest of the interval unassigned. Falls back to
/// equal weights when `weights` is missing, has the wrong length, has negative items, or sums
/// to more than 1.
pub fn get_bucket_ranges(
    num_variations: usize,
    coverage: f64,
    weights: Option<&[f64]>,
) -> Vec<BucketRange> {
    let coverage = if coverage.is_nan() {
        1.0
    } else {
        coverage.clamp(0.0, 1.0)
    };
    let weights = match weights {
        Some(w) if w.len() == num_variations => {
            let total: f64 = w.iter().sum();
            if total > 1.0 + WEIGHT_SUM_TOLERANCE || w.iter().any(|x| *x < 0.0 || x.is_nan()) {
                warn!(event_id = 5001; "Experiment weights must be non-negative and add up to at most 1, got {total}. Falling back to equal weights.");
                get_equal_weights(num_variations)
            } else {
                w.to_vec()
            }
        }
        Some(w) => {
            warn!(event_id = 5002; "Experiment has {} weights but {num_variations} variations. Falling back to equal weights.", w.len());
            get_equal_weights(num_variations)
        }
        None => get_equal_weights(num_variations),
    };

    let mut cumulative = 0.0;
    weights
        .iter()
        .map(|w| {
            let start = cumulative;
            cumulative += w;
            BucketRange(start, start + coverage * w)
        })
        .collect()
}

/// Reads a forced variation index for experiment `id` from the query string of `url`.
pub fn query_string_override(id: &str, url: &str, num_variations: usize) -> Option<usize> {
    let parsed = Url::parse(url).ok()?;
    let (_, raw) = parsed.query_pairs().find(|(k, _)| k == id)?;
    let index = raw.trim().parse::<usize>().ok()?;
    if index < num_variations {
        Some(index)
    } else {
        None
    }
}

#[cfg(test)]
mod hashing_tests {
    use crate::eval::hashing::*;
    use crate::model::experiment::{BucketRange, Namespace};

    #[test]
    fn hash_reference_vectors() {
        let cases = [
            ("", "a", 1, 0.22),
            ("", "b", 1, 0.077),
            ("b", "a", 1, 0.946),
            ("ef", "d", 1, 0.652),
            ("asdf", "8952klfjas09ujkasdf", 1, 0.335),
            ("", "123", 1, 0.011),
            ("", "___)((*\":&", 1, 0.563),
            ("seed", "a", 2, 0.0505),
            ("seed", "b", 2, 0.2696),
            ("foo", "ab", 2, 0.2575),
            ("foo", "def", 2, 0.2019),
            ("89123klj", "8952klfjas09ujkasdf", 2, 0.124),
            ("90850943850943285", "123", 2, 0.9627),
            ("___)((*\":&", "", 2, 0.5034),
            ("v2seed", "user123", 2, 0.0442),
        ];
        for (seed, value, version, expected) in cases {
            assert_eq!(
                hash(seed, value, version),
                Some(expected),
                "hash({seed:?}, {value:?}, {version})"
            );
        }
    }

    #[test]
    fn hash_is_stable() {
        let first = hash("exp1", "user-42", 2);
        for _ in 0..100 {
            assert_eq!(hash("exp1", "user-42", 2), first);
        }
    }

    #[test]
    fn hash_unknown_version() {
        assert_eq!(hash("seed", "a", 0), None);
        assert_eq!(hash("seed", "a", 3), None);
    }

    #[test]
    fn choose() {
        let ranges = vec![BucketRange(0.0, 0.5), BucketRange(0.5, 1.0)];
        assert_eq!(choose_variation(0.0, &ranges), Some(0));
        assert_eq!(choose_variation(0.4999, &ranges), Some(0));
        assert_eq!(choose_variation(0.5, &ranges), Some(1));
        assert_eq!(choose_variation(0.999, &ranges), Some(1));

        let partial = vec![BucketRange(0.0, 0.25), BucketRange(0.5, 0.75)];
        assert_eq!(choose_variation(0.3, &partial), None);
        assert_eq!(choose_variation(0.8, &partial), None);
        assert_eq!(choose_variation(0.6, &partial), Some(1));
        assert_eq!(choose_variation(0.1, &[]), None);
    }

    #[test]
    fn bucket_ranges() {
        assert_eq!(
            get_bucket_ranges(2, 1.0, None),
            vec![BucketRange(0.0, 0.5), BucketRange(0.5, 1.0)]
        );
        assert_eq!(
            get_bucket_ranges(2, 0.5, Some(&[0.25, 0.75])),
            vec![BucketRange(0.0, 0.125), BucketRange(0.25, 0.625)]
        );
        assert_eq!(
            get_bucket_ranges(2, 0.0, None),
            vec![BucketRange(0.0, 0.0), BucketRange(0.5, 0.5)]
        );
    }

    #[test]
    fn bucket_ranges_clamp_coverage() {
        assert_eq!(get_bucket_ranges(2, 1.5, None), get_bucket_ranges(2, 1.0, None));
        assert_eq!(get_bucket_ranges(2, -0.2, None), get_bucket_ranges(2, 0.0, None));
    }

    #[test]
    fn bucket_ranges_invalid_weights() {
        assert_eq!(
            get_bucket_ranges(2, 1.0, Some(&[0.75, 0.75])),
            vec![BucketRange(0.0, 0.5), BucketRange(0.5, 1.0)]
        );
        assert_eq!(
            get_bucket_ranges(2, 1.0, Some(&[1.0])),
            vec![BucketRange(0.0, 0.5), BucketRange(0.5, 1.0)]
        );
        assert_eq!(
            get_bucket_ranges(2, 1.0, Some(&[1.5, -0.5])),
            vec![BucketRange(0.0, 0.5), BucketRange(0.5, 1.0)]
        );
    }

    #[test]
    fn bucket_ranges_partial_weights() {
        assert_eq!(
            get_bucket_ranges(2, 1.0, Some(&[0.25, 0.5])),
            vec![BucketRange(0.0, 0.25), BucketRange(0.25, 0.75)]
        );
    }

    #[test]
    fn range_coverage_simulation() {
        let cases: [(&[f64], f64); 3] = [
            (&[0.5, 0.5], 1.0),
            (&[0.1, 0.2, 0.3], 1.0),
            (&[0.25, 0.25, 0.5], 0.4),
        ];
        let samples = 100_000;
        for (weights, coverage) in cases {
            let expected: f64 = weights.iter().sum::<f64>() * coverage;
            let ranges = get_bucket_ranges(weights.len(), coverage, Some(weights));
            let included = (0..samples)
                .filter(|_| choose_variation(rand::random::<f64>(), &ranges).is_some())
                .count();
            let ratio = included as f64 / samples as f64;
            assert!(
                (ratio - expected).abs() < 0.01,
                "mass {ratio} vs expected {expected} for {weights:?}"
            );
        }
    }

    #[test]
    fn namespace() {
        // hash("__ns1", "user-42", 1) == 0.801
        let ns = Namespace {
            id: "ns1".to_owned(),
            start: 0.8,
            end: 0.9,
        };
        assert!(in_namespace("user-42", &ns));
        let ns = Namespace {
            id: "ns1".to_owned(),
            start: 0.0,
            end: 0.8,
        };
        assert!(!in_namespace("user-42", &ns));
    }

    #[test]
    fn query_string() {
        let url = "https://example.com/page?exp1=1&other=abc";
        assert_eq!(query_string_override("exp1", url, 2), Some(1));
        assert_eq!(query_string_override("exp1", url, 1), None);
        assert_eq!(query_string_override("other", url, 2), None);
        assert_eq!(query_string_override("missing", url, 2), None);
        assert_eq!(query_string_override("exp1", "not a url", 2), None);
    }
}
