//! Key-to-partition routing for shuffles.
//!
//! Both variants share one contract: `partitions()` output slots, and
//! `index_of(key)` in `[0, partitions)`. Routing must be deterministic across
//! workers, so the hash variant hashes the canonical encoding and the range
//! variant carries its upper bounds with it.

use crate::canon;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Clone)]
pub enum Partitioner {
    Hash(HashPartitioner),
    Range(RangePartitioner),
}

impl Partitioner {
    pub fn hash(partitions: usize) -> Self {
        Partitioner::Hash(HashPartitioner { partitions })
    }

    pub fn partitions(&self) -> usize {
        match self {
            Partitioner::Hash(p) => p.partitions,
            Partitioner::Range(p) => p.partitions,
        }
    }

    pub fn index_of(&self, key: &Value) -> usize {
        match self {
            Partitioner::Hash(p) => p.index_of(key),
            Partitioner::Range(p) => p.index_of(key),
        }
    }
}

/// `hash(canon(key)) mod n` with the fixed multiplier-31 rolling hash.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    pub partitions: usize,
}

impl HashPartitioner {
    pub fn index_of(&self, key: &Value) -> usize {
        canon::hash31(&canon::encode(key)) as usize % self.partitions.max(1)
    }
}

/// Routes by comparing the key against sampled upper bounds.
///
/// `index_of` returns the smallest `i` with `key < bounds[i]`, or the last
/// partition when no bound is larger. A descending partitioner mirrors the
/// index so that partition 0 receives the largest keys and concatenating
/// partitions in id order yields a globally sorted sequence either way.
#[derive(Clone)]
pub struct RangePartitioner {
    pub partitions: usize,
    pub bounds: Vec<Value>,
    pub ascending: bool,
}

impl RangePartitioner {
    /// Build from a driver-collected sample of keys. The sample is sorted and
    /// `n - 1` evenly spaced bounds are selected; duplicate bounds from
    /// skewed samples are dropped, trading empty buckets for fuller ones.
    pub fn from_sample(mut sample: Vec<Value>, partitions: usize, ascending: bool) -> Self {
        sample.sort_by(canon::value_cmp);
        let mut bounds: Vec<Value> = Vec::new();
        if !sample.is_empty() && partitions > 1 {
            for i in 1..partitions {
                let at = i * sample.len() / partitions;
                let candidate = sample[at.min(sample.len() - 1)].clone();
                let duplicate = bounds
                    .last()
                    .is_some_and(|b| canon::value_cmp(b, &candidate) == Ordering::Equal);
                if !duplicate {
                    bounds.push(candidate);
                }
            }
        }
        Self {
            partitions,
            bounds,
            ascending,
        }
    }

    pub fn index_of(&self, key: &Value) -> usize {
        let last = self.partitions.max(1) - 1;
        let base = self
            .bounds
            .iter()
            .position(|b| canon::value_cmp(key, b) == Ordering::Less)
            .unwrap_or(last);
        if self.ascending {
            base
        } else {
            last - base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_routing_is_deterministic_and_in_range() {
        let p = Partitioner::hash(7);
        for i in 0..100 {
            let key = json!({"user": i});
            let a = p.index_of(&key);
            let b = p.index_of(&key);
            assert_eq!(a, b);
            assert!(a < 7);
        }
    }

    #[test]
    fn range_bounds_split_sorted_keys() {
        let sample: Vec<Value> = (0..100).map(|i| json!(i)).collect();
        let p = RangePartitioner::from_sample(sample, 4, true);
        assert_eq!(p.index_of(&json!(0)), 0);
        assert_eq!(p.index_of(&json!(99)), 3);
        // monotone: larger keys never land in smaller partitions
        let mut prev = 0;
        for i in 0..100 {
            let idx = p.index_of(&json!(i));
            assert!(idx >= prev);
            prev = idx;
        }
    }

    #[test]
    fn descending_range_mirrors_index() {
        let sample: Vec<Value> = (0..100).map(|i| json!(i)).collect();
        let p = RangePartitioner::from_sample(sample, 4, false);
        assert_eq!(p.index_of(&json!(99)), 0);
        assert_eq!(p.index_of(&json!(0)), 3);
    }

    #[test]
    fn skewed_sample_dedups_bounds() {
        let sample: Vec<Value> = std::iter::repeat(json!(5)).take(50).collect();
        let p = RangePartitioner::from_sample(sample, 4, true);
        assert!(p.bounds.len() <= 1);
        assert!(p.index_of(&json!(5)) < 4);
    }
}
