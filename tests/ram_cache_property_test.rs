//! Property-based tests for the RAM cache
//!
//! Random sequences of `put` / `get` / `delete` are replayed against both the
//! cache and a naive vector-backed LRU model. After every step the observable
//! results must agree, resident bytes must stay within the total limit, and
//! every resident entry must be smaller than the per-entry limit.

use bytes::Bytes;
use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};
use quickcheck_macros::quickcheck;
use s3_build_cache::ram_cache::RamCache;

const MAX_ENTRY_SIZE: u64 = 20;
const MAX_TOTAL_SIZE: u64 = 60;
const KEYS: &[&str] = &["ac/a", "ac/b", "cas/c", "cas/d", "cas/e", "cas/f"];

#[derive(Debug, Clone)]
enum Op {
    Put(&'static str, Vec<u8>),
    Get(&'static str),
    Delete(&'static str),
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        let key = *g.choose(KEYS).unwrap();
        match u8::arbitrary(g) % 4 {
            0 | 1 => {
                // Sizes straddle the per-entry limit.
                let len = usize::arbitrary(g) % (MAX_ENTRY_SIZE as usize + 6);
                let fill = u8::arbitrary(g);
                Op::Put(key, vec![fill; len])
            }
            2 => Op::Get(key),
            _ => Op::Delete(key),
        }
    }
}

/// Reference LRU: most recently used first
#[derive(Default)]
struct Model {
    entries: Vec<(&'static str, Vec<u8>)>,
}

impl Model {
    fn size(&self) -> u64 {
        self.entries.iter().map(|(_, v)| v.len() as u64).sum()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| *k == key)
    }

    fn put(&mut self, key: &'static str, value: Vec<u8>) {
        let size = value.len() as u64;
        if size >= MAX_ENTRY_SIZE {
            return;
        }
        self.delete(key);
        while self.size() + size > MAX_TOTAL_SIZE {
            self.entries.pop();
        }
        self.entries.insert(0, (key, value));
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let idx = self.position(key)?;
        let entry = self.entries.remove(idx);
        let value = entry.1.clone();
        self.entries.insert(0, entry);
        Some(value)
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.to_string()).collect()
    }
}

fn check_invariants(cache: &RamCache) -> bool {
    if cache.current_size() > MAX_TOTAL_SIZE {
        return false;
    }
    cache.keys_by_recency().len() == cache.len()
}

#[quickcheck]
fn prop_cache_matches_lru_model(ops: Vec<Op>) -> bool {
    let mut cache = RamCache::new(true, MAX_ENTRY_SIZE, MAX_TOTAL_SIZE);
    let mut model = Model::default();

    for op in ops {
        match op {
            Op::Put(key, value) => {
                cache.put(key, Bytes::from(value.clone()));
                model.put(key, value);
            }
            Op::Get(key) => {
                let actual = cache.get(key).map(|b| b.to_vec());
                if actual != model.get(key) {
                    return false;
                }
            }
            Op::Delete(key) => {
                if cache.delete(key) != model.delete(key) {
                    return false;
                }
            }
        }

        if !check_invariants(&cache) || cache.current_size() != model.size() {
            return false;
        }
        if cache.keys_by_recency() != model.keys() {
            return false;
        }
    }

    true
}

#[quickcheck]
fn prop_every_resident_entry_is_below_entry_limit(ops: Vec<Op>) -> bool {
    let mut cache = RamCache::new(true, MAX_ENTRY_SIZE, MAX_TOTAL_SIZE);
    for op in ops {
        if let Op::Put(key, value) = op {
            cache.put(key, Bytes::from(value));
        }
    }

    cache
        .keys_by_recency()
        .iter()
        .all(|key| cache.get(key).map(|v| (v.len() as u64) < MAX_ENTRY_SIZE).unwrap_or(false))
}

#[test]
fn prop_put_then_get_returns_value() {
    fn property(len: u8, fill: u8) -> TestResult {
        let len = len as u64 % (MAX_ENTRY_SIZE * 2);
        if len >= MAX_ENTRY_SIZE {
            return TestResult::discard();
        }

        let mut cache = RamCache::new(true, MAX_ENTRY_SIZE, MAX_TOTAL_SIZE);
        let value = Bytes::from(vec![fill; len as usize]);
        cache.put("ac/key", value.clone());
        TestResult::from_bool(cache.get("ac/key") == Some(value))
    }

    QuickCheck::new()
        .tests(200)
        .quickcheck(property as fn(u8, u8) -> TestResult);
}

#[quickcheck]
fn prop_disabled_cache_stores_nothing(ops: Vec<Op>) -> bool {
    let mut cache = RamCache::new(false, MAX_ENTRY_SIZE, MAX_TOTAL_SIZE);
    for op in ops {
        if let Op::Put(key, value) = op {
            cache.put(key, Bytes::from(value));
        }
    }
    cache.is_empty() && cache.current_size() == 0
}

#[test]
fn test_least_recently_used_is_evicted_first() {
    let mut cache = RamCache::new(true, 30, 50);
    cache.put("a", Bytes::from(vec![1u8; 20]));
    cache.put("b", Bytes::from(vec![2u8; 20]));
    cache.put("c", Bytes::from(vec![3u8; 20]));

    assert!(!cache.contains("a"));
    assert!(cache.contains("b"));
    assert!(cache.contains("c"));
}

#[test]
fn test_get_promotes_entry_ahead_of_newer_one() {
    let mut cache = RamCache::new(true, 30, 50);
    cache.put("a", Bytes::from(vec![1u8; 20]));
    cache.put("b", Bytes::from(vec![2u8; 20]));
    assert!(cache.get("a").is_some());
    cache.put("c", Bytes::from(vec![3u8; 20]));

    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert_eq!(cache.keys_by_recency(), vec!["c".to_string(), "a".to_string()]);
}
