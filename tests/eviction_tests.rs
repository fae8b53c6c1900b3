//! Budget and LRU invariants across the tiers.

use std::sync::Arc;
use std::thread;

use hotswap_cache::cache::{CacheKey, HotCache, ModelResidency, TensorCache};

fn key(name: &str) -> CacheKey {
    CacheKey::new("m", name)
}

#[test]
fn test_eviction_under_pressure() {
    let cache = TensorCache::new(100);
    for name in ["A", "B", "C"] {
        cache.allocate_or_get(&key(name), 40).unwrap();
    }

    assert!(!cache.is_cached(&key("A")));
    assert_eq!(cache.cached_keys(), vec![key("B"), key("C")]);
    assert_eq!(cache.used_bytes(), 80);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_evict_lru_in_insertion_order() {
    let cache = TensorCache::new(1000);
    for name in ["A", "B", "C"] {
        cache.allocate_or_get(&key(name), 10).unwrap();
    }

    assert_eq!(cache.evict_lru(), 10);
    assert!(!cache.is_cached(&key("A")));
    assert_eq!(cache.evict_lru(), 10);
    assert!(!cache.is_cached(&key("B")));
    assert_eq!(cache.evict_lru(), 10);
    assert!(cache.is_empty());
    assert_eq!(cache.evict_lru(), 0);
}

#[test]
fn test_touch_reorders() {
    let cache = TensorCache::new(30);
    for name in ["A", "B", "C"] {
        cache.allocate_or_get(&key(name), 10).unwrap();
    }
    cache.get(&key("A")).unwrap();
    cache.allocate_or_get(&key("D"), 10).unwrap();

    assert!(cache.is_cached(&key("A")));
    assert!(!cache.is_cached(&key("B")));
}

#[test]
fn test_budget_holds_over_mixed_sequence() {
    let cache = TensorCache::new(1000);
    let sizes = [300, 120, 450, 80, 999, 10, 600, 333, 70, 500];
    for (i, size) in sizes.iter().cycle().take(60).enumerate() {
        let k = key(&format!("t{}", i % 13));
        match i % 5 {
            3 => {
                cache.evict(&k);
            }
            4 => {
                cache.evict_until_free(*size);
            }
            _ => {
                let _ = cache.allocate_or_get(&k, *size);
            }
        }
        assert!(cache.used_bytes() <= cache.budget_bytes());
        let total: usize = cache
            .cached_keys()
            .iter()
            .filter_map(|k| cache.entry_size(k))
            .sum();
        assert_eq!(total, cache.used_bytes());
    }
}

#[test]
fn test_hot_budget_holds_over_mixed_sequence() {
    let hot = HotCache::new(400);
    let source = vec![1.5f32; 120];
    let counts = [25, 60, 100, 7, 40, 99, 13, 120, 1, 50];
    for (i, count) in counts.iter().cycle().take(80).enumerate() {
        let owner = ["llama", "qwen", "phi"][i % 3];
        let k = CacheKey::new(owner, format!("w{}", i % 11));
        match i % 9 {
            4 => {
                hot.evict_model(owner);
            }
            8 => hot.clear(),
            _ => {
                hot.prefetch(&k, &source, *count).unwrap();
            }
        }
        assert!(hot.current_size() <= hot.max_size());
        assert_eq!(hot.current_size() % 4, 0);
        if i % 9 == 8 {
            assert_eq!(hot.current_size(), 0);
            assert_eq!(hot.entry_count(), 0);
        }
    }
}

#[test]
fn test_hot_budget_holds_under_concurrent_prefetch() {
    let hot = Arc::new(HotCache::new(1000));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let hot = Arc::clone(&hot);
            thread::spawn(move || {
                let source = vec![t as f32; 64];
                for i in 0..200 {
                    let k = CacheKey::new(format!("model{}", t % 3), format!("w{}", i % 17));
                    let count = 1 + (i * 7 + t) % 64;
                    hot.prefetch(&k, &source, count).unwrap();
                    assert!(hot.current_size() <= hot.max_size());
                    if i % 50 == 49 {
                        hot.evict_model(&format!("model{}", t % 3));
                    }
                    let fallback = [0.0f32; 1];
                    let _ = hot.get_or_fallback(&k, &fallback);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(hot.current_size() <= hot.max_size());
}

#[test]
fn test_oversized_prefetch_leaves_cache_unchanged() {
    // 50-byte budget, 15 floats = 60 bytes.
    let hot = HotCache::new(50);
    hot.prefetch(&key("small"), &[0.0; 4], 4).unwrap();

    assert!(!hot.prefetch(&key("big"), &[0.0; 15], 15).unwrap());
    assert_eq!(hot.entry_count(), 1);
    assert_eq!(hot.current_size(), 16);
    assert!(hot.contains(&key("small")));
}

#[test]
fn test_tiers_evict_independently() {
    let tensor = TensorCache::new(100);
    let hot = HotCache::new(100);
    tensor.allocate_or_get(&key("x"), 100).unwrap();
    hot.prefetch(&key("x"), &[0.0; 25], 25).unwrap();

    tensor.allocate_or_get(&key("y"), 100).unwrap();
    assert!(!tensor.is_cached(&key("x")));
    assert!(hot.contains(&key("x")));
}

#[test]
fn test_model_residency_uses_lru_not_insertion() {
    let residency = ModelResidency::new(10_000);
    residency.register("llama", 4_000).unwrap();
    residency.register("qwen", 4_000).unwrap();
    residency.touch("llama");

    let evicted = residency.register("sdxl", 5_000).unwrap();
    assert_eq!(evicted, vec!["qwen".to_string()]);
    assert!(residency.is_resident("llama"));
    assert!(residency.used_bytes() <= residency.budget_bytes());
}
