// End-to-end scenarios for the off-heap cache: put/get/remove round trips,
// putIfAbsent semantics, concurrent access from multiple threads, and
// allocation-failure behavior at the memory budget boundary.

use native_cache::{AllocatorConfig, CacheConfig, CacheError, NativeCache};
use std::sync::Arc;
use std::thread;

fn small_cache() -> NativeCache<String> {
    let allocator_config = AllocatorConfig { max_memory_size: 256 * 1024 * 1024, arena_count: Some(2) };
    let cache_config = CacheConfig { concurrency: 16, initial_capacity: 1000, load_factor: 0.75, ..Default::default() };
    NativeCache::new(allocator_config, cache_config).unwrap()
}

#[test]
fn scenario_1_put_size_clear() {
    let cache = small_cache();
    cache.set("k".into(), b"value123").unwrap();
    assert_eq!(cache.len(), 1);
    cache.clear();
    assert_eq!(cache.stats().allocator.total_allocated_bytes, 0);
}

#[test]
fn scenario_2_put_overwrite_reflects_only_new_value() {
    let cache = small_cache();
    cache.set("k".into(), b"value1").unwrap();
    cache.set("k".into(), b"value23").unwrap();
    assert_eq!(cache.get(&"k".to_string()).unwrap(), b"value23");
    assert_eq!(cache.len(), 1);
}

#[test]
fn scenario_3_put_if_absent_keeps_first_and_drops_second() {
    let cache = small_cache();
    let v1 = cache.put_if_absent("k".into(), b"v1").unwrap();
    assert_eq!(v1, b"v1");
    let v2 = cache.put_if_absent("k".into(), b"v2").unwrap();
    assert_eq!(v2, b"v1");
    assert_eq!(cache.get(&"k".to_string()).unwrap(), b"v1");
}

#[test]
fn scenario_4_put_then_remove_empties_cache() {
    let cache = small_cache();
    cache.set("k".into(), b"value").unwrap();
    assert!(cache.remove(&"k".to_string()));
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.stats().allocator.total_allocated_bytes, 0);
}

#[test]
fn scenario_5_concurrent_ops_on_disjoint_key_sets() {
    let cache = Arc::new(small_cache());
    let mut handles = Vec::new();
    for t in 0..4 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..1000 {
                let key = format!("t{t}-k{i}");
                cache.set(key.clone(), b"payload").unwrap();
                assert_eq!(cache.get(&key).unwrap(), b"payload");
                if i % 3 == 0 {
                    cache.remove(&key);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let expected_live: usize = (0..4)
        .map(|_| (0..1000).filter(|i| i % 3 != 0).count())
        .sum();
    assert_eq!(cache.len(), expected_live);

    // Removed buffers are routed through the freeing thread's cache rather
    // than returned to the arena immediately (see thread_cache.rs), so
    // `allocated_bytes` only ever trends down to the live total, never
    // exactly equals it while queued-but-unused capacity sits cached.
    let allocator_total: usize = cache.stats().allocator.total_allocated_bytes;
    assert!(allocator_total >= expected_live * 16);
}

#[test]
fn scenario_6_allocation_failure_at_budget_boundary_then_recovers() {
    let allocator_config = AllocatorConfig { max_memory_size: 16 * 1024 * 1024, arena_count: Some(1) };
    let cache_config = CacheConfig::default();
    let cache: NativeCache<String> = NativeCache::new(allocator_config, cache_config).unwrap();

    let payload = vec![0u8; 1024 * 1024];
    let mut inserted = Vec::new();
    let mut failure_hit = false;
    for i in 0..64 {
        let key = format!("big-{i}");
        match cache.set(key.clone(), &payload) {
            Ok(()) => inserted.push(key),
            Err(CacheError::AllocationFailure { .. }) => {
                failure_hit = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(failure_hit, "expected allocator to exhaust its budget");

    let victim = inserted.pop().expect("at least one key must have been inserted before exhaustion");
    assert!(cache.remove(&victim));
    let retry_key = "retry".to_string();
    cache.set(retry_key.clone(), &payload).unwrap();
    assert_eq!(cache.get(&retry_key).unwrap(), payload);
}
