use std::sync::{Arc, Barrier};
use std::thread;

use bookcache::{Cache, DeleteOutcome, SetOutcome};

const THREADS: usize = 8;

#[test]
fn test_concurrent_disjoint_writers() {
    let cache = Arc::new(Cache::new(1 << 20).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..500 {
                    let key = format!("t{}-k{}", t, i);
                    assert_eq!(cache.set(key.as_bytes(), key.as_bytes()), SetOutcome::Inserted);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), THREADS * 500);
    for t in 0..THREADS {
        for i in 0..500 {
            let key = format!("t{}-k{}", t, i);
            assert_eq!(cache.get(key.as_bytes()).as_deref(), Some(key.as_bytes()));
        }
    }
    cache.check_invariants().unwrap();
}

#[test]
fn test_concurrent_mixed_under_eviction() {
    let budget = 4096;
    let cache = Arc::new(Cache::new(budget).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..2000usize {
                    let key = format!("k{}", (i * 7 + t) % 300);
                    match i % 4 {
                        0 | 1 => {
                            let value = vec![t as u8; i % 64];
                            assert!(cache.set(key.as_bytes(), &value).is_stored());
                        }
                        2 => {
                            if let Some(value) = cache.get(key.as_bytes()) {
                                // A value is always written whole by one thread
                                assert!(value.windows(2).all(|w| w[0] == w[1]));
                            }
                        }
                        _ => {
                            cache.delete(key.as_bytes());
                        }
                    }
                    assert!(cache.space_used() <= budget);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cache.space_used() <= budget);
    cache.check_invariants().unwrap();
}

#[test]
fn test_concurrent_readers_share_hot_key() {
    let cache = Arc::new(Cache::new(1024).unwrap());
    cache.set(b"hot", b"value");
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..1000 {
                    assert_eq!(cache.get(b"hot").as_deref(), Some(&b"value"[..]));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.stats().hits(), (THREADS * 1000) as u64);
    assert_eq!(cache.delete(b"hot"), DeleteOutcome::Deleted);
    cache.check_invariants().unwrap();
}
