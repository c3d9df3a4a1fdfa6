/*!
 * Memory Pool Tests
 * Freelist retention, batch refill, caps, and lock sharing
 */

use dnsmem::{MemError, MemoryContext, MemoryPool, PoolLock};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn defaults_match_the_contract() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 64).unwrap();
    assert_eq!(pool.element_size(), 64);
    assert_eq!(pool.free_max(), 1);
    assert_eq!(pool.fill_count(), 1);
    assert_eq!(pool.max_alloc(), usize::MAX);
    assert_eq!(pool.allocated(), 0);
    assert_eq!(pool.free_count(), 0);
}

#[test]
fn batch_refill_pulls_one_burst() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 64).unwrap();
    pool.set_fill_count(8);
    pool.set_free_max(4);

    // eight consecutive gets are satisfied by a single burst of eight
    let slots: Vec<_> = (0..8).map(|_| pool.get().unwrap()).collect();
    assert_eq!(ctx.in_use(), 8 * 64);
    assert_eq!(pool.allocated(), 8);
    assert_eq!(pool.free_count(), 0);

    // returning them keeps free_max slots and hands the rest back
    for slot in slots {
        pool.put(slot);
    }
    assert_eq!(pool.allocated(), 0);
    assert_eq!(pool.free_count(), 4);
    assert_eq!(ctx.in_use(), 4 * 64);
}

#[test]
fn freelist_retains_at_most_free_max() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 32).unwrap();
    pool.set_free_max(3);

    let slot = pool.get().unwrap();
    pool.put(slot);
    assert_eq!(pool.free_count(), 1);

    let slots: Vec<_> = (0..5).map(|_| pool.get().unwrap()).collect();
    for slot in slots {
        pool.put(slot);
    }
    assert_eq!(pool.free_count(), 3);
}

#[test]
fn max_alloc_caps_outstanding_slots() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 16).unwrap();
    pool.set_max_alloc(2);

    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    match pool.get() {
        Err(MemError::QuotaExceeded { used, limit, .. }) => {
            assert_eq!(used, 2);
            assert_eq!(limit, 2);
        }
        other => panic!("expected a quota error, got {:?}", other),
    }

    pool.put(a);
    let c = pool.get().unwrap();
    pool.put(b);
    pool.put(c);
}

#[test]
fn parent_quota_failures_propagate() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    ctx.set_quota(100);
    let pool = MemoryPool::create(&ctx, 64).unwrap();

    let slot = pool.get().unwrap();
    assert!(matches!(
        pool.get(),
        Err(MemError::QuotaExceeded { .. })
    ));
    pool.put(slot);
}

#[test]
fn recycled_slots_are_not_scribbled_again() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 16).unwrap();

    let slot = pool.get().unwrap();
    unsafe { std::ptr::write_bytes(slot.as_ptr(), 0x77, 16) };
    let addr = slot.as_ptr();
    pool.put(slot);

    let slot = pool.get().unwrap();
    assert_eq!(slot.as_ptr(), addr);
    let bytes = unsafe { std::slice::from_raw_parts(slot.as_ptr(), 16) };
    assert!(bytes.iter().all(|&b| b == 0x77));
    pool.put(slot);
}

#[test]
fn names_are_clamped_to_fifteen_chars() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 8).unwrap();
    pool.set_name("a-very-long-pool-name");
    assert_eq!(pool.name().unwrap(), "a-very-long-poo");
}

#[test]
fn pool_stats_flow_through_the_context() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 128).unwrap();
    pool.set_name("events");

    let slot = pool.get().unwrap();
    let stats = ctx.stats_snapshot();
    assert_eq!(stats.pools.len(), 1);
    assert_eq!(stats.pools[0].name.as_deref(), Some("events"));
    assert_eq!(stats.pools[0].element_size, 128);
    assert_eq!(stats.pools[0].allocated, 1);
    assert_eq!(stats.pools[0].free_count, 0);
    pool.put(slot);
}

#[test]
fn sibling_pools_share_one_lock() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let lock = Arc::new(PoolLock::new());
    let small = MemoryPool::create(&ctx, 64).unwrap();
    let large = MemoryPool::create(&ctx, 256).unwrap();
    small.associate_lock(Arc::clone(&lock));
    large.associate_lock(Arc::clone(&lock));

    let threads: Vec<_> = [small, large]
        .into_iter()
        .map(|pool| {
            std::thread::spawn(move || {
                for _ in 0..64 {
                    let slot = pool.get().unwrap();
                    pool.put(slot);
                }
                pool
            })
        })
        .collect();
    for thread in threads {
        let pool = thread.join().unwrap();
        assert_eq!(pool.allocated(), 0);
    }
}

#[test]
#[should_panic(expected = "already has an associated lock")]
fn second_associate_lock_is_refused() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 8).unwrap();
    pool.associate_lock(Arc::new(PoolLock::new()));
    pool.associate_lock(Arc::new(PoolLock::new()));
}

#[test]
#[should_panic(expected = "associate_lock after first get")]
fn associate_lock_after_get_is_refused() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let pool = MemoryPool::create(&ctx, 8).unwrap();
    let slot = pool.get().unwrap();
    pool.put(slot);
    pool.associate_lock(Arc::new(PoolLock::new()));
}

#[test]
#[should_panic(expected = "outstanding allocations")]
fn destroy_with_outstanding_slots_is_fatal() {
    let ctx = Box::leak(Box::new(MemoryContext::create(0, 0).unwrap()));
    let pool = MemoryPool::create(ctx, 64).unwrap();
    let _slot = pool.get().unwrap();
    drop(pool);
}

#[test]
#[should_panic(expected = "pool put size mismatch")]
fn cross_pool_put_is_fatal() {
    let ctx = Box::leak(Box::new(MemoryContext::create(0, 0).unwrap()));
    let small = Box::leak(Box::new(MemoryPool::create(ctx, 16).unwrap()));
    let large = Box::leak(Box::new(MemoryPool::create(ctx, 64).unwrap()));
    let slot = large.get().unwrap();
    small.put(slot);
}

#[test]
#[should_panic(expected = "element size")]
fn zero_element_size_is_refused() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let _ = MemoryPool::create(&ctx, 0);
}

#[test]
fn pool_creation_on_terminal_context_is_refused() {
    let ctx = MemoryContext::create(0, 0).unwrap();
    let held = ctx.attach().unwrap();
    ctx.destroy();
    assert!(MemoryPool::create(&held, 64).is_err());
}
