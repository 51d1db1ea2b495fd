//! Integration tests for the extent allocator under churn.

use std::sync::Arc;
use std::thread;

use hybridswap::extent::{ExtentError, ExtentSpace};
use hybridswap::NO_OWNER;

#[test]
fn test_churn_keeps_counters_consistent() {
    let space = Arc::new(ExtentSpace::new(128, 4));

    let workers: Vec<_> = (1..=4u16)
        .map(|owner| {
            let space = space.clone();
            thread::spawn(move || {
                let mut held = Vec::new();
                for round in 0..500usize {
                    match space.allocate(owner) {
                        Ok(e) => {
                            space.add_live(e, 64);
                            space.release_exclusive(e);
                            held.push(e);
                        }
                        Err(ExtentError::NoSpace { .. }) => {}
                    }
                    if round % 3 == 0 && !held.is_empty() {
                        let e = held.swap_remove(round % held.len());
                        // Nobody else claims our extents here.
                        assert!(space.claim_exclusive(e));
                        assert!(space.detach(e));
                        assert_eq!(space.sub_live(e, 64), 0);
                        space.free(e);
                    }
                }
                held
            })
        })
        .collect();

    let mut held = 0;
    for worker in workers {
        held += worker.join().unwrap().len();
    }

    assert_eq!(space.live_extents(), held);
    assert_eq!(space.fragments(), space.count_fragments());
    let per_owner: usize = (1..=4).map(|o| space.owner_extents(o)).sum();
    assert_eq!(per_owner, held);
    for e in 0..space.capacity() {
        assert_eq!(space.is_allocated(e), space.owner_of(e) != NO_OWNER);
        assert_eq!(space.is_allocated(e), space.is_linked(e));
    }
    assert!(space.utilization() <= 1.0);
}

#[test]
fn test_owner_lru_orders_by_release() {
    let space = ExtentSpace::new(8, 1);
    let ids: Vec<_> = (0..3).map(|_| space.allocate(1).unwrap()).collect();
    for &e in &ids {
        space.release_exclusive(e);
    }

    let lru = space.table().lock(space.owner_head(1));
    let order: Vec<_> = lru.iter().map(|node| space.extent_of_node(node)).collect();
    assert_eq!(order, vec![ids[2], ids[1], ids[0]]);
}
