//! Slot election under contention

use epochguard::config::CoordinationConfig;
use epochguard::election::PASSIVE_SLOT;
use epochguard::SlotAllocator;
use std::collections::HashSet;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

fn config(dir: &std::path::Path) -> CoordinationConfig {
    let mut config = CoordinationConfig::with_base_path(dir.join("data"));
    config.lock_dir = Some(dir.join("locks"));
    config
}

#[test]
fn test_forty_contenders_for_thirty_two_slots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let contenders = 40;

    let start = Arc::new(Barrier::new(contenders));
    let hold = Arc::new(Barrier::new(contenders + 1));
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let config = config.clone();
            let start = start.clone();
            let hold = hold.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                start.wait();
                let slot = SlotAllocator::new(&config);
                tx.send((slot.slot_id(), slot.is_leader()))
                    .expect("report slot");
                // Keep the slot until everyone has reported
                hold.wait();
                slot.release();
            })
        })
        .collect();
    drop(tx);

    let results: Vec<(i32, bool)> = rx.iter().take(contenders).collect();
    hold.wait();
    for handle in handles {
        handle.join().expect("contender panicked");
    }

    let held: Vec<i32> = results
        .iter()
        .map(|(slot, _)| *slot)
        .filter(|slot| *slot != PASSIVE_SLOT)
        .collect();
    let distinct: HashSet<i32> = held.iter().copied().collect();

    assert_eq!(held.len(), 32);
    assert_eq!(distinct.len(), 32, "no slot was handed out twice");
    assert!(distinct.iter().all(|slot| (0..32).contains(slot)));
    assert_eq!(results.iter().filter(|(_, leader)| *leader).count(), 1);
    assert_eq!(
        results.iter().filter(|(slot, _)| *slot == PASSIVE_SLOT).count(),
        8
    );
}

#[test]
fn test_released_slot_goes_to_next_starter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());

    let leader = SlotAllocator::new(&config);
    let follower = SlotAllocator::new(&config);
    assert!(leader.is_leader());
    assert_eq!(follower.slot_id(), 1);

    leader.release();
    // The running follower keeps its slot; only a new process can take 0
    assert_eq!(follower.slot_id(), 1);
    let newcomer = SlotAllocator::new(&config);
    assert!(newcomer.is_leader());
}

#[test]
fn test_smaller_slot_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.slot_count = 2;

    let a = SlotAllocator::new(&config);
    let b = SlotAllocator::new(&config);
    let c = SlotAllocator::new(&config);

    assert_eq!((a.slot_id(), b.slot_id()), (0, 1));
    assert!(!c.has_slot());
    assert_eq!(c.slot_id(), PASSIVE_SLOT);
}
