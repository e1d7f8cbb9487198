use std::sync::Barrier;
use std::thread;

use anyhow::Result;
use txcache::{CacheConfig, IsolationLevel, TransactionError, TransactionState};

#[path = "../common/mod.rs"]
mod common;
use common::{INITIAL_VALUE, PESSIMISTIC, seeded_manager, wait_until_blocked};

#[test]
fn test_crossed_writers_have_exactly_one_victim() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());
    let barrier = Barrier::new(2);

    let outcomes = crossbeam::thread::scope(|s| {
        // Begun in order so that TX-2 is the more recent transaction
        let plans = [
            (tm.begin(PESSIMISTIC, IsolationLevel::ReadCommitted), "TX-1", 0, 1),
            (tm.begin(PESSIMISTIC, IsolationLevel::ReadCommitted), "TX-2", 1, 0),
        ];
        let handles: Vec<_> = plans
            .into_iter()
            .map(|(mut txn, name, first, second)| {
                let tm = &tm;
                let barrier = &barrier;
                s.spawn(move |_| {
                    tm.put(&mut txn, first, name.to_string())?;
                    barrier.wait();
                    match tm.put(&mut txn, second, name.to_string()) {
                        Ok(()) => {
                            tm.commit(&mut txn)?;
                            Ok((name, txn.state()))
                        }
                        Err(TransactionError::Deadlock(_)) => Ok((name, txn.state())),
                        Err(e) => Err(e),
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    let mut survivors = Vec::new();
    let mut victims = Vec::new();
    for outcome in outcomes {
        let (name, state) = outcome?;
        match state {
            TransactionState::Committed => survivors.push(name),
            TransactionState::RolledBack => victims.push(name),
            other => panic!("{} ended in {:?}", name, other),
        }
    }

    assert_eq!(survivors.len(), 1);
    assert_eq!(victims.len(), 1);
    // The more recently started transaction is the victim
    assert_eq!(victims[0], "TX-2");

    let survivor = survivors[0];
    assert_eq!(tm.store().read(&0).as_deref(), Some(survivor));
    assert_eq!(tm.store().read(&1).as_deref(), Some(survivor));
    assert_eq!(tm.lock_table().lock_count(), 0);
    assert!(tm.active_transaction_ids().is_empty());
    Ok(())
}

#[test]
fn test_requester_closing_cycle_is_rolled_back() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());

    let mut tx1 = tm.begin(PESSIMISTIC, IsolationLevel::RepeatableRead);
    let mut tx2 = tm.begin(PESSIMISTIC, IsolationLevel::RepeatableRead);
    let tx1_id = tx1.id();
    let tx2_id = tx2.id();

    tm.put(&mut tx1, 0, "TX-1".to_string())?;
    tm.put(&mut tx2, 1, "TX-2".to_string())?;

    let handle = {
        let tm = tm.clone();
        thread::spawn(move || -> Result<_, TransactionError> {
            tm.put(&mut tx1, 1, "TX-1".to_string())?;
            tm.commit(&mut tx1)?;
            Ok(tx1)
        })
    };
    wait_until_blocked(&tm, tx1_id);

    let result = tm.put(&mut tx2, 0, "TX-2".to_string());
    assert_eq!(result, Err(TransactionError::Deadlock(tx2_id)));
    assert_eq!(tx2.state(), TransactionState::RolledBack);
    assert!(!tm.transaction_exists(tx2_id));

    // Rolling back the victim again is rejected
    assert!(matches!(
        tm.rollback(&mut tx2),
        Err(TransactionError::InvalidState { .. })
    ));

    let tx1 = handle.join().unwrap()?;
    assert_eq!(tx1.state(), TransactionState::Committed);
    assert_eq!(tm.store().read(&0).as_deref(), Some("TX-1"));
    assert_eq!(tm.store().read(&1).as_deref(), Some("TX-1"));
    Ok(())
}

#[test]
fn test_blocked_victim_is_woken_and_rolled_back() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());

    let mut tx1 = tm.begin(PESSIMISTIC, IsolationLevel::ReadCommitted);
    let mut tx2 = tm.begin(PESSIMISTIC, IsolationLevel::ReadCommitted);
    let tx2_id = tx2.id();

    tm.put(&mut tx1, 0, "TX-1".to_string())?;
    tm.put(&mut tx2, 1, "TX-2".to_string())?;

    // TX-2 blocks first, TX-1 closes the cycle afterwards
    let handle = {
        let tm = tm.clone();
        thread::spawn(move || {
            let result = tm.put(&mut tx2, 0, "TX-2".to_string());
            (result, tx2)
        })
    };
    wait_until_blocked(&tm, tx2_id);

    tm.put(&mut tx1, 1, "TX-1".to_string())?;

    let (result, tx2) = handle.join().unwrap();
    assert_eq!(result, Err(TransactionError::Deadlock(tx2_id)));
    assert_eq!(tx2.state(), TransactionState::RolledBack);

    tm.commit(&mut tx1)?;
    assert_eq!(tm.store().read(&0).as_deref(), Some("TX-1"));
    assert_eq!(tm.store().read(&1).as_deref(), Some("TX-1"));
    assert_eq!(tm.store().read(&2).as_deref(), Some(INITIAL_VALUE));
    Ok(())
}

#[test]
fn test_upgrading_readers_deadlock() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());

    let mut tx1 = tm.begin(PESSIMISTIC, IsolationLevel::RepeatableRead);
    let mut tx2 = tm.begin(PESSIMISTIC, IsolationLevel::RepeatableRead);
    let tx1_id = tx1.id();
    let tx2_id = tx2.id();

    tm.get(&mut tx1, &2)?;
    tm.get(&mut tx2, &2)?;

    let handle = {
        let tm = tm.clone();
        thread::spawn(move || -> Result<_, TransactionError> {
            tm.put(&mut tx1, 2, "TX-1".to_string())?;
            tm.commit(&mut tx1)?;
            Ok(tx1)
        })
    };
    wait_until_blocked(&tm, tx1_id);

    assert_eq!(
        tm.put(&mut tx2, 2, "TX-2".to_string()),
        Err(TransactionError::Deadlock(tx2_id))
    );

    let tx1 = handle.join().unwrap()?;
    assert_eq!(tx1.state(), TransactionState::Committed);
    assert_eq!(tm.store().read(&2).as_deref(), Some("TX-1"));
    Ok(())
}

#[test]
fn test_three_way_cycle() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());

    let mut txns: Vec<_> = (0..3)
        .map(|_| tm.begin(PESSIMISTIC, IsolationLevel::ReadCommitted))
        .collect();
    for (key, txn) in txns.iter_mut().enumerate() {
        let name = format!("TX-{}", txn.id());
        tm.put(txn, key as i32, name)?;
    }

    let mut tx3 = txns.pop().unwrap();
    let mut tx2 = txns.pop().unwrap();
    let mut tx1 = txns.pop().unwrap();
    let (tx1_id, tx2_id, tx3_id) = (tx1.id(), tx2.id(), tx3.id());

    // TX-1 waits for TX-2, TX-2 waits for TX-3
    let first = {
        let tm = tm.clone();
        thread::spawn(move || -> Result<_, TransactionError> {
            tm.put(&mut tx1, 1, "TX-1".to_string())?;
            tm.commit(&mut tx1)?;
            Ok(tx1)
        })
    };
    wait_until_blocked(&tm, tx1_id);

    let second = {
        let tm = tm.clone();
        thread::spawn(move || -> Result<_, TransactionError> {
            tm.put(&mut tx2, 2, "TX-2".to_string())?;
            tm.commit(&mut tx2)?;
            Ok(tx2)
        })
    };
    wait_until_blocked(&tm, tx2_id);

    // TX-3 closes the cycle and is the newest
    assert_eq!(
        tm.put(&mut tx3, 0, "TX-3".to_string()),
        Err(TransactionError::Deadlock(tx3_id))
    );

    let tx2 = second.join().unwrap()?;
    let tx1 = first.join().unwrap()?;
    assert_eq!(tx1.state(), TransactionState::Committed);
    assert_eq!(tx2.state(), TransactionState::Committed);

    assert_eq!(tm.store().read(&0).as_deref(), Some("TX-1"));
    assert_eq!(tm.store().read(&1).as_deref(), Some("TX-1"));
    assert_eq!(tm.store().read(&2).as_deref(), Some("TX-2"));
    assert_eq!(tm.lock_table().lock_count(), 0);
    Ok(())
}
