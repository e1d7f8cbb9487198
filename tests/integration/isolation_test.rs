use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use txcache::{CacheConfig, IsolationLevel, LockMode, TransactionState};

#[path = "../common/mod.rs"]
mod common;
use common::{
    INITIAL_VALUE, KEYS, Op, PESSIMISTIC, all_values, committed, run_two_transactions,
    seeded_manager, wait_until_blocked,
};

const RC: IsolationLevel = IsolationLevel::ReadCommitted;
const RR: IsolationLevel = IsolationLevel::RepeatableRead;

#[test]
fn test_put_blocks_until_holder_commits() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());

    let mut tx1 = tm.begin(PESSIMISTIC, RC);
    tm.put(&mut tx1, 0, "TX-1".to_string())?;

    let mut tx2 = tm.begin(PESSIMISTIC, RC);
    let tx2_id = tx2.id();

    let handle = {
        let tm = tm.clone();
        thread::spawn(move || -> Result<String> {
            tm.put(&mut tx2, 0, "TX-2".to_string())?;
            // Only reachable once TX-1 has committed its value
            let seen = tm.store().read(&0).unwrap_or_default();
            for key in 1..3 {
                tm.put(&mut tx2, key, "TX-2".to_string())?;
            }
            tm.commit(&mut tx2)?;
            Ok(seen)
        })
    };

    wait_until_blocked(&tm, tx2_id);

    // Key 0 is never torn or missing while TX-2 waits
    assert_eq!(committed(&tm), all_values(INITIAL_VALUE));

    tm.put(&mut tx1, 1, "TX-1".to_string())?;
    tm.put(&mut tx1, 2, "TX-1".to_string())?;
    assert!(tm.lock_table().is_waiting(tx2_id));
    tm.commit(&mut tx1)?;

    let seen_by_tx2 = handle.join().unwrap()?;
    assert_eq!(seen_by_tx2, "TX-1");
    assert_eq!(committed(&tm), all_values("TX-2"));
    assert_eq!(tm.lock_table().lock_count(), 0);
    Ok(())
}

#[test]
fn test_get_waits_for_uncommitted_put() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());

    let mut writer = tm.begin(PESSIMISTIC, RR);
    tm.put(&mut writer, 0, "TX-1".to_string())?;

    let mut reader = tm.begin(PESSIMISTIC, RC);
    let reader_id = reader.id();
    let handle = {
        let tm = tm.clone();
        thread::spawn(move || tm.get(&mut reader, &0).map(|value| (value, reader)))
    };

    wait_until_blocked(&tm, reader_id);
    tm.commit(&mut writer)?;

    let (value, mut reader) = handle.join().unwrap()?;
    assert_eq!(value, Some("TX-1".to_string()));
    tm.commit(&mut reader)?;
    Ok(())
}

#[test]
fn test_read_committed_allows_non_repeatable_read() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());
    let mut reader = tm.begin(PESSIMISTIC, RC);

    let first = tm.get(&mut reader, &1)?;
    assert_eq!(first.as_deref(), Some(INITIAL_VALUE));

    // A concurrent writer commits in between the two reads
    let writer = {
        let tm = tm.clone();
        thread::spawn(move || {
            tm.run_in_transaction(PESSIMISTIC, RC, |tm, txn| {
                tm.put(txn, 1, "TX-2".to_string())
            })
        })
    };
    writer.join().unwrap()?;

    let second = tm.get(&mut reader, &1)?;
    assert_eq!(second.as_deref(), Some("TX-2"));
    tm.commit(&mut reader)?;
    Ok(())
}

#[test]
fn test_repeatable_read_returns_same_value() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());
    let mut reader = tm.begin(PESSIMISTIC, RR);

    let first = tm.get(&mut reader, &1)?;
    assert_eq!(tm.lock_table().holders(&1), vec![(reader.id(), LockMode::Shared)]);

    let mut writer = tm.begin(PESSIMISTIC, RC);
    let writer_id = writer.id();
    let handle = {
        let tm = tm.clone();
        thread::spawn(move || {
            tm.put(&mut writer, 1, "TX-2".to_string())?;
            tm.commit(&mut writer)
        })
    };

    wait_until_blocked(&tm, writer_id);
    let second = tm.get(&mut reader, &1)?;
    assert_eq!(first, second);
    assert_eq!(second.as_deref(), Some(INITIAL_VALUE));
    tm.commit(&mut reader)?;

    handle.join().unwrap()?;
    assert_eq!(tm.store().read(&1).as_deref(), Some("TX-2"));
    Ok(())
}

#[test]
fn test_repeatable_read_readers_share_locks() -> Result<()> {
    let tm = seeded_manager(CacheConfig::default());
    let barrier = Barrier::new(2);

    let results = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let tm = &tm;
                let barrier = &barrier;
                s.spawn(move |_| -> Result<Vec<Option<String>>> {
                    let mut txn = tm.begin(PESSIMISTIC, RR);
                    let mut seen = Vec::new();
                    for key in KEYS {
                        seen.push(tm.get(&mut txn, &key)?);
                    }
                    // Both transactions hold all read locks at this point
                    barrier.wait();
                    for key in KEYS {
                        seen.push(tm.get(&mut txn, &key)?);
                    }
                    tm.commit(&mut txn)?;
                    assert_eq!(txn.state(), TransactionState::Committed);
                    Ok(seen)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    for seen in results {
        let seen = seen?;
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|value| value.as_deref() == Some(INITIAL_VALUE)));
    }
    assert_eq!(tm.lock_table().lock_count(), 0);
    Ok(())
}

#[test]
fn test_two_transaction_matrix() {
    let isolations = [(RC, RC), (RR, RR), (RR, RC), (RC, RR)];
    let operations = [
        (Op::Get, Op::Get),
        (Op::Get, Op::Put),
        (Op::Put, Op::Get),
        (Op::Put, Op::Put),
    ];

    for (iso1, iso2) in isolations {
        for (op1, op2) in operations {
            let tm = seeded_manager(CacheConfig::default());
            let (tx1, tx2) =
                run_two_transactions(&tm, (op1, iso1), (op2, iso2), Duration::from_millis(20));

            let case = format!("TX1 [{:?},{}], TX2 [{:?},{}]", op1, iso1, op2, iso2);
            assert!(tx1.is_ok(), "{}: TX-1 failed: {:?}", case, tx1);
            assert!(tx2.is_ok(), "{}: TX-2 failed: {:?}", case, tx2);

            let expected = match (op1, op2) {
                (_, Op::Put) => all_values("TX-2"),
                (Op::Put, Op::Get) => all_values("TX-1"),
                (Op::Get, Op::Get) => all_values(INITIAL_VALUE),
            };
            assert_eq!(committed(&tm), expected, "{}", case);
            assert!(tm.active_transaction_ids().is_empty(), "{}", case);
            assert_eq!(tm.lock_table().lock_count(), 0, "{}", case);
        }
    }
}
