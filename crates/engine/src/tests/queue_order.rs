// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use aosl_core::{AoslError, ExecMode, RefObject};

use super::{unique, WAIT};
use crate::mpq;

#[test]
fn test_entries_run_in_enqueue_order() {
    let q = mpq::create(&unique("fifo")).unwrap();
    let (tx, rx) = mpsc::channel();
    for n in 0..100 {
        let tx = tx.clone();
        mpq::queue(q, None, "push", move |_| {
            let _ = tx.send(n);
        })
        .unwrap();
    }

    let seen: Vec<i32> = (0..100).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_one_entry_at_a_time_across_producers() {
    let q = mpq::create(&unique("serial")).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let (active, overlap, log) = (Arc::clone(&active), Arc::clone(&overlap), Arc::clone(&log));
            thread::spawn(move || {
                for seq in 0..50 {
                    let (active, overlap, log) = (Arc::clone(&active), Arc::clone(&overlap), Arc::clone(&log));
                    mpq::queue(q, None, "work", move |_| {
                        if active.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        log.lock().unwrap().push((producer, seq));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // Everything queued before this call has run once it returns.
    mpq::call(q, None, "barrier", |_| ()).unwrap();

    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 200);
    for producer in 0..4 {
        let order: Vec<_> = log.iter().filter(|(p, _)| *p == producer).map(|(_, seq)| *seq).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
    drop(log);
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_this_queue_and_inline_call() {
    let q = mpq::create(&unique("current")).unwrap();
    assert_eq!(mpq::this_queue(), None);

    let on_queue = mpq::call(q, None, "who", |_| mpq::this_queue()).unwrap();
    assert_eq!(on_queue, Some(q));

    // A call into the queue it is already running on must not deadlock.
    let nested = mpq::call(q, None, "outer", move |_| mpq::call(q, None, "inner", |_| 7)).unwrap();
    assert_eq!(nested.unwrap(), 7);

    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_names_are_unique_and_resolvable() {
    let name = unique("named");
    let q = mpq::create(&name).unwrap();
    assert_eq!(mpq::lookup(&name), Some(q));
    assert_eq!(mpq::name(q).unwrap(), name);
    assert!(matches!(mpq::create(&name), Err(AoslError::AlreadyExists(_))));

    mpq::destroy(q, true).unwrap();
    assert_eq!(mpq::lookup(&name), None);
    assert!(matches!(mpq::queue(q, None, "late", |_| {}), Err(AoslError::InvalidQueue(_))));
}

#[test]
fn test_refused_entry_is_invoked_free_only() {
    let q = mpq::create(&unique("refused")).unwrap();
    mpq::destroy(q, true).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let result = mpq::queue(q, None, "refused", move |mode| sink.lock().unwrap().push(mode));

    assert!(matches!(result, Err(AoslError::InvalidQueue(_))));
    // Invoked once, before the error came back.
    assert_eq!(*seen.lock().unwrap(), vec![ExecMode::FreeOnly]);
}

#[test]
fn test_guarded_entry_runs_free_only_after_destroy() {
    let q = mpq::create(&unique("guarded")).unwrap();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    mpq::queue(q, None, "gate", move |_| {
        let _ = gate_rx.recv_timeout(WAIT);
    })
    .unwrap();

    let live = RefObject::new(1_u32, false).unwrap();
    let doomed = RefObject::new(2_u32, false).unwrap();
    let doomed_id = doomed.id();

    let (tx, rx) = mpsc::channel();
    let tx_live = tx.clone();
    mpq::queue(q, Some(live.id()), "live", move |mode| {
        let _ = tx_live.send(("live", mode));
    })
    .unwrap();
    mpq::queue(q, Some(doomed_id), "doomed", move |mode| {
        let _ = tx.send(("doomed", mode));
    })
    .unwrap();

    doomed.destroy(false).unwrap();
    gate_tx.send(()).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("live", ExecMode::Exec));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("doomed", ExecMode::FreeOnly));
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_destroy_releases_pending_entries_free_only() {
    let q = mpq::create(&unique("teardown")).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    mpq::queue(q, None, "busy", move |_| {
        let _ = started_tx.send(());
        thread::sleep(Duration::from_millis(100));
    })
    .unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let tx = tx.clone();
        mpq::queue(q, None, "pending", move |mode| {
            let _ = tx.send(mode);
        })
        .unwrap();
    }
    drop(tx);

    mpq::destroy(q, true).unwrap();
    let modes: Vec<_> = rx.iter().collect();
    assert_eq!(modes, vec![ExecMode::FreeOnly; 3]);
}

#[test]
fn test_yield_requeues_at_tail() {
    let q = mpq::create(&unique("yield")).unwrap();
    assert!(matches!(mpq::yield_now("off-queue", |_| {}), Err(AoslError::NotOnQueue)));

    let (tx, rx) = mpsc::channel();
    let first_tx = tx.clone();
    mpq::queue(q, None, "first", move |_| {
        let again = first_tx.clone();
        let _ = first_tx.send("first");
        mpq::yield_now("first-continued", move |_| {
            let _ = again.send("first-continued");
        })
        .unwrap();
    })
    .unwrap();
    mpq::queue(q, None, "second", move |_| {
        let _ = tx.send("second");
    })
    .unwrap();

    let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(order, vec!["first", "second", "first-continued"]);
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_panicking_entry_does_not_stop_the_queue() {
    let q = mpq::create(&unique("panic")).unwrap();
    mpq::queue(q, None, "boom", |_| panic!("entry failure")).unwrap();
    assert_eq!(mpq::call(q, None, "after", |_| 5).unwrap(), 5);
    mpq::destroy(q, true).unwrap();
}
