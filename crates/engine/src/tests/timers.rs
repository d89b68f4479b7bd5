// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use aosl_core::AoslError;

use super::{unique, WAIT};
use crate::mpq;
use crate::timer::{self, TimerKind};

#[test]
fn test_oneshot_fires_once_near_expiry() {
    let q = mpq::create(&unique("oneshot")).unwrap();
    let (tx, rx) = mpsc::channel();
    let scheduled = Instant::now();
    let id = timer::set_oneshot(q, "oneshot", Duration::from_millis(50), move |now| {
        let _ = tx.send((now, mpq::this_queue()));
    })
    .unwrap();

    let (fired, on_queue) = rx.recv_timeout(WAIT).unwrap();
    let elapsed = fired.duration_since(scheduled);
    assert!(elapsed >= Duration::from_millis(45), "fired early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late after {elapsed:?}");
    assert_eq!(on_queue, Some(q));

    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    assert!(!timer::is_active(id).unwrap());
    timer::kill(id).unwrap();
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_cancel_before_expiry_means_no_fire() {
    let q = mpq::create(&unique("cancel")).unwrap();
    let fires = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fires);
    let id = timer::set_oneshot(q, "cancel", Duration::from_millis(50), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    timer::cancel(id).unwrap();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(fires.load(Ordering::SeqCst), 0);

    // A canceled one-shot can be scheduled again.
    timer::sched(id, Duration::from_millis(10)).unwrap();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(fires.load(Ordering::SeqCst), 1);

    timer::kill(id).unwrap();
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_resched_changes_interval_without_spurious_fire() {
    let q = mpq::create(&unique("resched")).unwrap();
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&stamps);
    let id = timer::set_timer(q, "resched", Duration::from_millis(40), move |now| {
        sink.lock().unwrap().push(now);
    })
    .unwrap();
    assert_eq!(timer::interval(id).unwrap(), Some(Duration::from_millis(40)));

    thread::sleep(Duration::from_millis(30));
    let switched = Instant::now();
    timer::resched(id, Some(Duration::from_millis(200))).unwrap();
    thread::sleep(Duration::from_millis(500));
    timer::cancel(id).unwrap();

    let after: Vec<Instant> = stamps.lock().unwrap().iter().copied().filter(|at| *at > switched).collect();
    // The 40ms arming due ~10ms after the switch must not fire.
    assert!(!after.is_empty());
    assert!(after[0].duration_since(switched) >= Duration::from_millis(190), "{:?}", after[0] - switched);
    for pair in after.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(190));
    }
    assert_eq!(timer::interval(id).unwrap(), Some(Duration::from_millis(200)));

    timer::kill(id).unwrap();
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_kind_specific_scheduling() {
    let q = mpq::create(&unique("kinds")).unwrap();
    let interval = timer::create_timer(q, "idle-interval", Duration::from_millis(20), |_| {}).unwrap();
    let oneshot = timer::create_oneshot(q, "idle-oneshot", Duration::from_millis(20), |_| {}).unwrap();

    assert!(!timer::is_active(interval).unwrap());
    assert!(matches!(timer::sched(interval, Duration::from_millis(5)), Err(AoslError::InvalidArgument(_))));
    assert!(matches!(timer::resched(oneshot, None), Err(AoslError::InvalidArgument(_))));
    assert!(matches!(timer::resched(interval, Some(Duration::ZERO)), Err(AoslError::InvalidArgument(_))));
    assert_eq!(timer::interval(oneshot).unwrap(), None);

    timer::resched(interval, None).unwrap();
    assert!(timer::is_active(interval).unwrap());

    timer::kill(interval).unwrap();
    timer::kill(oneshot).unwrap();
    assert!(matches!(timer::cancel(oneshot), Err(AoslError::InvalidRef(_))));
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_kill_runs_drop_callback_once() {
    let q = mpq::create(&unique("kill")).unwrap();
    let drops = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::clone(&drops);
    let id = timer::create(
        q,
        "kill",
        TimerKind::Interval(Duration::from_millis(5)),
        true,
        |_| {},
        move || {
            dropped.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    thread::sleep(Duration::from_millis(30));
    timer::kill(id).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(timer::kill(id).is_err());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_kill_from_own_callback() {
    let q = mpq::create(&unique("self-kill")).unwrap();
    let (tx, rx) = mpsc::channel();
    let fires = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<timer::TimerId>>> = Arc::new(Mutex::new(None));

    let (counter, own) = (Arc::clone(&fires), Arc::clone(&slot));
    let id = timer::create(
        q,
        "self-kill",
        TimerKind::Interval(Duration::from_millis(10)),
        false,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own.lock().unwrap() {
                timer::kill(id).unwrap();
            }
        },
        move || {
            let _ = tx.send(());
        },
    )
    .unwrap();
    *slot.lock().unwrap() = Some(id);
    timer::resched(id, None).unwrap();

    rx.recv_timeout(WAIT).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    mpq::destroy(q, true).unwrap();
}
