// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use aosl_core::{AoslError, ExecMode};

use super::{unique, WAIT};
use crate::config::QueueConfig;
use crate::mpq;
use crate::pool;
use crate::task::{self, OpFlow, TaskKind, TaskTarget};

fn tracked(
    active: &Arc<AtomicUsize>,
    peak: &Arc<AtomicUsize>,
    done: &mpsc::Sender<usize>,
    n: usize,
) -> impl FnOnce(ExecMode) -> OpFlow + Send + 'static {
    let (active, peak, done) = (Arc::clone(active), Arc::clone(peak), done.clone());
    move |mode| {
        if mode == ExecMode::Exec {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = done.send(n);
        }
        OpFlow::Done
    }
}

#[test]
fn test_serial_task_on_pool_never_overlaps() {
    let pid = pool::create(&unique("serial-pool"), 3, &QueueConfig::default()).unwrap();
    let id = task::create("serial", TaskTarget::Pool(pid), TaskKind::Serial).unwrap();
    let (active, peak) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let (tx, rx) = mpsc::channel();

    for n in 0..8 {
        task::exec(id, "step", tracked(&active, &peak, &tx, n)).unwrap();
    }
    let order: Vec<usize> = (0..8).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();

    assert_eq!(order, (0..8).collect::<Vec<_>>());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    task::destroy(id).unwrap();
    pool::destroy(pid, true).unwrap();
}

#[test]
fn test_parallel_task_spreads_over_pool() {
    let pid = pool::create(&unique("parallel-pool"), 4, &QueueConfig::default()).unwrap();
    let id = task::create("parallel", TaskTarget::Pool(pid), TaskKind::Parallel).unwrap();
    let (active, peak) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let (tx, rx) = mpsc::channel();

    for n in 0..8 {
        task::exec(id, "step", {
            let (active, peak, tx) = (Arc::clone(&active), Arc::clone(&peak), tx.clone());
            move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(n);
                OpFlow::Done
            }
        })
        .unwrap();
    }
    for _ in 0..8 {
        rx.recv_timeout(WAIT).unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) > 1);
    task::destroy(id).unwrap();
    pool::destroy(pid, true).unwrap();
}

#[test]
fn test_async_op_holds_serial_task_until_done() {
    let q = mpq::create(&unique("async-task")).unwrap();
    let id = task::create("async", TaskTarget::Queue(q), TaskKind::Serial).unwrap();
    let (tx, rx) = mpsc::channel();

    let first = tx.clone();
    task::exec(id, "start", move |_| {
        let _ = first.send("start");
        OpFlow::Async
    })
    .unwrap();
    task::exec(id, "next", move |_| {
        let _ = tx.send("next");
        OpFlow::Done
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "start");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(task::waiting_ops_count(id).unwrap(), 1);

    task::async_done(id).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "next");
    assert!(matches!(task::async_done(id), Err(AoslError::InvalidArgument(_))));

    task::destroy(id).unwrap();
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_exclusive_op_is_a_barrier() {
    let pid = pool::create(&unique("exclusive-pool"), 4, &QueueConfig::default()).unwrap();
    let id = task::create("exclusive", TaskTarget::Pool(pid), TaskKind::Parallel).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let op = |label: &'static str| {
        let (active, tx) = (Arc::clone(&active), tx.clone());
        move |_: ExecMode| {
            active.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send((label, 0));
            OpFlow::Done
        }
    };

    task::exec(id, "before-a", op("before")).unwrap();
    task::exec(id, "before-b", op("before")).unwrap();
    task::exclusive_exec(id, "barrier", {
        let (active, tx) = (Arc::clone(&active), tx.clone());
        move |_| {
            let others = active.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            let _ = tx.send(("barrier", others));
        }
    })
    .unwrap();
    task::exec(id, "after", op("after")).unwrap();

    let events: Vec<_> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(events[0].0, "before");
    assert_eq!(events[1].0, "before");
    assert_eq!(events[2], ("barrier", 0));
    assert_eq!(events[3].0, "after");

    task::destroy(id).unwrap();
    pool::destroy(pid, true).unwrap();
}

#[test]
fn test_remove_head_and_destroy_free_waiting_ops() {
    let q = mpq::create(&unique("waiting")).unwrap();
    let id = task::create("waiting", TaskTarget::Queue(q), TaskKind::Serial).unwrap();
    let (tx, rx) = mpsc::channel();

    task::exec(id, "hold", |_| OpFlow::Async).unwrap();
    for label in ["a", "b", "c"] {
        let tx = tx.clone();
        task::exec(id, "queued", move |mode| {
            let _ = tx.send((label, mode));
            OpFlow::Done
        })
        .unwrap();
    }
    drop(tx);
    // The async op has started and blocks the rest.
    mpq::call(q, None, "sync", |_| ()).unwrap();
    assert_eq!(task::waiting_ops_count(id).unwrap(), 3);

    assert!(task::remove_waiting_ops_head(id).unwrap());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("a", ExecMode::FreeOnly));
    assert_eq!(task::waiting_ops_count(id).unwrap(), 2);

    task::destroy(id).unwrap();
    let rest: Vec<_> = rx.iter().collect();
    assert_eq!(rest, vec![("b", ExecMode::FreeOnly), ("c", ExecMode::FreeOnly)]);
    assert!(matches!(task::exec(id, "late", |_| OpFlow::Done), Err(AoslError::InvalidRef(_))));
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_panicking_op_does_not_stall_serial_task() {
    let q = mpq::create(&unique("task-panic")).unwrap();
    let id = task::create("panicky", TaskTarget::Queue(q), TaskKind::Serial).unwrap();
    let (tx, rx) = mpsc::channel();

    task::exec(id, "boom", |_| -> OpFlow { panic!("op failed on purpose") }).unwrap();
    task::exec(id, "after", move |mode| {
        let _ = tx.send(mode);
        OpFlow::Done
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ExecMode::Exec);
    assert_eq!(task::waiting_ops_count(id).unwrap(), 0);

    // The queue itself keeps running too.
    assert_eq!(mpq::call(q, None, "still-alive", |_| 7).unwrap(), 7);
    task::destroy(id).unwrap();
    mpq::destroy(q, true).unwrap();
}

#[test]
fn test_refused_dispatch_runs_op_free_only() {
    let q = mpq::create(&unique("task-refused")).unwrap();
    let id = task::create("orphan", TaskTarget::Queue(q), TaskKind::Serial).unwrap();
    mpq::destroy(q, true).unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        task::exec(id, "stranded", move |mode| {
            let _ = tx.send(mode);
            OpFlow::Done
        })
        .unwrap();
    }

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ExecMode::FreeOnly);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ExecMode::FreeOnly);
    assert_eq!(task::waiting_ops_count(id).unwrap(), 0);
    task::destroy(id).unwrap();
}
