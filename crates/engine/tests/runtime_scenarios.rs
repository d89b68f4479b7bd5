// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios against a runtime built from a configuration file.

#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;

use aosl_core::{AoslError, BufRegion, Data, Resume, Resumed, Slot};
use aosl_engine::coio::{self, CoTcpListener, CoTcpStream, CoUdpSocket, Extra, PacketSplitter};
use aosl_engine::gfsm::{self, ActCost, StateDef, Transition};
use aosl_engine::{mpq, pool, runtime, sbus, timer, Runtime};
use bytes::Bytes;

const WAIT: Duration = Duration::from_secs(5);

fn rt() -> &'static Runtime {
    static RT: OnceLock<&'static Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[main_queue]\nname = \"scenario.main\"\n\n[worker_pool]\nname = \"scenario.worker\"\nsize = 2\n\n\
             [packet]\nmax_packet_size = 64"
        )
        .unwrap();
        let loaded = aosl_engine::config::load(file.path().to_str()).unwrap();
        runtime::init(loaded.config).unwrap()
    })
}

fn channel_resume<T: Send + 'static>(tx: &mpsc::Sender<Resumed<T>>) -> Option<Resume<T>> {
    let tx = tx.clone();
    Some(Box::new(move |resumed| {
        let _ = tx.send(resumed);
    }))
}

fn wait_for<T>(rx: &mpsc::Receiver<Resumed<T>>) -> T {
    match rx.recv_timeout(WAIT).unwrap() {
        Resumed::Complete(result) => result.unwrap(),
        Resumed::FreeOnly => panic!("operation resumed free-only"),
    }
}

fn length_prefixed(bytes: &[u8]) -> aosl_core::Result<Option<usize>> {
    Ok(bytes.first().map(|len| 1 + usize::from(*len)))
}

#[test]
fn test_runtime_follows_configuration_file() {
    let rt = rt();
    assert_eq!(rt.config().main_queue.name, "scenario.main");
    assert_eq!(mpq::name(rt.main_queue()).unwrap(), "scenario.main");
    assert_eq!(mpq::main_queue().unwrap(), rt.main_queue());
    assert_eq!(pool::name(rt.worker_pool()).unwrap(), "scenario.worker");
    assert_eq!(pool::queues(rt.worker_pool()).unwrap().len(), 2);

    assert!(matches!(runtime::init(rt.config().clone()), Err(AoslError::AlreadyExists(_))));
    assert!(std::ptr::eq(runtime::get().unwrap(), rt));
}

#[test]
fn test_tcp_packets_echo_through_splitter() {
    let rt = rt();
    let listener = CoTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = coio::local_addr(listener).unwrap();

    let (accept_tx, accept_rx) = mpsc::channel();
    let conn = Slot::new();
    coio::accept(listener, conn.clone(), channel_resume(&accept_tx)).unwrap();

    let client = CoTcpStream::new_for(addr).unwrap();
    let (connect_tx, connect_rx) = mpsc::channel();
    coio::connect(client, addr, Some(Duration::from_secs(2)), channel_resume(&connect_tx)).unwrap();

    wait_for(&connect_rx);
    assert_eq!(wait_for(&accept_rx), 1);
    let accepted = conn.take().unwrap();
    assert_eq!(accepted.peer, coio::local_addr(client).unwrap());
    let server = accepted.fd;

    // Two packets in one segment, then a third split over two writes.
    let (write_tx, write_rx) = mpsc::channel();
    coio::write(client, BufRegion::whole(Data::from_slice(b"\x03abc\x02de\x04wx")), None, channel_resume(&write_tx))
        .unwrap();
    assert_eq!(wait_for(&write_rx), 10);

    let splitter = PacketSplitter::with_configured_limit(server, length_prefixed).unwrap();
    let (packet_tx, packet_rx) = mpsc::channel();
    let mut packets = Vec::new();
    for _ in 0..2 {
        splitter.read_packet(channel_resume(&packet_tx).unwrap()).unwrap();
        packets.push(wait_for(&packet_rx));
    }

    splitter.read_packet(channel_resume(&packet_tx).unwrap()).unwrap();
    coio::write(client, BufRegion::whole(Data::from_slice(b"yz")), None, channel_resume(&write_tx)).unwrap();
    assert_eq!(wait_for(&write_rx), 2);
    packets.push(wait_for(&packet_rx));
    assert_eq!(packets, [&b"\x03abc"[..], b"\x02de", b"\x04wxyz"]);

    // Echo the last packet back.
    coio::write(server, BufRegion::whole(Data::from_slice(&packets[2])), None, channel_resume(&write_tx)).unwrap();
    assert_eq!(wait_for(&write_rx), 5);
    let echoed = Data::zeroed(16);
    let (read_tx, read_rx) = mpsc::channel();
    coio::read(client, BufRegion::whole(echoed.clone()), None, channel_resume(&read_tx)).unwrap();
    let n = wait_for(&read_rx);
    assert_eq!(echoed.with(|bytes| bytes[..n].to_vec()), b"\x04wxyz"[..n].to_vec());

    assert_eq!(rt.config().packet.max_packet_size, 64);
    for fd in [client, server, listener] {
        coio::close(fd).unwrap();
    }
}

#[test]
fn test_udp_recv_reports_sender_address() {
    rt();
    let a = CoUdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let b = CoUdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let (a_addr, b_addr): (SocketAddr, SocketAddr) = (coio::local_addr(a).unwrap(), coio::local_addr(b).unwrap());

    let (recv_tx, recv_rx) = mpsc::channel();
    let inbox = Data::zeroed(32);
    let from = Slot::new();
    coio::recv(b, BufRegion::whole(inbox.clone()), Some(from.clone()), None, channel_resume(&recv_tx)).unwrap();

    let (send_tx, send_rx) = mpsc::channel();
    let to = Extra { addr: Some(b_addr), ..Extra::default() };
    coio::send(a, BufRegion::whole(Data::from_slice(b"datagram")), Some(to), None, channel_resume(&send_tx))
        .unwrap();
    assert_eq!(wait_for(&send_rx), 8);

    assert_eq!(wait_for(&recv_rx), 8);
    assert_eq!(inbox.with(|bytes| bytes[..8].to_vec()), b"datagram");
    assert_eq!(from.take().and_then(|extra| extra.addr), Some(a_addr));

    coio::close(a).unwrap();
    coio::close(b).unwrap();
}

const IDLE: i32 = 0;
const RUNNING: i32 = 1;
const DONE: i32 = 2;
const EV_START: u32 = 1;
const EV_TICK: u32 = 2;

#[test]
fn test_timer_drives_state_machine_to_completion() {
    rt();
    let q = mpq::create("scenario.fsm").unwrap();
    let watcher = mpq::create("scenario.watcher").unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let (bus_tx, bus_rx) = mpsc::channel();
    let action = sbus::action_add("scenario.finished", watcher, None, 0, move |_, _, data| {
        let _ = bus_tx.send((mpq::this_queue(), data.clone()));
    })
    .unwrap();

    let states = vec![
        StateDef::new(IDLE).on(Transition::new(EV_START, ActCost::None, RUNNING, IDLE, |_: &Arc<AtomicUsize>, _, _| {
            Ok(())
        })),
        StateDef::new(RUNNING).on(Transition::new(EV_TICK, ActCost::Small, RUNNING, DONE, |ticks: &Arc<AtomicUsize>, _, _| {
            if ticks.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                return Ok(());
            }
            sbus::send("scenario.finished", Bytes::from_static(b"done"));
            Err(AoslError::Action(1))
        })),
        StateDef::new(DONE),
    ];
    let fsm = gfsm::create_on(q, "ticker", Arc::clone(&ticks), states, IDLE).unwrap();
    assert_eq!(gfsm::trigger(fsm, EV_START, None, None).unwrap(), aosl_core::Outcome::Ready);

    let (stopped_tx, stopped_rx) = mpsc::channel();
    let own = Arc::new(OnceLock::new());
    let own_in = Arc::clone(&own);
    let tick = timer::create(
        q,
        "ticker",
        aosl_engine::TimerKind::Interval(Duration::from_millis(10)),
        false,
        move |_| {
            if let Err(AoslError::NotHandled { state, .. }) = gfsm::trigger(fsm, EV_TICK, None, None) {
                assert_eq!(state, DONE);
                if let Some(id) = own_in.get() {
                    let _ = timer::kill(*id);
                }
            }
        },
        move || {
            let _ = stopped_tx.send(());
        },
    )
    .unwrap();
    own.set(tick).unwrap();
    timer::resched(tick, None).unwrap();

    let (on_queue, payload) = bus_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(on_queue, Some(watcher));
    assert_eq!(payload, Bytes::from_static(b"done"));
    stopped_rx.recv_timeout(WAIT).unwrap();

    assert_eq!(gfsm::current_state(fsm).unwrap(), DONE);
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    sbus::action_del("scenario.finished", action).unwrap();
    gfsm::destroy(fsm).unwrap();
    mpq::destroy(q, true).unwrap();
    mpq::destroy(watcher, true).unwrap();
}
