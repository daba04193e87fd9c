//! Upstream exchanges against servers running on the loopback interface.

mod common;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use recursor_net::base::message_id;
use recursor_net::metrics::Counter;
use recursor_net::net::client::error::Error;
use recursor_net::net::client::{tcp, udp};
use recursor_net::net::mplex::Multiplexer;
use recursor_net::worker::WorkerRef;
use rstest::rstest;

type Slot = Rc<RefCell<Option<Result<Vec<u8>, Error>>>>;

/// Starts a UDP server on a thread that runs `script` on its socket.
fn udp_upstream<F>(script: F) -> SocketAddr
where
    F: FnOnce(UdpSocket) + Send + 'static,
{
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(common::PATIENCE)).unwrap();
    let addr = sock.local_addr().unwrap();
    thread::spawn(move || script(sock));
    addr
}

/// Spawns a task exchanging `query` with `dest`.
fn spawn_exchange(ctx: &WorkerRef, query: Vec<u8>, dest: SocketAddr) -> Slot {
    let slot: Slot = Default::default();
    let res = slot.clone();
    let task_ctx = ctx.clone();
    ctx.sched().spawn(async move {
        let answer = udp::exchange(&task_ctx, &query, dest).await;
        *res.borrow_mut() = Some(answer);
    });
    slot
}

/// Runs the worker until the exchange in `slot` has finished.
fn finish(ctx: &WorkerRef, slot: &Slot) -> Result<Vec<u8>, Error> {
    assert!(common::run_until(ctx, || slot.borrow().is_some()));
    slot.borrow_mut().take().unwrap()
}

//------------ UDP -----------------------------------------------------------

#[test]
fn udp_exchange_returns_answer() {
    let upstream = udp_upstream(|sock| {
        let mut buf = [0u8; 512];
        let (len, from) = sock.recv_from(&mut buf).unwrap();
        sock.send_to(&common::answer_for(&buf[..len]), from).unwrap();
    });
    let ctx = common::worker(common::local_config());
    let slot = spawn_exchange(&ctx, common::query(0x1234, "example.com"), upstream);

    let answer = finish(&ctx, &slot).unwrap();
    assert_eq!(message_id(&answer), Some(0x1234));
    assert!(ctx.udp_sockets().is_empty());
    assert_eq!(ctx.udp_sockets().opened(), 1);
    assert_eq!(ctx.udp_sockets().released(), 1);
    assert_eq!(ctx.sched().waiting_count(), 0);
    assert!(ctx.mplex().is_empty());
}

#[test]
fn udp_exchange_times_out() {
    let upstream = udp_upstream(|sock| {
        let mut buf = [0u8; 512];
        let _ = sock.recv_from(&mut buf);
        thread::sleep(Duration::from_secs(1));
    });
    let mut config = common::local_config();
    config.set_network_timeout(Duration::from_millis(100));
    let ctx = common::worker(config);
    let slot = spawn_exchange(&ctx, common::query(7, "example.com"), upstream);

    assert!(matches!(finish(&ctx, &slot), Err(Error::Timeout)));
    assert!(ctx.udp_sockets().is_empty());
    assert!(ctx.mplex().is_empty());
}

#[test]
fn udp_exchange_with_closed_port_fails() {
    let closed = {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap()
    };
    let ctx = common::worker(common::local_config());
    let slot = spawn_exchange(&ctx, common::query(7, "example.com"), closed);

    assert!(matches!(finish(&ctx, &slot), Err(Error::PermanentError(_))));
    assert!(ctx.udp_sockets().is_empty());
}

#[rstest]
#[case::one_miss(1, false)]
#[case::two_misses(2, true)]
fn near_misses_before_answer(#[case] misses: u16, #[case] spoofed: bool) {
    let upstream = udp_upstream(move |sock| {
        let mut buf = [0u8; 512];
        let (len, from) = sock.recv_from(&mut buf).unwrap();
        let answer = common::answer_for(&buf[..len]);
        for i in 0..misses {
            let mut wrong = answer.clone();
            let id = message_id(&answer).unwrap().wrapping_add(1 + i);
            wrong[..2].copy_from_slice(&id.to_be_bytes());
            sock.send_to(&wrong, from).unwrap();
        }
        sock.send_to(&answer, from).unwrap();
    });
    let ctx = common::worker(common::local_config());
    let slot = spawn_exchange(&ctx, common::query(100, "example.com"), upstream);

    let res = finish(&ctx, &slot);
    if spoofed {
        assert!(matches!(res, Err(Error::Spoofed)));
        assert_eq!(ctx.counters().get(Counter::SpoofCount), 1);
    } else {
        assert_eq!(message_id(&res.unwrap()), Some(100));
        assert_eq!(ctx.counters().get(Counter::SpoofCount), 0);
    }
    assert_eq!(ctx.counters().get(Counter::UnexpectedCount), u64::from(misses));
    assert!(ctx.udp_sockets().is_empty());
}

#[rstest]
#[case(2)]
#[case(7)]
#[case(100)]
fn identical_queries_are_chained(#[case] count: u16) {
    let (tx, rx) = mpsc::channel();
    let upstream = udp_upstream(move |sock| {
        let mut buf = [0u8; 512];
        let (len, from) = sock.recv_from(&mut buf).unwrap();
        sock.send_to(&common::answer_for(&buf[..len]), from).unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let mut more = 0;
        while sock.recv_from(&mut buf).is_ok() {
            more += 1;
        }
        tx.send(more).unwrap();
    });
    let ctx = common::worker(common::local_config());
    let slots: Vec<_> = (0..count)
        .map(|i| {
            spawn_exchange(&ctx, common::query(1000 + i, "example.com"), upstream)
        })
        .collect();

    assert!(common::run_until(&ctx, || {
        slots.iter().all(|slot| slot.borrow().is_some())
    }));
    for (i, slot) in slots.iter().enumerate() {
        let answer = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(message_id(&answer), Some(1000 + i as u16));
    }
    assert_eq!(
        ctx.counters().get(Counter::ChainResends),
        u64::from(count - 1)
    );
    assert_eq!(ctx.udp_sockets().opened(), 1);
    assert_eq!(ctx.sched().waiting_count(), 0);
    assert_eq!(rx.recv_timeout(common::PATIENCE).unwrap(), 0);
}

//------------ TCP -----------------------------------------------------------

/// Starts a TCP server on a thread that handles one connection.
fn tcp_upstream<F>(script: F) -> SocketAddr
where
    F: FnOnce(std::net::TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(common::PATIENCE)).unwrap();
        script(stream)
    });
    addr
}

/// Reads one length prefixed message.
fn read_frame(stream: &mut std::net::TcpStream) -> Vec<u8> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).unwrap();
    let mut msg = vec![0; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut msg).unwrap();
    msg
}

fn spawn_tcp_exchange(ctx: &WorkerRef, query: Vec<u8>, dest: SocketAddr) -> Slot {
    let slot: Slot = Default::default();
    let res = slot.clone();
    let task_ctx = ctx.clone();
    ctx.sched().spawn(async move {
        let answer = match tcp::async_connect(&task_ctx, dest, None).await {
            Ok(handler) => tcp::tcp_exchange(&task_ctx, &handler, &query).await,
            Err(err) => Err(err),
        };
        *res.borrow_mut() = Some(answer);
    });
    slot
}

#[test]
fn tcp_exchange_reassembles_fragments() {
    let upstream = tcp_upstream(|mut stream| {
        let query = read_frame(&mut stream);
        let answer = common::frame(&common::answer_for(&query));
        for octet in answer {
            stream.write_all(&[octet]).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    });
    let ctx = common::worker(common::local_config());
    let query = common::query(0x4242, "example.com");
    let slot = spawn_tcp_exchange(&ctx, query.clone(), upstream);

    let answer = finish(&ctx, &slot).unwrap();
    assert_eq!(answer, common::answer_for(&query));
    assert!(ctx.mplex().is_empty());
    assert_eq!(ctx.sched().waiting_count(), 0);
}

#[test]
fn tcp_exchange_fails_on_early_close() {
    let upstream = tcp_upstream(|mut stream| {
        let _ = read_frame(&mut stream);
        stream.write_all(&[0]).unwrap();
    });
    let ctx = common::worker(common::local_config());
    let slot = spawn_tcp_exchange(&ctx, common::query(1, "example.com"), upstream);

    assert!(matches!(finish(&ctx, &slot), Err(Error::PermanentError(_))));
    assert!(ctx.mplex().is_empty());
}

#[test]
fn tcp_connect_to_closed_port_fails() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let ctx = common::worker(common::local_config());
    let slot = spawn_tcp_exchange(&ctx, common::query(1, "example.com"), closed);

    assert!(matches!(finish(&ctx, &slot), Err(Error::PermanentError(_))));
}
