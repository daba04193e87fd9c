//! Running out of file descriptors while queries are outstanding.
//!
//! Lowering the descriptor limit affects the whole process, so this lives
//! in its own test binary with a single test.

mod common;

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use recursor_net::base::message_id;
use recursor_net::metrics::Counter;
use recursor_net::net::client::error::Error;
use recursor_net::net::client::udp;
use recursor_net::net::mplex::Multiplexer;
use recursor_net::worker::WorkerRef;

type Slot = Rc<RefCell<Option<Result<Vec<u8>, Error>>>>;

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

//------------ Exhausted -----------------------------------------------------

/// Uses up all descriptors the process may open until dropped.
struct Exhausted {
    limit: libc::rlimit,
    fds: Vec<RawFd>,
}

impl Exhausted {
    fn new(template: RawFd) -> Self {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) },
            0
        );
        let lowered = libc::rlimit {
            rlim_cur: limit.rlim_cur.min(256),
            rlim_max: limit.rlim_max,
        };
        assert_eq!(
            unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) },
            0
        );
        let mut res = Exhausted {
            limit,
            fds: Vec::new(),
        };
        loop {
            let fd = unsafe { libc::dup(template) };
            if fd < 0 {
                assert_eq!(
                    io::Error::last_os_error().raw_os_error(),
                    Some(libc::EMFILE)
                );
                break;
            }
            res.fds.push(fd);
        }
        res
    }
}

impl Drop for Exhausted {
    fn drop(&mut self) {
        for fd in self.fds.drain(..) {
            unsafe { libc::close(fd) };
        }
        unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &self.limit) };
    }
}

//------------ Tests ---------------------------------------------------------

#[test]
fn descriptor_shortage_fails_only_new_queries() {
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    upstream.set_nonblocking(true).unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let ctx = common::worker(common::local_config());

    // An outstanding query that got its socket before the shortage.
    let first = spawn_exchange(&ctx, common::query(1, "example.com"), upstream_addr);
    assert!(common::run_until(&ctx, || ctx.udp_sockets().len() == 1));

    let exhausted = Exhausted::new(upstream.as_raw_fd());
    let other = spawn_exchange(&ctx, common::query(2, "example.net"), upstream_addr);
    let chained = spawn_exchange(&ctx, common::query(3, "example.com"), upstream_addr);
    assert!(common::run_until(&ctx, || other.borrow().is_some()));
    assert!(matches!(
        other.borrow_mut().take(),
        Some(Err(Error::OsLimit(_)))
    ));
    // Nothing was left behind by the failed query.
    assert_eq!(ctx.udp_sockets().len(), 1);
    assert_eq!(ctx.udp_sockets().opened(), 1);
    assert_eq!(ctx.udp_sockets().released(), 0);
    assert_eq!(ctx.sched().waiting_count(), 2);
    assert_eq!(ctx.sched().runnable_count(), 2);
    drop(exhausted);

    let mut buf = [0u8; 512];
    let mut received = None;
    assert!(common::run_until(&ctx, || {
        match upstream.recv_from(&mut buf) {
            Ok((len, from)) => {
                received = Some((buf[..len].to_vec(), from));
                true
            }
            Err(_) => false,
        }
    }));
    let (query, from) = received.unwrap();
    assert_eq!(message_id(&query), Some(1));
    upstream.send_to(&common::answer_for(&query), from).unwrap();

    assert!(common::run_until(&ctx, || {
        first.borrow().is_some() && chained.borrow().is_some()
    }));
    let answer = first.borrow_mut().take().unwrap().unwrap();
    assert_eq!(message_id(&answer), Some(1));
    let answer = chained.borrow_mut().take().unwrap().unwrap();
    assert_eq!(message_id(&answer), Some(3));
    assert_eq!(ctx.counters().get(Counter::ChainResends), 1);
    assert!(ctx.udp_sockets().is_empty());
    assert_eq!(ctx.udp_sockets().released(), 1);
    assert_eq!(ctx.sched().waiting_count(), 0);
    assert_eq!(ctx.sched().runnable_count(), 0);
    assert!(ctx.mplex().is_empty());

    // The worker carries on once descriptors are available again.
    let retry = spawn_exchange(&ctx, common::query(4, "example.net"), upstream_addr);
    let mut received = None;
    assert!(common::run_until(&ctx, || {
        match upstream.recv_from(&mut buf) {
            Ok((len, from)) => {
                received = Some((buf[..len].to_vec(), from));
                true
            }
            Err(_) => false,
        }
    }));
    let (query, from) = received.unwrap();
    upstream.send_to(&common::answer_for(&query), from).unwrap();
    assert!(common::run_until(&ctx, || retry.borrow().is_some()));
    let answer = retry.borrow_mut().take().unwrap().unwrap();
    assert_eq!(message_id(&answer), Some(4));
    assert_eq!(ctx.udp_sockets().opened(), 2);
}
