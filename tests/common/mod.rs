//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::io::{self, Read};
use std::net::{TcpStream, UdpSocket};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use recursor_net::base::{build_query, Question};
use recursor_net::config::Config;
use recursor_net::logging::init_logging;
use recursor_net::net::server::service::{Answer, Request, Resolve};
use recursor_net::worker::{WorkerBuilder, WorkerRef};

/// How long a test waits for something to happen.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Builds a query for `qname`, type A.
pub fn query(id: u16, qname: &str) -> Vec<u8> {
    build_query(id, &Question::new(qname, 1, 1).unwrap(), true).unwrap()
}

/// Turns a query into an answer by setting the QR bit.
pub fn answer_for(query: &[u8]) -> Vec<u8> {
    let mut msg = query.to_vec();
    msg[2] |= 0x80;
    msg
}

/// An engine answering every query by echoing it as a response.
pub fn echo_engine() -> Rc<dyn Resolve> {
    Rc::new(
        |_ctx: WorkerRef, req: Request| -> LocalBoxFuture<'static, Option<Answer>> {
            async move {
                Some(Answer {
                    message: answer_for(&req.message),
                    cache_ttl: None,
                })
            }
            .boxed_local()
        },
    )
}

/// A config for talking to servers on the loopback interface.
pub fn local_config() -> Config {
    init_logging();
    let mut config = Config::new();
    config.set_query_local_addresses(vec!["127.0.0.1".parse().unwrap()]);
    config.set_network_timeout(Duration::from_secs(2));
    config
}

/// Builds a worker without listeners.
pub fn worker(config: Config) -> WorkerRef {
    WorkerBuilder::new(0, Arc::new(config), echo_engine())
        .build()
        .unwrap()
}

/// Runs the worker until `done` returns true or patience runs out.
///
/// Returns whether `done` became true.
pub fn run_until(ctx: &WorkerRef, mut done: impl FnMut() -> bool) -> bool {
    init_logging();
    let start = Instant::now();
    while start.elapsed() < PATIENCE {
        if done() {
            return true;
        }
        ctx.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    done()
}

/// Runs the worker until a datagram arrives on `client`.
pub fn recv_datagram(ctx: &WorkerRef, client: &UdpSocket) -> Option<Vec<u8>> {
    client.set_nonblocking(true).unwrap();
    let mut buf = vec![0; 4096];
    let mut res = None;
    run_until(ctx, || match client.recv(&mut buf) {
        Ok(len) => {
            res = Some(buf[..len].to_vec());
            true
        }
        Err(_) => false,
    });
    res
}

/// Runs the worker until a length prefixed message arrives on `stream`.
pub fn recv_frame(ctx: &WorkerRef, stream: &mut TcpStream) -> Option<Vec<u8>> {
    stream.set_nonblocking(true).unwrap();
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let mut frame = None;
    run_until(ctx, || {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(len) => data.extend_from_slice(&buf[..len]),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => return true,
        }
        if data.len() >= 2 {
            let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
            if data.len() >= len + 2 {
                frame = Some(data[2..len + 2].to_vec());
                return true;
            }
        }
        false
    });
    frame
}

/// Prefixes a message with its length.
pub fn frame(msg: &[u8]) -> Vec<u8> {
    let mut res = (msg.len() as u16).to_be_bytes().to_vec();
    res.extend_from_slice(msg);
    res
}
