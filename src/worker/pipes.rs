//! Communication between threads.
//!
//! Threads never share their contexts. Instead, a thread asks another one
//! to do something by sending it a [`ThreadMessage`], a function that is
//! run on the receiving thread with that thread's context.
//!
//! Every thread has two incoming pipes: a bounded one for queries handed
//! over by the distributors and an unbounded one for control messages. As
//! a thread spends its time waiting on its multiplexer, sending a message
//! also writes an octet to a Unix socket whose other end is registered
//! with the receiving thread's multiplexer.
//!
//! The [`Topology`] lists the pipes of all threads, distributors first,
//! followed by the workers. The thread that started the core keeps a
//! reference to it, too, and uses it to broadcast control messages.

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Role, WorkerRef};
use crate::config::Config;
use crate::metrics::Counters;

//------------ ThreadMessage -------------------------------------------------

/// A function to run on another thread.
pub struct ThreadMessage {
    func: Box<dyn FnOnce(&WorkerRef) + Send>,
}

impl ThreadMessage {
    /// Creates a new message from a function.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(&WorkerRef) + Send + 'static,
    {
        ThreadMessage {
            func: Box::new(func),
        }
    }

    /// Runs the function on the given thread.
    pub fn run(self, ctx: &WorkerRef) {
        (self.func)(ctx)
    }
}

impl fmt::Debug for ThreadMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ThreadMessage")
    }
}

//------------ WorkerInfo ----------------------------------------------------

/// The sending side of the pipes of one thread.
#[derive(Debug)]
pub struct WorkerInfo {
    index: usize,
    role: Role,
    pub(crate) query_tx: mpsc::Sender<ThreadMessage>,
    control_tx: mpsc::UnboundedSender<ThreadMessage>,
    wake: UnixStream,

    /// The number of tasks the thread currently runs.
    pub(crate) load: Arc<AtomicUsize>,

    /// The number of queries handed to this thread so far.
    distributed: AtomicU64,
}

impl WorkerInfo {
    /// Returns the index of the thread.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the role of the thread.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the current number of tasks of the thread.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Returns the number of queries distributed to the thread.
    pub fn distributed(&self) -> u64 {
        self.distributed.load(Ordering::Relaxed)
    }

    /// Tries to send a query without waiting.
    pub(crate) fn try_send_query(
        &self,
        msg: ThreadMessage,
    ) -> Result<(), mpsc::error::TrySendError<ThreadMessage>> {
        self.query_tx.try_send(msg)?;
        self.distributed.fetch_add(1, Ordering::Relaxed);
        self.wake();
        Ok(())
    }

    /// Sends a control message.
    pub(crate) fn send_control(&self, msg: ThreadMessage) -> Result<(), ()> {
        self.control_tx.send(msg).map_err(|_| ())?;
        self.wake();
        Ok(())
    }

    fn wake(&self) {
        match (&self.wake).write(&[1]) {
            Ok(_) => {}
            // A full socket has unread wake ups already.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!(thread = self.index, "waking thread failed: {}", err)
            }
        }
    }
}

//------------ ThreadPipes ---------------------------------------------------

/// The receiving side of the pipes of one thread.
#[derive(Debug)]
pub struct ThreadPipes {
    query_rx: mpsc::Receiver<ThreadMessage>,
    control_rx: mpsc::UnboundedReceiver<ThreadMessage>,
    wake_rx: UnixStream,
}

impl ThreadPipes {
    /// Returns the descriptor to watch for incoming messages.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_rx.as_raw_fd()
    }

    /// Takes all pending messages, control messages first.
    fn drain(&mut self) -> Vec<ThreadMessage> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        let mut res = Vec::new();
        while let Ok(msg) = self.control_rx.try_recv() {
            res.push(msg);
        }
        while let Ok(msg) = self.query_rx.try_recv() {
            res.push(msg);
        }
        res
    }
}

/// Runs all messages waiting for the current thread.
pub fn handle_pipe(ctx: &WorkerRef) {
    let Some(mut pipes) = ctx.take_pipes() else {
        return;
    };
    let messages = pipes.drain();
    ctx.put_pipes(pipes);
    trace!(count = messages.len(), "running thread messages");
    for msg in messages {
        msg.run(ctx);
    }
}

//------------ Topology ------------------------------------------------------

/// The pipes to all threads of the core.
#[derive(Debug)]
pub struct Topology {
    infos: Vec<WorkerInfo>,
    num_distributors: usize,
    pub(crate) load_balancing_factor: f64,
    pub(crate) counters: Arc<Counters>,
}

impl Topology {
    /// Creates the pipes for the threads configured in `config`.
    ///
    /// Returns the topology and the receiving sides, one per thread in the
    /// same order.
    pub fn new(
        config: &Config,
        counters: Arc<Counters>,
    ) -> io::Result<(Self, Vec<ThreadPipes>)> {
        let num_distributors = config.num_distributors();
        let total = num_distributors + config.num_workers();
        let mut infos = Vec::with_capacity(total);
        let mut pipes = Vec::with_capacity(total);
        for index in 0..total {
            let (query_tx, query_rx) =
                mpsc::channel(config.distribution_pipe_capacity());
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let (wake, wake_rx) = UnixStream::pair()?;
            wake.set_nonblocking(true)?;
            wake_rx.set_nonblocking(true)?;
            infos.push(WorkerInfo {
                index,
                role: if index < num_distributors {
                    Role::Distributor
                } else {
                    Role::Worker
                },
                query_tx,
                control_tx,
                wake,
                load: Default::default(),
                distributed: AtomicU64::new(0),
            });
            pipes.push(ThreadPipes {
                query_rx,
                control_rx,
                wake_rx,
            });
        }
        Ok((
            Topology {
                infos,
                num_distributors,
                load_balancing_factor: config.load_balancing_factor(),
                counters,
            },
            pipes,
        ))
    }

    /// Returns the information on all threads.
    pub fn infos(&self) -> &[WorkerInfo] {
        &self.infos
    }

    /// Returns the information on the thread with the given index.
    ///
    /// # Panics
    ///
    /// Panics if there is no such thread.
    pub fn info(&self, index: usize) -> &WorkerInfo {
        &self.infos[index]
    }

    /// Returns the number of distributor threads.
    pub fn num_distributors(&self) -> usize {
        self.num_distributors
    }

    /// Returns the information on the worker threads.
    pub fn workers(&self) -> &[WorkerInfo] {
        &self.infos[self.num_distributors..]
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_lists_distributors_first() {
        let mut config = Config::new();
        config.set_num_distributors(1);
        config.set_num_workers(3);
        let (topology, pipes) =
            Topology::new(&config, Arc::new(Counters::new())).unwrap();
        assert_eq!(pipes.len(), 4);
        assert_eq!(topology.info(0).role(), Role::Distributor);
        assert_eq!(topology.workers().len(), 3);
        assert!(topology.workers().iter().all(|w| w.role() == Role::Worker));
        assert_eq!(topology.workers()[0].index(), 1);
    }

    #[test]
    fn pending_messages_are_drained() {
        let config = Config::new();
        let (topology, mut pipes) =
            Topology::new(&config, Arc::new(Counters::new())).unwrap();
        let info = topology.info(0);
        info.try_send_query(ThreadMessage::new(|_| {})).unwrap();
        info.send_control(ThreadMessage::new(|_| {})).unwrap();
        assert_eq!(info.distributed(), 1);

        assert_eq!(pipes[0].drain().len(), 2);
        assert!(pipes[0].drain().is_empty());
    }
}
