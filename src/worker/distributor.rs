//! Handing queries and control messages to threads.
//!
//! Distributor threads read queries from the UDP listen sockets and pass
//! each to a worker picked by a hash of its question, so that identical
//! questions end up on the same worker and can be chained there. With a
//! load balancing factor configured, a worker loaded more than the factor
//! times the average is skipped in favour of the next one that is not.
//!
//! Query pipes are bounded. If the pipe to the chosen worker is full, one
//! other worker is picked at random. If that one is full, too, the query
//! is dropped.
//!
//! The thread that started the core uses [`Topology::broadcast`] and
//! [`Topology::broadcast_acc`] to run functions on every thread, for
//! instance to collect statistics or to shut down.

use core::ops::AddAssign;

use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::pipes::{ThreadMessage, Topology};
use super::{Role, WorkerRef};
use crate::metrics::Counter;

impl Topology {
    /// Picks the worker for a query with the given question hash.
    ///
    /// Returns the position of the worker among the worker threads.
    pub fn select_worker(&self, hash: u64) -> usize {
        let workers = self.workers();
        let count = workers.len();
        let start = (hash % count as u64) as usize;
        if self.load_balancing_factor == 0.0 {
            return start;
        }

        // Start with one for the query being distributed.
        let loads: Vec<usize> = workers.iter().map(|info| info.load()).collect();
        let total = 1 + loads.iter().sum::<usize>();
        let target = total as f64 / count as f64 * self.load_balancing_factor;
        if loads[start] as f64 <= target {
            return start;
        }
        self.counters.inc(Counter::RebalancedQueries);
        (1..count)
            .map(|step| (start + step) % count)
            .find(|&idx| loads[idx] as f64 <= target)
            .unwrap_or(start)
    }

    /// Hands a query to a worker.
    ///
    /// Only distributor threads may hand out queries. For any other `from`
    /// the query is refused. Returns whether the query was accepted by some
    /// worker.
    pub fn distribute(
        &self,
        from: Role,
        hash: u64,
        msg: ThreadMessage,
    ) -> bool {
        if from != Role::Distributor {
            debug!(?from, "refusing to distribute query");
            return false;
        }
        let workers = self.workers();
        let target = self.select_worker(hash);
        let msg = match workers[target].try_send_query(msg) {
            Ok(()) => {
                trace!(worker = workers[target].index(), "distributed query");
                return true;
            }
            Err(TrySendError::Full(msg)) => msg,
            Err(TrySendError::Closed(_)) => return false,
        };

        if workers.len() > 1 {
            let mut rng = rand::thread_rng();
            let other = loop {
                let idx = rng.gen_range(0..workers.len());
                if idx != target {
                    break idx;
                }
            };
            match workers[other].try_send_query(msg) {
                Ok(()) => {
                    trace!(
                        worker = workers[other].index(),
                        "distributed query to other worker"
                    );
                    return true;
                }
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        self.counters.inc(Counter::QueryPipeFullDrops);
        debug!("dropping query, worker pipes full");
        false
    }

    /// Runs a function on every thread and waits until all have finished.
    ///
    /// Returns the number of threads that ran the function. Must not be
    /// called from a thread of the topology.
    pub fn broadcast<F>(&self, func: F) -> usize
    where
        F: Fn(&WorkerRef) + Send + Sync + 'static,
    {
        self.broadcast_acc(move |ctx| {
            func(ctx);
            1usize
        })
    }

    /// Runs a function on every thread and sums up the results.
    ///
    /// Threads that have already stopped do not contribute. Must not be
    /// called from a thread of the topology.
    pub fn broadcast_acc<T, F>(&self, func: F) -> T
    where
        T: Default + AddAssign + Send + 'static,
        F: Fn(&WorkerRef) -> T + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let replies: Vec<_> = self
            .infos()
            .iter()
            .filter_map(|info| {
                let (tx, rx) = oneshot::channel();
                let func = func.clone();
                let msg = ThreadMessage::new(move |ctx| {
                    let _ = tx.send(func(ctx));
                });
                info.send_control(msg).ok().map(|_| rx)
            })
            .collect();
        let mut res = T::default();
        for reply in replies {
            if let Ok(value) = reply.blocking_recv() {
                res += value;
            }
        }
        res
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use rstest::rstest;

    use super::*;
    use crate::config::Config;
    use crate::metrics::Counters;

    fn topology(workers: usize, factor: f64, capacity: usize) -> Topology {
        let mut config = Config::new();
        config.set_num_distributors(1);
        config.set_num_workers(workers);
        config.set_load_balancing_factor(factor);
        config.set_distribution_pipe_capacity(capacity);
        Topology::new(&config, Arc::new(Counters::new())).unwrap().0
    }

    #[rstest]
    #[case(0, 0)]
    #[case(5, 1)]
    #[case(7, 3)]
    fn hash_picks_worker_without_balancing(#[case] hash: u64, #[case] worker: usize) {
        let topology = topology(4, 0.0, 16);
        assert_eq!(topology.select_worker(hash), worker);
        assert_eq!(topology.select_worker(hash), worker);
    }

    #[test]
    fn balancing_skips_loaded_worker() {
        let topology = topology(3, 1.5, 16);
        topology.workers()[1].load.store(30, Ordering::Relaxed);
        topology.workers()[2].load.store(0, Ordering::Relaxed);
        // Target is (1 + 30) / 3 * 1.5 = 15.5.
        assert_eq!(topology.select_worker(1), 2);
        assert_eq!(topology.counters.get(Counter::RebalancedQueries), 1);
        assert_eq!(topology.select_worker(2), 2);
        assert_eq!(topology.counters.get(Counter::RebalancedQueries), 1);
    }

    #[test]
    fn full_pipes_shed_queries() {
        let mut config = Config::new();
        config.set_num_workers(2);
        config.set_distribution_pipe_capacity(1);
        let (topology, _pipes) =
            Topology::new(&config, Arc::new(Counters::new())).unwrap();
        assert!(topology.distribute(Role::Distributor, 0, ThreadMessage::new(|_| {})));
        // The hashed worker is full, the other one takes it.
        assert!(topology.distribute(Role::Distributor, 0, ThreadMessage::new(|_| {})));
        assert!(!topology.distribute(Role::Distributor, 0, ThreadMessage::new(|_| {})));
        assert_eq!(topology.counters.get(Counter::QueryPipeFullDrops), 1);
        assert_eq!(topology.workers()[0].distributed(), 1);
        assert_eq!(topology.workers()[1].distributed(), 1);
    }

    #[test]
    fn single_worker_sheds_right_away() {
        let mut config = Config::new();
        config.set_num_workers(1);
        config.set_distribution_pipe_capacity(1);
        let (topology, _pipes) =
            Topology::new(&config, Arc::new(Counters::new())).unwrap();
        assert!(topology.distribute(Role::Distributor, 9, ThreadMessage::new(|_| {})));
        assert!(!topology.distribute(Role::Distributor, 9, ThreadMessage::new(|_| {})));
        assert_eq!(topology.counters.get(Counter::QueryPipeFullDrops), 1);
    }

    #[test]
    fn workers_cannot_distribute() {
        let topology = topology(2, 0.0, 16);
        assert!(!topology.distribute(Role::Worker, 0, ThreadMessage::new(|_| {})));
        assert_eq!(topology.workers()[0].distributed(), 0);
        assert_eq!(topology.workers()[1].distributed(), 0);
        assert_eq!(topology.counters.get(Counter::QueryPipeFullDrops), 0);
    }
}
