//! A fixed-size pool of worker threads, each with its own private VM
//! instance, used to execute conflict-free transaction groups in parallel
//! (§4.5 "Parallel execution").
//!
//! Grounded in the chunk-level parallel executor pattern of
//! `other_examples/24f407ce_vhqtvn-revela__...apply_chunk_output.rs.rs`:
//! a `rayon` thread pool plus `par_iter`/`into_par_iter` over independent
//! units of work, with no unsafe code anywhere in the dispatch path.

use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Mutex;

use super::ContractVm;

/// One VM per worker slot, indexed by the worker's position in the pool
/// (not its OS thread id). `rayon::current_thread_index` returns this same
/// position for the thread currently executing a task, which is how
/// [`WorkerPool::run`] finds the right VM without any `unsafe` or
/// thread-local storage.
pub struct WorkerPool<Vm> {
    pool: ThreadPool,
    vms: Vec<Mutex<Vm>>,
}

impl<Vm: ContractVm> WorkerPool<Vm> {
    /// Builds a pool of `size` worker threads, calling `factory` once per
    /// worker up front to populate its VM slot — "populated once at
    /// thread registration", per §4.5, rather than lazily on first use.
    pub fn new(size: usize, mut factory: impl FnMut() -> Vm) -> Self {
        let size = size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .build()
            .expect("building a fixed-size rayon thread pool does not fail");
        let vms = (0..size).map(|_| Mutex::new(factory())).collect();
        WorkerPool { pool, vms }
    }

    pub fn worker_count(&self) -> usize {
        self.vms.len()
    }

    /// Runs `work` over every item in `items`, in parallel across the
    /// pool's workers, each call borrowing that worker's private VM.
    /// Item order in the result matches input order; this says nothing
    /// about execution order, which callers must not rely on since
    /// conflict-free grouping is the only thing that makes the result
    /// order-independent.
    pub fn run<T, R, F>(&self, items: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T, &mut Vm) -> R + Sync,
    {
        metrics::gauge!("chain_state.contract_state.worker_pool.queue_depth", items.len() as f64);
        self.pool.install(|| {
            items
                .into_par_iter()
                .map(|item| {
                    let index = rayon::current_thread_index().unwrap_or(0) % self.vms.len();
                    let mut vm = self.vms[index].lock().expect("worker VM mutex poisoned");
                    work(item, &mut vm)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_state::{ContractCache, ContractInvocation};
    use crate::error::Result;

    struct CountingVm {
        calls: u32,
    }

    impl ContractVm for CountingVm {
        fn execute(&mut self, _invocation: &ContractInvocation, _cache: &mut ContractCache) -> Result<()> {
            self.calls += 1;
            Ok(())
        }
    }

    #[test]
    fn dispatches_every_item_exactly_once() {
        let pool = WorkerPool::new(4, || CountingVm { calls: 0 });
        let items: Vec<u32> = (0..50).collect();
        let results = pool.run(items, |item, vm| {
            vm.calls += 1;
            item * 2
        });
        assert_eq!(results.len(), 50);
        assert_eq!(results[10], 20);
    }

    #[test]
    fn pool_of_one_still_runs_every_item() {
        let pool = WorkerPool::new(1, || CountingVm { calls: 0 });
        let results = pool.run(vec![1, 2, 3], |item, _vm| item + 1);
        assert_eq!(results, vec![2, 3, 4]);
    }
}
