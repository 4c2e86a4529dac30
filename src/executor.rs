use super::*;

use std::{
    cell::UnsafeCell,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use rayon::prelude::*;

/// Worker pool handle passed to `build`, `update` and the parallel searches.
/// The default executor runs on rayon's global pool; `with_threads` builds a
/// dedicated pool. Cloning is cheap and shares the pool.
#[derive(Clone, Default)]
pub struct Executor {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Executor {
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("Failed to build worker pool")?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Number of workers, fixed for the lifetime of the pool.
    pub fn num_workers(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Index of the calling worker in `0..num_workers()`, or `None` when the
    /// caller is not one of this executor's workers.
    pub fn worker_index(&self) -> Option<usize> {
        match &self.pool {
            Some(pool) => pool.current_thread_index(),
            None => rayon::current_thread_index(),
        }
    }

    /// Runs `op` inside the pool so that nested parallel work lands on this
    /// executor's workers.
    pub fn install<Op, T>(&self, op: Op) -> T
    where
        Op: FnOnce() -> T + Send,
        T: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Applies `f` to every element, partitioned across workers. Unordered;
    /// `f` must be safe to call concurrently.
    pub fn parallel_apply<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(&mut T) + Sync,
    {
        self.install(|| items.par_iter_mut().for_each(|item| f(item)));
    }

    /// `parallel_apply` with the element index passed along.
    pub fn parallel_apply_indexed<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync,
    {
        self.install(|| {
            items
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, item)| f(i, item));
        });
    }

    /// Runs `f` over contiguous index blocks covering `0..len`.
    pub fn parallel_for<F>(&self, len: usize, f: F)
    where
        F: Fn(Range<usize>) + Sync,
    {
        if len == 0 {
            return;
        }
        let blocks = (self.num_workers() * 4).max(1);
        let block_len = (len + blocks - 1) / blocks;
        self.install(|| {
            (0..len)
                .into_par_iter()
                .step_by(block_len)
                .for_each(|begin| f(begin..(begin + block_len).min(len)));
        });
    }

    pub fn parallel_copy<T>(&self, src: &[T], dst: &mut [T])
    where
        T: Copy + Send + Sync,
    {
        assert_eq!(src.len(), dst.len());
        self.install(|| {
            dst.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(d, s)| *d = *s);
        });
    }

    /// Fills `dst` with `start, start + 1, ...` in parallel.
    pub fn parallel_iota<I>(&self, dst: &mut [I], start: usize)
    where
        I: TreeIndex,
    {
        self.parallel_apply_indexed(dst, |i, value| *value = I::from_usize(start + i));
    }
}

//
// Per-worker accumulators
//
// Both containers hold one slot per worker plus a reserve slot for the single
// thread driving the parallel region from outside the pool. A slot is only
// ever touched by the thread it belongs to, which is what makes the unsafe
// cell access below sound; they must not be shared across two concurrently
// running parallel regions.
//

pub struct LocalVector<'e, T> {
    executor: &'e Executor,
    slots: Vec<UnsafeCell<Vec<T>>>,
}

// SAFETY: each worker of the executor's pool has a stable, distinct index and
// writes only its own slot; the reserve slot is written only by the thread
// that owns the region.
unsafe impl<T: Send> Sync for LocalVector<'_, T> {}

impl<'e, T: Send> LocalVector<'e, T> {
    pub fn new(executor: &'e Executor) -> Self {
        let slots = (0..executor.num_workers() + 1)
            .map(|_| UnsafeCell::new(Vec::new()))
            .collect();
        Self { executor, slots }
    }

    #[inline]
    fn slot(&self) -> usize {
        let reserve = self.slots.len() - 1;
        match self.executor.worker_index() {
            Some(index) if index < reserve => index,
            _ => reserve,
        }
    }

    /// Appends to the calling worker's vector, no synchronization.
    #[inline]
    pub fn push(&self, value: T) {
        // SAFETY: see the Sync impl; the slot belongs to this thread.
        unsafe { (*self.slots[self.slot()].get()).push(value) };
    }

    /// Concatenates the per-worker vectors in worker-id order.
    pub fn merge(self) -> Vec<T> {
        let mut out = Vec::new();
        for cell in self.slots {
            out.append(&mut cell.into_inner());
        }
        out
    }
}

pub struct LocalValue<'e, T> {
    executor: &'e Executor,
    slots: Vec<UnsafeCell<T>>,
}

// SAFETY: as for `LocalVector`.
unsafe impl<T: Send> Sync for LocalValue<'_, T> {}

impl<'e, T: Clone + Send> LocalValue<'e, T> {
    pub fn new(executor: &'e Executor, seed: T) -> Self {
        let slots = (0..executor.num_workers() + 1)
            .map(|_| UnsafeCell::new(seed.clone()))
            .collect();
        Self { executor, slots }
    }

    #[inline]
    fn slot(&self) -> usize {
        let reserve = self.slots.len() - 1;
        match self.executor.worker_index() {
            Some(index) if index < reserve => index,
            _ => reserve,
        }
    }

    /// Gives `f` the calling worker's value, no synchronization.
    #[inline]
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        // SAFETY: see the Sync impl; the slot belongs to this thread.
        unsafe { f(&mut *self.slots[self.slot()].get()) };
    }

    /// Folds the per-worker values in worker-id order. `op` must be
    /// associative for the result to be deterministic.
    pub fn reduce<Op: FnMut(T, T) -> T>(self, op: Op) -> T {
        self.slots
            .into_iter()
            .map(UnsafeCell::into_inner)
            .reduce(op)
            .expect("Local value has at least one slot")
    }
}

//
// Atomic best-so-far
//

/// Monotonically decreasing metric shared between workers, stored as `f64`
/// bits. `update_min` is the "assign if strictly better" compare-and-swap.
pub struct AtomicMetric(AtomicU64);

impl AtomicMetric {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn update_min(&self, value: f64) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        while value < f64::from_bits(current) {
            match self.0.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

/// Widens a metric for use in the shared atomics.
#[inline]
pub(crate) fn metric_f64<R: Real>(value: R) -> f64 {
    num::ToPrimitive::to_f64(&value).unwrap_or(f64::INFINITY)
}
