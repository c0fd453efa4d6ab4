//! Scratch memory and worker dispatch for network evaluation.
//!
//! Per-timestep layers need small working vectors (a quantized copy of the
//! input row, a concatenated LSTM input, a back-propagated error row). Rather
//! than allocating them for every timestep, workers borrow a [`WorkerScratch`]
//! from a [`Pool`] once per dispatched job and hand it back when the job ends.
//! Buffers keep their capacity between calls, so steady-state recognition does
//! not allocate working memory.
//!
//! [`NetworkScratch`] also owns the optional rayon thread pool used to spread
//! independent timesteps over workers. Every timestep writes only its own
//! output row, so results do not depend on how the rows were scheduled.

use crate::dotproduct::DotProduct;
use crate::{LinescribeError, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;

#[cfg(feature = "pool-metrics")]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Below this many timesteps a layer runs on the calling thread.
pub const MIN_PARALLEL_TIMESTEPS: usize = 16;

/// Allocation counters for a [`Pool`].
#[cfg(feature = "pool-metrics")]
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub total_acquires: AtomicUsize,
    pub total_cache_hits: AtomicUsize,
    pub total_creations: AtomicUsize,
}

#[cfg(feature = "pool-metrics")]
impl PoolMetrics {
    /// Share of acquisitions served from the pool, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let acquires = self.total_acquires.load(Ordering::Relaxed);
        if acquires == 0 {
            return 0.0;
        }
        (self.total_cache_hits.load(Ordering::Relaxed) as f64 / acquires as f64) * 100.0
    }
}

/// Types that can be handed back to a [`Pool`] and reused.
pub trait Recyclable: Send + 'static {
    /// Clear contents, keeping allocated capacity.
    fn reset(&mut self);
}

/// A thread-safe free list of reusable objects.
pub struct Pool<T: Recyclable> {
    factory: Arc<dyn Fn() -> T + Send + Sync>,
    objects: Arc<Mutex<Vec<T>>>,
    max_size: usize,
    #[cfg(feature = "pool-metrics")]
    metrics: Arc<PoolMetrics>,
}

impl<T: Recyclable> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            factory: Arc::clone(&self.factory),
            objects: Arc::clone(&self.objects),
            max_size: self.max_size,
            #[cfg(feature = "pool-metrics")]
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<T: Recyclable> Pool<T> {
    pub fn new<F>(factory: F, max_size: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Pool {
            factory: Arc::new(factory),
            objects: Arc::new(Mutex::new(Vec::with_capacity(max_size))),
            max_size,
            #[cfg(feature = "pool-metrics")]
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Take an object from the pool, creating one if the pool is empty.
    pub fn acquire(&self) -> PoolGuard<T> {
        #[cfg(feature = "pool-metrics")]
        self.metrics.total_acquires.fetch_add(1, Ordering::Relaxed);

        let reused = self.objects.lock().pop();
        let object = match reused {
            Some(mut obj) => {
                #[cfg(feature = "pool-metrics")]
                self.metrics.total_cache_hits.fetch_add(1, Ordering::Relaxed);
                obj.reset();
                obj
            }
            None => {
                #[cfg(feature = "pool-metrics")]
                self.metrics.total_creations.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        };

        PoolGuard {
            object: Some(object),
            pool: self.clone(),
        }
    }

    /// Number of idle objects currently held.
    pub fn size(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn clear(&self) {
        self.objects.lock().clear();
    }

    #[cfg(feature = "pool-metrics")]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

/// Returns its object to the pool on drop.
pub struct PoolGuard<T: Recyclable> {
    object: Option<T>,
    pool: Pool<T>,
}

impl<T: Recyclable> std::ops::Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("pooled object is present until drop")
    }
}

impl<T: Recyclable> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("pooled object is present until drop")
    }
}

impl<T: Recyclable> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            // Reset happens on the next acquire, not here.
            let mut objects = self.pool.objects.lock();
            if objects.len() < self.pool.max_size {
                objects.push(object);
            }
        }
    }
}

/// Working vectors owned by one worker for the duration of a job.
#[derive(Debug, Default)]
pub struct WorkerScratch {
    pub floats: Vec<f32>,
    pub floats2: Vec<f32>,
    pub ints: Vec<i8>,
}

impl Recyclable for WorkerScratch {
    fn reset(&mut self) {
        self.floats.clear();
        self.floats2.clear();
        self.ints.clear();
    }
}

impl Recyclable for Vec<f32> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Evaluation context: dot-product back end, worker pool and scratch buffers.
pub struct NetworkScratch {
    dot: DotProduct,
    workers: Option<Arc<rayon::ThreadPool>>,
    num_threads: usize,
    buffers: Pool<WorkerScratch>,
}

impl std::fmt::Debug for NetworkScratch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkScratch")
            .field("dot", &self.dot)
            .field("num_threads", &self.num_threads)
            .field("idle_buffers", &self.buffers.size())
            .finish()
    }
}

impl Default for NetworkScratch {
    fn default() -> Self {
        Self::sequential()
    }
}

impl NetworkScratch {
    /// Single-threaded context using the process-wide dot product.
    pub fn sequential() -> Self {
        Self {
            dot: DotProduct::global(),
            workers: None,
            num_threads: 1,
            buffers: Pool::new(WorkerScratch::default, 4),
        }
    }

    /// Context dispatching timesteps over `num_threads` workers.
    ///
    /// `num_threads <= 1` yields a sequential context.
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads <= 1 {
            return Ok(Self::sequential());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("linescribe-worker-{i}"))
            .build()
            .map_err(|e| LinescribeError::Other(format!("Failed to build worker pool: {e}")))?;
        Ok(Self {
            dot: DotProduct::global(),
            workers: Some(Arc::new(pool)),
            num_threads,
            buffers: Pool::new(WorkerScratch::default, num_threads * 4),
        })
    }

    /// Context sized to the machine (`num_cpus`) unless `threads` is given.
    pub fn from_thread_count(threads: Option<usize>) -> Result<Self> {
        Self::new(threads.unwrap_or_else(num_cpus::get))
    }

    pub fn with_dot_product(mut self, dot: DotProduct) -> Self {
        self.dot = dot;
        self
    }

    pub fn dot_product(&self) -> DotProduct {
        self.dot
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn acquire(&self) -> PoolGuard<WorkerScratch> {
        self.buffers.acquire()
    }

    pub fn buffer_pool(&self) -> &Pool<WorkerScratch> {
        &self.buffers
    }

    /// Run `op` inside the worker pool, if there is one.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.workers {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Call `f(t, row, scratch)` for every `depth`-sized row of `data`.
    ///
    /// Rows are independent; they may run concurrently, each on a worker with
    /// its own scratch buffers.
    pub fn for_each_timestep<F>(&self, data: &mut [f32], depth: usize, f: F)
    where
        F: Fn(usize, &mut [f32], &mut WorkerScratch) + Send + Sync,
    {
        if depth == 0 {
            return;
        }
        match &self.workers {
            Some(pool) if data.len() / depth >= MIN_PARALLEL_TIMESTEPS => pool.install(|| {
                data.par_chunks_mut(depth)
                    .enumerate()
                    .for_each_init(|| self.buffers.acquire(), |scratch, (t, row)| f(t, row, scratch));
            }),
            _ => {
                let mut scratch = self.buffers.acquire();
                for (t, row) in data.chunks_mut(depth).enumerate() {
                    f(t, row, &mut scratch);
                }
            }
        }
    }
}
