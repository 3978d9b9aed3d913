//! Workers, runtimes and the current-worker binding.
//!
//! A [`Runtime`] owns a fixed set of [`Worker`]s. Each worker owns a memory
//! [`Pool`] and at most one reducer map. A thread binds itself to a worker
//! with [`Runtime::enter`]; while the returned [`WorkerGuard`] is alive,
//! [`current_worker`] resolves to that worker on this thread and no other
//! thread can bind it.
//!
//! # Thread Safety
//!
//! The reducer map lives in an `UnsafeCell`. Only the thread bound to the
//! worker may touch it, which is why the raw accessors on [`Worker`] are
//! `unsafe` and the safe ones live on [`WorkerGuard`].

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;
use strand_alloc::{ContextId, MemTag, Pool};

use crate::config::Options;
use crate::error::RuntimeError;
use crate::map::{ReducerMap, ViewStorage};

pub type WorkerId = usize;

/// Scheduler callback for promoting a worker's own deque.
///
/// With `force_reduce` set, every reducer lookup first calls this hook so
/// that the scheduler can give the running strand a fresh reducer map.
pub trait DequeHook: Send + Sync {
    fn promote_own_deque(&self, w: &Worker);
}

/// A worker of a strand runtime.
pub struct Worker {
    id: WorkerId,
    ctx: ContextId,
    force_reduce: bool,
    pool: Pool,
    deque_hook: Option<Arc<dyn DequeHook>>,
    bound: AtomicBool,

    /// # Safety
    /// Only the thread bound to this worker may access the map.
    reducer_map: UnsafeCell<Option<Box<ReducerMap>>>,
}

// SAFETY: the map is only reached by the bound thread; everything else is
// `Sync` on its own.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    fn new(id: WorkerId, ctx: ContextId, options: &Options, deque_hook: Option<Arc<dyn DequeHook>>) -> Self {
        Self {
            id,
            ctx,
            force_reduce: options.force_reduce,
            pool: Pool::new(Some(ctx)),
            deque_hook,
            bound: AtomicBool::new(false),
            reducer_map: UnsafeCell::new(None),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn force_reduce(&self) -> bool {
        self.force_reduce
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    fn try_bind(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unbind(&self) {
        self.bound.store(false, Ordering::Release);
    }

    pub fn promote_own_deque(&self) {
        match &self.deque_hook {
            Some(hook) => hook.promote_own_deque(self),
            None => log::trace!("worker {}: no deque hook, nothing to promote", self.id),
        }
    }

    /// The worker's reducer map, if one is installed.
    ///
    /// # Safety
    /// The caller must be bound to this worker and must not hold another
    /// reference to the map.
    pub unsafe fn reducer_map(&self) -> Option<&mut ReducerMap> {
        (*self.reducer_map.get()).as_deref_mut()
    }

    /// The worker's reducer map, installing an empty one if needed.
    ///
    /// # Safety
    /// As for [`Worker::reducer_map`].
    pub unsafe fn reducer_map_or_install(&self) -> &mut ReducerMap {
        let slot = &mut *self.reducer_map.get();
        if slot.is_none() {
            log::debug!("worker {}: installing a new reducer map", self.id);
        }
        slot.get_or_insert_with(|| ReducerMap::make(Some(self)))
    }

    /// Detaches the worker's map.
    ///
    /// # Safety
    /// As for [`Worker::reducer_map`].
    pub unsafe fn take_reducer_map(&self) -> Option<Box<ReducerMap>> {
        (*self.reducer_map.get()).take()
    }

    /// Replaces the worker's map, returning the previous one.
    ///
    /// # Safety
    /// As for [`Worker::reducer_map`].
    pub unsafe fn set_reducer_map(&self, map: Option<Box<ReducerMap>>) -> Option<Box<ReducerMap>> {
        mem::replace(&mut *self.reducer_map.get(), map)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(map) = self.reducer_map.get_mut().take() {
            log::debug!("worker {}: cleaning up reducers ({} left)", self.id, map.len());
            map.destroy(Some(&*self));
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}

/// A set of workers sharing one memory context.
pub struct Runtime {
    ctx: ContextId,
    options: Options,
    workers: Vec<Arc<Worker>>,
    exiting_worker: CachePadded<AtomicUsize>,
}

impl Runtime {
    pub fn new(options: Options) -> Result<Self, RuntimeError> {
        options.validate()?;
        Ok(Self::start(options, None))
    }

    /// Creates a runtime whose workers call `hook` to promote their deques.
    pub fn with_deque_hook(options: Options, hook: Arc<dyn DequeHook>) -> Result<Self, RuntimeError> {
        options.validate()?;
        Ok(Self::start(options, Some(hook)))
    }

    fn start(options: Options, hook: Option<Arc<dyn DequeHook>>) -> Self {
        let ctx = ContextId::next();
        let workers = (0..options.nworkers)
            .map(|id| Arc::new(Worker::new(id, ctx, &options, hook.clone())))
            .collect();
        log::info!(
            "strand runtime {} started with {} workers (force_reduce: {})",
            ctx,
            options.nworkers,
            options.force_reduce
        );
        Self {
            ctx,
            options,
            workers,
            exiting_worker: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn nworkers(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Arc<Worker>> {
        self.workers.get(id)
    }

    /// The worker most recently released by a thread.
    pub fn exiting_worker(&self) -> &Arc<Worker> {
        let id = self.exiting_worker.load(Ordering::Relaxed);
        &self.workers[id.min(self.workers.len() - 1)]
    }

    /// Binds the calling thread to worker `id` until the guard is dropped.
    ///
    /// Guards on one thread must be dropped in reverse order of creation.
    pub fn enter(&self, id: WorkerId) -> Result<WorkerGuard<'_>, RuntimeError> {
        let worker = self.workers.get(id).ok_or(RuntimeError::NoSuchWorker(id))?;
        if !worker.try_bind() {
            return Err(RuntimeError::WorkerBusy(id));
        }
        let previous = CURRENT_WORKER.with(|cur| cur.replace(Some(Arc::clone(worker))));
        log::trace!("worker {} entered on {:?}", id, std::thread::current().id());
        Ok(WorkerGuard {
            runtime: self,
            worker: Arc::clone(worker),
            previous,
            _not_send: PhantomData,
        })
    }

    /// Bytes under `tag` outstanding across all worker pools.
    pub fn outstanding(&self, tag: MemTag) -> isize {
        self.workers.iter().map(|w| w.pool.outstanding(tag)).sum()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        log::info!("strand runtime {} shutting down", self.ctx);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("ctx", &self.ctx)
            .field("options", &self.options)
            .field("workers", &self.workers)
            .finish()
    }
}

/// Proof that the calling thread is bound to a worker.
pub struct WorkerGuard<'rt> {
    runtime: &'rt Runtime,
    worker: Arc<Worker>,
    previous: Option<Arc<Worker>>,
    _not_send: PhantomData<*const ()>,
}

impl<'rt> WorkerGuard<'rt> {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    pub fn reducer_map(&mut self) -> Option<&mut ReducerMap> {
        // SAFETY: the guard proves the binding; `&mut self` rules out
        // overlapping borrows.
        unsafe { self.worker.reducer_map() }
    }

    pub fn take_reducer_map(&mut self) -> Option<Box<ReducerMap>> {
        // SAFETY: as in `reducer_map`.
        unsafe { self.worker.take_reducer_map() }
    }

    pub fn set_reducer_map(&mut self, map: Option<Box<ReducerMap>>) -> Option<Box<ReducerMap>> {
        // SAFETY: as in `reducer_map`.
        unsafe { self.worker.set_reducer_map(map) }
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_WORKER.try_with(|cur| *cur.borrow_mut() = previous);
        self.worker.unbind();
        self.runtime.exiting_worker.store(self.worker.id, Ordering::Relaxed);
        log::trace!("worker {} exited", self.worker.id);
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
    static TEARDOWN_WORKER: Cell<Option<NonNull<Worker>>> = const { Cell::new(None) };
}

struct RestoreTeardown(Option<NonNull<Worker>>);

impl Drop for RestoreTeardown {
    fn drop(&mut self) {
        let _ = TEARDOWN_WORKER.try_with(|cur| cur.set(self.0));
    }
}

/// Runs `f` with view storage routed to `w`'s pool.
///
/// Map teardown runs the reducers' deallocate callbacks, which cannot be
/// told which worker owns the map. `None` leaves the routing unchanged.
pub(crate) fn with_teardown_worker<R>(w: Option<&Worker>, f: impl FnOnce() -> R) -> R {
    let Some(w) = w else {
        return f();
    };
    let _restore = RestoreTeardown(TEARDOWN_WORKER.with(|cur| cur.replace(Some(NonNull::from(w)))));
    f()
}

/// Runs `f` on the pool that view storage comes from: the teardown worker's,
/// else the current worker's, else the default runtime's exiting worker's.
pub(crate) fn view_pool<R>(f: impl FnOnce(&Pool) -> R) -> R {
    if let Some(w) = TEARDOWN_WORKER.try_with(Cell::get).ok().flatten() {
        // SAFETY: only set while `with_teardown_worker` borrows the worker.
        return f(unsafe { w.as_ref() }.pool());
    }
    match current_worker() {
        Some(w) => f(w.pool()),
        None => f(default_runtime().exiting_worker().pool()),
    }
}

/// The worker bound to the calling thread, if any.
pub fn current_worker() -> Option<Arc<Worker>> {
    CURRENT_WORKER
        .try_with(|cur| cur.borrow().clone())
        .ok()
        .flatten()
}

/// The pool serving `w`, or the context-less global pool.
pub fn pool_for(w: Option<&Worker>) -> &Pool {
    match w {
        Some(w) => w.pool(),
        None => strand_alloc::global(),
    }
}

static DEFAULT_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// The process-wide runtime used outside any parallel region.
///
/// Created on first use from [`Options::from_env`], falling back to the
/// defaults when the environment is invalid.
pub fn default_runtime() -> &'static Runtime {
    DEFAULT_RUNTIME.get_or_init(|| {
        let options = Options::from_env().unwrap_or_else(|err| {
            log::warn!("ignoring invalid runtime options: {}", err);
            Options::default()
        });
        Runtime::start(options, None)
    })
}
