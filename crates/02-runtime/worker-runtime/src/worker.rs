use std::fmt;
use std::mem;
use std::sync::Arc;

use mm_iface::MmIface;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::async_ctx::AsyncContext;
use crate::callbackq::CallbackQueue;
use crate::config::{ThreadMode, WorkerConfig};
use crate::context::Context;
use crate::error::{WorkerError, WorkerResult};

/// Messages an [`MmIface`] engine receives per worker progress call.
const MM_PROGRESS_BATCH: usize = 16;

/// Something the worker polls on every progress call.
pub trait ProgressEngine: Send {
    fn progress(&mut self) -> WorkerResult<usize>;

    fn name(&self) -> &'static str;
}

impl ProgressEngine for MmIface {
    fn progress(&mut self) -> WorkerResult<usize> {
        Ok(MmIface::progress(self, MM_PROGRESS_BATCH)?)
    }

    fn name(&self) -> &'static str {
        "mm"
    }
}

/// Holds the worker critical section; a no-op in single-thread mode.
#[must_use = "the critical section is released as soon as the guard drops"]
pub struct CsGuard<'a> {
    _lock: Option<ReentrantMutexGuard<'a, ()>>,
}

/// Progress driver owning the async context and the one-shot callback queue.
pub struct Worker {
    context: Arc<Context>,
    config: WorkerConfig,
    mt_lock: Option<ReentrantMutex<()>>,
    async_ctx: Arc<AsyncContext>,
    callbackq: Arc<CallbackQueue>,
    engines: Mutex<Vec<Box<dyn ProgressEngine>>>,
}

impl Worker {
    pub fn new(context: Arc<Context>, config: WorkerConfig) -> WorkerResult<Self> {
        if config.progress_queue_depth == 0 {
            return Err(WorkerError::InvalidParam("progress queue depth must be non-zero"));
        }
        let mt_lock = match config.thread_mode {
            ThreadMode::Single => None,
            ThreadMode::Multi => Some(ReentrantMutex::new(())),
        };
        tracing::debug!(
            thread_mode = ?config.thread_mode,
            progress_queue_depth = config.progress_queue_depth,
            resources = context.resources().len(),
            "created worker"
        );
        Ok(Self {
            context,
            config,
            mt_lock,
            async_ctx: Arc::new(AsyncContext::new()),
            callbackq: Arc::new(CallbackQueue::new(config.progress_queue_depth)),
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn async_ctx(&self) -> &Arc<AsyncContext> {
        &self.async_ctx
    }

    pub fn callbackq(&self) -> &Arc<CallbackQueue> {
        &self.callbackq
    }

    /// Enters the worker critical section. Reentrant, so callbacks running
    /// under [`Worker::progress`] may call back into the worker.
    pub fn enter_cs(&self) -> CsGuard<'_> {
        CsGuard {
            _lock: self.mt_lock.as_ref().map(|lock| lock.lock()),
        }
    }

    pub fn register_engine<E>(&self, engine: E)
    where
        E: ProgressEngine + 'static,
    {
        let _cs = self.enter_cs();
        tracing::trace!(engine = engine.name(), "registered progress engine");
        self.engines.lock().push(Box::new(engine));
    }

    /// Runs queued one-shot callbacks, then polls every engine once.
    ///
    /// Engines are polled outside the engine list lock, so their handlers may
    /// call [`Worker::register_engine`]; new engines are first polled on the
    /// next call. Returns the amount of work done.
    pub fn progress(&self) -> WorkerResult<usize> {
        let _cs = self.enter_cs();
        let mut work = self.callbackq.dispatch();

        let mut engines = mem::take(&mut *self.engines.lock());
        let mut outcome = Ok(());
        for engine in engines.iter_mut() {
            match engine.progress() {
                Ok(done) => work += done,
                Err(err) => {
                    tracing::error!(engine = engine.name(), "engine progress failed: {err}");
                    outcome = Err(err);
                    break;
                }
            }
        }

        let mut registered = self.engines.lock();
        engines.append(&mut registered);
        *registered = engines;
        outcome.map(|()| work)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("async_ctx", &self.async_ctx)
            .field("callbackq", &self.callbackq)
            .finish()
    }
}
