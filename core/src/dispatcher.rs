//! Per-entity event dispatcher.
//!
//! An [`InternalDispatcher`] routes events to the guard evaluators registered
//! by one entity. Handler execution is serialised on a mailbox task owned by
//! the dispatcher, so handlers of one entity never run concurrently and
//! asynchronous dispatches from one thread run in submission order.
//!
//! Two delivery modes exist:
//!
//! * [`InternalDispatcher::immediate_dispatch`] resolves once every accepted
//!   handler ran and reports the first guard or handler error. Lifecycle
//!   markers use it.
//! * [`InternalDispatcher::async_dispatch`] returns at once. Events raised on
//!   one thread go through a thread-local FIFO drained by the outermost caller,
//!   so an event raised while another one is being routed is queued instead of
//!   routed reentrantly.
//!
//! The entity lifecycle is NEW → RUNNING → DESTROYED. Asynchronous events
//! arriving while NEW are buffered and flushed once by [`InternalDispatcher::start`];
//! events arriving after destruction are discarded.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::Event;
use crate::guard::{AcceptedHandler, GuardRegistry, PerceptionGuards};
use crate::{KernelError, Result};

/// Lifecycle state of the entity backing a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityState {
    New,
    Running,
    Destroyed,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub handlers_run: u64,
    pub handler_failures: u64,
    pub guard_failures: u64,
    pub dead_events: u64,
    pub dropped_dead_events: u64,
    pub buffered: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    handlers_run: AtomicU64,
    handler_failures: AtomicU64,
    guard_failures: AtomicU64,
    dead_events: AtomicU64,
    dropped_dead_events: AtomicU64,
    buffered: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handlers_run: self.handlers_run.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            guard_failures: self.guard_failures.load(Ordering::Relaxed),
            dead_events: self.dead_events.load(Ordering::Relaxed),
            dropped_dead_events: self.dropped_dead_events.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Unit of work executed by the mailbox task.
struct Job {
    event: Event,
    handlers: Vec<AcceptedHandler>,
    done: Option<oneshot::Sender<Result<()>>>,
}

struct Lifecycle {
    state: EntityState,
    buffer: VecDeque<Event>,
    // set while start() drains the buffer; the state stays NEW meanwhile
    flushing: bool,
}

struct Inner {
    name: String,
    registry: GuardRegistry,
    lifecycle: Mutex<Lifecycle>,
    // None once shutdown began
    mailbox: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    counters: Arc<Counters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    static PENDING: RefCell<VecDeque<(Arc<Inner>, Event)>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        DRAINING.with(|d| d.set(false));
    }
}

/// Queues `event` on the calling thread; the outermost caller drains the queue.
fn enqueue_on_thread(inner: Arc<Inner>, event: Event) {
    PENDING.with(|q| q.borrow_mut().push_back((inner, event)));
    if DRAINING.with(|d| d.replace(true)) {
        return;
    }
    let _guard = DrainGuard;
    while let Some((inner, event)) = PENDING.with(|q| q.borrow_mut().pop_front()) {
        inner.route_async(event);
    }
}

impl Inner {
    fn route_async(self: &Arc<Self>, event: Event) {
        let evaluators = self.registry.evaluators_for(&event);
        if evaluators.is_empty() {
            if let Some(dead) = self.on_unmatched(&event) {
                enqueue_on_thread(Arc::clone(self), dead);
            }
            return;
        }

        let mut handlers = Vec::new();
        for evaluator in evaluators.iter() {
            match GuardRegistry::evaluate_guard(evaluator, &event) {
                Ok(accepted) => handlers.extend(accepted),
                Err(e) => {
                    Counters::bump(&self.counters.guard_failures);
                    warn!(target: "dispatcher", entity = %self.name, event_id = %event.id, error = %e, "Guard evaluation failed");
                }
            }
        }
        if handlers.is_empty() {
            debug!(target: "dispatcher", entity = %self.name, event_type = %event.r#type, "No guard accepted event");
            return;
        }
        if let Err(e) = self.submit(Job {
            event,
            handlers,
            done: None,
        }) {
            Counters::bump(&self.counters.discarded);
            debug!(target: "dispatcher", entity = %self.name, error = %e, "Dropping event for closed dispatcher");
        }
    }

    /// Dead-event policy: an unmatched event is rewrapped once; an unmatched
    /// dead event is dropped.
    fn on_unmatched(&self, event: &Event) -> Option<Event> {
        if event.is_dead_event() {
            Counters::bump(&self.counters.dropped_dead_events);
            debug!(target: "dispatcher", entity = %self.name, event_id = %event.id, "Dropping unmatched dead event");
            None
        } else {
            Counters::bump(&self.counters.dead_events);
            debug!(target: "dispatcher", entity = %self.name, event_type = %event.r#type, "No listener, redispatching as dead event");
            Some(Event::dead_letter_of(event))
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        let mailbox = lock(&self.mailbox);
        let tx = mailbox.as_ref().ok_or(KernelError::DispatcherClosed)?;
        Counters::bump(&self.counters.dispatched);
        tx.send(job).map_err(|_| KernelError::DispatcherClosed)
    }
}

async fn run_mailbox(name: String, counters: Arc<Counters>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let mut first_error = None;
        for handler in &job.handlers {
            Counters::bump(&counters.handlers_run);
            if let Err(e) = handler.invoke(&job.event) {
                Counters::bump(&counters.handler_failures);
                if job.done.is_none() {
                    error!(target: "dispatcher", entity = %name, event_id = %job.event.id, error = %e, "Handler failed");
                }
                first_error.get_or_insert(e);
            }
        }
        if let Some(done) = job.done {
            let _ = done.send(first_error.map_or(Ok(()), Err));
        }
    }
    debug!(target: "dispatcher", entity = %name, "Mailbox closed");
}

/// Event router of one entity.
pub struct InternalDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InternalDispatcher {
    /// Creates a dispatcher in the NEW state. Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_mailbox(name.clone(), Arc::clone(&counters), rx));
        Self {
            inner: Arc::new(Inner {
                name,
                registry: GuardRegistry::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: EntityState::New,
                    buffer: VecDeque::new(),
                    flushing: false,
                }),
                mailbox: Mutex::new(Some(tx)),
                counters,
            }),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &GuardRegistry {
        &self.inner.registry
    }

    pub fn register<T: PerceptionGuards>(&self, listener: &Arc<T>) -> bool {
        self.inner.registry.register(listener)
    }

    pub fn unregister<T: PerceptionGuards>(&self, listener: &Arc<T>) -> Result<usize> {
        self.inner.registry.unregister(listener)
    }

    pub fn state(&self) -> EntityState {
        lock(&self.inner.lifecycle).state
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.counters.snapshot()
    }

    /// Flushes the buffered events in arrival order, then moves NEW → RUNNING.
    ///
    /// Events dispatched while the flush runs are still buffered behind the
    /// ones being flushed, so nothing overtakes an earlier event.
    pub fn start(&self) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.state != EntityState::New || lifecycle.flushing {
                debug!(target: "dispatcher", entity = %self.inner.name, state = ?lifecycle.state, "Start ignored");
                return;
            }
            lifecycle.flushing = true;
        }

        let mut flushed = 0;
        loop {
            let batch = {
                let mut lifecycle = lock(&self.inner.lifecycle);
                if lifecycle.buffer.is_empty() {
                    lifecycle.flushing = false;
                    if lifecycle.state == EntityState::New {
                        lifecycle.state = EntityState::Running;
                    }
                    break;
                }
                std::mem::take(&mut lifecycle.buffer)
            };
            flushed += batch.len();
            for event in batch {
                enqueue_on_thread(Arc::clone(&self.inner), event);
            }
        }
        info!(target: "dispatcher", entity = %self.inner.name, buffered = flushed, "Dispatcher running");
    }

    /// Fire-and-forget dispatch.
    pub fn async_dispatch(&self, event: Event) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match lifecycle.state {
                EntityState::New => {
                    Counters::bump(&self.inner.counters.buffered);
                    lifecycle.buffer.push_back(event);
                    return;
                }
                EntityState::Destroyed => {
                    Counters::bump(&self.inner.counters.discarded);
                    debug!(target: "dispatcher", entity = %self.inner.name, event_id = %event.id, "Discarding event for destroyed entity");
                    return;
                }
                EntityState::Running => {}
            }
        }
        enqueue_on_thread(Arc::clone(&self.inner), event);
    }

    /// Runs every accepted handler on the mailbox and waits for completion.
    ///
    /// Guards run on the caller; a failing guard does not prevent the other
    /// evaluators from running. The first guard error, else the first handler
    /// error, is returned.
    pub async fn immediate_dispatch(&self, event: Event) -> Result<()> {
        let mut event = event;
        let evaluators = loop {
            let evaluators = self.inner.registry.evaluators_for(&event);
            if !evaluators.is_empty() {
                break evaluators;
            }
            match self.inner.on_unmatched(&event) {
                Some(dead) => event = dead,
                None => return Ok(()),
            }
        };

        let mut guard_error = None;
        let mut handlers = Vec::new();
        for evaluator in evaluators.iter() {
            match GuardRegistry::evaluate_guard(evaluator, &event) {
                Ok(accepted) => handlers.extend(accepted),
                Err(e) => {
                    Counters::bump(&self.inner.counters.guard_failures);
                    warn!(target: "dispatcher", entity = %self.inner.name, event_id = %event.id, error = %e, "Guard evaluation failed");
                    guard_error.get_or_insert(e);
                }
            }
        }

        let handler_result = if handlers.is_empty() {
            Ok(())
        } else {
            let (done_tx, done_rx) = oneshot::channel();
            self.inner.submit(Job {
                event,
                handlers,
                done: Some(done_tx),
            })?;
            done_rx.await.map_err(|_| KernelError::DispatcherClosed)?
        };

        match guard_error {
            Some(e) => Err(e),
            None => handler_result,
        }
    }

    /// Stops intake, waits up to `grace` for in-flight handlers, then aborts.
    pub async fn shutdown(&self, grace: Duration) {
        let discarded = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.state = EntityState::Destroyed;
            std::mem::take(&mut lifecycle.buffer).len()
        };
        if discarded > 0 {
            self.inner
                .counters
                .discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            warn!(target: "dispatcher", entity = %self.inner.name, discarded, "Discarded buffered events on destroy");
        }

        drop(lock(&self.inner.mailbox).take());
        let worker = lock(&self.worker).take();
        if let Some(mut handle) = worker {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(target: "dispatcher", entity = %self.inner.name, grace_ms = grace.as_millis() as u64, "In-flight handlers exceeded grace period, aborting");
                handle.abort();
            }
        }
        info!(target: "dispatcher", entity = %self.inner.name, "Dispatcher shut down");
    }
}

impl Drop for InternalDispatcher {
    fn drop(&mut self) {
        // Closing the mailbox lets the worker drain and exit.
        drop(lock(&self.inner.mailbox).take());
    }
}
