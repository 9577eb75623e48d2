//! Guard evaluators and their registry.
//!
//! A listener object publishes a table of [`GuardEvaluator`]s through
//! [`PerceptionGuards`]: each entry names an event type, a guard predicate and
//! the handlers to run when the guard accepts. The [`GuardRegistry`] indexes
//! those tables per event type for one entity.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use loom_kernel::{Event, GuardEvaluator, GuardRegistry, PerceptionGuards};
//!
//! #[derive(Default)]
//! struct Pong {
//!     seen: AtomicUsize,
//! }
//!
//! impl PerceptionGuards for Pong {
//!     fn guard_evaluators(self: Arc<Self>) -> Vec<GuardEvaluator> {
//!         vec![GuardEvaluator::on("ping").then(move |_evt| {
//!             self.seen.fetch_add(1, Ordering::SeqCst);
//!             Ok(())
//!         })]
//!     }
//! }
//!
//! let registry = GuardRegistry::new();
//! let pong = Arc::new(Pong::default());
//! assert!(registry.register(&pong));
//!
//! let evt = Event::signal("ping");
//! for evaluator in registry.evaluators_for(&evt).iter() {
//!     for handler in GuardRegistry::evaluate_guard(evaluator, &evt).unwrap() {
//!         handler.invoke(&evt).unwrap();
//!     }
//! }
//! assert_eq!(pong.seen.load(Ordering::SeqCst), 1);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::event::Event;
use crate::{KernelError, Result};

/// Error type returned by user guard and handler code.
pub type BehaviorError = Box<dyn std::error::Error + Send + Sync>;

type GuardFn = Arc<dyn Fn(&Event) -> std::result::Result<bool, BehaviorError> + Send + Sync>;
type HandlerFn = Arc<dyn Fn(&Event) -> std::result::Result<(), BehaviorError> + Send + Sync>;

/// Implemented by objects that want to perceive events through a dispatcher.
pub trait PerceptionGuards: Send + Sync + 'static {
    /// Builds the guard table of this object. Closures usually capture `self`.
    fn guard_evaluators(self: Arc<Self>) -> Vec<GuardEvaluator>;
}

/// Identity of a registered object (its `Arc` allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey(usize);

impl TargetKey {
    pub fn of<T: ?Sized>(target: &Arc<T>) -> Self {
        Self(Arc::as_ptr(target).cast::<()>() as usize)
    }
}

/// One guard predicate of a target object plus the handlers it unlocks.
#[derive(Clone)]
pub struct GuardEvaluator {
    event_type: String,
    guard: GuardFn,
    handlers: Vec<HandlerFn>,
    target: Option<TargetKey>,
    target_name: Arc<str>,
    seq: u64,
}

impl GuardEvaluator {
    /// Evaluator for `event_type` (and its subtypes) whose guard accepts everything.
    pub fn on(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            guard: Arc::new(|_| Ok(true)),
            handlers: Vec::new(),
            target: None,
            target_name: Arc::from("<unregistered>"),
            seq: 0,
        }
    }

    /// Replaces the guard predicate.
    pub fn when<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<bool, BehaviorError> + Send + Sync + 'static,
    {
        self.guard = Arc::new(guard);
        self
    }

    /// Adds a handler run when the guard accepts.
    pub fn then<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<(), BehaviorError> + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn target(&self) -> Option<TargetKey> {
        self.target
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl fmt::Debug for GuardEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardEvaluator")
            .field("event_type", &self.event_type)
            .field("target", &self.target_name)
            .field("handlers", &self.handlers.len())
            .field("seq", &self.seq)
            .finish()
    }
}

/// A handler accepted by a guard, bound to its target for error context.
#[derive(Clone)]
pub struct AcceptedHandler {
    target_name: Arc<str>,
    handler: HandlerFn,
}

impl AcceptedHandler {
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Runs the handler; errors and panics become [`KernelError::HandlerInvocation`].
    pub fn invoke(&self, event: &Event) -> Result<()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.handler)(event)))
            .unwrap_or_else(|panic| Err(panic_message(panic).into()));
        outcome.map_err(|source| KernelError::HandlerInvocation {
            target: self.target_name.to_string(),
            event_type: event.r#type.clone(),
            source,
        })
    }
}

impl fmt::Debug for AcceptedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedHandler")
            .field("target", &self.target_name)
            .finish()
    }
}

/// Snapshot of the evaluators matching one event, in registration order.
///
/// Cloning is cheap and each call to [`EvaluatorSequence::iter`] restarts
/// from the first evaluator.
#[derive(Debug, Clone)]
pub struct EvaluatorSequence {
    evaluators: Arc<[GuardEvaluator]>,
}

impl EvaluatorSequence {
    pub fn iter(&self) -> std::slice::Iter<'_, GuardEvaluator> {
        self.evaluators.iter()
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }
}

impl<'a> IntoIterator for &'a EvaluatorSequence {
    type Item = &'a GuardEvaluator;
    type IntoIter = std::slice::Iter<'a, GuardEvaluator>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Default)]
struct Index {
    by_type: HashMap<String, Vec<GuardEvaluator>>,
    // target -> indexed event types
    targets: HashMap<TargetKey, Vec<String>>,
}

impl Index {
    fn remove_target(&mut self, key: TargetKey) -> Option<usize> {
        let types = self.targets.remove(&key)?;
        let mut removed = 0;
        for ty in types {
            if let Some(list) = self.by_type.get_mut(&ty) {
                let before = list.len();
                list.retain(|e| e.target != Some(key));
                removed += before - list.len();
                if list.is_empty() {
                    self.by_type.remove(&ty);
                }
            }
        }
        Some(removed)
    }
}

/// Per-entity index of guard evaluators by event type.
#[derive(Default)]
pub struct GuardRegistry {
    index: RwLock<Index>,
    next_seq: AtomicU64,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes the guard table of `target`.
    ///
    /// Returns `false` when the object exposes no evaluator; it is then simply
    /// not indexed. Registering the same object again refreshes its table.
    pub fn register<T>(&self, target: &Arc<T>) -> bool
    where
        T: PerceptionGuards,
    {
        let key = TargetKey::of(target);
        let name: Arc<str> = Arc::from(std::any::type_name::<T>());
        let evaluators = Arc::clone(target).guard_evaluators();
        if evaluators.is_empty() {
            debug!(target: "dispatcher", listener = %name, "No guard evaluator, object not indexed");
            return false;
        }

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.remove_target(key);
        let mut types = Vec::with_capacity(evaluators.len());
        for mut evaluator in evaluators {
            evaluator.target = Some(key);
            evaluator.target_name = Arc::clone(&name);
            evaluator.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            types.push(evaluator.event_type.clone());
            index
                .by_type
                .entry(evaluator.event_type.clone())
                .or_default()
                .push(evaluator);
        }
        types.sort();
        types.dedup();
        debug!(target: "dispatcher", listener = %name, event_types = ?types, "Registered guard evaluators");
        index.targets.insert(key, types);
        true
    }

    /// Removes every evaluator owned by `target`, returning how many were removed.
    pub fn unregister<T>(&self, target: &Arc<T>) -> Result<usize>
    where
        T: PerceptionGuards,
    {
        let key = TargetKey::of(target);
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index
            .remove_target(key)
            .ok_or_else(|| KernelError::NotRegistered(std::any::type_name::<T>().to_string()))
    }

    pub fn is_registered<T>(&self, target: &Arc<T>) -> bool
    where
        T: PerceptionGuards,
    {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.targets.contains_key(&TargetKey::of(target))
    }

    pub fn registered_count(&self) -> usize {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.targets.len()
    }

    /// Evaluators interested in `event`'s type or any of its supertypes.
    pub fn evaluators_for(&self, event: &Event) -> EvaluatorSequence {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<GuardEvaluator> = event
            .type_hierarchy()
            .filter_map(|ty| index.by_type.get(ty))
            .flat_map(|list| list.iter().cloned())
            .collect();
        matching.sort_by_key(|e| e.seq);
        EvaluatorSequence {
            evaluators: matching.into(),
        }
    }

    /// Runs the guard of `evaluator` and returns the handlers it unlocked.
    pub fn evaluate_guard(evaluator: &GuardEvaluator, event: &Event) -> Result<Vec<AcceptedHandler>> {
        let verdict = catch_unwind(AssertUnwindSafe(|| (evaluator.guard)(event)))
            .unwrap_or_else(|panic| Err(panic_message(panic).into()));
        match verdict {
            Ok(true) => Ok(evaluator
                .handlers
                .iter()
                .map(|handler| AcceptedHandler {
                    target_name: Arc::clone(&evaluator.target_name),
                    handler: Arc::clone(handler),
                })
                .collect()),
            Ok(false) => Ok(Vec::new()),
            Err(source) => Err(KernelError::GuardInvocation {
                target: evaluator.target_name.to_string(),
                event_type: event.r#type.clone(),
                source,
            }),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
