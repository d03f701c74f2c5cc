//! The calculation engine and the registration API.
//!
//! [`CalcEngine`] owns the cache, the diagnostic id map, and the stack of
//! currently-executing nodes. [`CalcEngine::register`] hands out a
//! [`NodeBuilder`]; building it wraps a user function into a [`Node`], the
//! graph-aware callable.
//!
//! # Call semantics
//!
//! A wrapper call computes its identity, records it in the id map and in
//! the calling node's trace frame, and returns the cached value on a hit
//! with no user-function invocation and no event. On a miss the declared
//! call plan is scanned and the dependency edges are staged *before* the
//! user function runs, so reverse queries see them even for dependencies
//! the body never reaches on this evaluation. The body then runs with a
//! fresh trace frame; every nested wrapper call, hit or miss, records
//! itself there, which picks up dependencies whose arguments are computed
//! at runtime and are invisible to the static scan. On success the merged
//! requires-set and the result are written together and the calculated
//! event fires; on error or panic the staged record is removed, nothing is
//! cached, no event fires, and a later call simply retries.
//!
//! # Threading
//!
//! Single-threaded by design. The engine handle is a cheap `Rc` clone and
//! all work happens synchronously on the caller's thread; state borrows
//! never span a user-function invocation, which is what makes reentrant
//! (nested) wrapper calls safe.

use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use crate::error::CalcError;
use crate::event::EventChannel;
use crate::graph::{CacheSnapshot, DepGraph};
use crate::helper::FunctionHelper;
use crate::id::{LongId, ShortId};
use crate::key::NodeArgs;
use crate::scan::{CallPlan, CallSite};

/// Engine-wide options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path prefixes stripped when deriving a node's default module path
    /// from its registration site. The longest match wins.
    pub source_roots: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            source_roots: vec!["src".to_owned(), "tests".to_owned()],
        }
    }
}

/// Trace frame of one in-flight node computation.
struct Frame {
    traced: IndexSet<ShortId>,
}

struct EngineState {
    graph: DepGraph,
    id_map: IndexMap<ShortId, LongId>,
    frames: Vec<Frame>,
    config: EngineConfig,
}

/// Lazy calculation engine.
///
/// The cache can be viewed as a directed graph with each unique function
/// call, together with its arguments, considered a graph node. Handles are
/// cheap clones sharing one underlying state.
pub struct CalcEngine {
    state: Rc<RefCell<EngineState>>,
}

impl Clone for CalcEngine {
    fn clone(&self) -> Self {
        CalcEngine {
            state: Rc::clone(&self.state),
        }
    }
}

impl fmt::Debug for CalcEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CalcEngine")
            .field("cached_nodes", &state.graph.len())
            .field("known_ids", &state.id_map.len())
            .finish()
    }
}

impl Default for CalcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CalcEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        CalcEngine {
            state: Rc::new(RefCell::new(EngineState {
                graph: DepGraph::default(),
                id_map: IndexMap::new(),
                frames: Vec::new(),
                config,
            })),
        }
    }

    /// Starts a node registration. The name stands in for the function's
    /// declared name; the module path defaults from this call site and can
    /// be overridden on the builder.
    #[track_caller]
    pub fn register(&self, name: &str) -> NodeBuilder {
        NodeBuilder {
            engine: self.clone(),
            name: name.to_owned(),
            path: None,
            typed: false,
            is_method: false,
            plan: CallPlan::default(),
            location: Location::caller(),
        }
    }

    /// Clears all cached node data and the id map.
    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.graph.clear();
        state.id_map.clear();
    }

    /// Number of node records currently cached (including staged,
    /// value-less ones).
    pub fn len(&self) -> usize {
        self.state.borrow().graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().graph.is_empty()
    }

    pub fn contains(&self, id: ShortId) -> bool {
        self.state.borrow().graph.contains(id)
    }

    /// The direct requires-set recorded for a node, if present.
    pub fn requires(&self, id: ShortId) -> Option<Vec<ShortId>> {
        self.state.borrow().graph.requires_of(id)
    }

    /// All nodes that transitively require `id` (the seed excluded).
    pub fn required_by(&self, id: ShortId) -> Vec<ShortId> {
        self.state.borrow().graph.required_by(id)
    }

    /// Last-seen structured identity for a short id.
    pub fn long_id(&self, id: ShortId) -> Option<LongId> {
        self.state.borrow().id_map.get(&id).cloned()
    }

    /// Copy of the diagnostic short-to-long id map.
    pub fn id_map(&self) -> IndexMap<ShortId, LongId> {
        self.state.borrow().id_map.clone()
    }

    /// Serializable snapshot of the cache for external collaborators.
    /// Values are opaque and omitted.
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            nodes: self.state.borrow().graph.snapshot(),
        }
    }
}

/// Builder returned by [`CalcEngine::register`].
#[derive(Debug)]
pub struct NodeBuilder {
    engine: CalcEngine,
    name: String,
    path: Option<String>,
    typed: bool,
    is_method: bool,
    plan: CallPlan,
    location: &'static Location<'static>,
}

impl NodeBuilder {
    /// Record argument types in node identities, so equal-valued arguments
    /// of different types key distinct nodes.
    pub fn typed(mut self, typed: bool) -> Self {
        self.typed = typed;
        self
    }

    /// Overrides the module path half of the fully-qualified name.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Registers a method: the first argument is treated as the receiver
    /// and keyed by its identity token.
    pub fn method(mut self) -> Self {
        self.is_method = true;
        self
    }

    /// Declares a literal call site for static dependency discovery.
    pub fn calls(mut self, site: CallSite) -> Self {
        self.plan.push(site);
        self
    }

    /// Wraps the user function into a graph node.
    pub fn build<A, T, F>(self, func: F) -> Node<A, T>
    where
        A: NodeArgs,
        T: Clone + 'static,
        F: Fn(A) -> Result<T, CalcError> + 'static,
    {
        let helper = {
            let state = self.engine.state.borrow();
            Rc::new(FunctionHelper::new(
                &self.name,
                self.path.as_deref(),
                self.location,
                &state.config.source_roots,
                self.typed,
                self.is_method,
                self.plan,
            ))
        };
        Node {
            inner: Rc::new(NodeInner {
                engine: self.engine,
                helper,
                func: Box::new(func),
                on_calculated: EventChannel::new(),
                on_value_set: EventChannel::new(),
            }),
        }
    }
}

struct NodeInner<A, T> {
    engine: CalcEngine,
    helper: Rc<FunctionHelper>,
    func: Box<dyn Fn(A) -> Result<T, CalcError>>,
    on_calculated: EventChannel<T>,
    on_value_set: EventChannel<T>,
}

/// A graph-aware function: the wrapper produced by registration.
///
/// Cloning a node is cheap and clones share cache entries, events, and
/// identity, so bodies of downstream nodes capture clones freely.
pub struct Node<A, T> {
    inner: Rc<NodeInner<A, T>>,
}

impl<A, T> Clone for Node<A, T> {
    fn clone(&self) -> Self {
        Node {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A, T> fmt::Debug for Node<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("fqn", &self.inner.helper.fqn())
            .finish()
    }
}

/// Removes the partial footprint of a failed call: pops the trace frame
/// (unless already handed over) and deletes the staged record, so a failed
/// or panicked computation leaves the node uncached and retryable.
struct CallGuard {
    engine: CalcEngine,
    short: ShortId,
    frame_popped: bool,
    completed: bool,
}

impl CallGuard {
    fn pop_frame(&mut self) -> IndexSet<ShortId> {
        self.frame_popped = true;
        let mut state = self.engine.state.borrow_mut();
        state
            .frames
            .pop()
            .map(|frame| frame.traced)
            .unwrap_or_default()
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.engine.state.borrow_mut();
        if !self.frame_popped {
            state.frames.pop();
        }
        state.graph.remove(self.short);
    }
}

impl<A: NodeArgs, T: Clone + 'static> Node<A, T> {
    /// Calls the node: cached value on a hit, otherwise computes, caches,
    /// and fires the calculated event.
    pub fn call(&self, args: A) -> Result<T, CalcError> {
        let parts = args.split()?;
        let this = parts.receiver();
        let (short, long) = self.inner.helper.make_node_id_pair(&parts);

        {
            let mut state = self.inner.engine.state.borrow_mut();
            state.id_map.insert(short, long.clone());
            if let Some(frame) = state.frames.last_mut() {
                frame.traced.insert(short);
            }
            state.graph.verify(short, &long)?;
            if let Some(value) = state.graph.value(short) {
                let hit = value
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or(CalcError::ValueTypeMismatch { short })?;
                trace!(target: "calcgraph", "{short} served from cache");
                return Ok(hit);
            }

            // Static discovery happens before the body runs, so reverse
            // queries already see these edges during the computation.
            let scanned = self.inner.helper.scan_with_longs(this);
            for (req_short, req_long) in &scanned {
                state.id_map.insert(*req_short, req_long.clone());
            }
            state.graph.stage(short, &long, &scanned)?;
            let mut traced = IndexSet::new();
            traced.extend(scanned.iter().map(|(s, _)| *s));
            state.frames.push(Frame { traced });
        }

        let mut guard = CallGuard {
            engine: self.inner.engine.clone(),
            short,
            frame_popped: false,
            completed: false,
        };
        let value = (self.inner.func)(args)?;
        let traced = guard.pop_frame();

        {
            let mut state = self.inner.engine.state.borrow_mut();
            let requires: Vec<(ShortId, LongId)> = traced
                .iter()
                .filter_map(|id| state.id_map.get(id).map(|l| (*id, l.clone())))
                .collect();
            state
                .graph
                .put(short, &long, &requires, Rc::new(value.clone()))?;
            if tracing::enabled!(target: "calcgraph", tracing::Level::DEBUG) {
                let ids: Vec<String> = requires.iter().map(|(id, _)| id.to_string()).collect();
                debug!(target: "calcgraph", "{short} called requiring: {}", ids.join(", "));
            }
        }
        guard.completed = true;
        self.inner.on_calculated.emit(&value);
        Ok(value)
    }

    /// Invalidates the node for these arguments: removes its record and
    /// every record that transitively requires it. No event fires; the
    /// next call recomputes and fires the calculated event instead.
    pub fn invalidate(&self, args: A) -> Result<(), CalcError> {
        let parts = args.split()?;
        let (short, long) = self.inner.helper.make_node_id_pair(&parts);
        let mut state = self.inner.engine.state.borrow_mut();
        state.id_map.insert(short, long);
        let removed = state.graph.invalidate(short);
        trace!(target: "calcgraph", "{short} invalidated, {removed} records removed");
        Ok(())
    }

    /// Writes a value for these arguments without invalidating anything
    /// that requires the node, then fires the value-set event. Creates the
    /// record when the node was never computed.
    pub fn set_value(&self, value: T, args: A) -> Result<(), CalcError> {
        let parts = args.split()?;
        let (short, long) = self.inner.helper.make_node_id_pair(&parts);
        {
            let mut state = self.inner.engine.state.borrow_mut();
            state.id_map.insert(short, long.clone());
            state
                .graph
                .set_value(short, &long, Rc::new(value.clone()))?;
        }
        self.inner.on_value_set.emit(&value);
        Ok(())
    }

    /// Writes a value, removes every record that transitively requires the
    /// node (the node's own fresh value stays), then fires the value-set
    /// event.
    pub fn set_value_and_invalidate(&self, value: T, args: A) -> Result<(), CalcError> {
        let parts = args.split()?;
        let (short, long) = self.inner.helper.make_node_id_pair(&parts);
        {
            let mut state = self.inner.engine.state.borrow_mut();
            state.id_map.insert(short, long.clone());
            state
                .graph
                .set_value(short, &long, Rc::new(value.clone()))?;
            for id in state.graph.required_by(short) {
                state.graph.remove(id);
            }
        }
        self.inner.on_value_set.emit(&value);
        Ok(())
    }

    /// The identity/dependency metadata object; also the marker used by
    /// call plans to name this node as a callee.
    pub fn helper(&self) -> &Rc<FunctionHelper> {
        &self.inner.helper
    }

    /// A call-plan entry targeting this node.
    pub fn site(&self) -> CallSite {
        CallSite::of(&self.inner.helper)
    }

    /// Channel fired after each recomputation, with the produced value.
    pub fn on_calculated(&self) -> EventChannel<T> {
        self.inner.on_calculated.clone()
    }

    /// Channel fired after each external value assignment.
    pub fn on_value_set(&self) -> EventChannel<T> {
        self.inner.on_value_set.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn memoizes_by_arguments() {
        let engine = CalcEngine::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let double = engine
            .register("double")
            .path("unit")
            .build(move |(x,): (i64,)| {
                c.set(c.get() + 1);
                Ok(2 * x)
            });

        assert_eq!(double.call((21,)).unwrap(), 42);
        assert_eq!(double.call((21,)).unwrap(), 42);
        assert_eq!(count.get(), 1);

        assert_eq!(double.call((5,)).unwrap(), 10);
        assert_eq!(count.get(), 2);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn failed_calls_leave_no_record_and_retry() {
        let engine = CalcEngine::new();
        let attempts = Rc::new(Cell::new(0u32));
        let a = Rc::clone(&attempts);
        let flaky = engine.register("flaky").path("unit").build(move |_: ()| {
            a.set(a.get() + 1);
            if a.get() == 1 {
                Err(CalcError::user("first attempt fails"))
            } else {
                Ok(7i64)
            }
        });

        assert!(flaky.call(()).is_err());
        assert!(engine.is_empty());

        assert_eq!(flaky.call(()).unwrap(), 7);
        assert_eq!(attempts.get(), 2);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn panicking_calls_leave_no_record() {
        let engine = CalcEngine::new();
        let boom = engine
            .register("boom")
            .path("unit")
            .build(|_: ()| -> Result<i64, CalcError> { panic!("body panicked") });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| boom.call(())));
        assert!(result.is_err());
        assert!(engine.is_empty());

        // The engine stays usable after the unwind.
        let ok = engine.register("ok").path("unit").build(|_: ()| Ok(1i64));
        assert_eq!(ok.call(()).unwrap(), 1);
    }

    #[test]
    fn runtime_tracing_records_computed_argument_calls() {
        let engine = CalcEngine::new();
        let base = engine
            .register("base")
            .path("unit")
            .build(|(x,): (i64,)| Ok(10 * x));

        // The argument is computed at runtime, so no call plan could have
        // declared it; tracing records the edge anyway.
        let b = base.clone();
        let top = engine.register("top").path("unit").build(move |_: ()| {
            let k = 2 + 1;
            b.call((k,))
        });

        assert_eq!(top.call(()).unwrap(), 30);
        let base_id = base
            .helper()
            .make_node_id_pair(&(3i64,).split().unwrap())
            .0;
        let top_id = top.helper().make_node_id_pair(&().split().unwrap()).0;
        assert_eq!(engine.requires(top_id).unwrap(), vec![base_id]);
        assert_eq!(engine.required_by(base_id), vec![top_id]);
    }

    #[test]
    fn declared_but_uncalled_dependencies_still_cascade() {
        let engine = CalcEngine::new();
        let count = Rc::new(Cell::new(0u32));

        let dep = engine
            .register("dep")
            .path("unit")
            .build(|_: ()| Ok(1i64));
        // The body never calls `dep`; only the plan declares it.
        let c = Rc::clone(&count);
        let top = engine
            .register("top")
            .path("unit")
            .calls(dep.site())
            .build(move |_: ()| {
                c.set(c.get() + 1);
                Ok(99i64)
            });

        assert_eq!(top.call(()).unwrap(), 99);
        assert_eq!(count.get(), 1);

        dep.invalidate(()).unwrap();
        assert_eq!(top.call(()).unwrap(), 99);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn clear_forces_recomputation() {
        let engine = CalcEngine::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let node = engine.register("n").path("unit").build(move |_: ()| {
            c.set(c.get() + 1);
            Ok(5i64)
        });

        node.call(()).unwrap();
        engine.clear();
        assert!(engine.is_empty());
        assert!(engine.id_map().is_empty());

        node.call(()).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn set_value_on_unknown_node_creates_the_record() {
        let engine = CalcEngine::new();
        let node = engine
            .register("n")
            .path("unit")
            .build(|(x,): (i64,)| Ok(x));

        node.set_value(123, (9,)).unwrap();
        assert_eq!(engine.len(), 1);
        assert_eq!(node.call((9,)).unwrap(), 123);
    }

    #[test]
    fn snapshot_lists_records_with_requires() {
        let engine = CalcEngine::new();
        let a = engine.register("a").path("unit").build(|_: ()| Ok(1i64));
        let a2 = a.clone();
        let b = engine
            .register("b")
            .path("unit")
            .build(move |_: ()| a2.call(()));

        b.call(()).unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert!(snapshot.nodes.iter().all(|n| n.has_value));
        serde_json::to_string(&snapshot).unwrap();
    }
}
