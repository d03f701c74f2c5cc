//! Static call-site discovery.
//!
//! The scanner turns a registration's declared [`CallPlan`] into the set of
//! node ids the function will call, so dependency edges can be recorded
//! before the function body runs. A [`CallSite`] names a graph callee (via
//! its helper handle, the "on graph" marker) together with the
//! literal-constant arguments of the call; method sites get the receiver
//! token prepended at scan time.
//!
//! # Limitations
//!
//! Only literal arguments are representable in a plan. A call whose
//! arguments are computed at runtime is invisible here; the runtime trace
//! kept by the engine during invocation picks those up instead. Missed
//! edges degrade invalidation precision, never the correctness of computed
//! results, because every call consults the cache by its true arguments.
//!
//! # Failure semantics
//!
//! A site whose callee has been dropped, whose literals are unhashable, or
//! which is a method site scanned without a receiver is skipped. An empty
//! plan yields an empty set. Scanning never errors.

use std::rc::{Rc, Weak};

use tracing::trace;

use crate::helper::FunctionHelper;
use crate::id::{LongId, ShortId};
use crate::key::{CallParts, Instance, KeyPart, NodeArgs};

/// One declared graph call inside a registered function.
#[derive(Debug, Clone)]
pub struct CallSite {
    callee: Weak<FunctionHelper>,
    /// `None` when the declared literals could not be keyed.
    literal: Option<CallParts>,
    method: bool,
}

impl CallSite {
    /// A call site targeting the wrapper that owns `helper`.
    pub fn of(helper: &Rc<FunctionHelper>) -> Self {
        CallSite {
            callee: Rc::downgrade(helper),
            literal: Some(CallParts::default()),
            method: false,
        }
    }

    /// A receiver-bound call site: shorthand for `of(helper).method()`.
    pub fn method_of(helper: &Rc<FunctionHelper>) -> Self {
        Self::of(helper).method()
    }

    /// Marks this as a receiver-bound call: the scanning receiver is
    /// prepended to the declared positional literals.
    pub fn method(mut self) -> Self {
        self.method = true;
        self
    }

    /// Declares the literal arguments of the call.
    pub fn args(mut self, args: impl NodeArgs) -> Self {
        self.literal = args.split().ok();
        self
    }
}

/// The declared call sites of one registered function, in source order.
#[derive(Debug, Clone, Default)]
pub struct CallPlan {
    sites: Vec<CallSite>,
}

impl CallPlan {
    pub(crate) fn push(&mut self, site: CallSite) {
        self.sites.push(site);
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Resolves a plan against an optional receiver into discovered node ids.
pub(crate) fn scan(plan: &CallPlan, this: Option<Instance>) -> Vec<(ShortId, LongId)> {
    let mut found = Vec::with_capacity(plan.sites.len());
    for site in &plan.sites {
        let Some(helper) = site.callee.upgrade() else {
            trace!(target: "calcgraph", "scan: skipping call site with dropped callee");
            continue;
        };
        let Some(literal) = &site.literal else {
            trace!(target: "calcgraph", fqn = helper.fqn(), "scan: skipping unkeyable call site");
            continue;
        };
        let mut parts = literal.clone();
        if site.method {
            let Some(receiver) = this else {
                trace!(target: "calcgraph", fqn = helper.fqn(), "scan: method site without receiver");
                continue;
            };
            parts.pos.insert(0, KeyPart::Receiver(receiver.token()));
            parts.pos_tags.insert(0, "instance");
            parts.receiver = Some(receiver);
        }
        found.push(helper.make_node_id_pair(&parts));
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kwargs;
    use std::panic::Location;

    fn graph_fn(name: &str, is_method: bool) -> Rc<FunctionHelper> {
        Rc::new(FunctionHelper::new(
            name,
            Some("test"),
            Location::caller(),
            &[],
            false,
            is_method,
            CallPlan::default(),
        ))
    }

    #[test]
    fn discovers_literal_calls_in_order() {
        let x = graph_fn("x", false);
        let y = graph_fn("y", false);

        let mut plan = CallPlan::default();
        plan.push(CallSite::of(&x).args((2i64, 3i64, 4i64)));
        plan.push(CallSite::of(&y).args((9i64, 8i64)));

        let found: Vec<ShortId> = scan(&plan, None).into_iter().map(|(s, _)| s).collect();
        let expected = vec![
            x.make_node_id_pair(&(2i64, 3i64, 4i64).split().unwrap()).0,
            y.make_node_id_pair(&(9i64, 8i64).split().unwrap()).0,
        ];
        assert_eq!(found, expected);
    }

    #[test]
    fn keyword_literals_key_the_keyword_segment() {
        let x = graph_fn("x", false);
        let y = graph_fn("y", false);

        let mut plan = CallPlan::default();
        plan.push(CallSite::of(&x).args((2i64, 3i64, kwargs! { y: 4 })));
        plan.push(CallSite::of(&y).args((9i64, 8i64)));

        let found: Vec<ShortId> = scan(&plan, None).into_iter().map(|(s, _)| s).collect();
        let expected = vec![
            x.make_node_id_pair(&(2i64, 3i64, kwargs! { y: 4 }).split().unwrap())
                .0,
            y.make_node_id_pair(&(9i64, 8i64).split().unwrap()).0,
        ];
        assert_eq!(found, expected);
    }

    #[test]
    fn method_sites_prepend_the_receiver() {
        let p = graph_fn("Foo.p", true);
        let q = graph_fn("Foo.q", true);
        let this = Instance::new();

        let mut plan = CallPlan::default();
        plan.push(CallSite::method_of(&p).args((1i64, 5i64)));
        plan.push(CallSite::method_of(&q).args((2i64, 3i64, kwargs! { r: 10 })));

        let found: Vec<ShortId> = scan(&plan, Some(this)).into_iter().map(|(s, _)| s).collect();
        let expected = vec![
            p.make_node_id_pair(&(this, 1i64, 5i64).split().unwrap()).0,
            q.make_node_id_pair(&(this, 2i64, 3i64, kwargs! { r: 10 }).split().unwrap())
                .0,
        ];
        assert_eq!(found, expected);
    }

    #[test]
    fn method_sites_without_receiver_are_skipped() {
        let p = graph_fn("Foo.p", true);
        let free = graph_fn("x", false);

        let mut plan = CallPlan::default();
        plan.push(CallSite::of(&p).method());
        plan.push(CallSite::of(&free).args((1i64,)));

        let found = scan(&plan, None);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].0,
            free.make_node_id_pair(&(1i64,).split().unwrap()).0
        );
    }

    #[test]
    fn dropped_callees_are_skipped() {
        let x = graph_fn("x", false);
        let mut plan = CallPlan::default();
        plan.push(CallSite::of(&x).args((1i64,)));
        drop(x);

        assert!(scan(&plan, None).is_empty());
    }

    #[test]
    fn unkeyable_literals_are_skipped() {
        let x = graph_fn("x", false);
        let mut plan = CallPlan::default();
        plan.push(CallSite::of(&x).args((f64::NAN,)));
        plan.push(CallSite::of(&x).args((1i64,)));

        let found = scan(&plan, None);
        assert_eq!(found.len(), 1);
    }
}
