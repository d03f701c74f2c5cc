//! The cache and dependency graph.
//!
//! [`DepGraph`] stores one [`NodeRecord`] per computed (or staged) node in a
//! `StableGraph`, indexed by short id. A record's requires-set is its
//! outgoing `Requires` edges, which doubles as the reverse index: the
//! "required by" query is a reverse breadth-first traversal instead of a
//! full-table fixed-point scan, keeping invalidation linear in the size of
//! its result.
//!
//! # Semantics
//!
//! - A record may exist without a value: dependency edges are staged before
//!   the producing function runs. Such a record is not a cache hit.
//! - `put` is an unconditional overwrite; required targets that have no
//!   record yet are default-constructed value-less.
//! - Deleting records never notifies observers; the next access recomputes
//!   and fires the calculated event instead.
//! - The long identity is stored with each record and verified whenever a
//!   record is addressed, so a short-id collision surfaces as an error
//!   rather than silently aliasing two nodes.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use petgraph::{Directed, Direction};
use serde::Serialize;

use crate::error::CalcError;
use crate::id::{LongId, ShortId};

/// A dependency edge: the source node requires the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Requires;

/// Cached state of one node.
pub(crate) struct NodeRecord {
    short: ShortId,
    long: LongId,
    value: Option<Rc<dyn Any>>,
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("short", &self.short)
            .field("long", &self.long)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

/// Serializable snapshot of one cached node, without its opaque value.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: ShortId,
    pub long: LongId,
    pub has_value: bool,
    pub requires: Vec<ShortId>,
}

/// Read-only snapshot of the whole cache, for external collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Default)]
pub(crate) struct DepGraph {
    graph: StableGraph<NodeRecord, Requires, Directed, u32>,
    index: HashMap<ShortId, NodeIndex<u32>>,
}

impl DepGraph {
    /// Looks up or creates the record for `short`, verifying the stored
    /// long identity against the presented one.
    fn ensure(&mut self, short: ShortId, long: &LongId) -> Result<NodeIndex<u32>, CalcError> {
        if let Some(&idx) = self.index.get(&short) {
            if self.graph[idx].long != *long {
                return Err(CalcError::IdCollision { short });
            }
            return Ok(idx);
        }
        let idx = self.graph.add_node(NodeRecord {
            short,
            long: long.clone(),
            value: None,
        });
        self.index.insert(short, idx);
        Ok(idx)
    }

    pub(crate) fn contains(&self, short: ShortId) -> bool {
        self.index.contains_key(&short)
    }

    /// The cached value, if this node has been computed and not invalidated.
    pub(crate) fn value(&self, short: ShortId) -> Option<&Rc<dyn Any>> {
        let idx = self.index.get(&short)?;
        self.graph[*idx].value.as_ref()
    }

    /// Errors when `short` exists with a different long identity.
    pub(crate) fn verify(&self, short: ShortId, long: &LongId) -> Result<(), CalcError> {
        match self.index.get(&short) {
            Some(&idx) if self.graph[idx].long != *long => {
                Err(CalcError::IdCollision { short })
            }
            _ => Ok(()),
        }
    }

    /// Records the requires-set of `short`, replacing any previous edges.
    /// The value, if any, is left untouched. Missing required targets are
    /// created value-less.
    pub(crate) fn stage(
        &mut self,
        short: ShortId,
        long: &LongId,
        requires: &[(ShortId, LongId)],
    ) -> Result<(), CalcError> {
        let idx = self.ensure(short, long)?;
        let stale: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in stale {
            self.graph.remove_edge(edge);
        }
        let mut seen = Vec::with_capacity(requires.len());
        for (req_short, req_long) in requires {
            if *req_short == short || seen.contains(req_short) {
                continue;
            }
            seen.push(*req_short);
            let target = self.ensure(*req_short, req_long)?;
            self.graph.add_edge(idx, target, Requires);
        }
        Ok(())
    }

    /// Unconditional overwrite of a node: requires-set and value together.
    pub(crate) fn put(
        &mut self,
        short: ShortId,
        long: &LongId,
        requires: &[(ShortId, LongId)],
        value: Rc<dyn Any>,
    ) -> Result<(), CalcError> {
        self.stage(short, long, requires)?;
        let idx = self.index[&short];
        self.graph[idx].value = Some(value);
        Ok(())
    }

    /// Writes a value without touching the requires-set, creating the
    /// record when absent.
    pub(crate) fn set_value(
        &mut self,
        short: ShortId,
        long: &LongId,
        value: Rc<dyn Any>,
    ) -> Result<(), CalcError> {
        let idx = self.ensure(short, long)?;
        self.graph[idx].value = Some(value);
        Ok(())
    }

    /// The direct requires-set of a node, if it has a record.
    pub(crate) fn requires_of(&self, short: ShortId) -> Option<Vec<ShortId>> {
        let idx = self.index.get(&short)?;
        Some(
            self.graph
                .neighbors_directed(*idx, Direction::Outgoing)
                .map(|n| self.graph[n].short)
                .collect(),
        )
    }

    /// Transitive reverse closure: every node whose requires-set reaches
    /// `short`. The seed itself is excluded. Unknown ids yield an empty set.
    pub(crate) fn required_by(&self, short: ShortId) -> Vec<ShortId> {
        let Some(&start) = self.index.get(&short) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut out = Vec::new();
        while let Some(idx) = bfs.next(reversed) {
            if idx != start {
                out.push(self.graph[idx].short);
            }
        }
        out
    }

    pub(crate) fn remove(&mut self, short: ShortId) -> bool {
        match self.index.remove(&short) {
            Some(idx) => {
                self.graph.remove_node(idx);
                true
            }
            None => false,
        }
    }

    /// Deletes `short` and everything that transitively requires it.
    /// Returns the number of records removed.
    pub(crate) fn invalidate(&mut self, short: ShortId) -> usize {
        let mut doomed = self.required_by(short);
        doomed.push(short);
        doomed.into_iter().filter(|id| self.remove(*id)).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.graph.clear();
        self.index.clear();
    }

    /// Snapshot of every record, sorted by short id for determinism.
    pub(crate) fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<NodeSnapshot> = self
            .index
            .values()
            .map(|&idx| {
                let record = &self.graph[idx];
                let mut requires: Vec<ShortId> = self
                    .graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .map(|n| self.graph[n].short)
                    .collect();
                requires.sort_unstable();
                NodeSnapshot {
                    id: record.short,
                    long: record.long.clone(),
                    has_value: record.value.is_some(),
                    requires,
                }
            })
            .collect();
        nodes.sort_unstable_by_key(|n| n.id);
        nodes
    }
}
