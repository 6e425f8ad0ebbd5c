//! The belief database.
//!
//! Beliefs are edges of a directed graph over PM-object ids: an edge
//! `a -> b` says object `a` must be observed durable before a write to `b`
//! may persist alone. Repeated evidence increments the edge's count.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use pmcheck_error::Result;
use pmcheck_types::{AddrRange, OpId, Operation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::graph::{AccessKind, DepGraph, EdgeKind};
use crate::objects::{PmObject, PmObjectList};

/// One ordering belief with the number of times it was inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Belief {
    /// Object that must be durable first.
    pub before: u32,
    /// Object whose write depends on it.
    pub after: u32,
    pub count: u64,
}

#[derive(Debug, Default)]
pub struct BeliefDatabase {
    objects: PmObjectList,
    edges: BTreeMap<(u32, u32), u64>,
    critical: BTreeSet<u32>,
    /// Object lookups by store id.
    lookups: Mutex<HashMap<OpId, Option<u32>>>,
}

impl BeliefDatabase {
    /// Read every dependence-graph file and build the database.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut graphs = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)?;
            let parsed = DepGraph::parse_all(&text)?;
            debug!(path = %path.display(), graphs = parsed.len(), "dependence graphs parsed");
            graphs.extend(parsed);
        }
        Ok(Self::from_graphs(&graphs))
    }

    /// Build objects, beliefs and critical reads from dependence graphs.
    pub fn from_graphs(graphs: &[DepGraph]) -> Self {
        let mut db = Self::default();
        for graph in graphs {
            let dangling = graph.dangling_nodes();
            if !dangling.is_empty() {
                warn!(
                    undeclared = dangling.len(),
                    "dependence graph edges reference undeclared nodes"
                );
            }
            for node in graph.nodes() {
                db.objects.insert(node.range);
            }
        }
        db.objects.assign_ids();
        for graph in graphs {
            db.infer(graph);
        }
        info!(
            graphs = graphs.len(),
            pm_objects = db.pm_object_count(),
            beliefs = db.belief_count(),
            critical_reads = db.critical_read_count(),
            "belief database built"
        );
        db
    }

    fn object_id(&self, range: AddrRange) -> Option<u32> {
        if range.is_empty() {
            return None;
        }
        self.objects.find(range).map(|o| o.id)
    }

    fn add_belief(&mut self, before: u32, after: u32) {
        *self.edges.entry((before, after)).or_insert(0) += 1;
    }

    fn infer(&mut self, graph: &DepGraph) {
        for edge in graph.edges() {
            let (Some(src), Some(dst)) = (graph.node(edge.src), graph.node(edge.dst)) else {
                continue;
            };
            let (Some(src_obj), Some(dst_obj)) =
                (self.object_id(src.range), self.object_id(dst.range))
            else {
                continue;
            };
            match (edge.kind, src.kind, dst.kind) {
                // The load must be observed before the store it feeds persists.
                (EdgeKind::Data | EdgeKind::Control, AccessKind::Store, AccessKind::Load) => {
                    self.add_belief(dst_obj, src_obj);
                    self.critical.insert(dst_obj);
                }
                (EdgeKind::Control, AccessKind::Load, AccessKind::Load) => {
                    self.add_belief(src_obj, dst_obj);
                    self.critical.insert(dst_obj);
                    for pred_obj in self.controlling_loads(graph, edge.src) {
                        self.add_belief(pred_obj, dst_obj);
                    }
                }
                _ => {}
            }
        }
    }

    /// Objects of every load that transitively reaches `from`.
    ///
    /// Breadth-first over predecessors of any edge kind. Store nodes end a
    /// path; zero-size nodes are walked through but name no object.
    fn controlling_loads(&self, graph: &DepGraph, from: u64) -> BTreeSet<u32> {
        let mut found = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node_id) = queue.pop_front() {
            for (pred, _) in graph.predecessors(node_id) {
                if !seen.insert(pred) {
                    continue;
                }
                let Some(node) = graph.node(pred) else {
                    continue;
                };
                if node.kind == AccessKind::Store {
                    continue;
                }
                queue.push_back(pred);
                if let Some(obj) = self.object_id(node.range) {
                    found.insert(obj);
                }
            }
        }
        found
    }

    /// Object id of a store, memoized. `None` when no object covers it.
    pub fn lookup(&self, store: &Operation) -> Option<u32> {
        let range = store.store_range()?;
        let mut lookups = self.lookups.lock();
        *lookups
            .entry(store.id)
            .or_insert_with(|| self.object_id(range))
    }

    /// Whether the store writes an object some belief reads critically.
    pub fn is_critical_store(&self, store: &Operation) -> bool {
        self.lookup(store)
            .is_some_and(|obj| self.critical.contains(&obj))
    }

    /// Whether persisting `persist` while `volatile` is lost breaks a
    /// belief, i.e. `volatile`'s object must be durable before `persist`'s.
    pub fn violates_ordering(&self, persist: &Operation, volatile: &Operation) -> bool {
        match (self.lookup(persist), self.lookup(volatile)) {
            (Some(p), Some(v)) => self.edges.contains_key(&(v, p)),
            _ => false,
        }
    }

    /// Count of the belief `before -> after` between the objects covering
    /// the two ranges.
    pub fn belief_count_between(&self, before: AddrRange, after: AddrRange) -> Option<u64> {
        let key = (self.object_id(before)?, self.object_id(after)?);
        self.edges.get(&key).copied()
    }

    pub fn objects(&self) -> &PmObjectList {
        &self.objects
    }

    pub fn beliefs(&self) -> impl Iterator<Item = Belief> + '_ {
        self.edges.iter().map(|(&(before, after), &count)| Belief {
            before,
            after,
            count,
        })
    }

    pub fn critical_objects(&self) -> impl Iterator<Item = &PmObject> + '_ {
        self.objects
            .iter()
            .filter(|o| self.critical.contains(&o.id))
    }

    pub fn pm_object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn belief_count(&self) -> usize {
        self.edges.len()
    }

    pub fn critical_read_count(&self) -> usize {
        self.critical.len()
    }
}

#[cfg(test)]
mod tests {
    use pmcheck_types::{OpKind, SourceTag, ThreadId};

    use super::*;

    fn graphs(text: &str) -> Vec<DepGraph> {
        DepGraph::parse_all(text).unwrap()
    }

    fn store(id: u64, address: u64, size: u64) -> Operation {
        Operation {
            id: OpId::new(id),
            tid: ThreadId::new(0),
            src: SourceTag::default(),
            kind: OpKind::Store {
                range: AddrRange::new(address, size),
                bytes: vec![0; usize::try_from(size).unwrap()],
            },
        }
    }

    const X: u64 = 0x1000;
    const Y: u64 = 0x2000;

    #[test]
    fn data_store_to_load_orders_load_first() {
        let db = BeliefDatabase::from_graphs(&graphs(
            "digraph G {\n0[label=\"TraceEntry:Store,2000,8\"];\n1[label=\"TraceEntry:Load,1000,8\"];\n0->1 [label=\"data\"];\n}\n",
        ));
        assert_eq!(db.pm_object_count(), 2);
        assert_eq!(
            db.belief_count_between(AddrRange::new(X, 8), AddrRange::new(Y, 8)),
            Some(1)
        );
        assert_eq!(db.critical_read_count(), 1);
        assert!(db.is_critical_store(&store(1, X, 8)));
        assert!(!db.is_critical_store(&store(2, Y, 8)));
        assert!(db.violates_ordering(&store(3, Y, 8), &store(4, X, 8)));
        assert!(!db.violates_ordering(&store(5, X, 8), &store(6, Y, 8)));
    }

    #[test]
    fn repeated_evidence_counts() {
        let one = "digraph G {\n0[label=\"TraceEntry:Store,2000,8\"];\n1[label=\"TraceEntry:Load,1000,8\"];\n0->1 [label=\"ctrl\"];\n}\n";
        let db = BeliefDatabase::from_graphs(&graphs(&format!("{one}{one}")));
        assert_eq!(db.belief_count(), 1);
        assert_eq!(db.beliefs().next().unwrap().count, 2);
    }

    #[test]
    fn control_chain_is_transitive() {
        // A controls B controls C.
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Load,1000,8\"];\n\
            1[label=\"TraceEntry:Load,2000,8\"];\n\
            2[label=\"TraceEntry:Load,3000,8\"];\n\
            0->1 [label=\"ctrl\"];\n\
            1->2 [label=\"ctrl\"];\n\
            }\n";
        let db = BeliefDatabase::from_graphs(&graphs(text));
        let a = AddrRange::new(0x1000, 8);
        let b = AddrRange::new(0x2000, 8);
        let c = AddrRange::new(0x3000, 8);
        assert!(db.belief_count_between(a, b).is_some());
        assert!(db.belief_count_between(b, c).is_some());
        assert!(db.belief_count_between(a, c).is_some());
        assert_eq!(db.belief_count(), 3);
        assert_eq!(db.critical_read_count(), 2);
    }

    #[test]
    fn transitive_walk_stops_at_stores() {
        // S ->ctrl A ->ctrl B ->ctrl C, E (size 0) ->ctrl B.
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Store,4000,8\"];\n\
            1[label=\"TraceEntry:Load,1000,8\"];\n\
            2[label=\"TraceEntry:Load,2000,8\"];\n\
            3[label=\"TraceEntry:Load,3000,8\"];\n\
            4[label=\"TraceEntry:Load,5000,0\"];\n\
            0->1 [label=\"ctrl\"];\n\
            1->2 [label=\"ctrl\"];\n\
            4->2 [label=\"ctrl\"];\n\
            2->3 [label=\"ctrl\"];\n\
            }\n";
        let db = BeliefDatabase::from_graphs(&graphs(text));
        let s = AddrRange::new(0x4000, 8);
        let c = AddrRange::new(0x3000, 8);
        assert!(db.belief_count_between(AddrRange::new(0x1000, 8), c).is_some());
        assert!(db.belief_count_between(s, c).is_none());
        // Store->Load ctrl edge still yields (A, S).
        assert!(db.belief_count_between(AddrRange::new(0x1000, 8), s).is_some());
        assert_eq!(db.pm_object_count(), 4);
    }

    #[test]
    fn transitive_walk_passes_through_empty_nodes() {
        // A ->ctrl Z (size 0) ->ctrl B ->ctrl C.
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Load,1000,8\"];\n\
            1[label=\"TraceEntry:Load,1800,0\"];\n\
            2[label=\"TraceEntry:Load,2000,8\"];\n\
            3[label=\"TraceEntry:Load,3000,8\"];\n\
            0->1 [label=\"ctrl\"];\n\
            1->2 [label=\"ctrl\"];\n\
            2->3 [label=\"ctrl\"];\n\
            }\n";
        let db = BeliefDatabase::from_graphs(&graphs(text));
        let a = AddrRange::new(0x1000, 8);
        let b = AddrRange::new(0x2000, 8);
        let c = AddrRange::new(0x3000, 8);
        assert_eq!(db.belief_count_between(a, c), Some(1));
        assert_eq!(db.belief_count_between(b, c), Some(1));
        assert_eq!(db.belief_count_between(a, b), None);
    }

    #[test]
    fn transitive_belief_counts_each_object_once_per_edge() {
        // Two loads of X both control B; B controls C.
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Load,1000,8\"];\n\
            1[label=\"TraceEntry:Load,1000,8\"];\n\
            2[label=\"TraceEntry:Load,2000,8\"];\n\
            3[label=\"TraceEntry:Load,3000,8\"];\n\
            0->2 [label=\"ctrl\"];\n\
            1->2 [label=\"ctrl\"];\n\
            2->3 [label=\"ctrl\"];\n\
            }\n";
        let db = BeliefDatabase::from_graphs(&graphs(text));
        let x = AddrRange::new(X, 8);
        assert_eq!(db.belief_count_between(x, AddrRange::new(0x2000, 8)), Some(2));
        assert_eq!(db.belief_count_between(x, AddrRange::new(0x3000, 8)), Some(1));
    }

    #[test]
    fn transitive_walk_follows_data_edges() {
        // A ->data B ->ctrl C.
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Load,1000,8\"];\n\
            1[label=\"TraceEntry:Load,2000,8\"];\n\
            2[label=\"TraceEntry:Load,3000,8\"];\n\
            0->1 [label=\"data\"];\n\
            1->2 [label=\"ctrl\"];\n\
            }\n";
        let db = BeliefDatabase::from_graphs(&graphs(text));
        let a = AddrRange::new(0x1000, 8);
        let c = AddrRange::new(0x3000, 8);
        assert_eq!(db.belief_count_between(a, c), Some(1));
        assert_eq!(db.belief_count_between(a, AddrRange::new(0x2000, 8)), None);
        assert_eq!(db.belief_count(), 2);
    }

    #[test]
    fn undeclared_edge_endpoints_are_skipped() {
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Load,1000,8\"];\n\
            1[label=\"TraceEntry:Load,2000,8\"];\n\
            7->1 [label=\"ctrl\"];\n\
            0->1 [label=\"ctrl\"];\n\
            }\n";
        let parsed = graphs(text);
        assert_eq!(parsed[0].dangling_nodes().len(), 1);
        let db = BeliefDatabase::from_graphs(&parsed);
        assert_eq!(db.belief_count(), 1);
        assert_eq!(
            db.belief_count_between(AddrRange::new(0x1000, 8), AddrRange::new(0x2000, 8)),
            Some(1)
        );
    }

    #[test]
    fn unresolved_stores_are_tolerated() {
        let db = BeliefDatabase::from_graphs(&graphs(
            "digraph G {\n0[label=\"TraceEntry:Store,2000,8\"];\n1[label=\"TraceEntry:Load,1000,8\"];\n0->1 [label=\"data\"];\n}\n",
        ));
        let outside = store(9, 0x9000, 8);
        assert_eq!(db.lookup(&outside), None);
        assert!(!db.is_critical_store(&outside));
        assert!(!db.violates_ordering(&outside, &store(10, X, 8)));
        assert!(!db.violates_ordering(&store(11, Y, 8), &outside));
    }

    #[test]
    fn ignored_edge_shapes() {
        // Load->Store and data Load->Load carry no belief.
        let text = "digraph G {\n\
            0[label=\"TraceEntry:Load,1000,8\"];\n\
            1[label=\"TraceEntry:Store,2000,8\"];\n\
            2[label=\"TraceEntry:Load,3000,8\"];\n\
            0->1 [label=\"data\"];\n\
            0->2 [label=\"data\"];\n\
            }\n";
        let db = BeliefDatabase::from_graphs(&graphs(text));
        assert_eq!(db.belief_count(), 0);
        assert_eq!(db.critical_read_count(), 0);
    }
}
