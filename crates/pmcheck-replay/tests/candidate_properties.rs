//! Candidate lists never need look-ahead past the current fence.

use std::fmt::Write as _;

use pmcheck_belief::{BeliefDatabase, DepGraph};
use pmcheck_replay::CandidateSet;
use pmcheck_types::{OpId, Trace};
use proptest::prelude::*;

const OBJECTS: u64 = 6;

fn object_address(object: u64) -> u64 {
    0x1000 + object * 0x100
}

/// One graph with a `Store(s) -> Load(l)` edge of the given kind per pair.
fn graph(edges: &[(u64, u64, bool)]) -> String {
    let mut out = String::from("digraph G {\n");
    for (i, &(store, load, data)) in edges.iter().enumerate() {
        let (s, l) = (2 * i, 2 * i + 1);
        let _ = writeln!(
            out,
            "{s}[label=\"TraceEntry:Store,{:x},8\"];",
            object_address(store)
        );
        let _ = writeln!(
            out,
            "{l}[label=\"TraceEntry:Load,{:x},8\"];",
            object_address(load)
        );
        let kind = if data { "data" } else { "ctrl" };
        let _ = writeln!(out, "{s}->{l} [label=\"{kind}\"];");
    }
    out.push_str("}\n");
    out
}

fn trace(stores: &[(u64, bool)]) -> String {
    let mut out = String::from("TXStart,0,a\n");
    for (i, &(object, fence)) in stores.iter().enumerate() {
        let _ = writeln!(
            out,
            "Store,0,{:x},8,00 00 00 00 00 00 00 {:02x},w.c:{i}",
            object_address(object),
            i % 256
        );
        if fence {
            out.push_str("Fence,0,f\n");
        }
    }
    out.push_str("TXEnd,0,b\n");
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn decidable_prefix_grows_monotonically(
        edges in prop::collection::vec((0..OBJECTS, 0..OBJECTS, any::<bool>()), 1..10),
        stores in prop::collection::vec((0..OBJECTS, any::<bool>()), 2..24),
    ) {
        let db = BeliefDatabase::from_graphs(&DepGraph::parse_all(&graph(&edges)).unwrap());
        let trace = Trace::parse(&trace(&stores)).unwrap();
        let set = CandidateSet::generate(&trace, &db, 10_000).unwrap();
        let list = set.get(0);

        let mut previous = 0;
        for k in 0..trace.len() {
            let bound = OpId::new(u64::try_from(k).unwrap());
            let decidable = list.iter().filter(|c| c.decidable_at() <= bound).count();
            prop_assert!(decidable >= previous);
            // the decidable ones are exactly a prefix of the list
            prop_assert!(list[..decidable].iter().all(|c| c.decidable_at() <= bound));
            previous = decidable;
        }
        prop_assert_eq!(previous, list.len());
    }

    #[test]
    fn candidates_pair_distinct_stores_of_the_transaction(
        edges in prop::collection::vec((0..OBJECTS, 0..OBJECTS, any::<bool>()), 1..10),
        stores in prop::collection::vec((0..OBJECTS, any::<bool>()), 2..24),
    ) {
        let db = BeliefDatabase::from_graphs(&DepGraph::parse_all(&graph(&edges)).unwrap());
        let trace = Trace::parse(&trace(&stores)).unwrap();
        let set = CandidateSet::generate(&trace, &db, 10_000).unwrap();
        for c in set.get(0) {
            prop_assert_ne!(c.pre, c.volatile);
            prop_assert!(trace.op(c.pre).unwrap().is_store());
            prop_assert!(trace.op(c.volatile).unwrap().is_store());
        }
    }
}
