//! Program dependence graph text format.
//!
//! A file holds one `digraph` block per traced transaction:
//!
//! ```text
//! digraph G {
//! 0[label="TI:4:::Src:list.c:31:::TraceEntry:Load,7f0000001000,8"];
//! 1[label="TI:9:::Src:list.c:40:::TraceEntry:Store,7f0000001040,8"];
//! 0->1 [label="data"];
//! }
//! ```
//!
//! Node ids are local to their block.

use std::collections::{HashMap, HashSet};
use std::fmt;

use pmcheck_error::{PmcheckError, Result};
use pmcheck_types::AddrRange;

/// Memory access kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Load,
    Store,
}

/// Dependency kind of a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Data,
    Control,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "data",
            Self::Control => "ctrl",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepNode {
    pub id: u64,
    pub kind: AccessKind,
    pub range: AddrRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEdge {
    pub src: u64,
    pub dst: u64,
    pub kind: EdgeKind,
}

/// One dependence graph.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    nodes: Vec<DepNode>,
    node_index: HashMap<u64, usize>,
    edges: Vec<DepEdge>,
    edge_index: HashMap<(u64, u64), usize>,
    predecessors: HashMap<u64, Vec<(u64, EdgeKind)>>,
}

impl DepGraph {
    /// Parse every `digraph` block of a file.
    pub fn parse_all(text: &str) -> Result<Vec<Self>> {
        let mut graphs = Vec::new();
        let mut current: Option<Self> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("digraph") || line.ends_with('{') {
                if current.is_some() {
                    return Err(PmcheckError::graph(line_no, "digraph opened inside a block"));
                }
                current = Some(Self::default());
                continue;
            }
            if line.starts_with('}') {
                let graph = current
                    .take()
                    .ok_or_else(|| PmcheckError::graph(line_no, "'}' without digraph"))?;
                graphs.push(graph);
                continue;
            }
            let graph = current
                .as_mut()
                .ok_or_else(|| PmcheckError::graph(line_no, "statement outside digraph"))?;
            if line.contains("->") {
                graph.add_edge(parse_edge(line_no, line)?);
            } else {
                graph.add_node(parse_node(line_no, line)?);
            }
        }
        if current.is_some() {
            return Err(PmcheckError::graph(
                text.lines().count(),
                "unterminated digraph block",
            ));
        }
        Ok(graphs)
    }

    pub fn add_node(&mut self, node: DepNode) {
        match self.node_index.get(&node.id) {
            Some(&slot) => self.nodes[slot] = node,
            None => {
                self.node_index.insert(node.id, self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    /// Add an edge; a repeated `(src, dst)` keeps its position and takes the
    /// new kind.
    pub fn add_edge(&mut self, edge: DepEdge) {
        let key = (edge.src, edge.dst);
        if let Some(&slot) = self.edge_index.get(&key) {
            let old = self.edges[slot].kind;
            self.edges[slot].kind = edge.kind;
            if let Some(preds) = self.predecessors.get_mut(&edge.dst) {
                for pred in preds.iter_mut().filter(|p| p.0 == edge.src && p.1 == old) {
                    pred.1 = edge.kind;
                }
            }
            return;
        }
        self.edge_index.insert(key, self.edges.len());
        self.edges.push(edge);
        self.predecessors
            .entry(edge.dst)
            .or_default()
            .push((edge.src, edge.kind));
    }

    pub fn nodes(&self) -> &[DepNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DepEdge] {
        &self.edges
    }

    pub fn node(&self, id: u64) -> Option<&DepNode> {
        self.node_index.get(&id).map(|&slot| &self.nodes[slot])
    }

    /// Sources and kinds of edges into `id`, in insertion order.
    pub fn predecessors(&self, id: u64) -> impl Iterator<Item = (u64, EdgeKind)> + '_ {
        self.predecessors.get(&id).into_iter().flatten().copied()
    }

    /// Nodes referenced by an edge but never declared.
    pub fn dangling_nodes(&self) -> HashSet<u64> {
        self.edges
            .iter()
            .flat_map(|e| [e.src, e.dst])
            .filter(|id| !self.node_index.contains_key(id))
            .collect()
    }
}

/// Quoted value of the `label` attribute.
fn label(line: &str) -> Option<&str> {
    let start = line.find("label=\"")? + "label=\"".len();
    let len = line[start..].find('"')?;
    Some(&line[start..start + len])
}

fn parse_id(line_no: usize, text: &str) -> Result<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|e| PmcheckError::graph(line_no, format!("bad node id '{text}': {e}")))
}

fn parse_node(line_no: usize, line: &str) -> Result<DepNode> {
    let bracket = line
        .find('[')
        .ok_or_else(|| PmcheckError::graph(line_no, "node line without attributes"))?;
    let id = parse_id(line_no, &line[..bracket])?;
    let label =
        label(line).ok_or_else(|| PmcheckError::graph(line_no, "node line without label"))?;
    let entry_at = label
        .find("TraceEntry")
        .ok_or_else(|| PmcheckError::graph(line_no, "label without TraceEntry"))?;
    // `TraceEntry:` and `TraceEntry(` spellings both occur.
    let entry = label[entry_at + "TraceEntry".len()..]
        .get(1..)
        .unwrap_or_default()
        .trim_end_matches(')');
    let fields: Vec<&str> = entry.split(',').map(str::trim).collect();
    let [kind, address, size] = fields.as_slice() else {
        return Err(PmcheckError::graph(
            line_no,
            format!("TraceEntry '{entry}' needs kind, address and size"),
        ));
    };
    let kind = match *kind {
        "Load" => AccessKind::Load,
        "Store" => AccessKind::Store,
        other => {
            return Err(PmcheckError::graph(
                line_no,
                format!("unknown access kind '{other}'"),
            ));
        }
    };
    let digits = address.trim_start_matches("0x");
    let address = u64::from_str_radix(digits, 16)
        .map_err(|e| PmcheckError::graph(line_no, format!("bad address '{address}': {e}")))?;
    let size = size
        .parse::<u64>()
        .map_err(|e| PmcheckError::graph(line_no, format!("bad size '{size}': {e}")))?;
    Ok(DepNode {
        id,
        kind,
        range: AddrRange::new(address, size),
    })
}

fn parse_edge(line_no: usize, line: &str) -> Result<DepEdge> {
    let arrow = line
        .find("->")
        .ok_or_else(|| PmcheckError::graph(line_no, "edge line without '->'"))?;
    let src = parse_id(line_no, &line[..arrow])?;
    let rest = &line[arrow + 2..];
    let dst_end = rest
        .find(|c: char| c == '[' || c == ';' || c.is_whitespace())
        .unwrap_or(rest.len());
    let dst = parse_id(line_no, &rest[..dst_end])?;
    let kind = match label(line) {
        Some("data") => EdgeKind::Data,
        Some("ctrl") => EdgeKind::Control,
        Some(other) => {
            return Err(PmcheckError::graph(
                line_no,
                format!("unknown edge kind '{other}'"),
            ));
        }
        None => return Err(PmcheckError::graph(line_no, "edge line without label")),
    };
    Ok(DepEdge { src, dst, kind })
}
