//! Arena of record nodes with typed adjacency lists. Nodes are addressed by
//! index, so cycles in the data never become cycles in ownership.

use std::collections::{HashMap, HashSet};

use concord_core::{RecordId, RelationshipKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIx(u32);

impl NodeIx {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct NodeSlot {
    record_id: RecordId,
    outgoing: HashMap<String, Vec<NodeIx>>,
    incoming: HashMap<String, Vec<NodeIx>>,
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    nodes: Vec<NodeSlot>,
    index: HashMap<RecordId, NodeIx>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, record_id: RecordId) -> Option<NodeIx> {
        self.index.get(&record_id).copied()
    }

    fn node(&mut self, record_id: RecordId) -> NodeIx {
        if let Some(ix) = self.index.get(&record_id) {
            return *ix;
        }
        let ix = NodeIx(self.nodes.len() as u32);
        self.nodes.push(NodeSlot {
            record_id,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        });
        self.index.insert(record_id, ix);
        ix
    }

    pub fn contains(&self, key: &RelationshipKey) -> bool {
        match (self.lookup(key.source_id), self.lookup(key.target_id)) {
            (Some(s), Some(t)) => self.successors(s, &key.relationship_type).contains(&t),
            _ => false,
        }
    }

    /// Add the edge. Adding an existing edge is a no-op.
    pub fn link(&mut self, key: &RelationshipKey) {
        if self.contains(key) {
            return;
        }
        let source = self.node(key.source_id);
        let target = self.node(key.target_id);
        let ty = &key.relationship_type;
        self.nodes[source.index()]
            .outgoing
            .entry(ty.clone())
            .or_default()
            .push(target);
        self.nodes[target.index()]
            .incoming
            .entry(ty.clone())
            .or_default()
            .push(source);
    }

    pub fn unlink(&mut self, key: &RelationshipKey) {
        let (Some(source), Some(target)) = (self.lookup(key.source_id), self.lookup(key.target_id))
        else {
            return;
        };
        let ty = &key.relationship_type;
        if let Some(out) = self.nodes[source.index()].outgoing.get_mut(ty) {
            out.retain(|n| *n != target);
        }
        if let Some(inc) = self.nodes[target.index()].incoming.get_mut(ty) {
            inc.retain(|n| *n != source);
        }
    }

    fn successors(&self, node: NodeIx, ty: &str) -> &[NodeIx] {
        self.nodes[node.index()]
            .outgoing
            .get(ty)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn predecessors(&self, node: NodeIx, ty: &str) -> &[NodeIx] {
        self.nodes[node.index()]
            .incoming
            .get(ty)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn outgoing(&self, record_id: RecordId, ty: &str) -> Vec<RecordId> {
        self.lookup(record_id)
            .map(|ix| self.resolve(self.successors(ix, ty)))
            .unwrap_or_default()
    }

    pub fn incoming(&self, record_id: RecordId, ty: &str) -> Vec<RecordId> {
        self.lookup(record_id)
            .map(|ix| self.resolve(self.predecessors(ix, ty)))
            .unwrap_or_default()
    }

    pub fn out_degree(&self, record_id: RecordId, ty: &str) -> usize {
        self.lookup(record_id)
            .map(|ix| self.successors(ix, ty).len())
            .unwrap_or(0)
    }

    fn resolve(&self, nodes: &[NodeIx]) -> Vec<RecordId> {
        nodes.iter().map(|n| self.nodes[n.index()].record_id).collect()
    }

    /// Depth-first reachability over edges of one type.
    pub fn has_path(&self, from: RecordId, to: RecordId, ty: &str) -> bool {
        self.path(from, to, ty).is_some()
    }

    /// Records along some path from `from` to `to`, both ends included.
    pub fn path(&self, from: RecordId, to: RecordId, ty: &str) -> Option<Vec<RecordId>> {
        let (from, to) = (self.lookup(from)?, self.lookup(to)?);
        let mut parent: Vec<Option<NodeIx>> = vec![None; self.nodes.len()];
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        visited[from.index()] = true;
        while let Some(node) = stack.pop() {
            if node == to {
                let mut hops = vec![node];
                let mut at = node;
                while let Some(prev) = parent[at.index()] {
                    hops.push(prev);
                    at = prev;
                }
                hops.reverse();
                return Some(self.resolve(&hops));
            }
            for &next in self.successors(node, ty) {
                if !std::mem::replace(&mut visited[next.index()], true) {
                    parent[next.index()] = Some(node);
                    stack.push(next);
                }
            }
        }
        None
    }

    /// Edges on the longest chain that would pass through `key` once it is
    /// added. `None` when the chain already contains a cycle.
    pub fn chain_length_through(&self, key: &RelationshipKey) -> Option<usize> {
        let ty = &key.relationship_type;
        let before = match self.lookup(key.source_id) {
            Some(ix) => self.longest(ix, ty, Direction::Backward, &mut HashMap::new(), &mut HashSet::new())?,
            None => 0,
        };
        let after = match self.lookup(key.target_id) {
            Some(ix) => self.longest(ix, ty, Direction::Forward, &mut HashMap::new(), &mut HashSet::new())?,
            None => 0,
        };
        Some(before + 1 + after)
    }

    fn longest(
        &self,
        node: NodeIx,
        ty: &str,
        direction: Direction,
        memo: &mut HashMap<NodeIx, usize>,
        on_stack: &mut HashSet<NodeIx>,
    ) -> Option<usize> {
        if let Some(depth) = memo.get(&node) {
            return Some(*depth);
        }
        if !on_stack.insert(node) {
            return None;
        }
        let next = match direction {
            Direction::Forward => self.successors(node, ty),
            Direction::Backward => self.predecessors(node, ty),
        };
        let mut depth = 0;
        for n in next {
            depth = depth.max(1 + self.longest(*n, ty, direction, memo, on_stack)?);
        }
        on_stack.remove(&node);
        memo.insert(node, depth);
        Some(depth)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: RecordId, t: RecordId) -> RelationshipKey {
        RelationshipKey::new(s, t, "depends_on")
    }

    #[test]
    fn path_follows_only_one_type() {
        let (a, b, c) = (RecordId::new(), RecordId::new(), RecordId::new());
        let mut graph = RelationshipGraph::new();
        graph.link(&key(a, b));
        graph.link(&RelationshipKey::new(b, c, "mentions"));
        assert!(graph.has_path(a, b, "depends_on"));
        assert!(!graph.has_path(a, c, "depends_on"));
        assert!(!graph.has_path(b, a, "depends_on"));
    }

    #[test]
    fn path_lists_every_hop() {
        let (a, b, c) = (RecordId::new(), RecordId::new(), RecordId::new());
        let mut graph = RelationshipGraph::new();
        graph.link(&RelationshipKey::new(a, b, "t"));
        graph.link(&RelationshipKey::new(b, c, "t"));
        assert_eq!(graph.path(a, c, "t"), Some(vec![a, b, c]));
        assert_eq!(graph.path(a, a, "t"), Some(vec![a]));
        assert_eq!(graph.path(c, a, "t"), None);
    }

    #[test]
    fn unlink_removes_both_directions() {
        let (a, b) = (RecordId::new(), RecordId::new());
        let mut graph = RelationshipGraph::new();
        graph.link(&key(a, b));
        graph.link(&key(a, b));
        assert_eq!(graph.out_degree(a, "depends_on"), 1);
        graph.unlink(&key(a, b));
        assert!(graph.outgoing(a, "depends_on").is_empty());
        assert!(graph.incoming(b, "depends_on").is_empty());
    }

    #[test]
    fn chain_length_counts_both_sides() {
        let ids: Vec<RecordId> = (0..5).map(|_| RecordId::new()).collect();
        let mut graph = RelationshipGraph::new();
        graph.link(&key(ids[0], ids[1]));
        graph.link(&key(ids[3], ids[4]));
        assert_eq!(graph.chain_length_through(&key(ids[1], ids[3])), Some(3));

        graph.link(&key(ids[4], ids[3]));
        assert_eq!(graph.chain_length_through(&key(ids[1], ids[3])), None);
    }
}
