use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;
use uuid::Uuid;

use crate::spec::{EdgeSpec, ExecutionConfig, NodeSpec, WorkflowSpec};

/// A validated, immutable workflow DAG.
///
/// Construction is the only place validation happens; afterwards the
/// graph answers dependency queries and nothing else can change it.
pub struct WorkflowDag {
    workflow_id: Uuid,
    name: String,
    execution: ExecutionConfig,
    graph: DiGraph<NodeSpec, EdgeSpec>,
    index: HashMap<Uuid, NodeIndex>,
    /// Stable topological ordering, used as a scheduling hint only.
    topo: Vec<Uuid>,
}

impl WorkflowDag {
    /// Validate a submission into an executable DAG.
    ///
    /// Rejects duplicate node ids, edges naming unknown endpoints, cycles
    /// (naming one offending node), and a zero callback timeout.
    pub fn validate(spec: WorkflowSpec) -> Result<Self, DagError> {
        if spec.execution.callback_timeout_ms == 0 {
            return Err(DagError::InvalidExecutionConfig(
                "callback_timeout_ms must be non-zero".to_string(),
            ));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(spec.nodes.len());

        for node in spec.nodes {
            let id = node.id;
            if index.contains_key(&id) {
                return Err(DagError::DuplicateNode(id));
            }
            index.insert(id, graph.add_node(node));
        }

        for edge in spec.edges {
            let from = *index
                .get(&edge.source)
                .ok_or(DagError::UnknownNode(edge.source))?;
            let to = *index
                .get(&edge.target)
                .ok_or(DagError::UnknownNode(edge.target))?;
            graph.add_edge(from, to, edge);
        }

        let topo = toposort(&graph, None)
            .map_err(|cycle| DagError::CycleDetected(graph[cycle.node_id()].id))?
            .into_iter()
            .map(|idx| graph[idx].id)
            .collect();

        Ok(Self {
            workflow_id: spec.id,
            name: spec.name,
            execution: spec.execution,
            graph,
            index,
            topo,
        })
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(&self, id: Uuid) -> Option<&NodeSpec> {
        self.index.get(&id).map(|idx| &self.graph[*idx])
    }

    /// Node ids in stable topological order.
    pub fn topo_order(&self) -> &[Uuid] {
        &self.topo
    }

    /// Nodes with no inputs; the initial ready set.
    pub fn roots(&self) -> Vec<Uuid> {
        self.topo
            .iter()
            .copied()
            .filter(|id| self.parents(*id).is_empty())
            .collect()
    }

    /// Direct upstream dependencies of a node.
    pub fn parents(&self, id: Uuid) -> Vec<Uuid> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct downstream dependents of a node.
    pub fn children(&self, id: Uuid) -> Vec<Uuid> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every node reachable downstream of `id`, excluding `id` itself.
    /// These are the nodes cancelled when `id` fails terminally.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let Some(start) = self.index.get(&id) else {
            return Vec::new();
        };

        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(*start);

        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        // Preserve topological order for deterministic cancellation.
        self.topo
            .iter()
            .copied()
            .filter(|nid| {
                self.index
                    .get(nid)
                    .map(|idx| seen.contains(idx))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Incoming edges of a node, paired with their source node id.
    pub fn incoming_edges(&self, id: Uuid) -> Vec<(Uuid, &EdgeSpec)> {
        let Some(idx) = self.index.get(&id) else {
            return Vec::new();
        };
        use petgraph::visit::EdgeRef;
        self.graph
            .edges_directed(*idx, Direction::Incoming)
            .map(|e| (self.graph[e.source()].id, e.weight()))
            .collect()
    }

    fn neighbors(&self, id: Uuid, dir: Direction) -> Vec<Uuid> {
        let Some(idx) = self.index.get(&id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(*idx, dir)
            .map(|n| self.graph[n].id)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected at node {0}")]
    CycleDetected(Uuid),

    #[error("Edge references unknown node {0}")]
    UnknownNode(Uuid),

    #[error("Duplicate node id {0}")]
    DuplicateNode(Uuid),

    #[error("Invalid execution config: {0}")]
    InvalidExecutionConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{EdgeSpec, NodeSpec, WorkflowSpec};

    fn two_node_spec() -> (WorkflowSpec, Uuid, Uuid) {
        let mut spec = WorkflowSpec::new("pair", ExecutionConfig::with_timeout(10_000));
        let a = NodeSpec::new("t.a", "A").output("out", "json");
        let b = NodeSpec::new("t.b", "B").input("in", "json", true);
        let (ida, idb) = (a.id, b.id);
        spec.nodes.push(a);
        spec.nodes.push(b);
        spec.edges.push(EdgeSpec::new(ida, "out", idb, "in"));
        (spec, ida, idb)
    }

    #[test]
    fn validates_chain() {
        let (spec, ida, idb) = two_node_spec();
        let dag = WorkflowDag::validate(spec).unwrap();
        assert_eq!(dag.node_count(), 2);
        assert_eq!(dag.roots(), vec![ida]);
        assert_eq!(dag.parents(idb), vec![ida]);
        assert_eq!(dag.children(ida), vec![idb]);
        assert_eq!(dag.topo_order(), &[ida, idb]);
    }

    #[test]
    fn rejects_cycle() {
        let (mut spec, ida, idb) = two_node_spec();
        spec.edges.push(EdgeSpec::new(idb, "out", ida, "in"));
        match WorkflowDag::validate(spec) {
            Err(DagError::CycleDetected(node)) => {
                assert!(node == ida || node == idb);
            }
            other => panic!("expected CycleDetected, got {:?}", other.err()),
        }
    }

    #[test]
    fn rejects_dangling_edge() {
        let (mut spec, ida, _) = two_node_spec();
        let ghost = Uuid::new_v4();
        spec.edges.push(EdgeSpec::new(ida, "out", ghost, "in"));
        match WorkflowDag::validate(spec) {
            Err(DagError::UnknownNode(node)) => assert_eq!(node, ghost),
            other => panic!("expected UnknownNode, got {:?}", other.err()),
        }
    }

    #[test]
    fn rejects_duplicate_node() {
        let (mut spec, ida, _) = two_node_spec();
        let mut dup = NodeSpec::new("t.dup", "Dup");
        dup.id = ida;
        spec.nodes.push(dup);
        assert!(matches!(
            WorkflowDag::validate(spec),
            Err(DagError::DuplicateNode(id)) if id == ida
        ));
    }

    #[test]
    fn rejects_zero_callback_timeout() {
        let (mut spec, _, _) = two_node_spec();
        spec.execution.callback_timeout_ms = 0;
        assert!(matches!(
            WorkflowDag::validate(spec),
            Err(DagError::InvalidExecutionConfig(_))
        ));
    }

    #[test]
    fn diamond_descendants() {
        // A -> B, A -> C, B -> D, C -> D
        let mut spec = WorkflowSpec::new("diamond", ExecutionConfig::with_timeout(10_000));
        let nodes: Vec<NodeSpec> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| NodeSpec::new("t", n))
            .collect();
        let ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        spec.nodes = nodes;
        spec.edges = vec![
            EdgeSpec::new(ids[0], "out", ids[1], "in"),
            EdgeSpec::new(ids[0], "out", ids[2], "in"),
            EdgeSpec::new(ids[1], "out", ids[3], "left"),
            EdgeSpec::new(ids[2], "out", ids[3], "right"),
        ];

        let dag = WorkflowDag::validate(spec).unwrap();
        let down = dag.descendants(ids[0]);
        assert_eq!(down.len(), 3);
        assert!(!down.contains(&ids[0]));
        // D has two parents
        let mut parents = dag.parents(ids[3]);
        parents.sort();
        let mut expect = vec![ids[1], ids[2]];
        expect.sort();
        assert_eq!(parents, expect);
    }
}
