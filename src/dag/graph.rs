// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;
use tracing::debug;

use crate::dag::work_item::WorkItem;
use crate::errors::ValidationError;
use crate::types::WorkItemId;

/// Arena entry: the item plus adjacency by id.
#[derive(Debug, Clone, Serialize)]
struct GraphNode {
    item: WorkItem,
    /// Direct dependencies, sorted.
    deps: Vec<WorkItemId>,
    /// Direct dependents, sorted.
    dependents: Vec<WorkItemId>,
    /// Longest dependency path length from a root.
    level: usize,
}

/// Validated, acyclic graph of work items plus its parallel groups.
///
/// Nodes are addressed by id; there are no object references between nodes,
/// so the whole graph can be cloned or serialised as-is.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Graph {
    nodes: BTreeMap<WorkItemId, GraphNode>,
    /// `(from, to)`: `to` depends on `from`.
    edges: BTreeSet<(WorkItemId, WorkItemId)>,
    /// Group `k` holds every id whose level is `k`, ascending by id.
    groups: Vec<Vec<WorkItemId>>,
}

impl Graph {
    /// Build a graph from descriptors, rejecting duplicates, unknown
    /// dependencies and cycles.
    pub fn build(items: Vec<WorkItem>) -> Result<Self, ValidationError> {
        let mut nodes: BTreeMap<WorkItemId, GraphNode> = BTreeMap::new();

        for item in items {
            if item.id.trim().is_empty() {
                return Err(ValidationError::MalformedWorkItem {
                    item: item.id.clone(),
                    message: "id must not be empty".to_string(),
                });
            }
            if nodes.contains_key(&item.id) {
                return Err(ValidationError::DuplicateId {
                    kind: "step",
                    id: item.id.clone(),
                });
            }
            let deps: Vec<WorkItemId> = item.depends_on.iter().cloned().collect();
            nodes.insert(
                item.id.clone(),
                GraphNode {
                    item,
                    deps,
                    dependents: Vec::new(),
                    level: 0,
                },
            );
        }

        let mut edges = BTreeSet::new();
        for (id, node) in &nodes {
            for dep in &node.deps {
                if !nodes.contains_key(dep) {
                    return Err(ValidationError::UnknownDependency {
                        item: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                edges.insert((dep.clone(), id.clone()));
            }
        }

        for (from, to) in &edges {
            if let Some(node) = nodes.get_mut(from) {
                node.dependents.push(to.clone());
            }
        }

        let order = topological_order(&nodes, &edges)?;

        // Levels in topological order: every dependency is seen first.
        for id in &order {
            let level = nodes[id]
                .deps
                .iter()
                .map(|d| nodes[d].level + 1)
                .max()
                .unwrap_or(0);
            if let Some(node) = nodes.get_mut(id) {
                node.level = level;
            }
        }

        let depth = nodes.values().map(|n| n.level + 1).max().unwrap_or(0);
        let mut groups: Vec<Vec<WorkItemId>> = vec![Vec::new(); depth];
        // BTreeMap iteration keeps every group sorted by id.
        for (id, node) in &nodes {
            groups[node.level].push(id.clone());
        }

        debug!(nodes = nodes.len(), groups = groups.len(), "built step graph");

        Ok(Self {
            nodes,
            edges,
            groups,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.nodes.values().map(|n| &n.item)
    }

    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.nodes.get(id).map(|n| &n.item)
    }

    pub fn dependencies_of(&self, id: &str) -> &[WorkItemId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[WorkItemId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    pub fn level_of(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|n| n.level)
    }

    pub fn edges(&self) -> &BTreeSet<(WorkItemId, WorkItemId)> {
        &self.edges
    }

    pub fn groups(&self) -> &[Vec<WorkItemId>] {
        &self.groups
    }

    /// `id` plus every transitive dependency whose level is at least
    /// `min_level`.
    pub fn ancestors_from_level(&self, id: &str, min_level: usize) -> BTreeSet<WorkItemId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id.to_string()];

        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if node.level < min_level || !out.insert(current.clone()) {
                continue;
            }
            stack.extend(node.deps.iter().cloned());
        }

        out
    }

    /// Every transitive dependent of any id in `roots`, excluding the roots.
    pub fn descendants_of(&self, roots: &BTreeSet<WorkItemId>) -> BTreeSet<WorkItemId> {
        self.descendants_avoiding(roots, &BTreeSet::new())
    }

    /// Like [`Graph::descendants_of`], but never enters or walks through an
    /// id in `avoid`.
    pub fn descendants_avoiding(
        &self,
        roots: &BTreeSet<WorkItemId>,
        avoid: &BTreeSet<WorkItemId>,
    ) -> BTreeSet<WorkItemId> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<WorkItemId> = roots
            .iter()
            .flat_map(|r| self.dependents_of(r).iter().cloned())
            .collect();

        while let Some(current) = stack.pop() {
            if roots.contains(&current) || avoid.contains(&current) {
                continue;
            }
            if !out.insert(current.clone()) {
                continue;
            }
            stack.extend(self.dependents_of(&current).iter().cloned());
        }

        out
    }
}

/// Topological order of all nodes, or the witness cycle.
fn topological_order(
    nodes: &BTreeMap<WorkItemId, GraphNode>,
    edges: &BTreeSet<(WorkItemId, WorkItemId)>,
) -> Result<Vec<WorkItemId>, ValidationError> {
    // Edge direction: dep -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in nodes.keys() {
        graph.add_node(id.as_str());
    }
    for (from, to) in edges {
        graph.add_edge(from.as_str(), to.as_str(), ());
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => {
            let hint = cycle.node_id();
            let cycle = find_cycle(nodes, hint).unwrap_or_else(|| vec![hint.to_string()]);
            Err(ValidationError::Cycle { cycle })
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-colour DFS returning one cycle as `[a, b, ..., a]`.
///
/// Starts from `hint` (the node petgraph tripped on), then every other node.
fn find_cycle(nodes: &BTreeMap<WorkItemId, GraphNode>, hint: &str) -> Option<Vec<WorkItemId>> {
    let mut colors: HashMap<&str, Color> =
        nodes.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();

    let starts = std::iter::once(hint).chain(nodes.keys().map(|k| k.as_str()));
    for start in starts {
        if colors.get(start) == Some(&Color::White) {
            if let Some(cycle) = visit(nodes, start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    nodes: &'a BTreeMap<WorkItemId, GraphNode>,
    node: &'a str,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<WorkItemId>> {
    colors.insert(node, Color::Gray);
    path.push(node);

    for next in &nodes[node].dependents {
        match colors.get(next.as_str()).copied() {
            Some(Color::Gray) => {
                let start = path.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                let mut cycle: Vec<WorkItemId> =
                    path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.clone());
                return Some(cycle);
            }
            Some(Color::White) => {
                if let Some(cycle) = visit(nodes, next.as_str(), colors, path) {
                    return Some(cycle);
                }
            }
            _ => {}
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
    None
}
