//! Pure, in-memory task graph.
//!
//! Stateless except for the [`TaskGraph`] instance it is asked to
//! operate on. Nodes are kept in an id-keyed map (arena + index
//! pattern): every inter-node reference (`children`, `dependencies`,
//! `dependents`, `parent`) is an id, never a pointer or `Rc`, so the
//! structure has no cyclic ownership to fight the borrow checker over.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::task::{EdgeKind, Task, TaskRelation, TaskStatus, normalize_id};

/// Errors that can occur while building or parsing a task graph.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("relation has an empty endpoint: {from:?} -> {to:?}")]
    EmptyRelation { from: String, to: String },

    #[error("task {0:?} cannot relate to itself")]
    SelfReferential(String),

    #[error("relation {relation:?} references unknown task {id:?}")]
    UnknownEndpoint { relation: &'static str, id: String },

    #[error("unsupported relation type: {0:?}")]
    UnsupportedRelationType(String),

    #[error("task {task:?} has multiple parents: {existing:?} and {new:?}")]
    MultiParent {
        task: String,
        existing: String,
        new: String,
    },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("parent-chain cycle detected: {}", .0.join(" -> "))]
    ParentCycleDetected(Vec<String>),
}

/// Parse a raw relation-kind string from an adapter into an [`EdgeKind`].
pub fn parse_relation_kind(raw: &str) -> Result<EdgeKind, GraphError> {
    match raw {
        "parent" => Ok(EdgeKind::Parent),
        "depends_on" => Ok(EdgeKind::DependsOn),
        "blocks" => Ok(EdgeKind::Blocks),
        other => Err(GraphError::UnsupportedRelationType(other.to_string())),
    }
}

/// A single node in the graph: a task plus its materialized edges.
///
/// `children`, `dependencies`, `dependents` are sorted by id (a
/// `BTreeSet` rather than a later sort pass) for deterministic
/// iteration order.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task: Task,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub dependents: BTreeSet<String>,
    pub depth: usize,
}

/// The in-memory task graph for one root/parent id.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub root: String,
    nodes: BTreeMap<String, TaskNode>,
}

/// A lightweight summary returned by [`get_next_available`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub priority: i64,
}

/// Options for [`calculate_concurrency`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrencyOpts {
    /// Hard cap on the returned value; `0` means "no explicit cap".
    pub max_workers: usize,
    /// Used to derive a `2 * cpu_count` cap; `0` means "no cap from this source".
    pub cpu_count: usize,
}

impl TaskGraph {
    /// Build a graph from a flat task list and a set of relations.
    ///
    /// Rejects empty or self-referential relations, unknown endpoints,
    /// unsupported relation types (see [`parse_relation_kind`] for where
    /// those are caught before reaching here), multi-parent nodes, and
    /// dependency cycles (the error carries the full cycle path, in
    /// order). Depth is assigned by DFS over parent edges, with cycle
    /// detection independent of the dependency-cycle check.
    pub fn build(
        root: &str,
        tasks: Vec<Task>,
        relations: Vec<TaskRelation>,
    ) -> Result<TaskGraph, GraphError> {
        let root = normalize_id(root);

        let mut nodes: BTreeMap<String, TaskNode> = BTreeMap::new();
        for task in tasks {
            let id = normalize_id(&task.id);
            // Dedupe with equal-content tolerance: a later entry with the
            // same normalized id simply overwrites the earlier one.
            nodes.insert(
                id.clone(),
                TaskNode {
                    task: Task { id, ..task },
                    parent: None,
                    children: BTreeSet::new(),
                    dependencies: BTreeSet::new(),
                    dependents: BTreeSet::new(),
                    depth: 0,
                },
            );
        }

        for rel in relations {
            let from = normalize_id(&rel.from);
            let to = normalize_id(&rel.to);

            if from.is_empty() || to.is_empty() {
                return Err(GraphError::EmptyRelation { from, to });
            }
            if from == to {
                return Err(GraphError::SelfReferential(from));
            }
            if !nodes.contains_key(&from) {
                return Err(GraphError::UnknownEndpoint {
                    relation: "from",
                    id: from,
                });
            }
            if !nodes.contains_key(&to) {
                return Err(GraphError::UnknownEndpoint {
                    relation: "to",
                    id: to,
                });
            }

            match rel.kind {
                EdgeKind::Parent => {
                    // from = child, to = parent.
                    if let Some(existing) = nodes[&from].parent.clone() {
                        if existing != to {
                            return Err(GraphError::MultiParent {
                                task: from,
                                existing,
                                new: to,
                            });
                        }
                    } else {
                        nodes.get_mut(&from).unwrap().parent = Some(to.clone());
                        nodes.get_mut(&to).unwrap().children.insert(from.clone());
                    }
                }
                EdgeKind::DependsOn => {
                    // from depends on to: from must wait for to.
                    nodes.get_mut(&from).unwrap().dependencies.insert(to.clone());
                    nodes.get_mut(&to).unwrap().dependents.insert(from.clone());
                }
                EdgeKind::Blocks => {
                    // blocks(from, to) is stored as depends_on(to, from):
                    // `to` depends on `from` completing first.
                    nodes.get_mut(&to).unwrap().dependencies.insert(from.clone());
                    nodes.get_mut(&from).unwrap().dependents.insert(to.clone());
                }
            }
        }

        check_dependency_cycles(&nodes)?;
        assign_depths(&mut nodes)?;

        Ok(TaskGraph { root, nodes })
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Detect cycles on the `depends_on` graph via Kahn's algorithm, falling
/// back to a DFS back-edge walk (only when Kahn's leaves a remainder) to
/// report the nodes in cycle order rather than merely as an unordered
/// set.
fn check_dependency_cycles(nodes: &BTreeMap<String, TaskNode>) -> Result<(), GraphError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    for (id, node) in nodes {
        in_degree.insert(id.as_str(), node.dependencies.len());
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in &nodes[id].dependents {
            let deg = in_degree.get_mut(dependent.as_str()).unwrap();
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(dependent.as_str());
            }
        }
    }

    if visited == nodes.len() {
        return Ok(());
    }

    let remaining: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg > 0)
        .map(|(id, _)| *id)
        .collect();

    Err(GraphError::CycleDetected(find_cycle_path(nodes, &remaining)))
}

/// Walk the subgraph of nodes still known to be in a cycle (per Kahn's
/// leftover set) via DFS, tracking the gray (on-stack) path, and return
/// the first cycle found as an ordered, closed path `a -> b -> ... -> a`.
fn find_cycle_path(nodes: &BTreeMap<String, TaskNode>, remaining: &BTreeSet<&str>) -> Vec<String> {
    #[derive(PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: BTreeMap<&str, Color> =
        remaining.iter().map(|id| (*id, Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    // Iterative DFS so the cycle-closing back edge can be reported without
    // fighting the borrow checker over a recursive closure.
    let start_candidates: Vec<&str> = remaining.iter().copied().collect();
    for start in start_candidates {
        if !matches!(color.get(start), Some(Color::White)) {
            continue;
        }
        let mut frames: Vec<(&str, std::collections::btree_set::Iter<'_, String>)> = Vec::new();
        color.insert(start, Color::Gray);
        stack.push(start);
        frames.push((start, nodes[start].dependents.iter()));

        'outer: while let Some((node_id, iter)) = frames.last_mut() {
            let node_id = *node_id;
            loop {
                match iter.next() {
                    Some(next) => {
                        let next = next.as_str();
                        if !remaining.contains(next) {
                            continue;
                        }
                        match color.get(next) {
                            Some(Color::Gray) => {
                                // Found a back edge: close the cycle from `next`.
                                let pos = stack.iter().position(|n| *n == next).unwrap();
                                let mut path: Vec<String> =
                                    stack[pos..].iter().map(|s| s.to_string()).collect();
                                path.push(next.to_string());
                                return path;
                            }
                            Some(Color::White) => {
                                color.insert(next, Color::Gray);
                                stack.push(next);
                                frames.push((next, nodes[next].dependents.iter()));
                                continue 'outer;
                            }
                            _ => continue,
                        }
                    }
                    None => break,
                }
            }
            color.insert(node_id, Color::Black);
            stack.pop();
            frames.pop();
        }
    }

    // Should be unreachable given Kahn's algorithm already proved a
    // cycle exists among `remaining`, but fall back to naming the whole
    // remainder rather than panicking.
    remaining.iter().map(|s| s.to_string()).collect()
}

fn assign_depths(nodes: &mut BTreeMap<String, TaskNode>) -> Result<(), GraphError> {
    let ids: Vec<String> = nodes.keys().cloned().collect();

    #[derive(PartialEq, Clone, Copy)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color: BTreeMap<String, Color> = ids.iter().map(|id| (id.clone(), Color::White)).collect();
    let mut depth_cache: BTreeMap<String, usize> = BTreeMap::new();

    for start in &ids {
        if color[start] != Color::White {
            continue;
        }
        let mut path: Vec<String> = Vec::new();
        let mut cur = start.clone();
        loop {
            match color[&cur] {
                Color::Black => break,
                Color::Gray => {
                    let pos = path.iter().position(|n| *n == cur).unwrap();
                    let mut cycle = path[pos..].to_vec();
                    cycle.push(cur);
                    return Err(GraphError::ParentCycleDetected(cycle));
                }
                Color::White => {
                    color.insert(cur.clone(), Color::Gray);
                    path.push(cur.clone());
                    match &nodes[&cur].parent {
                        Some(parent) => {
                            cur = parent.clone();
                        }
                        None => break,
                    }
                }
            }
        }

        // Unwind `path`, computing depth from the root outward.
        let mut depth = match path.last() {
            Some(last) => {
                // `last`'s parent is either terminal (black/none) or we broke
                // out on hitting a black node's cached depth.
                match &nodes[last].parent {
                    Some(parent) if color[parent] == Color::Black => depth_cache[parent] + 1,
                    Some(_) => 0, // unreachable: would have errored above
                    None => 0,
                }
            }
            None => 0,
        };
        for id in path.iter().rev() {
            nodes.get_mut(id).unwrap().depth = depth;
            depth_cache.insert(id.clone(), depth);
            color.insert(id.clone(), Color::Black);
            depth += 1;
        }
    }

    Ok(())
}

/// Every `open` node whose dependencies are all `closed`, excluding the
/// root, in ascending id order.
pub fn get_next_available(graph: &TaskGraph) -> Vec<TaskSummary> {
    let mut out = Vec::new();
    for (id, node) in graph.nodes.iter() {
        if *id == graph.root {
            continue;
        }
        if node.task.status != TaskStatus::Open {
            continue;
        }
        let ready = node
            .dependencies
            .iter()
            .all(|dep| graph.nodes.get(dep).map(|n| n.task.status) == Some(TaskStatus::Closed));
        if ready {
            out.push(TaskSummary {
                id: id.clone(),
                title: node.task.title.clone(),
                priority: node.task.priority(),
            });
        }
    }
    out
}

/// Maximum across depths of the count of `open`-status nodes at each
/// depth, clamped by `opts.max_workers` (when > 0) and `2 *
/// opts.cpu_count` (when > 0), and at least 1. Returns 0 only when the
/// graph is empty.
pub fn calculate_concurrency(graph: &TaskGraph, opts: ConcurrencyOpts) -> usize {
    if graph.is_empty() {
        return 0;
    }

    let mut per_depth: BTreeMap<usize, usize> = BTreeMap::new();
    for node in graph.nodes.values() {
        if node.task.status == TaskStatus::Open {
            *per_depth.entry(node.depth).or_insert(0) += 1;
        }
    }

    let mut estimate = per_depth.values().copied().max().unwrap_or(0).max(1);

    if opts.max_workers > 0 {
        estimate = estimate.min(opts.max_workers);
    }
    if opts.cpu_count > 0 {
        estimate = estimate.min(opts.cpu_count * 2);
    }

    estimate.max(1)
}

/// Mutate the in-memory node's status. Unknown ids are ignored.
pub fn update_task_status(graph: &mut TaskGraph, id: &str, status: TaskStatus) {
    if let Some(node) = graph.nodes.get_mut(id) {
        node.task.status = status;
    }
}

/// `true` iff every node in the graph is terminal.
pub fn is_complete(graph: &TaskGraph) -> bool {
    graph.nodes.values().all(|n| n.task.status.is_terminal())
}
