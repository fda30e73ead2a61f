//! Task dependency graph.
//!
//! The graph keeps a forward adjacency map (`task -> dependencies`), the
//! derived reverse map (`dependency -> dependents`) and per-node metadata.
//! Dependencies may name tasks that are not tracked; such external
//! dependencies never take part in cycles or in-degree counts and are
//! treated as satisfied unless an existence check says otherwise.

use crate::core::task::{Leverage, Priority, Task, TaskId, TaskStatus};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Metadata stored per tracked node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeMeta {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub leverage: Leverage,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub context_gathered: bool,
}

impl From<&Task> for NodeMeta {
    fn from(task: &Task) -> Self {
        Self {
            priority: task.priority,
            leverage: task.leverage,
            status: task.status,
            context_gathered: task.context_gathered,
        }
    }
}

/// Result of the depth-first cycle search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub has_cycle: bool,
    /// Nodes from the back-edge target round to itself, e.g. `[a, b, c, a]`.
    pub cycle: Vec<TaskId>,
}

/// Result of Kahn's topological sort.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopoResult {
    pub sorted: Vec<TaskId>,
    pub has_cycle: bool,
    /// Every tracked node that could not be placed in `sorted`.
    pub cycle_nodes: Vec<TaskId>,
}

/// Outcome of a dependency check for one task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyCheck {
    pub satisfied: bool,
    pub blocking: Vec<TaskId>,
}

/// Summary counts over the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphStats {
    pub total_tasks: usize,
    pub total_edges: usize,
    pub with_dependencies: usize,
    pub without_dependencies: usize,
    pub average_dependencies: f64,
}

/// Persisted form of the graph. Reverse edges are rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub adjacency: BTreeMap<TaskId, Vec<TaskId>>,
    #[serde(default)]
    pub metadata: BTreeMap<TaskId, NodeMeta>,
}

/// The task dependency graph.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    adjacency: BTreeMap<TaskId, Vec<TaskId>>,
    reverse: BTreeMap<TaskId, Vec<TaskId>>,
    metadata: BTreeMap<TaskId, NodeMeta>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a node.
    ///
    /// The id and every dependency are canonicalized. Re-adding an id
    /// replaces its metadata and dependency list, and reverse edges for
    /// dependencies dropped by the update are removed.
    pub fn add_task<I, S>(&mut self, id: &str, deps: I, meta: NodeMeta) -> TaskId
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = TaskId::canonical(id);
        let mut new_deps: Vec<TaskId> = Vec::new();
        for raw in deps {
            let dep = TaskId::canonical(raw.as_ref());
            if dep.is_empty() || new_deps.contains(&dep) {
                continue;
            }
            new_deps.push(dep);
        }

        if let Some(old_deps) = self.adjacency.get(&id) {
            let stale: Vec<TaskId> = old_deps
                .iter()
                .filter(|d| !new_deps.contains(d))
                .cloned()
                .collect();
            for dep in stale {
                self.unlink_reverse(&dep, &id);
            }
        }

        for dep in &new_deps {
            let dependents = self.reverse.entry(dep.clone()).or_default();
            if !dependents.contains(&id) {
                dependents.push(id.clone());
            }
        }

        self.adjacency.insert(id.clone(), new_deps);
        self.metadata.insert(id.clone(), meta);
        id
    }

    /// Insert or overwrite a node from a task record.
    pub fn add(&mut self, task: &Task) -> TaskId {
        self.add_task(
            task.id.as_str(),
            task.depends_on.iter().map(TaskId::as_str),
            NodeMeta::from(task),
        )
    }

    /// Remove a node. Tasks depending on it now see it as external.
    pub fn remove_task(&mut self, id: &TaskId) -> bool {
        let Some(deps) = self.adjacency.remove(id) else {
            return false;
        };
        for dep in deps {
            self.unlink_reverse(&dep, id);
        }
        self.metadata.remove(id);
        true
    }

    fn unlink_reverse(&mut self, dep: &TaskId, dependent: &TaskId) {
        if let Some(list) = self.reverse.get_mut(dep) {
            list.retain(|d| d != dependent);
            if list.is_empty() {
                self.reverse.remove(dep);
            }
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.adjacency.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn metadata(&self, id: &TaskId) -> Option<&NodeMeta> {
        self.metadata.get(id)
    }

    /// Update the graph-local status copy of a tracked node.
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> bool {
        match self.metadata.get_mut(id) {
            Some(meta) => {
                meta.status = status;
                true
            }
            None => false,
        }
    }

    /// Declared dependencies of a node (tracked or not).
    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes that declare `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> &[TaskId] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.adjacency.keys()
    }

    // ========== Analysis ==========

    /// Depth-first search for the first cycle among tracked nodes.
    pub fn detect_circular_dependencies(&self) -> CycleReport {
        let mut visited: HashSet<&TaskId> = HashSet::new();

        for root in self.adjacency.keys() {
            if visited.contains(root) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(root, &mut visited) {
                return CycleReport {
                    has_cycle: true,
                    cycle,
                };
            }
        }
        CycleReport::default()
    }

    /// Iterative DFS from `root`. Each stack frame holds a node and the
    /// index of its next dependency; the stack is also the current path.
    fn dfs_cycle<'a>(
        &'a self,
        root: &'a TaskId,
        visited: &mut HashSet<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        let mut stack: Vec<(&'a TaskId, usize)> = vec![(root, 0)];
        let mut on_stack: HashSet<&'a TaskId> = HashSet::from([root]);
        visited.insert(root);

        while let Some(&(node, next)) = stack.last() {
            let Some(dep) = self.dependencies(node).get(next) else {
                on_stack.remove(node);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            // External dependencies cannot close a cycle.
            let Some((tracked, _)) = self.adjacency.get_key_value(dep) else {
                continue;
            };
            if on_stack.contains(tracked) {
                let start = stack.iter().position(|(n, _)| *n == tracked).unwrap_or(0);
                let mut cycle: Vec<TaskId> =
                    stack[start..].iter().map(|(n, _)| (*n).clone()).collect();
                cycle.push(tracked.clone());
                return Some(cycle);
            }
            if visited.insert(tracked) {
                on_stack.insert(tracked);
                stack.push((tracked, 0));
            }
        }
        None
    }

    /// Kahn's algorithm over tracked nodes; external dependencies add no
    /// in-degree.
    pub fn topological_sort(&self) -> TopoResult {
        let mut in_degree: HashMap<&TaskId, usize> = self
            .adjacency
            .iter()
            .map(|(id, deps)| (id, deps.iter().filter(|d| self.contains(d)).count()))
            .collect();

        let mut ready: VecDeque<&TaskId> = self
            .adjacency
            .keys()
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();

        let mut sorted = Vec::with_capacity(self.adjacency.len());
        while let Some(node) = ready.pop_front() {
            sorted.push(node.clone());
            for dependent in self.dependents(node) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        let placed: HashSet<&TaskId> = sorted.iter().collect();
        let cycle_nodes: Vec<TaskId> = self
            .adjacency
            .keys()
            .filter(|id| !placed.contains(id))
            .cloned()
            .collect();

        TopoResult {
            has_cycle: sorted.len() < self.adjacency.len(),
            sorted,
            cycle_nodes,
        }
    }

    /// Every group of mutually dependent nodes (strongly connected
    /// components with more than one node, and self-loops).
    pub fn cycle_groups(&self) -> Vec<Vec<TaskId>> {
        let mut graph: DiGraph<&TaskId, ()> = DiGraph::new();
        let mut index: HashMap<&TaskId, NodeIndex> = HashMap::new();
        for id in self.adjacency.keys() {
            index.insert(id, graph.add_node(id));
        }
        for (id, deps) in &self.adjacency {
            for dep in deps {
                if let (Some(&from), Some(&to)) = (index.get(dep), index.get(id)) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut groups: Vec<Vec<TaskId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|&n| graph.find_edge(n, n).is_some())
            })
            .map(|scc| {
                let mut ids: Vec<TaskId> = scc.iter().map(|&n| graph[n].clone()).collect();
                ids.sort();
                ids
            })
            .collect();
        groups.sort();
        groups
    }

    /// Check whether every dependency of `id` is satisfied.
    ///
    /// A tracked dependency blocks while its stored status is not completed
    /// and it is not in `completed`. An untracked dependency blocks only when
    /// an existence checker is supplied and reports it missing.
    pub fn check_dependencies_satisfied(
        &self,
        id: &TaskId,
        completed: &HashSet<TaskId>,
        exists: Option<&dyn Fn(&TaskId) -> bool>,
    ) -> DependencyCheck {
        let blocking: Vec<TaskId> = self
            .dependencies(id)
            .iter()
            .filter(|dep| match self.metadata.get(*dep) {
                Some(meta) => meta.status != TaskStatus::Completed && !completed.contains(*dep),
                None => match exists {
                    Some(check) => !check(dep),
                    None => false,
                },
            })
            .cloned()
            .collect();

        DependencyCheck {
            satisfied: blocking.is_empty(),
            blocking,
        }
    }

    /// Tracked, not yet completed tasks whose dependencies are satisfied.
    pub fn get_ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.adjacency
            .keys()
            .filter(|id| {
                let done = completed.contains(*id)
                    || self
                        .metadata
                        .get(*id)
                        .map(|m| m.status == TaskStatus::Completed)
                        .unwrap_or(false);
                !done && self.check_dependencies_satisfied(id, completed, None).satisfied
            })
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let total_tasks = self.adjacency.len();
        let total_edges: usize = self.adjacency.values().map(Vec::len).sum();
        let with_dependencies = self.adjacency.values().filter(|d| !d.is_empty()).count();
        GraphStats {
            total_tasks,
            total_edges,
            with_dependencies,
            without_dependencies: total_tasks - with_dependencies,
            average_dependencies: if total_tasks == 0 {
                0.0
            } else {
                total_edges as f64 / total_tasks as f64
            },
        }
    }

    // ========== Persistence ==========

    pub fn serialize(&self) -> GraphSnapshot {
        GraphSnapshot {
            adjacency: self.adjacency.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn deserialize(snapshot: &GraphSnapshot) -> Self {
        let mut graph = Self::new();
        for (id, deps) in &snapshot.adjacency {
            let meta = snapshot.metadata.get(id).cloned().unwrap_or_default();
            graph.add_task(id.as_str(), deps.iter().map(TaskId::as_str), meta);
        }
        graph
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("DependencyGraph")
            .field("tasks", &stats.total_tasks)
            .field("edges", &stats.total_edges)
            .finish()
    }
}
