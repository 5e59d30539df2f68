use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::NodeIndex;

use crate::error::ConfigError;
use crate::task::{OutputScope, Task, TaskContext, TaskResult};

/// The set of named tasks and the dependency edges between them.
///
/// Edges point from a dependency to its dependent. Node indices follow
/// registration order, which is what breaks ties when planning, so two
/// registries built the same way always plan the same order.
///
/// Dependencies may name tasks which are registered later. Names which are
/// never registered are reported by [`TaskRegistry::validate`] and by any
/// run that reaches them.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    pub(crate) graph: Graph<Task, ()>,
    names: HashMap<String, NodeIndex>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a task definition.
    ///
    /// ```rust
    /// use kagari::{OutputScope, TaskRegistry};
    ///
    /// let mut registry = TaskRegistry::new();
    /// registry
    ///     .task("compile-styles")
    ///     .depends_on(["clean"])
    ///     .output(OutputScope::tree("css"))
    ///     .run(|_| Ok(()))
    ///     .unwrap();
    /// ```
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            registry: self,
            name: name.into(),
            dependencies: Vec::new(),
            scopes: Vec::new(),
        }
    }

    /// Registers a task without an output claim.
    pub fn register<I, S, F>(&mut self, name: &str, dependencies: I, action: F) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&TaskContext<'_>) -> TaskResult + Send + Sync + 'static,
    {
        self.task(name).depends_on(dependencies).run(action)
    }

    fn insert(&mut self, task: Task) -> Result<(), ConfigError> {
        if self.names.contains_key(&task.name) {
            return Err(ConfigError::DuplicateTask(task.name));
        }

        let name = task.name.clone();
        let dependencies = task.dependencies.clone();
        let index = self.graph.add_node(task);
        self.names.insert(name.clone(), index);

        for dependency in &dependencies {
            if let Some(&dep) = self.names.get(dependency) {
                self.graph.update_edge(dep, index, ());
            }
        }

        // Earlier tasks which referred to this one ahead of time.
        let waiting: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&other| other != index)
            .filter(|&other| self.graph[other].dependencies.contains(&name))
            .collect();

        for other in waiting {
            self.graph.update_edge(index, other, ());
        }

        Ok(())
    }

    /// Looks a task up by name.
    pub fn resolve(&self, name: &str) -> Result<&Task, ConfigError> {
        self.index(name)
            .map(|index| &self.graph[index])
            .ok_or_else(|| ConfigError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Task names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_indices().map(|i| self.graph[i].name.as_str())
    }

    pub(crate) fn index(&self, name: &str) -> Option<NodeIndex> {
        self.names.get(name).copied()
    }

    pub(crate) fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    pub(crate) fn dependencies_of(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    /// Checks the whole graph: dependencies exist, no cycles, and output
    /// claims of tasks which may run concurrently do not overlap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for index in self.graph.node_indices() {
            self.check_dependencies(index)?;
        }

        let all = self.graph.node_indices().collect();
        self.check_acyclic(&all)?;
        self.check_scopes()?;

        Ok(())
    }

    /// Deterministic execution order for `names` and everything they
    /// transitively depend on.
    pub fn plan<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&str>, ConfigError> {
        let roots = names
            .iter()
            .map(|name| {
                self.index(name.as_ref())
                    .ok_or_else(|| ConfigError::UnknownTask(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let closure = self.closure(&roots)?;
        let order = self.toposort(&closure)?;

        Ok(order.into_iter().map(|i| self.graph[i].name.as_str()).collect())
    }

    /// Every node reachable from `roots` by following dependencies.
    pub(crate) fn closure(&self, roots: &[NodeIndex]) -> Result<HashSet<NodeIndex>, ConfigError> {
        let mut seen = HashSet::new();
        let mut stack = roots.to_vec();

        while let Some(index) = stack.pop() {
            if !seen.insert(index) {
                continue;
            }
            self.check_dependencies(index)?;
            stack.extend(self.dependencies_of(index));
        }

        Ok(seen)
    }

    /// Topological order of `nodes` with ties broken by registration order.
    /// Fails if the nodes contain a cycle.
    pub(crate) fn toposort(&self, nodes: &HashSet<NodeIndex>) -> Result<Vec<NodeIndex>, ConfigError> {
        self.check_acyclic(nodes)?;

        let mut counts: HashMap<NodeIndex, usize> = nodes
            .iter()
            .map(|&i| (i, self.dependencies_of(i).filter(|d| nodes.contains(d)).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for dependent in self.dependents(index) {
                if let Some(count) = counts.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        Ok(order)
    }

    pub(crate) fn check_dependencies(&self, index: NodeIndex) -> Result<(), ConfigError> {
        let task = &self.graph[index];
        match task.dependencies.iter().find(|d| !self.names.contains_key(*d)) {
            Some(missing) => Err(ConfigError::UnknownDependency {
                task: task.name.clone(),
                dependency: missing.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_acyclic(&self, nodes: &HashSet<NodeIndex>) -> Result<(), ConfigError> {
        // A cycle touching the set lies entirely within it, since every member
        // of a cycle is a dependency of every other member.
        let mut components = tarjan_scc(&self.graph);
        for component in &mut components {
            component.sort();
        }
        components.sort();

        for component in components {
            if !nodes.contains(&component[0]) {
                continue;
            }

            let cyclic = component.len() > 1 || self.graph.contains_edge(component[0], component[0]);
            if cyclic {
                return Err(ConfigError::CyclicDependency {
                    cycle: self.trace_cycle(&component),
                });
            }
        }

        Ok(())
    }

    /// Walks a strongly connected component along dependency edges,
    /// always taking the earliest registered dependency, until a task
    /// repeats. The result starts and ends with the same task.
    fn trace_cycle(&self, component: &[NodeIndex]) -> Vec<String> {
        let members: HashSet<_> = component.iter().copied().collect();
        let mut path: Vec<NodeIndex> = Vec::new();
        let mut current = component[0];

        loop {
            if let Some(pos) = path.iter().position(|&n| n == current) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&n| self.graph[n].name.clone()).collect();
                cycle.push(self.graph[current].name.clone());
                return cycle;
            }

            path.push(current);

            match self.dependencies_of(current).filter(|d| members.contains(d)).min() {
                Some(next) => current = next,
                None => return path.iter().map(|&n| self.graph[n].name.clone()).collect(),
            }
        }
    }

    fn check_scopes(&self) -> Result<(), ConfigError> {
        let scoped: Vec<_> = self
            .graph
            .node_indices()
            .flat_map(|i| self.graph[i].scopes.iter().map(move |scope| (i, scope)))
            .collect();

        for (n, &(a, scope_a)) in scoped.iter().enumerate() {
            for &(b, scope_b) in &scoped[n + 1..] {
                if a == b || !scope_a.overlaps(scope_b) {
                    continue;
                }

                if !self.ordered(a, b) {
                    return Err(ConfigError::ScopeConflict {
                        first: self.graph[a].name.clone(),
                        first_scope: scope_a.clone(),
                        second: self.graph[b].name.clone(),
                        second_scope: scope_b.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn ordered(&self, a: NodeIndex, b: NodeIndex) -> bool {
        has_path_connecting(&self.graph, a, b, None) || has_path_connecting(&self.graph, b, a, None)
    }

    /// Subtrees claimed as [`OutputScope::Tree`] by tasks which may run at the
    /// same time as `index`.
    pub(crate) fn reserved_for(&self, index: NodeIndex) -> Vec<Utf8PathBuf> {
        self.graph
            .node_indices()
            .filter(|&other| other != index && !self.ordered(index, other))
            .flat_map(|other| &self.graph[other].scopes)
            .filter_map(|scope| match scope {
                OutputScope::Tree(path) => Some(path.clone()),
                OutputScope::Files(_) => None,
            })
            .collect()
    }
}

/// Renders the graph as a Mermaid diagram.
impl std::fmt::Display for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");
            if task.scopes.is_empty() {
                writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
            } else {
                let scopes: Vec<_> = task.scopes.iter().map(ToString::to_string).collect();
                writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, scopes.join(", "))?;
            }
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

/// Builder returned by [`TaskRegistry::task`].
pub struct TaskDef<'a> {
    registry: &'a mut TaskRegistry,
    name: String,
    dependencies: Vec<String>,
    scopes: Vec<OutputScope>,
}

impl TaskDef<'_> {
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Claims part of the output directory for this task. May be called
    /// more than once.
    pub fn output(mut self, scope: OutputScope) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn run<F>(self, action: F) -> Result<(), ConfigError>
    where
        F: Fn(&TaskContext<'_>) -> TaskResult + Send + Sync + 'static,
    {
        self.registry.insert(Task {
            name: self.name,
            dependencies: self.dependencies,
            scopes: self.scopes,
            action: Arc::new(action),
        })
    }
}
