//! Task registry and dependency resolution
//!
//! `resolve` walks dependencies depth-first with a visiting set, which yields
//! a per-target plan and names the exact cycle when there is one. `validate`
//! checks the whole registry at once through a petgraph DAG so a broken build
//! definition is caught before any task body runs.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{Config, RunContext};
use crate::error::{AssetflowError, Result};
use crate::executor::{Executor, RunReport};
use crate::task::Task;

/// Registry of named tasks
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
    /// Registration order, for stable listings
    order: Vec<String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from configuration
    pub fn from_config(config: &Config, ctx: &RunContext) -> Result<Self> {
        let mut graph = Self::new();
        for name in config.task_names() {
            graph.register(config.build_task(name, ctx)?)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task; a second registration under the same name is rejected
    /// and the first one stays active.
    pub fn register(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(task.name()) {
            return Err(AssetflowError::DuplicateTask {
                name: task.name().to_string(),
            });
        }

        tracing::trace!(task = task.name(), mode = %task.mode(), "registered");
        self.order.push(task.name().to_string());
        self.tasks.insert(task.name().to_string(), task);
        Ok(())
    }

    /// Linear execution order for `name`: every dependency precedes its
    /// dependents and each task appears once.
    pub fn resolve(&self, name: &str) -> Result<Vec<String>> {
        let mut visiting = Vec::new();
        let mut done = HashSet::new();
        let mut order = Vec::new();
        self.visit(name, None, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        requested_by: Option<&str>,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }

        if let Some(pos) = visiting.iter().position(|n| n == name) {
            let mut cycle = visiting[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(AssetflowError::CyclicDependency {
                cycle: cycle.join(" -> "),
            });
        }

        let task = self.tasks.get(name).ok_or_else(|| match requested_by {
            Some(parent) => AssetflowError::DependencyUnresolved {
                task: parent.to_string(),
                dependency: name.to_string(),
            },
            None => AssetflowError::TaskNotFound {
                name: name.to_string(),
                available: self.order.clone(),
            },
        })?;

        visiting.push(name.to_string());
        for dep in task.dependencies() {
            self.visit(dep, Some(name), visiting, done, order)?;
        }
        visiting.pop();

        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    /// Check every registered task: dependencies exist and nothing is cyclic
    pub fn validate(&self) -> Result<()> {
        for name in &self.order {
            for dep in self.tasks[name].dependencies() {
                if !self.tasks.contains_key(dep) {
                    return Err(AssetflowError::DependencyUnresolved {
                        task: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let (graph, _) = self.dag();
        if is_cyclic_directed(&graph) {
            for name in &self.order {
                self.resolve(name)?;
            }
        }
        Ok(())
    }

    /// Edges run from dependency to dependent
    fn dag(&self) -> (DiGraph<&str, ()>, HashMap<&str, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for name in &self.order {
            index.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for name in &self.order {
            for dep in self.tasks[name].dependencies() {
                if let Some(&from) = index.get(dep.as_str()) {
                    graph.add_edge(from, index[name.as_str()], ());
                }
            }
        }

        (graph, index)
    }

    /// Every task, dependencies first
    pub fn all_tasks_ordered(&self) -> Result<Vec<&Task>> {
        let (graph, _) = self.dag();
        let sorted = toposort(&graph, None).map_err(|cycle| AssetflowError::CyclicDependency {
            cycle: graph[cycle.node_id()].to_string(),
        })?;

        Ok(sorted
            .into_iter()
            .map(|idx| &self.tasks[graph[idx]])
            .collect())
    }

    /// Run `name` and its prerequisites
    pub async fn run(self: &Arc<Self>, name: &str, ctx: Arc<RunContext>) -> Result<RunReport> {
        Executor::new(Arc::clone(self), ctx).run(name).await
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn get_task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Task names in registration order
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Direct dependencies of a task
    pub fn dependencies(&self, name: &str) -> Option<&[String]> {
        self.tasks.get(name).map(Task::dependencies)
    }

    /// Tasks that list `name` as a direct dependency
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| self.tasks[n.as_str()].dependencies().iter().any(|d| d == name))
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(tasks: &[(&str, &[&str])]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for (name, deps) in tasks {
            graph
                .register(Task::one_shot(*name, |_| async { Ok(()) }).depends_on(deps.iter().copied()))
                .unwrap();
        }
        graph
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_resolve_dependencies_first() {
        let graph = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let order = graph.resolve("d").unwrap();

        assert_eq!(order.len(), 4);
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "a") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "d"));
        assert!(position(&order, "c") < position(&order, "d"));
    }

    #[test]
    fn test_shared_dependency_appears_once() {
        let graph = graph(&[("a", &["b"]), ("b", &[]), ("task", &["a", "b"])]);
        assert_eq!(graph.resolve("task").unwrap(), vec!["b", "a", "task"]);
    }

    #[test]
    fn test_resolve_only_includes_ancestors() {
        let graph = graph(&[("sass", &[]), ("lint", &[]), ("preprocess", &["sass"])]);
        assert_eq!(graph.resolve("preprocess").unwrap(), vec!["sass", "preprocess"]);
    }

    #[test]
    fn test_cycle_is_named() {
        let graph = graph(&[("a", &["b"]), ("b", &["a"])]);
        match graph.resolve("a") {
            Err(AssetflowError::CyclicDependency { cycle }) => assert_eq!(cycle, "a -> b -> a"),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(matches!(graph.validate(), Err(AssetflowError::CyclicDependency { .. })));
    }

    #[test]
    fn test_self_cycle() {
        let graph = graph(&[("a", &["a"])]);
        assert!(matches!(graph.resolve("a"), Err(AssetflowError::CyclicDependency { .. })));
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut graph = graph(&[("sass", &[])]);
        let err = graph
            .register(Task::group("sass", ["lint"]))
            .unwrap_err();

        assert!(matches!(err, AssetflowError::DuplicateTask { ref name } if name == "sass"));
        assert!(graph.get_task("sass").unwrap().dependencies().is_empty());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_unresolved_dependency() {
        let graph = graph(&[("default", &["bower"])]);
        match graph.resolve("default") {
            Err(AssetflowError::DependencyUnresolved { task, dependency }) => {
                assert_eq!(task, "default");
                assert_eq!(dependency, "bower");
            }
            other => panic!("expected unresolved dependency, got {other:?}"),
        }
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_unknown_target() {
        let graph = graph(&[("sass", &[])]);
        assert!(matches!(graph.resolve("nope"), Err(AssetflowError::TaskNotFound { .. })));
    }

    #[test]
    fn test_all_tasks_ordered_and_dependents() {
        let graph = graph(&[("tests", &["unit", "lint"]), ("unit", &[]), ("lint", &[])]);
        let ordered: Vec<&str> = graph.all_tasks_ordered().unwrap().iter().map(|t| t.name()).collect();
        assert_eq!(ordered.last(), Some(&"tests"));
        assert_eq!(graph.dependents("lint"), vec!["tests"]);
        assert_eq!(graph.dependencies("tests").unwrap(), ["unit", "lint"]);
    }
}
