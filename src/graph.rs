//! Named tasks with prerequisites, executed in dependency order.
//!
//! A [`TaskGraph`] is run with a sequence of [`Step`]s. Steps execute one
//! after another; the tasks inside a [`Step::Parallel`] start together. Before
//! a task starts, all of its prerequisites (transitively) must have finished.
//! Within a single [`TaskGraph::run`] every task executes at most once, so a
//! prerequisite shared by several tasks is not repeated.
//!
//! Scheduling follows the usual dependency-count approach:
//! 1. The prerequisite closure of the step is collected from the graph.
//! 2. Each task in the closure counts how many of its prerequisites are
//!    still pending.
//! 3. Tasks with a zero count are spawned onto a [`JoinSet`].
//! 4. Whenever a task completes, the counts of its dependents are
//!    decremented and newly unblocked tasks are spawned.
//!
//! When a task fails nothing new is spawned, but tasks already in flight are
//! allowed to finish before the failure is reported.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use tokio::task::{Id, JoinSet};
use tracing::Instrument;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::TaskError;
use crate::utils::{fmt_duration, task_style};

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct Task {
    prerequisites: Vec<String>,
    action: TaskFn,
}

/// One element of a run sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    One(String),
    Parallel(Vec<String>),
}

impl Step {
    fn names(&self) -> &[String] {
        match self {
            Step::One(name) => std::slice::from_ref(name),
            Step::Parallel(names) => names,
        }
    }
}

impl From<&str> for Step {
    fn from(name: &str) -> Self {
        Step::One(name.to_string())
    }
}

impl From<String> for Step {
    fn from(name: String) -> Self {
        Step::One(name)
    }
}

impl<const N: usize> From<[&str; N]> for Step {
    fn from(names: [&str; N]) -> Self {
        Step::Parallel(names.iter().map(|name| name.to_string()).collect())
    }
}

impl From<Vec<&str>> for Step {
    fn from(names: Vec<&str>) -> Self {
        Step::Parallel(names.into_iter().map(String::from).collect())
    }
}

#[derive(Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. Registering the same name again replaces the task.
    /// Prerequisites may name tasks that are registered later; they are
    /// resolved when the graph runs.
    pub fn register<F, Fut>(&mut self, name: &str, prerequisites: &[&str], action: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: TaskFn = Arc::new(move || Box::pin(action()) as TaskFuture);

        self.tasks.insert(
            name.to_string(),
            Task {
                prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
                action,
            },
        );

        self
    }

    /// Run `sequence` step by step.
    ///
    /// Every name referenced by the sequence, and every prerequisite reachable
    /// from it, is resolved before anything starts, so a missing task never
    /// leaves the pipeline half executed.
    pub async fn run<I, S>(&self, sequence: I) -> Result<(), TaskError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Step>,
    {
        let steps: Vec<Step> = sequence.into_iter().map(Into::into).collect();
        let (graph, indices) = self.resolve(&steps)?;

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(TaskError::Cycle(graph[cycle.node_id()].clone()));
        }

        let mut done = HashSet::new();

        for step in &steps {
            let targets: Vec<NodeIndex> = step.names().iter().map(|name| indices[name]).collect();
            self.run_step(&graph, &targets, &mut done).await?;
        }

        Ok(())
    }

    /// Build the prerequisite graph for everything reachable from `steps`.
    /// Edges point from a prerequisite to the task that needs it.
    fn resolve(
        &self,
        steps: &[Step],
    ) -> Result<(Graph<String, ()>, HashMap<String, NodeIndex>), TaskError> {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();
        let mut pending: Vec<String> = steps
            .iter()
            .flat_map(|step| step.names().iter().cloned())
            .collect();

        while let Some(name) = pending.pop() {
            if indices.contains_key(&name) {
                continue;
            }

            let task = self
                .tasks
                .get(&name)
                .ok_or_else(|| TaskError::NotFound(name.clone()))?;

            indices.insert(name.clone(), graph.add_node(name));
            pending.extend(task.prerequisites.iter().cloned());
        }

        for (name, &index) in &indices {
            for prerequisite in &self.tasks[name].prerequisites {
                graph.add_edge(indices[prerequisite], index, ());
            }
        }

        Ok((graph, indices))
    }

    async fn run_step(
        &self,
        graph: &Graph<String, ()>,
        targets: &[NodeIndex],
        done: &mut HashSet<NodeIndex>,
    ) -> Result<(), TaskError> {
        // Everything the targets need that has not run yet.
        let mut nodes_to_run = HashSet::new();
        let mut stack: Vec<NodeIndex> = targets.to_vec();
        while let Some(index) = stack.pop() {
            if done.contains(&index) || !nodes_to_run.insert(index) {
                continue;
            }
            stack.extend(graph.neighbors_directed(index, Direction::Incoming));
        }

        let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
            .iter()
            .map(|&index| {
                let count = graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count();
                (index, count)
            })
            .collect();

        let mut running = JoinSet::new();
        let mut spawned: HashMap<Id, NodeIndex> = HashMap::new();
        let mut failure: Option<(NodeIndex, anyhow::Error)> = None;

        for (&index, &count) in &dependency_counts {
            if count == 0 {
                self.spawn(&mut running, &mut spawned, graph, index);
            }
        }

        while let Some(joined) = running.join_next_with_id().await {
            let (index, result, elapsed) = match joined {
                Ok((_, ok)) => ok,
                Err(e) => {
                    let Some(&index) = spawned.get(&e.id()) else {
                        continue;
                    };
                    tracing::error!(task = %graph[index], "task panicked");
                    if failure.is_none() {
                        failure = Some((index, anyhow::anyhow!("task panicked: {e}")));
                    }
                    continue;
                }
            };

            let name = &graph[index];

            if let Err(err) = result {
                tracing::error!(task = %name, elapsed = %fmt_duration(elapsed), "task errored");
                if failure.is_none() {
                    failure = Some((index, err));
                }
                continue;
            }

            tracing::info!(task = %name, elapsed = %fmt_duration(elapsed), "finished");
            done.insert(index);

            if failure.is_some() {
                continue;
            }

            for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(count) = dependency_counts.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.spawn(&mut running, &mut spawned, graph, dependent);
                    }
                }
            }
        }

        match failure {
            Some((index, err)) => Err(TaskError::Failed(graph[index].clone(), err)),
            None => Ok(()),
        }
    }

    fn spawn(
        &self,
        running: &mut JoinSet<(NodeIndex, anyhow::Result<()>, Duration)>,
        spawned: &mut HashMap<Id, NodeIndex>,
        graph: &Graph<String, ()>,
        index: NodeIndex,
    ) {
        let name = &graph[index];
        let future = (self.tasks[name].action)();

        let span = tracing::info_span!("task", name = %name);
        span.pb_set_style(&task_style());
        span.pb_set_message(&format!("Running {name}"));

        tracing::info!(task = %name, "starting");

        let handle = running.spawn(
            async move {
                let start = Instant::now();
                let result = future.await;
                (index, result, start.elapsed())
            }
            .instrument(span),
        );
        spawned.insert(handle.id(), index);
    }
}
