use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use regex::Regex;

use crate::Environment;
use crate::core::Args;
use crate::data::Data;
use crate::engine::runner::{Diagnostics, run_tasks_parallel};
use crate::engine::{Document, State, Task, TaskId, TaskVariant};
use crate::error::{BatchError, GraphError, HistoryError, TaskError};
use crate::graph::{Ast, DirectoryDefaults, qualify};
use crate::history::{RunHistory, RunRecord};

/// Shared flag which stops a running batch from launching new tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Documents a pattern gained or lost since the previous batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// One run of the engine.
///
/// A batch is built from an [`Ast`], turning every node into a [`Task`],
/// and then run once. Tasks only exist for the duration of the batch; what
/// survives is the run history and the content store.
pub struct Batch<'a> {
    pub(crate) id: i64,
    previous_id: Option<i64>,
    pub(crate) env: &'a Environment,
    pub(crate) history: &'a RunHistory,
    pub(crate) tasks: Vec<Task>,
    lookup: HashMap<String, TaskId>,
    tree: Vec<TaskId>,
    defaults: DirectoryDefaults,
    pattern_changes: BTreeMap<String, PatternChanges>,
    /// Patterns whose documents were already created.
    expanded: HashSet<TaskId>,
    pub(crate) cancel: CancelToken,
    ran: bool,
}

impl<'a> Batch<'a> {
    /// Creates one task per node. Nodes are registered after their inputs.
    pub fn new(
        env: &'a Environment,
        history: &'a RunHistory,
        ast: &Ast,
    ) -> Result<Self, BatchError> {
        let id = history.next_batch_id()?;
        let previous_id = history.previous_batch_id(id)?;

        let mut batch = Self {
            id,
            previous_id,
            env,
            history,
            tasks: vec![],
            lookup: HashMap::new(),
            tree: vec![],
            defaults: ast.defaults().clone(),
            pattern_changes: BTreeMap::new(),
            expanded: HashSet::new(),
            cancel: CancelToken::default(),
            ran: false,
        };

        for qualified in ast.post_order() {
            let node = ast
                .node(qualified)
                .ok_or_else(|| GraphError::NodeNotFound(qualified.to_string()))?;
            batch.register(qualified, node.args.clone())?;
        }

        for index in 0..batch.tasks.len() {
            let children = ast
                .inputs_for_node(&batch.tasks[index].qualified)
                .into_iter()
                .filter_map(|input| batch.lookup.get(input).copied())
                .collect();
            batch.tasks[index].children = children;
        }

        batch.tree = ast
            .tree()
            .into_iter()
            .filter_map(|root| batch.lookup.get(root).copied())
            .collect();

        tracing::info!("batch {} created with {} tasks", id, batch.tasks.len());
        Ok(batch)
    }

    fn register(&mut self, qualified: &str, args: Args) -> Result<TaskId, GraphError> {
        let variant = qualified
            .split_once(':')
            .and_then(|(prefix, _)| TaskVariant::from_prefix(prefix))
            .ok_or_else(|| GraphError::UnknownVariant {
                id: qualified.to_string(),
                variant: qualified.split(':').next().unwrap_or_default().to_string(),
            })?;

        Ok(self.push_task(qualified.to_string(), variant, args))
    }

    fn push_task(&mut self, qualified: String, variant: TaskVariant, args: Args) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.lookup.insert(qualified.clone(), id);
        self.tasks.push(Task::new(id, qualified, variant, args));
        id
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn previous_batch_id(&self) -> Option<i64> {
        self.previous_id
    }

    /// Top-level tasks, in declaration order.
    pub fn tree(&self) -> Vec<&Task> {
        self.tree.iter().map(|id| &self.tasks[id.0]).collect()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Looks a task up by qualified key, or by key alone.
    pub fn task(&self, key: &str) -> Option<&Task> {
        let id = match self.lookup.get(key) {
            Some(id) => *id,
            None => *self.lookup.get(qualify(key).ok()?.as_str())?,
        };
        Some(&self.tasks[id.0])
    }

    pub fn state(&self, key: &str) -> Option<State> {
        self.task(key).map(Task::state)
    }

    pub fn document(&self, key: &str) -> Option<&Document> {
        self.task(key).and_then(Task::document)
    }

    /// Every populated document of the batch, in registration order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.tasks.iter().filter_map(Task::document)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Changes in pattern expansion compared with the previous batch, by
    /// qualified pattern key.
    pub fn pattern_changes(&self) -> &BTreeMap<String, PatternChanges> {
        &self.pattern_changes
    }

    /// Every task `id` transitively depends on.
    pub fn dependencies(&self, id: TaskId) -> BTreeSet<TaskId> {
        let mut acc = BTreeSet::new();
        self.closure(id, &mut acc);
        acc.remove(&id);
        acc
    }

    /// Run records created by `key` in the previous batch.
    pub fn children_in_previous_batch(&self, key: &str) -> Result<Vec<RunRecord>, HistoryError> {
        let Some(previous) = self.previous_id else {
            return Ok(vec![]);
        };
        let qualified = match self.task(key) {
            Some(task) => task.qualified.clone(),
            None => key.to_string(),
        };
        self.history.children_in_batch(previous, &qualified)
    }

    /// Output of the most recent recorded run of a document.
    pub fn find_data(&self, doc_key: &str) -> Result<Data, HistoryError> {
        self.history
            .find_data_by_doc_key(doc_key, self.env.store.as_ref())
    }

    /// Runs the batch.
    ///
    /// Without a target every task runs. With a target, the tasks whose key
    /// equals it run, or when there are none, the tasks whose key starts
    /// with it. Documents created by patterns can be targeted as well.
    /// Selected tasks bring everything they depend on; all other tasks stay
    /// `new`.
    pub fn run(&mut self, target: Option<&str>) -> Result<Diagnostics, BatchError> {
        if self.ran {
            return Err(BatchError::AlreadyRun(self.id));
        }
        self.ran = true;

        let span = tracing::info_span!("batch", id = self.id);
        let _enter = span.enter();

        self.expand_patterns();

        let mut selected = self.select(target);
        if let Some(target) = target
            && selected.is_empty()
        {
            tracing::warn!("no task matches target '{}'", target);
        }

        self.populate(&mut selected)?;
        self.check_cycles(&selected)?;

        let diagnostics = run_tasks_parallel(self, &selected)?;

        tracing::info!("{}", diagnostics);
        Ok(diagnostics)
    }

    fn select(&self, target: Option<&str>) -> BTreeSet<TaskId> {
        let roots: Vec<TaskId> = match target.filter(|t| !t.is_empty()) {
            None => self.tasks.iter().map(Task::id).collect(),
            Some(target) => {
                let exact: Vec<TaskId> = self
                    .tasks
                    .iter()
                    .filter(|t| t.key() == target || t.qualified == target)
                    .map(Task::id)
                    .collect();

                match exact.is_empty() {
                    false => exact,
                    true => self
                        .tasks
                        .iter()
                        .filter(|t| t.key().starts_with(target))
                        .map(Task::id)
                        .collect(),
                }
            }
        };

        let mut selected = BTreeSet::new();
        for root in roots {
            self.closure(root, &mut selected);
        }
        selected
    }

    fn closure(&self, id: TaskId, acc: &mut BTreeSet<TaskId>) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if acc.insert(id) {
                stack.extend(self.tasks[id.0].children.iter().copied());
            }
        }
    }

    /// Populates the selected tasks. Pattern expansion adds new documents
    /// to the batch and to the selection.
    fn populate(&mut self, selected: &mut BTreeSet<TaskId>) -> Result<(), BatchError> {
        let mut pending = selected.clone();

        while let Some(id) = pending.pop_first() {
            if self.tasks[id.0].state != State::New {
                continue;
            }

            let result = match self.tasks[id.0].variant {
                TaskVariant::Doc => self.populate_doc(id),
                TaskVariant::Bundle => self.tasks[id.0].transition(State::Populated),
                TaskVariant::Pattern => match self.populate_pattern(id) {
                    Ok(linked) => {
                        self.diff_pattern(id)?;
                        for child in linked {
                            let mut closure = BTreeSet::new();
                            self.closure(child, &mut closure);
                            for dep in closure {
                                if selected.insert(dep) {
                                    pending.insert(dep);
                                }
                            }
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };

            if let Err(e) = result {
                let task = &mut self.tasks[id.0];
                tracing::error!("couldn't populate {}: {}", task.qualified, e);
                task.fail(e);
            }
        }

        Ok(())
    }

    fn populate_doc(&mut self, id: TaskId) -> Result<(), TaskError> {
        let task = &self.tasks[id.0];
        let document = Document::populate(task.key(), task.args.clone(), self.env)?;

        let task = &mut self.tasks[id.0];
        task.document = Some(document);
        task.transition(State::Populated)
    }

    /// Creates the documents of every pattern up front, so that they can be
    /// selected by key. A pattern which fails to expand is retried, and
    /// failed, when it is populated.
    fn expand_patterns(&mut self) {
        let patterns: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|task| task.variant == TaskVariant::Pattern && task.state == State::New)
            .map(Task::id)
            .collect();

        for id in patterns {
            if let Err(e) = self.expand_pattern(id) {
                tracing::debug!("deferring expansion of {}: {}", self.tasks[id.0].qualified, e);
            }
        }
    }

    fn populate_pattern(&mut self, id: TaskId) -> Result<Vec<TaskId>, TaskError> {
        if !self.expanded.contains(&id) {
            self.expand_pattern(id)?;
        }

        let task = &mut self.tasks[id.0];
        task.transition(State::Populated)?;
        Ok(task.children.clone())
    }

    /// Creates one document per file matching the pattern and links them to
    /// the pattern.
    fn expand_pattern(&mut self, id: TaskId) -> Result<(), TaskError> {
        let task = &self.tasks[id.0];
        let qualified = task.qualified.clone();
        let key = task.key().to_string();
        let args = task.args.clone();
        let original_children = task.children.clone();

        let mut parts = key.split('|');
        let file_pattern = parts.next().unwrap_or_default();
        let aliases: Vec<&str> = parts.collect();

        let pattern =
            glob::Pattern::new(file_pattern).map_err(|e| TaskError::Pattern(key.clone(), e))?;
        let except = match args.get_str("except") {
            Some(except) if !except.is_empty() => {
                Some(Regex::new(except).map_err(|e| TaskError::Except(key.clone(), e))?)
            }
            _ => None,
        };
        let recurse = args.get_bool("recurse").unwrap_or(true);

        let mut with_registered = original_children.clone();
        for registered in (0..id.0).map(TaskId) {
            if !with_registered.contains(&registered) {
                with_registered.push(registered);
            }
        }

        let mut linked = vec![];

        for path in self.env.tree.walk(recurse)? {
            if !pattern.matches(path.as_str()) {
                continue;
            }

            if let Some(except) = &except
                && except.is_match(path.as_str())
            {
                tracing::debug!(
                    "skipping file '{}' because it matches except '{}'",
                    path,
                    except.as_str()
                );
                continue;
            }

            let doc_key = match aliases.is_empty() {
                true => path.to_string(),
                false => format!("{}|{}", path, aliases.join("|")),
            };
            let child_qualified = format!("{}:{}", TaskVariant::Doc.prefix(), doc_key);

            if let Some(&existing) = self.lookup.get(&child_qualified) {
                if self.dependencies(existing).contains(&id) {
                    tracing::debug!("not linking {} into {}, it depends on it", child_qualified, qualified);
                } else if !linked.contains(&existing) {
                    linked.push(existing);
                }
                continue;
            }

            let doc_args = args.over(&self.defaults.for_path(&path));
            let children = match doc_args.get_bool("depends") {
                Some(true) => with_registered.clone(),
                _ => original_children.clone(),
            };
            tracing::debug!("creating child of {}: {}", qualified, doc_key);

            let child = self.push_task(
                child_qualified,
                TaskVariant::Doc,
                doc_args.without(&["depends"]),
            );
            let task = &mut self.tasks[child.0];
            task.created_by = Some(qualified.clone());
            task.children = children;
            linked.push(child);
        }

        let task = &mut self.tasks[id.0];
        for child in linked {
            if !task.children.contains(&child) {
                task.children.push(child);
            }
        }
        self.expanded.insert(id);

        Ok(())
    }

    /// Compares the documents a pattern created with those it created in the
    /// previous batch.
    fn diff_pattern(&mut self, id: TaskId) -> Result<(), HistoryError> {
        let Some(previous) = self.previous_id else {
            return Ok(());
        };

        let qualified = self.tasks[id.0].qualified.clone();
        let before: BTreeSet<String> = self
            .history
            .children_in_batch(previous, &qualified)?
            .into_iter()
            .filter(|record| record.class_name == TaskVariant::Doc.class_name())
            .map(|record| record.key)
            .collect();

        let now: BTreeSet<String> = self
            .tasks
            .iter()
            .filter(|task| task.created_by.as_deref() == Some(qualified.as_str()))
            .map(|task| task.key().to_string())
            .collect();

        let changes = PatternChanges {
            added: now.difference(&before).cloned().collect(),
            removed: before.difference(&now).cloned().collect(),
        };

        for key in &changes.added {
            tracing::info!("{} picked up new document {}", qualified, key);
        }
        for key in &changes.removed {
            tracing::info!("{} no longer produces {}", qualified, key);
        }

        self.pattern_changes.insert(qualified, changes);
        Ok(())
    }

    fn check_cycles(&self, selected: &BTreeSet<TaskId>) -> Result<(), BatchError> {
        let mut graph = Graph::<TaskId, ()>::new();
        let nodes: HashMap<TaskId, NodeIndex> = selected
            .iter()
            .map(|&id| (id, graph.add_node(id)))
            .collect();

        for &id in selected {
            for child in &self.tasks[id.0].children {
                if let Some(&from) = nodes.get(child) {
                    graph.add_edge(from, nodes[&id], ());
                }
            }
        }

        petgraph::algo::toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| BatchError::Cycle(self.tasks[graph[cycle.node_id()].0].qualified.clone()))
    }

    /// Documents whose outputs `id` consumes: direct document children, and
    /// the documents reachable through bundles and patterns.
    pub(crate) fn input_docs(&self, id: TaskId) -> Vec<TaskId> {
        let mut docs = vec![];
        let mut seen = HashSet::new();
        let mut stack: Vec<TaskId> = self.tasks[id.0].children.iter().rev().copied().collect();

        while let Some(child) = stack.pop() {
            if !seen.insert(child) {
                continue;
            }
            let task = &self.tasks[child.0];
            match task.variant {
                TaskVariant::Doc => docs.push(child),
                _ => stack.extend(task.children.iter().rev().copied()),
            }
        }

        docs
    }
}
