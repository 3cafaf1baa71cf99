use std::fmt::Display;

use crate::core::{Args, Hash32};
use crate::engine::{Document, State};
use crate::error::{SharedTaskError, TaskError};

/// Index of a task in its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// The closed set of task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskVariant {
    /// One file with a filter chain.
    Doc,
    /// A glob pattern expanding into one document per matching file.
    Pattern,
    /// A named group of other tasks.
    Bundle,
}

impl TaskVariant {
    pub fn prefix(self) -> &'static str {
        match self {
            TaskVariant::Doc => "doc",
            TaskVariant::Pattern => "pattern",
            TaskVariant::Bundle => "bundle",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "doc" => Some(TaskVariant::Doc),
            "pattern" => Some(TaskVariant::Pattern),
            "bundle" => Some(TaskVariant::Bundle),
            _ => None,
        }
    }

    /// Name recorded in the run history.
    pub fn class_name(self) -> &'static str {
        match self {
            TaskVariant::Doc => "Doc",
            TaskVariant::Pattern => "PatternDoc",
            TaskVariant::Bundle => "BundleDoc",
        }
    }
}

impl Display for TaskVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A unit of work in a batch.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    /// Key with the variant prefix, e.g. `doc:hello.py|pyg`.
    pub(crate) qualified: String,
    pub(crate) variant: TaskVariant,
    pub(crate) args: Args,
    /// Tasks which have to complete first, in declaration order.
    pub(crate) children: Vec<TaskId>,
    pub(crate) state: State,
    pub(crate) hashstring: Option<Hash32>,
    /// Qualified key of the task which created this one during the batch.
    pub(crate) created_by: Option<String>,
    /// Present for documents, absent while a worker holds it.
    pub(crate) document: Option<Document>,
    pub(crate) error: Option<SharedTaskError>,
}

impl Task {
    pub(crate) fn new(id: TaskId, qualified: String, variant: TaskVariant, args: Args) -> Self {
        Self {
            id,
            qualified,
            variant,
            args,
            children: vec![],
            state: State::New,
            hashstring: None,
            created_by: None,
            document: None,
            error: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Key without the variant prefix.
    pub fn key(&self) -> &str {
        self.qualified
            .split_once(':')
            .map(|(_, key)| key)
            .unwrap_or(&self.qualified)
    }

    pub fn qualified_key(&self) -> &str {
        &self.qualified
    }

    pub fn variant(&self) -> TaskVariant {
        self.variant
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Cache key, `None` for bundles and patterns.
    pub fn hashstring(&self) -> Option<Hash32> {
        self.hashstring
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref().map(SharedTaskError::inner)
    }

    /// Run history key, unique across batches.
    pub fn key_with_batch_id(&self, batch_id: i64) -> String {
        format!("{}:{}", self.qualified, batch_id)
    }

    pub(crate) fn transition(&mut self, next: State) -> Result<(), TaskError> {
        self.state.transition(&self.qualified, next)
    }

    /// Marks the task as failed, keeping the first error seen.
    pub(crate) fn fail(&mut self, error: impl Into<SharedTaskError>) {
        if !self.state.is_terminal() {
            self.state = State::Error;
        }
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }
}
