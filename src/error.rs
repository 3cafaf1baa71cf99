use std::sync::Arc;

use thiserror::Error;

pub use anyhow::Error as FilterError;

#[derive(Debug, Error)]
pub enum ShioriError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Error while recording run history:\n{0}")]
    History(#[from] HistoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Error while running the batch:\n{0}")]
    Batch(#[from] BatchError),

    #[error("Couldn't read settings from '{0}':\n{1}")]
    Settings(String, anyhow::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid hash '{0}'")]
pub struct ParseHashError(pub String);

/// Errors raised while declaring nodes and edges.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node '{0}' has already been declared")]
    DuplicateNode(String),

    #[error("Node '{0}' has not been declared")]
    NodeNotFound(String),

    #[error("Unknown task variant '{variant}' in node '{id}', expected one of: doc, pattern, bundle")]
    UnknownVariant { id: String, variant: String },
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// Bad input in the configuration, shown to the user verbatim.
    #[error("{0}")]
    UserFeedback(String),

    #[error("{0}")]
    FilterNotFound(String),

    #[error("Filter '{alias}' used in '{key}' is not active on this system")]
    InactiveFilter { alias: String, key: String },

    #[error("Can't move '{key}' from state '{from}' to '{to}'")]
    IllegalTransition {
        key: String,
        from: crate::engine::State,
        to: crate::engine::State,
    },

    #[error("Internal problem in '{0}': {1}")]
    Internal(String, String),

    #[error("Filter '{alias}' failed on '{key}':\n{source}")]
    Filter {
        key: String,
        alias: String,
        #[source]
        source: FilterError,
    },

    #[error("Couldn't run '{key}' because '{dependency}' failed")]
    DependencyFailed { key: String, dependency: String },

    #[error("Invalid 'except' expression in '{0}':\n{1}")]
    Except(String, regex::Error),

    #[error("Invalid pattern in '{0}':\n{1}")]
    Pattern(String, glob::PatternError),

    #[error("Couldn't walk the project tree:\n{0}")]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Couldn't create a scratch directory:\n{0}")]
    Scratch(std::io::Error),
}

impl TaskError {
    /// Errors caused by configuration input rather than a defect.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TaskError::UserFeedback(_)
                | TaskError::FilterNotFound(_)
                | TaskError::Except(..)
                | TaskError::Pattern(..)
        )
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, TaskError::InactiveFilter { .. })
    }
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode metadata:\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode metadata:\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("No data stored under '{0}'")]
    Missing(String),

    #[error("Storage type '{found}' can't be read by the '{expected}' store")]
    WrongStorage { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unable to serialize args of '{0}':\n{1}")]
    Serialize(String, serde_json::Error),

    #[error("Unable to deserialize stored args of '{0}':\n{1}")]
    Deserialize(String, serde_json::Error),

    #[error("No run record with key '{0}'")]
    MissingRecord(String),

    #[error("No stored output for document '{0}'")]
    MissingData(String),

    #[error("Invalid hashstring '{0}' in run history")]
    Hashstring(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Couldn't create the history directory:\n{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),

    #[error("Couldn't build the worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid progress bar template:\n{0}")]
    Style(#[from] indicatif::style::TemplateError),

    #[error("Batch {0} has already been run")]
    AlreadyRun(i64),

    #[error("{} task(s) failed: {}", .0.len(), .0.join(", "))]
    Failed(Vec<String>),
}

/// Shared, cloneable form of a task failure kept in diagnostics.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct SharedTaskError(#[from] pub(crate) Arc<TaskError>);

impl SharedTaskError {
    pub fn inner(&self) -> &TaskError {
        &self.0
    }
}

impl From<TaskError> for SharedTaskError {
    fn from(e: TaskError) -> Self {
        SharedTaskError(Arc::new(e))
    }
}
