#![forbid(unsafe_code)]
//! Document build pipeline.
//!
//! A configuration parser declares nodes and dependencies on an [`Ast`]. A
//! [`Batch`] turns every node into a task: a single document pushed through
//! a chain of filters, a glob pattern expanding into documents, or a bundle
//! grouping other tasks. Every stage of a document is an artifact with a
//! content-derived cache key, so outputs which are already in the
//! [`DataStore`] are never computed twice. Each run is recorded in a SQLite
//! [`RunHistory`].
//!
//! ```
//! use shiori::{Args, Ast, Batch, Environment, FilterRegistry, MemoryTree, RunHistory, State};
//!
//! let tree = MemoryTree::new().with("hello.txt", "hello");
//! let env = Environment::in_memory(FilterRegistry::new(), tree);
//! let history = RunHistory::in_memory()?;
//!
//! let mut ast = Ast::new();
//! ast.add_node("hello.txt", Args::new())?;
//! ast.add_dependency("all", "hello.txt")?;
//!
//! let mut batch = Batch::new(&env, &history, &ast)?;
//! let diagnostics = batch.run(None)?;
//!
//! assert!(diagnostics.is_success());
//! assert_eq!(batch.state("hello.txt"), Some(State::Complete));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod core;
mod data;
mod engine;
mod error;
mod filter;
mod graph;
mod history;
mod settings;
mod tree;
mod utils;

pub use crate::core::{Args, Hash32};
pub use crate::data::{Data, DataSpec, DataStore, FsStore, GENERIC, MemoryStore};
pub use crate::engine::{
    Artifact, ArtifactKind, Batch, CancelToken, Diagnostics, Document, PatternChanges, State,
    Task, TaskExecution, TaskId, TaskVariant,
};
pub use crate::error::*;
pub use crate::filter::{Filter, FilterContext, FilterOutput, FilterRegistry, Passthrough};
pub use crate::graph::{Ast, DirectoryDefaults, Node, qualify};
pub use crate::history::{
    FILTER_ARTIFACT, INITIAL_ARTIFACT, RunCompletion, RunHistory, RunRecord, RunStart,
    START_BATCH_ID, serialize_task_args,
};
pub use crate::settings::{Environment, Settings};
pub use crate::tree::{DEFAULT_EXCLUDE, FileTree, FsTree, MemoryTree};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
