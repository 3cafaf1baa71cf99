//! Tasks, documents and artifacts, and the batch which runs them.

mod artifact;
mod batch;
mod document;
mod runner;
mod state;
mod task;

pub use crate::engine::artifact::{Artifact, ArtifactKind};
pub use crate::engine::batch::{Batch, CancelToken, PatternChanges};
pub use crate::engine::document::Document;
pub use crate::engine::runner::{Diagnostics, TaskExecution};
pub use crate::engine::state::State;
pub use crate::engine::task::{Task, TaskId, TaskVariant};
