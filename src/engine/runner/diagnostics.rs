use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use console::style;

use crate::engine::{Batch, State, TaskExecution, TaskId};
use crate::error::{BatchError, SharedTaskError};

/// Outcome of a batch run.
///
/// Returned by [`Batch::run`]. Individual task failures never abort the
/// batch, they are collected here instead.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub batch_id: i64,
    /// Wall time of every document handed to a worker.
    pub execution_times: HashMap<TaskId, TaskExecution>,
    /// Qualified keys of tasks which completed.
    pub completed: BTreeSet<String>,
    /// Artifact keys whose output came from the store.
    pub cache_hits: BTreeSet<String>,
    /// Tasks which failed, with their error.
    pub failed: BTreeMap<String, SharedTaskError>,
    /// Tasks which never ran because something they depend on failed.
    pub unreachable: BTreeSet<String>,
    /// Tasks which never ran because the batch was cancelled or halted.
    pub unlaunched: BTreeSet<String>,
}

impl Diagnostics {
    pub(crate) fn new(batch_id: i64) -> Self {
        Self {
            batch_id,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.unreachable.is_empty() && self.unlaunched.is_empty()
    }

    /// Turns any failure into an error listing the failed tasks.
    pub fn check(self) -> Result<Self, BatchError> {
        if self.is_success() {
            return Ok(self);
        }

        let keys = self
            .failed
            .keys()
            .chain(&self.unreachable)
            .chain(&self.unlaunched)
            .cloned()
            .collect();
        Err(BatchError::Failed(keys))
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution
    /// duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow, or failed
    /// * **Blue**: Every artifact was cached
    /// * **Grey**: Not selected, or never ran
    pub fn render_mermaid(&self, batch: &Batch) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for task in batch.tasks() {
            let index = task.id().index();
            let name = task.qualified_key().replace('"', "#quot;");

            let (label_extra, color_code) = match (task.state(), times.get(&task.id())) {
                (State::Error, _) => ("Failed".to_string(), "#FF6B6B".to_string()),
                (_, Some(_)) if self.fully_cached(task.document()) => {
                    ("Cached".to_string(), "#ADD8E6".to_string())
                }
                (_, Some(exec)) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);

                    // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                    let (r, g, b) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255, 0)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
                    };

                    (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}{b:02X}"))
                }
                (State::Complete, None) => ("Done".to_string(), "#E0E0E0".to_string()),
                (state, None) => (state.to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {index}[\"{name}\\n{label_extra}\"]");
            let _ = writeln!(f, "    style {index} fill:{color_code}");
        }

        for task in batch.tasks() {
            for child in task.children() {
                let _ = writeln!(f, "    {} --> {}", child.index(), task.id().index());
            }
        }

        f
    }

    fn fully_cached(&self, document: Option<&crate::engine::Document>) -> bool {
        let Some(document) = document else {
            return false;
        };

        let mut filters = document.artifacts().iter().skip(1).peekable();
        filters.peek().is_some() && filters.all(|artifact| self.cache_hits.contains(artifact.key()))
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batch {}: {} completed, {} cached",
            self.batch_id,
            style(self.completed.len()).green(),
            style(self.cache_hits.len()).cyan(),
        )?;

        if !self.failed.is_empty() {
            write!(f, ", {} failed", style(self.failed.len()).red())?;
        }
        if !self.unreachable.is_empty() {
            write!(f, ", {} unreachable", style(self.unreachable.len()).yellow())?;
        }
        if !self.unlaunched.is_empty() {
            write!(f, ", {} not launched", style(self.unlaunched.len()).dim())?;
        }

        for (key, error) in &self.failed {
            write!(f, "\n  {} {}: {}", style("✗").red(), key, error)?;
        }

        Ok(())
    }
}
