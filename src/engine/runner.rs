mod diagnostics;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::ProgressStyle;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::Environment;
use crate::core::Hash32;
use crate::data::{Data, GENERIC};
use crate::engine::artifact::ArtifactKind;
use crate::engine::document::Progress;
use crate::engine::{Batch, Document, State, TaskId, TaskVariant};
use crate::error::{BatchError, HistoryError, TaskError};
use crate::history::{RunCompletion, RunStart, serialize_task_args};
use crate::utils::{get_style_batch, get_style_task};

pub use diagnostics::Diagnostics;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Messages sent from workers back to the scheduler thread, which is the
/// only one writing to the run history.
enum Event {
    ArtifactStarted(RunStart),
    ArtifactFinished(String, Result<RunCompletion, HistoryError>),
    Done {
        id: TaskId,
        document: Document,
        result: Result<Hash32, TaskError>,
        start: Instant,
        duration: Duration,
    },
}

/// Everything a worker needs to run one document.
struct Job {
    id: TaskId,
    key: String,
    created_by: Option<String>,
    document: Document,
    inputs: Vec<Data>,
    input_hashes: Vec<Hash32>,
}

/// Unique history key of the `index`th artifact of a document.
fn artifact_unique_key(doc_key: &str, index: usize, batch_id: i64) -> String {
    format!("artifact:{doc_key}:{index}:{batch_id}")
}

/// Runs the selected tasks of a batch on a rayon pool. A task is launched as
/// soon as every task it depends on has settled.
///
/// 1. Dependency counts are computed for every selected task, counting only
///    dependencies which are selected as well.
/// 2. Tasks without dependencies are queued.
/// 3. Queued documents are handed to workers; bundles and patterns have
///    nothing to compute and settle immediately.
/// 4. Workers report artifact progress and their final result through a
///    channel. The calling thread writes the history and unlocks dependents.
///
/// A failed task never stops the batch, its dependents are reported as
/// unreachable instead. A failing history write does: nothing new is
/// launched, running documents are drained and the error is returned.
pub(crate) fn run_tasks_parallel(
    batch: &mut Batch,
    selected: &BTreeSet<TaskId>,
) -> Result<Diagnostics, BatchError> {
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    let mut dependency_counts: HashMap<TaskId, usize> = HashMap::new();
    for &id in selected {
        let children: BTreeSet<TaskId> = batch.tasks[id.0]
            .children
            .iter()
            .filter(|child| selected.contains(child))
            .copied()
            .collect();
        for &child in &children {
            dependents.entry(child).or_default().push(id);
        }
        dependency_counts.insert(id, children.len());
    }

    let total_tasks = selected.len() as u64;
    if total_tasks == 0 {
        return Ok(Diagnostics::new(batch.id));
    }

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total_tasks);
    root_span.pb_set_style(&get_style_batch()?);
    root_span.pb_set_message(&format!("Running batch {}...", batch.id));
    let _enter = root_span.enter();

    let ready = selected
        .iter()
        .filter(|id| dependency_counts.get(id).copied().unwrap_or(0) == 0)
        .copied()
        .collect();

    let pool = match batch.env.settings.workers {
        Some(workers) => Some(rayon::ThreadPoolBuilder::new().num_threads(workers).build()?),
        None => None,
    };

    let mut scheduler = Scheduler {
        diagnostics: Diagnostics::new(batch.id),
        batch,
        dependents,
        dependency_counts,
        ready,
        fatal: None,
        root_span: root_span.clone(),
        pb_style: get_style_task()?,
    };

    // The scheduler loop stays on this thread while workers run documents.
    match &pool {
        Some(pool) => pool.in_place_scope(|s| scheduler.run(s)),
        None => rayon::in_place_scope(|s| scheduler.run(s)),
    }

    let Scheduler {
        batch,
        mut diagnostics,
        fatal,
        ..
    } = scheduler;

    for &id in selected {
        let task = &batch.tasks[id.0];
        if !task.state.is_terminal() && !diagnostics.completed.contains(&task.qualified) {
            diagnostics.unlaunched.insert(task.qualified.clone());
        }
    }

    if let Some(e) = fatal {
        return Err(BatchError::History(e));
    }

    tracing::info!("Batch {} complete!", batch.id);
    Ok(diagnostics)
}

struct Scheduler<'b, 'a> {
    batch: &'b mut Batch<'a>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    dependency_counts: HashMap<TaskId, usize>,
    ready: VecDeque<TaskId>,
    diagnostics: Diagnostics,
    /// First history write that failed.
    fatal: Option<HistoryError>,
    root_span: Span,
    pb_style: ProgressStyle,
}

impl<'a> Scheduler<'_, 'a> {
    fn run<'scope>(&mut self, s: &rayon::Scope<'scope>)
    where
        'a: 'scope,
    {
        let env: &'a Environment = self.batch.env;
        let batch_id = self.batch.id;
        let (sender, receiver) = channel::<Event>();
        let mut in_flight = 0usize;

        loop {
            while let Some(id) = self.ready.pop_front() {
                let Some(job) = self.launch(id) else {
                    self.settled(id);
                    continue;
                };

                let sender = sender.clone();
                let pb_style = self.pb_style.clone();
                in_flight += 1;

                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "task", key = job.key.as_str());
                    span.pb_set_style(&pb_style);
                    span.pb_set_message(&format!("Running {}", job.key));
                    let _enter = span.enter();

                    let start = Instant::now();
                    let Job {
                        id,
                        key,
                        created_by,
                        mut document,
                        inputs,
                        input_hashes,
                    } = job;

                    // The document is only borrowed, so it goes back to its
                    // task even when a filter panics.
                    let result = match catch_unwind(AssertUnwindSafe(|| {
                        run_document(
                            env,
                            batch_id,
                            created_by,
                            &mut document,
                            &inputs,
                            &input_hashes,
                            &sender,
                        )
                    })) {
                        Ok(result) => result,
                        Err(panic) => {
                            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("Task panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("Task panicked: {s}")
                            } else {
                                String::from("Task panicked with unknown payload")
                            };
                            Err(TaskError::Internal(key, msg))
                        }
                    };

                    let _ = sender.send(Event::Done {
                        id,
                        document,
                        result,
                        start,
                        duration: start.elapsed(),
                    });
                });
            }

            if in_flight == 0 {
                break;
            }

            let Ok(event) = receiver.recv() else {
                break;
            };

            match event {
                Event::ArtifactStarted(start) => {
                    if self.fatal.is_none()
                        && let Err(e) = self.batch.history.create_record(&start)
                    {
                        self.fatal = Some(e);
                    }
                }
                Event::ArtifactFinished(unique_key, completion) => {
                    if self.fatal.is_none()
                        && let Err(e) = completion
                            .and_then(|done| self.batch.history.update_record(&unique_key, &done))
                    {
                        self.fatal = Some(e);
                    }
                }
                Event::Done {
                    id,
                    document,
                    result,
                    start,
                    duration,
                } => {
                    in_flight -= 1;
                    self.diagnostics
                        .execution_times
                        .insert(id, TaskExecution { start, duration });

                    if let Err(e) = self.finish(id, document, result) {
                        tracing::error!("couldn't record {} in the history: {}", self.batch.tasks[id.0].qualified, e);
                        self.fatal.get_or_insert(e);
                    }

                    self.settled(id);
                }
            }
        }
    }

    /// Counts a task as done and queues the dependents it unlocked.
    fn settled(&mut self, id: TaskId) {
        self.root_span.pb_inc(1);

        let Some(dependents) = self.dependents.get(&id) else {
            return;
        };

        for &index in dependents {
            if let Some(count) = self.dependency_counts.get_mut(&index) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(index);
                }
            }
        }
    }

    /// Decides what happens to a task whose dependencies have settled.
    /// Returns the job to hand to a worker, or `None` when the task settled
    /// right here.
    fn launch(&mut self, id: TaskId) -> Option<Job> {
        if self.fatal.is_some() || self.batch.cancel.is_cancelled() {
            let qualified = self.batch.tasks[id.0].qualified.clone();
            self.diagnostics.unlaunched.insert(qualified);
            return None;
        }

        match self.prepare(id) {
            Ok(job) => job,
            Err(e) => {
                let qualified = self.batch.tasks[id.0].qualified.clone();
                tracing::error!("couldn't record {} in the history: {}", qualified, e);
                self.diagnostics.unlaunched.insert(qualified);
                self.fatal = Some(e);
                None
            }
        }
    }

    fn prepare(&mut self, id: TaskId) -> Result<Option<Job>, HistoryError> {
        let batch = &mut *self.batch;
        let diagnostics = &mut self.diagnostics;
        let task = &batch.tasks[id.0];
        let qualified = task.qualified.clone();

        if task.state == State::Error {
            let error = task.error.clone().unwrap_or_else(|| {
                TaskError::Internal(qualified.clone(), "failed without an error".into()).into()
            });
            diagnostics.failed.insert(qualified, error);
            return Ok(None);
        }

        if let Some(&failed) = task
            .children
            .iter()
            .find(|child| batch.tasks[child.0].state == State::Error)
        {
            let dependency = batch.tasks[failed.0].qualified.clone();
            tracing::warn!("skipping {} because {} failed", qualified, dependency);
            batch.tasks[id.0].fail(TaskError::DependencyFailed {
                key: qualified.clone(),
                dependency,
            });
            diagnostics.unreachable.insert(qualified);
            return Ok(None);
        }

        let unique_key = task.key_with_batch_id(batch.id);
        batch.history.create_record(&RunStart {
            unique_key: unique_key.clone(),
            batch_id: batch.id,
            key: task.key().to_string(),
            doc_key: task.key().to_string(),
            class_name: task.variant.class_name().to_string(),
            created_by_doc: task.created_by.clone(),
            started_at: Utc::now(),
        })?;

        if task.variant != TaskVariant::Doc {
            let args = serialize_task_args(task.key(), &task.args, None)?;
            let task = &mut batch.tasks[id.0];
            let result = task
                .transition(State::Setup)
                .and_then(|_| task.transition(State::Complete));

            if let Err(e) = result {
                task.fail(e);
                if let Some(error) = task.error.clone() {
                    diagnostics.failed.insert(qualified, error);
                }
                return Ok(None);
            }

            batch.history.update_record(
                &unique_key,
                &RunCompletion {
                    args,
                    hashstring: None,
                    ext: None,
                    data_type: None,
                    storage_type: None,
                    completed_at: Utc::now(),
                },
            )?;
            diagnostics.completed.insert(qualified);
            return Ok(None);
        }

        let mut inputs = vec![];
        let mut input_hashes = vec![];
        for input in batch.input_docs(id) {
            let Some(document) = batch.tasks[input.0].document() else {
                continue;
            };
            if let Ok(data) = document.output() {
                inputs.push(data.clone());
            }
            if let Some(hash) = document.hashstring() {
                input_hashes.push(hash);
            }
        }

        let task = &mut batch.tasks[id.0];
        let Some(document) = task.document.take() else {
            task.fail(TaskError::Internal(
                qualified.clone(),
                "document was never populated".into(),
            ));
            if let Some(error) = task.error.clone() {
                diagnostics.failed.insert(qualified, error);
            }
            return Ok(None);
        };

        Ok(Some(Job {
            id,
            key: qualified,
            created_by: task.created_by.clone(),
            document,
            inputs,
            input_hashes,
        }))
    }

    /// Puts a document returned by a worker back into its task and records
    /// the outcome.
    fn finish(
        &mut self,
        id: TaskId,
        document: Document,
        result: Result<Hash32, TaskError>,
    ) -> Result<(), HistoryError> {
        for artifact in document.artifacts() {
            if artifact.was_cached() {
                self.diagnostics.cache_hits.insert(artifact.key().to_string());
            }
        }

        let batch_id = self.batch.id;
        let task = &mut self.batch.tasks[id.0];
        let qualified = task.qualified.clone();
        task.document = Some(document);

        let result = result.and_then(|hash| {
            task.hashstring = Some(hash);
            task.transition(State::Setup)?;
            task.transition(State::Complete)?;
            Ok(hash)
        });

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!("{} failed: {}", qualified, e);
                task.fail(e);
                if let Some(error) = task.error.clone() {
                    self.diagnostics.failed.insert(qualified, error);
                }
                return Ok(());
            }
        };

        self.diagnostics.completed.insert(qualified);
        if self.fatal.is_some() {
            return Ok(());
        }

        let task = &self.batch.tasks[id.0];
        let contents = task.document().and_then(Document::contents_hash);
        let args = serialize_task_args(task.key(), &task.args, contents.map(|hash| (hash, GENERIC)))?;
        let output = task.document().and_then(|document| document.output().ok());

        self.batch.history.update_record(
            &task.key_with_batch_id(batch_id),
            &RunCompletion {
                args,
                hashstring: Some(hash),
                ext: output.map(|data| data.ext.clone()),
                data_type: output.map(|data| data.data_type.clone()),
                storage_type: output.map(|data| data.storage_type.clone()),
                completed_at: Utc::now(),
            },
        )
    }
}

/// Sets up and runs one document on a worker thread.
fn run_document(
    env: &Environment,
    batch_id: i64,
    created_by: Option<String>,
    document: &mut Document,
    inputs: &[Data],
    input_hashes: &[Hash32],
    sender: &Sender<Event>,
) -> Result<Hash32, TaskError> {
    let hash = document.setup(input_hashes)?;
    let doc_key = document.key().to_string();
    let contents_hash = document.contents_hash();

    document.run(env, inputs, &mut |progress| match progress {
        Progress::Started(index, artifact) => {
            let _ = sender.send(Event::ArtifactStarted(RunStart {
                unique_key: artifact_unique_key(&doc_key, index, batch_id),
                batch_id,
                key: artifact.key().to_string(),
                doc_key: doc_key.clone(),
                class_name: artifact.class_name().to_string(),
                created_by_doc: created_by.clone(),
                started_at: Utc::now(),
            }));
        }
        Progress::Finished(index, artifact) => {
            let contents = match artifact.kind() {
                ArtifactKind::Initial { .. } => contents_hash.map(|hash| (hash, GENERIC)),
                ArtifactKind::Filter { .. } => None,
            };
            let output = artifact.output();

            let completion =
                serialize_task_args(artifact.key(), artifact.args(), contents).map(|args| {
                    RunCompletion {
                        args,
                        hashstring: artifact.hashstring(),
                        ext: output.map(|data| data.ext.clone()),
                        data_type: output.map(|data| data.data_type.clone()),
                        storage_type: output.map(|data| data.storage_type.clone()),
                        completed_at: Utc::now(),
                    }
                });

            let _ = sender.send(Event::ArtifactFinished(
                artifact_unique_key(&doc_key, index, batch_id),
                completion,
            ));
        }
    })?;

    Ok(hash)
}
