use std::fs;
use std::sync::Arc;

use camino::Utf8Path;

use crate::Environment;
use crate::core::{Args, Hash32, KeyHasher};
use crate::data::{Data, GENERIC};
use crate::engine::State;
use crate::error::TaskError;
use crate::filter::{Filter, FilterContext};
use crate::history::{FILTER_ARTIFACT, INITIAL_ARTIFACT};

/// Argument keys which only matter to the document or its initial artifact.
pub(crate) const TRANSIENT_ARGS: &[&str] = &["contents", "contentshash", "data-class-alias", "depends"];

pub enum ArtifactKind {
    /// Raw document content, read from the file tree or given inline.
    Initial {
        contents: Arc<[u8]>,
        is_virtual: bool,
    },
    /// Output of running one filter over the previous artifact.
    Filter {
        alias: String,
        filter: Arc<dyn Filter>,
    },
}

impl std::fmt::Debug for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial { contents, is_virtual } => f
                .debug_struct("Initial")
                .field("len", &contents.len())
                .field("is_virtual", is_virtual)
                .finish(),
            Self::Filter { alias, filter } => f
                .debug_struct("Filter")
                .field("alias", alias)
                .field("filter", filter)
                .finish(),
        }
    }
}

/// One cacheable stage of a document.
#[derive(Debug)]
pub struct Artifact {
    pub(crate) key: String,
    pub(crate) kind: ArtifactKind,
    pub(crate) state: State,
    pub(crate) hashstring: Option<Hash32>,
    /// Index of the previous artifact in the owning document.
    pub(crate) prior: Option<usize>,
    pub(crate) next_alias: Option<String>,
    pub(crate) args: Args,
    pub(crate) output: Option<Data>,
    pub(crate) cached: bool,
}

impl Artifact {
    pub(crate) fn initial(key: String, contents: Arc<[u8]>, is_virtual: bool, args: Args) -> Self {
        Self {
            key,
            kind: ArtifactKind::Initial {
                contents,
                is_virtual,
            },
            state: State::New,
            hashstring: None,
            prior: None,
            next_alias: None,
            args,
            output: None,
            cached: false,
        }
    }

    pub(crate) fn filter(
        key: String,
        alias: String,
        filter: Arc<dyn Filter>,
        prior: usize,
        args: Args,
    ) -> Self {
        Self {
            key,
            kind: ArtifactKind::Filter { alias, filter },
            state: State::New,
            hashstring: None,
            prior: Some(prior),
            next_alias: None,
            args,
            output: None,
            cached: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Cache key, known once the artifact is set up.
    pub fn hashstring(&self) -> Option<Hash32> {
        self.hashstring
    }

    pub fn prior(&self) -> Option<usize> {
        self.prior
    }

    pub fn next_alias(&self) -> Option<&str> {
        self.next_alias.as_deref()
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn output(&self) -> Option<&Data> {
        self.output.as_ref()
    }

    /// Whether the output was found in the store instead of computed.
    pub fn was_cached(&self) -> bool {
        self.cached
    }

    pub fn alias(&self) -> Option<&str> {
        match &self.kind {
            ArtifactKind::Initial { .. } => None,
            ArtifactKind::Filter { alias, .. } => Some(alias),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, ArtifactKind::Initial { is_virtual: true, .. })
    }

    pub fn class_name(&self) -> &'static str {
        match self.kind {
            ArtifactKind::Initial { .. } => INITIAL_ARTIFACT,
            ArtifactKind::Filter { .. } => FILTER_ARTIFACT,
        }
    }

    pub(crate) fn transition(&mut self, next: State) -> Result<(), TaskError> {
        self.state.transition(&self.key, next)
    }

    /// Derives the cache key.
    ///
    /// Initial artifacts hash their content and arguments. Filter artifacts
    /// hash the previous cache key, the filter alias and version, their
    /// arguments and the cache keys of the documents they consume.
    pub(crate) fn setup(&mut self, prior: Option<Hash32>, inputs: &[Hash32]) -> Result<(), TaskError> {
        let args = self
            .args
            .without(TRANSIENT_ARGS)
            .to_canonical_json()
            .map_err(|e| TaskError::Internal(self.key.clone(), e.to_string()))?;

        let hash = match &self.kind {
            ArtifactKind::Initial { contents, .. } => {
                KeyHasher::new("initial").part(contents).part(&args).finish()
            }
            ArtifactKind::Filter { alias, filter } => {
                let Some(prior) = prior else {
                    return Err(TaskError::Internal(
                        self.key.clone(),
                        "filter artifact set up before its predecessor".into(),
                    ));
                };

                let mut hasher = KeyHasher::new("filter");
                hasher
                    .part(prior.to_hex())
                    .part(alias)
                    .part(filter.version())
                    .part(&args);
                for input in inputs {
                    hasher.part(input.to_hex());
                }
                hasher.finish()
            }
        };

        self.hashstring = Some(hash);
        self.transition(State::Setup)
    }

    /// Produces the output of this stage, reusing a stored one when the
    /// cache key is already known to the store.
    pub(crate) fn run(
        &mut self,
        env: &Environment,
        prior: Option<&Data>,
        inputs: &[Data],
    ) -> Result<(), TaskError> {
        let result = self.execute(env, prior, inputs);
        if result.is_err() && !self.state.is_terminal() {
            self.state = State::Error;
        }
        result
    }

    fn execute(
        &mut self,
        env: &Environment,
        prior: Option<&Data>,
        inputs: &[Data],
    ) -> Result<(), TaskError> {
        let hash = self.hashstring.ok_or_else(|| {
            TaskError::Internal(self.key.clone(), "artifact run before setup".into())
        })?;

        match &self.kind {
            ArtifactKind::Initial { contents, .. } => {
                let name = Utf8Path::new(&self.key);
                let ext = name.extension().map(|e| format!(".{e}")).unwrap_or_default();

                let mut data = Data::new(self.key.clone(), ext, hash);
                data.set_data(contents.clone());
                if !env.store.contains(&hash)? {
                    env.store.store(&data)?;
                }
                data.storage_type = env.store.storage_type().to_string();
                self.output = Some(data);
            }
            ArtifactKind::Filter { alias, filter } => {
                if let Some(mut data) = env.store.lookup(&hash)? {
                    tracing::info!("cache hit for {}", self.key);
                    data.key = self.key.clone();
                    self.output = Some(data);
                    self.cached = true;
                    return self.transition(State::Complete);
                }

                tracing::info!("running {} for {}", alias, self.key);

                let prior = prior.ok_or_else(|| {
                    TaskError::Internal(self.key.clone(), "filter artifact without input".into())
                })?;

                let scratch = scratch_dir(env)?;
                let scratch_path = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
                    TaskError::Scratch(std::io::Error::other("scratch path isn't valid UTF-8"))
                })?;

                let ctx = FilterContext {
                    key: &self.key,
                    alias,
                    next_alias: self.next_alias.as_deref(),
                    args: &self.args,
                    inputs,
                    scratch: scratch_path,
                };

                let output = filter
                    .process(&ctx, prior)
                    .map_err(|source| TaskError::Filter {
                        key: self.key.clone(),
                        alias: alias.clone(),
                        source,
                    })?;

                let data_type = output.data_type.unwrap_or_else(|| GENERIC.to_string());
                let mut data = Data::new(self.key.clone(), output.ext, hash).with_data_type(data_type);
                data.set_data(output.bytes);
                env.store.store(&data)?;
                data.storage_type = env.store.storage_type().to_string();
                self.output = Some(data);
            }
        }

        self.transition(State::Complete)
    }
}

fn scratch_dir(env: &Environment) -> Result<tempfile::TempDir, TaskError> {
    let builder = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("shiori-");
        builder
    };

    match env.settings.scratch_path() {
        Some(dir) => {
            fs::create_dir_all(&dir).map_err(TaskError::Scratch)?;
            builder.tempdir_in(dir).map_err(TaskError::Scratch)
        }
        None => builder.tempdir().map_err(TaskError::Scratch),
    }
}
