use std::sync::Arc;

use camino::Utf8Path;
use serde_json::Value;

use crate::Environment;
use crate::core::{Args, Hash32};
use crate::data::Data;
use crate::engine::State;
use crate::engine::artifact::{Artifact, ArtifactKind, TRANSIENT_ARGS};
use crate::error::TaskError;

/// What happened to an artifact while its document was running.
pub(crate) enum Progress<'a> {
    Started(usize, &'a Artifact),
    Finished(usize, &'a Artifact),
}

/// A single source file pushed through a chain of filters.
///
/// The key `hello.py|pyg|l` names the file `hello.py` and the filters `pyg`
/// and `l`. Each prefix of the chain is one [`Artifact`]; the document owns
/// all of them and links them by index.
#[derive(Debug)]
pub struct Document {
    key: String,
    name: String,
    filters: Vec<String>,
    artifacts: Vec<Artifact>,
    canonical: bool,
    args: Args,
}

impl Document {
    /// Splits the key and builds the artifact chain, resolving every filter
    /// alias on the way.
    pub(crate) fn populate(key: &str, args: Args, env: &Environment) -> Result<Self, TaskError> {
        let mut parts = key.split('|');
        let name = parts.next().unwrap_or_default().to_string();
        let filters: Vec<String> = parts.map(str::to_string).collect();

        let (contents, is_virtual): (Arc<[u8]>, bool) = match args.get("contents") {
            Some(Value::String(text)) => (Arc::from(text.as_bytes()), true),
            Some(other) => (Arc::from(other.to_string().into_bytes()), true),
            None => match env.tree.read(Utf8Path::new(&name))? {
                Some(bytes) => (Arc::from(bytes), false),
                None => (Arc::from(Vec::new()), true),
            },
        };

        let mut initial = Artifact::initial(name.clone(), contents, is_virtual, args.clone());
        initial.next_alias = filters.first().cloned();
        initial.transition(State::Populated)?;

        let mut artifacts = vec![initial];
        let filter_args = args.without(TRANSIENT_ARGS);
        let mut last_is_fragment = false;

        for (i, alias) in filters.iter().enumerate() {
            let artifact_key = format!("{}|{}", name, filters[..=i].join("|"));
            let filter = env.filters.resolve(alias, key)?;

            let next_alias = filters.get(i + 1).cloned();
            if let Some(next) = &next_alias {
                env.filters.resolve(next, key)?;
            }

            last_is_fragment = filter.is_fragment();

            let mut artifact =
                Artifact::filter(artifact_key, alias.clone(), filter, i, filter_args.clone());
            artifact.next_alias = next_alias;
            artifact.transition(State::Populated)?;
            artifacts.push(artifact);
        }

        let canonical = args
            .get_bool("canon")
            .unwrap_or(filters.is_empty() || !last_is_fragment);

        Ok(Self {
            key: key.to_string(),
            name,
            filters,
            artifacts,
            canonical,
            args,
        })
    }

    /// Sets up every artifact in order, returning the document's cache key.
    pub(crate) fn setup(&mut self, inputs: &[Hash32]) -> Result<Hash32, TaskError> {
        let mut prior = None;
        for artifact in &mut self.artifacts {
            artifact.setup(prior, inputs)?;
            prior = artifact.hashstring;
        }

        self.hashstring().ok_or_else(|| {
            TaskError::Internal(self.key.clone(), "document has no artifacts".into())
        })
    }

    /// Runs the artifact chain front to back. `progress` sees every artifact
    /// start and every successful finish.
    pub(crate) fn run(
        &mut self,
        env: &Environment,
        inputs: &[Data],
        progress: &mut dyn FnMut(Progress),
    ) -> Result<(), TaskError> {
        for i in 0..self.artifacts.len() {
            let (done, rest) = self.artifacts.split_at_mut(i);
            let artifact = &mut rest[0];
            let prior = artifact
                .prior
                .and_then(|p| done.get(p))
                .and_then(|p| p.output.as_ref());

            progress(Progress::Started(i, artifact));
            artifact.run(env, prior, inputs)?;
            progress(Progress::Finished(i, artifact));
        }

        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn is_canonical(&self) -> bool {
        self.canonical
    }

    pub fn final_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }

    /// Cache key of the final artifact.
    pub fn hashstring(&self) -> Option<Hash32> {
        self.final_artifact().and_then(Artifact::hashstring)
    }

    /// Hash of inline `contents`, if the document was given any.
    pub fn contents_hash(&self) -> Option<Hash32> {
        if !self.args.contains("contents") {
            return None;
        }
        match &self.artifacts.first()?.kind {
            ArtifactKind::Initial { contents, .. } => Some(Hash32::hash(contents)),
            _ => None,
        }
    }

    pub fn websafe_key(&self) -> String {
        self.key.replace('/', "--")
    }

    /// Output of the final filter.
    pub fn output(&self) -> Result<&Data, TaskError> {
        let Some(last) = self.final_artifact() else {
            return Err(TaskError::Internal(self.key.clone(), "document has no artifacts".into()));
        };

        let ready = match last.state {
            State::Complete => true,
            State::Setup => self.filters.is_empty(),
            _ => false,
        };
        if !ready {
            return Err(TaskError::Internal(
                self.key.clone(),
                format!("Final artifact state is '{}'", last.state),
            ));
        }

        last.output.as_ref().ok_or_else(|| {
            TaskError::Internal(self.key.clone(), "final artifact has no output".into())
        })
    }

    pub fn is_index_page(&self) -> bool {
        self.output().is_ok_and(|data| {
            let name = data.name();
            name.as_str().ends_with("index.html") || name.as_str().ends_with("index.json")
        })
    }

    /// The `title` argument, the capitalized directory of an index page, or
    /// the file name.
    pub fn title(&self) -> String {
        if let Some(title) = self.args.get_str("title") {
            return title.to_string();
        }

        if self.is_index_page() {
            let dir = Utf8Path::new(&self.name)
                .parent()
                .and_then(Utf8Path::file_name)
                .unwrap_or_default();
            let mut chars = dir.chars();
            return match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            };
        }

        self.name.clone()
    }
}
