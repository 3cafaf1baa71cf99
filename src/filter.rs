//! Filters and the registry they are looked up in.
//!
//! A filter is one transformation step in a document's chain. The engine
//! only knows the [`Filter`] trait; concrete implementations (syntax
//! highlighting, renderers, wrapped external tools) live outside this crate
//! and are registered once at startup.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use camino::Utf8Path;

use crate::core::Args;
use crate::data::Data;
use crate::error::TaskError;

/// Below this many registered filters, a failed lookup lists all of them.
const LIST_AVAILABLE_BELOW: usize = 10;

/// Everything a filter gets to see while it runs.
pub struct FilterContext<'a> {
    /// Key of the artifact being produced, e.g. `hello.py|pyg`.
    pub key: &'a str,
    /// Alias the filter was resolved from.
    pub alias: &'a str,
    /// Alias of the next filter in the chain, if any.
    pub next_alias: Option<&'a str>,
    /// Document arguments, minus the keys only relevant to the engine.
    pub args: &'a Args,
    /// Final outputs of the documents this one depends on.
    pub inputs: &'a [Data],
    /// Private working directory, removed after the filter returns.
    pub scratch: &'a Utf8Path,
}

impl FilterContext<'_> {
    /// Arguments addressed to this filter specifically, i.e. the object
    /// stored under the filter's alias.
    pub fn filter_args(&self) -> Args {
        self.args
            .get(self.alias)
            .cloned()
            .and_then(Args::from_json)
            .unwrap_or_default()
    }
}

/// The result of running a filter.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub bytes: Vec<u8>,
    /// Extension of the output, with the leading dot.
    pub ext: String,
    /// Data class marker, `None` for the generic default.
    pub data_type: Option<String>,
}

impl FilterOutput {
    pub fn new(bytes: impl Into<Vec<u8>>, ext: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            ext: ext.into(),
            data_type: None,
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }
}

pub trait Filter: Send + Sync {
    /// Human readable name, used in diagnostics.
    fn name(&self) -> &str;

    /// Version marker folded into every cache key this filter produces.
    /// Bump it whenever the output for the same input changes.
    fn version(&self) -> &str;

    /// Whether the runtime prerequisites (binaries, libraries) are there.
    fn is_active(&self) -> bool {
        true
    }

    /// Fragment filters produce output that isn't a standalone document.
    fn is_fragment(&self) -> bool {
        false
    }

    fn process(&self, ctx: &FilterContext, input: &Data) -> anyhow::Result<FilterOutput>;
}

impl Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Filter({}@{})", self.name(), self.version())
    }
}

/// Returns its input unchanged. Aliases starting with `-` resolve to this.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Filter for Passthrough {
    fn name(&self) -> &str {
        "Passthrough"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, _: &FilterContext, input: &Data) -> anyhow::Result<FilterOutput> {
        Ok(FilterOutput::new(input.data(), input.ext.clone()).with_data_type(&input.data_type))
    }
}

/// Maps filter aliases to filter instances.
///
/// The registry is an ordinary value: build one during startup, pass it to
/// the [`Environment`](crate::Environment), and build a fresh one in every
/// test that needs a different set of filters. Nothing is registered
/// behind the caller's back.
#[derive(Clone)]
pub struct FilterRegistry {
    map: BTreeMap<String, Arc<dyn Filter>>,
    passthrough: Arc<dyn Filter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            passthrough: Arc::new(Passthrough),
        }
    }

    /// Registers `filter` under every alias given. Later registrations of
    /// the same alias replace earlier ones.
    pub fn register<F>(&mut self, aliases: &[&str], filter: F) -> &mut Self
    where
        F: Filter + 'static,
    {
        let filter: Arc<dyn Filter> = Arc::new(filter);
        for alias in aliases {
            self.map.insert(alias.to_string(), filter.clone());
        }
        self
    }

    pub fn with<F>(mut self, aliases: &[&str], filter: F) -> Self
    where
        F: Filter + 'static,
    {
        self.register(aliases, filter);
        self
    }

    /// Drops every registration, keeping the built-in pass-through.
    pub fn reset(&mut self) {
        self.map.clear();
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<&str> {
        self.map.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Resolves `alias` as it appears in the document `key`.
    pub fn resolve(&self, alias: &str, key: &str) -> Result<Arc<dyn Filter>, TaskError> {
        if alias.is_empty() {
            return Err(TaskError::UserFeedback(format!(
                "You have a trailing | or you have 2 | symbols together in your specification for {key}"
            )));
        }

        let filter = match alias.starts_with('-') {
            true => Some(self.passthrough.clone()),
            false => self.map.get(alias).cloned(),
        };

        let Some(filter) = filter else {
            let mut msg = format!("There isn't a filter '{alias}' available.");
            let count = self.map.len();
            if count < LIST_AVAILABLE_BELOW {
                msg.push_str(&format!(
                    " Note that only {count} filters are available: {}.",
                    self.aliases().join(", ")
                ));
                msg.push_str(" Check that the filters were registered before the batch was created.");
            }
            return Err(TaskError::FilterNotFound(msg));
        };

        if !filter.is_active() {
            return Err(TaskError::InactiveFilter {
                alias: alias.to_string(),
                key: key.to_string(),
            });
        }

        Ok(filter)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("aliases", &self.aliases())
            .finish()
    }
}
