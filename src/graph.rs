//! The graph builder fed by configuration parsers.
//!
//! A parser declares nodes (`add_node`) and edges (`add_dependency`) in any
//! order. The resulting [`Ast`] answers the questions the task factory asks:
//! which nodes are top-level, what arguments a node carries and which other
//! nodes it consumes.

use std::collections::{BTreeMap, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::DfsPostOrder;

use crate::core::{ArcStr, Args};
use crate::engine::TaskVariant;
use crate::error::GraphError;

/// A single declared node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: ArcStr,
    pub args: Args,
    /// Set once `add_node` was called for this id. Nodes that were only
    /// mentioned by an edge so far are not declared yet.
    declared: bool,
}

/// Qualifies a raw node id with its task variant.
///
/// Ids that already carry a known prefix are kept. Otherwise a base name
/// with glob metacharacters is a pattern, one without an extension is a
/// bundle and anything else is a single document.
pub fn qualify(id: &str) -> Result<String, GraphError> {
    if let Some((prefix, _)) = id.split_once(':')
        && !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_alphabetic())
    {
        return match TaskVariant::from_prefix(prefix) {
            Some(_) => Ok(id.to_string()),
            None => Err(GraphError::UnknownVariant {
                id: id.to_string(),
                variant: prefix.to_string(),
            }),
        };
    }

    let base = id.split('|').next().unwrap_or(id);
    let variant = if base.contains(['*', '?', '[']) {
        TaskVariant::Pattern
    } else if !base.contains('.') {
        TaskVariant::Bundle
    } else {
        TaskVariant::Doc
    };

    Ok(format!("{}:{id}", variant.prefix()))
}

/// Default arguments registered for directories.
///
/// Defaults of an ancestor directory apply to everything below it, the
/// deepest directory winning on conflicts.
#[derive(Debug, Clone, Default)]
pub struct DirectoryDefaults {
    map: BTreeMap<Utf8PathBuf, Args>,
}

impl DirectoryDefaults {
    pub fn set(&mut self, dir: impl AsRef<Utf8Path>, args: Args) {
        self.map.insert(normalize_dir(dir.as_ref()), args);
    }

    /// Merged defaults applying to the file at `path`.
    pub fn for_path(&self, path: impl AsRef<Utf8Path>) -> Args {
        let path = normalize_dir(path.as_ref());
        let dir = path.parent().unwrap_or(Utf8Path::new(""));

        let mut chain: Vec<&Utf8Path> = dir.ancestors().collect();
        chain.reverse();

        let mut acc = self.map.get(Utf8Path::new("")).cloned().unwrap_or_default();
        for ancestor in chain.into_iter().filter(|a| !a.as_str().is_empty()) {
            if let Some(args) = self.map.get(ancestor) {
                acc = args.over(&acc);
            }
        }

        acc
    }
}

fn normalize_dir(path: &Utf8Path) -> Utf8PathBuf {
    let trimmed = path.as_str().trim_start_matches("./").trim_end_matches('/');
    match trimmed {
        "." => Utf8PathBuf::new(),
        other => Utf8PathBuf::from(other),
    }
}

/// Abstract graph produced by a configuration parser.
///
/// Edges point from a node to the node it depends on.
#[derive(Debug, Default)]
pub struct Ast {
    graph: Graph<Node, ()>,
    index: HashMap<ArcStr, NodeIndex>,
    defaults: DirectoryDefaults,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, id: String) -> NodeIndex {
        if let Some(&index) = self.index.get(id.as_str()) {
            return index;
        }

        let id: ArcStr = id.into();
        let index = self.graph.add_node(Node {
            id: id.clone(),
            args: Args::default(),
            declared: false,
        });
        self.index.insert(id, index);
        index
    }

    fn lookup(&self, id: &str) -> Option<NodeIndex> {
        let id = qualify(id).ok()?;
        self.index.get(id.as_str()).copied()
    }

    /// Declares a node. A node that was so far only mentioned by an edge
    /// receives its arguments here; declaring the same id twice is an error.
    pub fn add_node(&mut self, id: &str, args: Args) -> Result<&str, GraphError> {
        let id = qualify(id)?;
        let index = self.ensure(id);
        let node = &mut self.graph[index];

        if node.declared {
            return Err(GraphError::DuplicateNode(node.id.to_string()));
        }

        node.args = args;
        node.declared = true;
        Ok(&node.id)
    }

    /// Declares that `from` consumes `to`. Both endpoints are created if
    /// they don't exist yet; `to` stops being a root either way.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let from = self.ensure(qualify(from)?);
        let to = self.ensure(qualify(to)?);
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    /// Replaces argument values of an existing node key by key.
    pub fn override_args(&mut self, id: &str, args: Args) -> Result<(), GraphError> {
        let index = self
            .lookup(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        let node = &mut self.graph[index];
        node.args = args.over(&node.args);
        Ok(())
    }

    pub fn set_directory_defaults(&mut self, dir: impl AsRef<Utf8Path>, args: Args) {
        self.defaults.set(dir, args);
    }

    pub fn default_args_for_directory(&self, path: impl AsRef<Utf8Path>) -> Args {
        self.defaults.for_path(path)
    }

    pub fn defaults(&self) -> &DirectoryDefaults {
        &self.defaults
    }

    /// Top-level node ids in insertion order.
    pub fn tree(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|i| self.graph[i].id.as_ref())
            .collect()
    }

    /// Returns the root listing and every known node id.
    pub fn walk(&self) -> (Vec<&str>, Vec<&str>) {
        let nodes = self
            .graph
            .node_indices()
            .map(|i| self.graph[i].id.as_ref())
            .collect();

        (self.tree(), nodes)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.lookup(id).map(|i| &self.graph[i])
    }

    pub fn args_for_node(&self, id: &str) -> Option<&Args> {
        self.node(id).map(|node| &node.args)
    }

    /// Ids the node depends on, in the order the edges were declared.
    pub fn inputs_for_node(&self, id: &str) -> Vec<&str> {
        let Some(index) = self.lookup(id) else {
            return vec![];
        };

        // petgraph lists the most recently added edge first
        let mut inputs: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|i| self.graph[i].id.as_ref())
            .collect();
        inputs.reverse();
        inputs
    }

    /// Every node, each one listed after all of its inputs.
    ///
    /// Nodes on a cycle are still listed exactly once; detecting the cycle is
    /// left to the scheduler.
    pub fn post_order(&self) -> Vec<&str> {
        let mut starts: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        starts.extend(self.graph.node_indices());

        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut dfs = DfsPostOrder::empty(&self.graph);

        for start in starts {
            if dfs.finished.contains(start.index()) {
                continue;
            }
            dfs.move_to(start);
            while let Some(index) = dfs.next(&self.graph) {
                order.push(self.graph[index].id.as_ref());
            }
        }

        order
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
