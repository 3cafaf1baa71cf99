use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use shiori::{
    Args, Ast, Batch, BatchError, Data, DataStore, Environment, Filter, FilterContext,
    FilterOutput, FilterRegistry, MemoryStore, MemoryTree, RunHistory, START_BATCH_ID, Settings,
    State, TaskError,
};

struct Upper;

impl Filter for Upper {
    fn name(&self) -> &str {
        "Upper"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, _: &FilterContext, input: &Data) -> anyhow::Result<FilterOutput> {
        Ok(FilterOutput::new(input.text().to_uppercase(), input.ext.clone()))
    }
}

/// Counts its invocations.
struct Count(Arc<AtomicUsize>);

impl Filter for Count {
    fn name(&self) -> &str {
        "Count"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, _: &FilterContext, input: &Data) -> anyhow::Result<FilterOutput> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(FilterOutput::new(input.data().to_vec(), ".txt"))
    }
}

/// Joins the outputs of the documents it depends on.
struct Join;

impl Filter for Join {
    fn name(&self) -> &str {
        "Join"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, ctx: &FilterContext, input: &Data) -> anyhow::Result<FilterOutput> {
        let parts: Vec<String> = ctx.inputs.iter().map(Data::text).collect();
        Ok(FilterOutput::new(format!("{}:{}", input.text(), parts.join(",")), ".txt"))
    }
}

struct Fail;

impl Filter for Fail {
    fn name(&self) -> &str {
        "Fail"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, _: &FilterContext, _: &Data) -> anyhow::Result<FilterOutput> {
        anyhow::bail!("this filter always fails")
    }
}

struct Panic;

impl Filter for Panic {
    fn name(&self) -> &str {
        "Panic"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, _: &FilterContext, _: &Data) -> anyhow::Result<FilterOutput> {
        panic!("boom")
    }
}

fn filters() -> FilterRegistry {
    FilterRegistry::new()
        .with(&["up"], Upper)
        .with(&["join"], Join)
        .with(&["fail"], Fail)
        .with(&["panic"], Panic)
}

fn bundles() -> Ast {
    let mut ast = Ast::new();
    for (parent, child) in [
        ("foo", "bar"),
        ("foo", "baz"),
        ("foob", "foobar"),
        ("xyz", "abc"),
        ("xyz", "def"),
    ] {
        ast.add_dependency(parent, child).unwrap();
    }
    ast
}

fn states(batch: &Batch, keys: &[&str]) -> Vec<State> {
    keys.iter().map(|key| batch.state(key).unwrap()).collect()
}

#[test]
fn run_target_exact_match_brings_dependencies() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();
    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();

    batch.run(Some("foo")).unwrap();

    use State::*;
    assert_eq!(
        states(&batch, &["foo", "bar", "baz", "foob", "foobar", "xyz", "abc"]),
        [Complete, Complete, Complete, New, New, New, New]
    );
}

#[test]
fn run_target_prefix_match() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();

    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();
    batch.run(Some("fo")).unwrap();

    use State::*;
    assert_eq!(
        states(&batch, &["foo", "bar", "baz", "foob", "foobar", "xyz"]),
        [Complete, Complete, Complete, Complete, Complete, New]
    );

    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();
    batch.run(Some("ba")).unwrap();
    assert_eq!(
        states(&batch, &["foo", "bar", "baz", "foob"]),
        [New, Complete, Complete, New]
    );

    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();
    batch.run(Some("bar")).unwrap();
    assert_eq!(states(&batch, &["bar", "baz"]), [Complete, New]);
}

#[test]
fn run_without_target_runs_everything() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();
    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();

    let diagnostics = batch.run(None).unwrap();

    assert!(diagnostics.is_success());
    assert_eq!(diagnostics.completed.len(), 8);
    assert!(batch.tasks().iter().all(|t| t.state() == State::Complete));
}

#[test]
fn batch_runs_only_once() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();
    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();

    batch.run(None).unwrap();
    assert!(matches!(batch.run(None), Err(BatchError::AlreadyRun(START_BATCH_ID))));
}

#[test]
fn batch_ids_increase() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();

    let mut first = Batch::new(&env, &history, &bundles()).unwrap();
    assert_eq!(first.id(), START_BATCH_ID);
    assert_eq!(first.previous_batch_id(), None);
    first.run(None).unwrap();

    let second = Batch::new(&env, &history, &bundles()).unwrap();
    assert_eq!(second.id(), START_BATCH_ID + 1);
    assert_eq!(second.previous_batch_id(), Some(START_BATCH_ID));
}

#[test]
fn filter_chain_output_is_recorded() {
    let tree = MemoryTree::new()
        .with("hello.txt", "hello")
        .with("dir/nested.txt", "nested");
    let env = Environment::in_memory(filters(), tree);
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_dependency("all", "hello.txt|up").unwrap();
    ast.add_dependency("all", "dir/nested.txt|up").unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = batch.run(None).unwrap().check().unwrap();
    assert_eq!(diagnostics.completed.len(), 3);

    let document = batch.document("hello.txt|up").unwrap();
    assert_eq!(document.output().unwrap().text(), "HELLO");
    assert_eq!(document.artifacts().len(), 2);

    let data = batch.find_data("hello.txt|up").unwrap();
    assert_eq!(data.text(), "HELLO");
    assert_eq!(data.ext, ".txt");

    let data = history
        .find_data_by_websafe_key("dir--nested.txt|up", env.store.as_ref())
        .unwrap();
    assert_eq!(data.text(), "NESTED");

    let record = history.record("doc:hello.txt|up:1001").unwrap().unwrap();
    assert!(record.is_complete());
    assert_eq!(record.class_name, "Doc");
    assert_eq!(record.hashstring, document.hashstring());
    assert_eq!(record.storage_type.as_deref(), Some("memory"));

    let artifact = history.record("artifact:hello.txt|up:1:1001").unwrap().unwrap();
    assert_eq!(artifact.class_name, "FilterArtifact");
    assert_eq!(artifact.doc_key, "hello.txt|up");
    assert!(artifact.is_complete());

    let bundle = history.record("bundle:all:1001").unwrap().unwrap();
    assert_eq!(bundle.hashstring, None);
    assert!(bundle.is_complete());
}

#[test]
fn unchanged_documents_hit_the_cache() {
    let count = Arc::new(AtomicUsize::new(0));
    let filters = FilterRegistry::new().with(&["count"], Count(count.clone()));
    let env = Environment::in_memory(filters, MemoryTree::new().with("a.txt", "a"));
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("a.txt|count", Args::new()).unwrap();

    let mut first = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = first.run(None).unwrap();
    assert!(diagnostics.cache_hits.is_empty());

    let mut second = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = second.run(None).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(diagnostics.cache_hits.contains("a.txt|count"));
    assert_eq!(
        first.document("a.txt|count").unwrap().hashstring(),
        second.document("a.txt|count").unwrap().hashstring()
    );

    let mermaid = diagnostics.render_mermaid(&second);
    assert!(mermaid.starts_with("graph LR"));
    assert!(mermaid.contains("Cached"));
}

#[test]
fn changed_inputs_invalidate_dependents() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_dependency("report.txt|join", "a.txt|up").unwrap();
    ast.add_dependency("report.txt|join", "b.txt|up").unwrap();

    let tree = MemoryTree::new()
        .with("report.txt", "report")
        .with("a.txt", "a")
        .with("b.txt", "b");
    let env = Environment::in_memory(filters(), tree.clone()).with_store(store.clone());

    let mut first = Batch::new(&env, &history, &ast).unwrap();
    first.run(None).unwrap().check().unwrap();
    let report = first.document("report.txt|join").unwrap();
    assert_eq!(report.output().unwrap().text(), "report:A,B");

    let env = Environment::in_memory(filters(), tree.with("b.txt", "c")).with_store(store);
    let mut second = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = second.run(None).unwrap();

    let report = second.document("report.txt|join").unwrap();
    assert_eq!(report.output().unwrap().text(), "report:A,C");
    assert!(diagnostics.cache_hits.contains("a.txt|up"));
    assert!(!diagnostics.cache_hits.contains("report.txt|join"));
}

#[test]
fn failures_are_isolated() {
    let tree = MemoryTree::new()
        .with("bad.txt", "bad")
        .with("good.txt", "good")
        .with("report.txt", "report");
    let env = Environment::in_memory(filters(), tree);
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_dependency("all", "bad.txt|fail").unwrap();
    ast.add_dependency("all", "good.txt|up").unwrap();
    ast.add_dependency("report.txt|join", "bad.txt|fail").unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = batch.run(None).unwrap();

    assert_eq!(batch.state("good.txt|up"), Some(State::Complete));
    assert_eq!(batch.state("bad.txt|fail"), Some(State::Error));
    assert_eq!(batch.state("report.txt|join"), Some(State::Error));
    assert_eq!(batch.state("all"), Some(State::Error));

    assert!(diagnostics.failed.contains_key("doc:bad.txt|fail"));
    assert!(diagnostics.unreachable.contains("doc:report.txt|join"));
    assert!(diagnostics.unreachable.contains("bundle:all"));
    assert!(matches!(
        batch.task("report.txt|join").unwrap().error(),
        Some(TaskError::DependencyFailed { .. })
    ));
    assert!(matches!(
        batch.task("bad.txt|fail").unwrap().error(),
        Some(TaskError::Filter { .. })
    ));

    // the failing artifact never completes
    let record = history.record("artifact:bad.txt|fail:1:1001").unwrap().unwrap();
    assert!(!record.is_complete());

    assert!(matches!(diagnostics.check(), Err(BatchError::Failed(_))));
}

#[test]
fn panicking_filter_fails_its_task_only() {
    let tree = MemoryTree::new().with("a.txt", "a").with("b.txt", "b");
    let env = Environment::in_memory(filters(), tree);
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("a.txt|panic", Args::new()).unwrap();
    ast.add_node("b.txt|up", Args::new()).unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = batch.run(None).unwrap();

    let error = diagnostics.failed.get("doc:a.txt|panic").unwrap();
    assert!(error.to_string().contains("boom"));
    assert_eq!(batch.state("b.txt|up"), Some(State::Complete));
    assert!(batch.document("a.txt|panic").is_some());
}

#[test]
fn unknown_filter_fails_during_populate() {
    let env = Environment::in_memory(filters(), MemoryTree::new().with("a.txt", "a"));
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("a.txt|nope", Args::new()).unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = batch.run(None).unwrap();

    let error = diagnostics.failed.get("doc:a.txt|nope").unwrap();
    assert!(error.inner().is_user_error());
    assert!(error.to_string().contains("Note that only 4 filters are available"));
    assert_eq!(history.len().unwrap(), 0);
}

#[test]
fn cycles_are_rejected() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_dependency("a.txt", "b.txt").unwrap();
    ast.add_dependency("b.txt", "a.txt").unwrap();
    ast.add_dependency("all", "a.txt").unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    assert!(matches!(batch.run(None), Err(BatchError::Cycle(_))));
}

#[test]
fn cancelled_batch_launches_nothing() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();
    let mut batch = Batch::new(&env, &history, &bundles()).unwrap();

    batch.cancel_token().cancel();
    let diagnostics = batch.run(None).unwrap();

    assert_eq!(diagnostics.unlaunched.len(), 8);
    assert!(!diagnostics.is_success());
    assert_eq!(batch.state("foo"), Some(State::Populated));
    assert_eq!(history.len().unwrap(), 0);
}

#[test]
fn inline_contents_are_not_stored() {
    let env = Environment::in_memory(filters(), MemoryTree::new());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("virtual.txt|up", Args::new().with("contents", "hi"))
        .unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    let document = batch.document("virtual.txt|up").unwrap();
    assert_eq!(document.output().unwrap().text(), "HI");
    assert!(document.artifacts()[0].is_virtual());

    let args = history
        .record("doc:virtual.txt|up:1001")
        .unwrap()
        .unwrap()
        .parsed_args()
        .unwrap();
    assert!(!args.contains("contents"));
    assert_eq!(
        args.get_str("contentshash"),
        document.contents_hash().map(|h| h.to_hex()).as_deref()
    );
    assert_eq!(args.get_str("data-class-alias"), Some("generic"));
}

#[test]
fn single_worker_pool_completes() {
    let tree = MemoryTree::new()
        .with("a.txt", "a")
        .with("b.txt", "b")
        .with("c.txt", "c");
    let env = Environment::in_memory(filters(), tree).with_settings(Settings::default().with_workers(1));
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_dependency("c.txt|join", "a.txt|up").unwrap();
    ast.add_dependency("c.txt|join", "b.txt|up").unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    assert_eq!(
        batch.document("c.txt|join").unwrap().output().unwrap().text(),
        "c:A,B"
    );
}

fn python_tree() -> MemoryTree {
    MemoryTree::new()
        .with("config.txt", "config")
        .with("src/a.py", "a")
        .with("src/b.py", "b")
        .with("src/skip_c.py", "c")
        .with("docs/readme.md", "readme")
}

#[test]
fn pattern_expands_matching_files() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("*.py|up", Args::new().with("except", "skip_"))
        .unwrap();
    ast.set_directory_defaults("src", Args::new().with("title", "Source"));

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    let a = batch.task("src/a.py|up").unwrap();
    assert_eq!(a.created_by(), Some("pattern:*.py|up"));
    assert_eq!(a.state(), State::Complete);
    assert_eq!(a.args().get_str("title"), Some("Source"));
    assert_eq!(a.args().get_str("except"), Some("skip_"));
    assert_eq!(batch.document("src/b.py|up").unwrap().output().unwrap().text(), "B");

    assert!(batch.task("src/skip_c.py|up").is_none());
    assert!(batch.task("docs/readme.md|up").is_none());

    let pattern = batch.task("*.py|up").unwrap();
    assert_eq!(pattern.children().len(), 2);
    assert_eq!(pattern.state(), State::Complete);

    let children = batch.children_in_previous_batch("*.py|up").unwrap();
    assert!(children.is_empty());
}

#[test]
fn pattern_without_recursion_skips_subdirectories() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("*.py|up", Args::new().with("recurse", false))
        .unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    assert_eq!(batch.len(), 1);
    assert!(batch.task("*.py|up").unwrap().children().is_empty());
}

#[test]
fn pattern_depends_links_earlier_tasks() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("config.txt|up", Args::new()).unwrap();
    ast.add_node("*.py|up", Args::new().with("depends", true))
        .unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    let config = batch.task("config.txt|up").unwrap().id();
    let a = batch.task("src/a.py|up").unwrap();
    assert!(a.children().contains(&config));
    assert!(!a.args().contains("depends"));
}

#[test]
fn pattern_changes_between_batches() {
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("*.py|up", Args::new()).unwrap();

    let tree = MemoryTree::new().with("a.py", "a").with("b.py", "b");
    let env = Environment::in_memory(filters(), tree);
    let mut first = Batch::new(&env, &history, &ast).unwrap();
    first.run(None).unwrap();
    assert!(first.pattern_changes().is_empty());

    let tree = MemoryTree::new().with("a.py", "a").with("c.py", "c");
    let env = Environment::in_memory(filters(), tree);
    let mut second = Batch::new(&env, &history, &ast).unwrap();
    second.run(None).unwrap();

    let changes = &second.pattern_changes()["pattern:*.py|up"];
    assert_eq!(changes.added, ["c.py|up"]);
    assert_eq!(changes.removed, ["b.py|up"]);

    let previous: Vec<_> = second
        .children_in_previous_batch("*.py|up")
        .unwrap()
        .into_iter()
        .filter(|record| record.class_name == "Doc")
        .map(|record| record.key)
        .collect();
    assert_eq!(previous, ["a.py|up", "b.py|up"]);
}

#[test]
fn history_survives_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state/history.sqlite3");
    let path = path.to_str().unwrap();

    let env = Environment::in_memory(filters(), MemoryTree::new().with("a.txt", "a"));
    let mut ast = Ast::new();
    ast.add_node("a.txt|up", Args::new()).unwrap();

    {
        let history = RunHistory::open(path).unwrap();
        let mut batch = Batch::new(&env, &history, &ast).unwrap();
        batch.run(None).unwrap().check().unwrap();
    }

    let history = RunHistory::open(path).unwrap();
    assert_eq!(history.next_batch_id().unwrap(), START_BATCH_ID + 1);

    let record = history.record("doc:a.txt|up:1001").unwrap().unwrap();
    assert!(record.is_complete());
    assert_eq!(record.batch_id, START_BATCH_ID);

    let records = history.query_like("a.txt").unwrap();
    assert_eq!(records.len(), 3);
}

#[test]
fn pattern_documents_can_be_targeted() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("*.py|up", Args::new()).unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    let diagnostics = batch.run(Some("src/a.py|up")).unwrap().check().unwrap();

    assert_eq!(batch.state("src/a.py|up"), Some(State::Complete));
    assert_eq!(batch.state("src/b.py|up"), Some(State::New));
    assert_eq!(batch.state("*.py|up"), Some(State::New));
    assert_eq!(diagnostics.completed.len(), 1);
    assert_eq!(
        batch.document("src/a.py|up").unwrap().output().unwrap().text(),
        "A"
    );
}

#[test]
fn pattern_target_prefix_reaches_documents() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("*.py|up", Args::new().with("except", "skip_"))
        .unwrap();

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(Some("src/")).unwrap().check().unwrap();

    use State::*;
    assert_eq!(
        states(&batch, &["src/a.py|up", "src/b.py|up", "*.py|up"]),
        [Complete, Complete, New]
    );
}

#[test]
fn pattern_explicit_args_win_over_directory_defaults() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("*.py|up", Args::new().with("title", "Explicit"))
        .unwrap();
    ast.set_directory_defaults("src", Args::new().with("title", "Source").with("lang", "py"));

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    let a = batch.task("src/a.py|up").unwrap();
    assert_eq!(a.args().get_str("title"), Some("Explicit"));
    assert_eq!(a.args().get_str("lang"), Some("py"));
    assert_eq!(batch.document("src/a.py|up").unwrap().title(), "Explicit");
}

#[test]
fn pattern_depends_from_directory_defaults() {
    let env = Environment::in_memory(filters(), python_tree());
    let history = RunHistory::in_memory().unwrap();

    let mut ast = Ast::new();
    ast.add_node("config.txt|up", Args::new()).unwrap();
    ast.add_node("*.py|up", Args::new()).unwrap();
    ast.set_directory_defaults("src", Args::new().with("depends", true));

    let mut batch = Batch::new(&env, &history, &ast).unwrap();
    batch.run(None).unwrap().check().unwrap();

    let config = batch.task("config.txt|up").unwrap().id();
    let a = batch.task("src/a.py|up").unwrap();
    assert!(a.children().contains(&config));
    assert!(!a.args().contains("depends"));
}
