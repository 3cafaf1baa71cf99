//! Persistent record of every task execution.
//!
//! One row per task per batch, keyed by `"{key}:{batch}"`. A row is inserted
//! when a task starts and patched in place when it finishes, so history only
//! ever grows and never holds two rows for one task run.

use std::fs;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use crate::core::{Args, Hash32};
use crate::data::{Data, DataSpec, DataStore};
use crate::error::HistoryError;

/// Batch id handed out when the history is empty.
pub const START_BATCH_ID: i64 = 1001;

/// Class names recorded for artifacts, as opposed to tasks.
pub const INITIAL_ARTIFACT: &str = "InitialArtifact";
pub const FILTER_ARTIFACT: &str = "FilterArtifact";

const FIELDS: &[(&str, &str)] = &[
    ("unique_key", "text primary key"),
    ("batch_id", "integer"),
    ("key", "text"),
    ("args", "text"),
    ("doc_key", "text"),
    ("class_name", "text"),
    ("hashstring", "text"),
    ("ext", "text"),
    ("data_type", "text"),
    ("storage_type", "text"),
    ("created_by_doc", "text"),
    ("started_at", "timestamp"),
    ("completed_at", "timestamp"),
];

/// Row written when a task starts.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub unique_key: String,
    pub batch_id: i64,
    pub key: String,
    pub doc_key: String,
    pub class_name: String,
    pub created_by_doc: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Fields filled in once a task has finished.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    /// Serialized arguments, see [`serialize_task_args`].
    pub args: String,
    pub hashstring: Option<Hash32>,
    pub ext: Option<String>,
    pub data_type: Option<String>,
    pub storage_type: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// A full row of the history table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub unique_key: String,
    pub batch_id: i64,
    pub key: String,
    pub args: Option<String>,
    pub doc_key: String,
    pub class_name: String,
    pub hashstring: Option<Hash32>,
    pub ext: Option<String>,
    pub data_type: Option<String>,
    pub storage_type: Option<String>,
    pub created_by_doc: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let hashstring: Option<String> = row.get("hashstring")?;

        Ok(Self {
            unique_key: row.get("unique_key")?,
            batch_id: row.get("batch_id")?,
            key: row.get("key")?,
            args: row.get("args")?,
            doc_key: row.get("doc_key")?,
            class_name: row.get("class_name")?,
            hashstring: hashstring.and_then(|s| s.parse().ok()),
            ext: row.get("ext")?,
            data_type: row.get("data_type")?,
            storage_type: row.get("storage_type")?,
            created_by_doc: row.get("created_by_doc")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// Deserialized arguments, empty for runs which never completed.
    pub fn parsed_args(&self) -> Result<Args, HistoryError> {
        let Some(args) = &self.args else {
            return Ok(Args::new());
        };
        serde_json::from_str(args).map_err(|e| HistoryError::Deserialize(self.key.clone(), e))
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Serializes task arguments for the history.
///
/// Inline `contents` are never stored. When they were present, the hash of
/// the contents and the data class are recorded in their place.
pub fn serialize_task_args(
    key: &str,
    args: &Args,
    contents: Option<(Hash32, &str)>,
) -> Result<String, HistoryError> {
    let mut stored = args.without(&["contents"]);

    if args.contains("contents")
        && let Some((hash, data_class)) = contents
    {
        stored = stored
            .with("contentshash", Value::String(hash.to_hex()))
            .with("data-class-alias", Value::String(data_class.to_string()));
    }

    stored
        .to_canonical_json()
        .map_err(|e| HistoryError::Serialize(key.to_string(), e))
}

/// SQLite backed run history.
///
/// The connection sits behind a mutex, the batch scheduler is the only
/// writer in practice.
pub struct RunHistory {
    conn: Mutex<Connection>,
}

impl RunHistory {
    /// Opens (or creates) the database at `path`, creating missing parent
    /// directories.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, HistoryError> {
        let history = Self {
            conn: Mutex::new(conn),
        };
        history.create_table()?;
        Ok(history)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates the `tasks` table. An existing table is fine, any other
    /// failure is returned.
    pub fn create_table(&self) -> Result<(), HistoryError> {
        let fields: Vec<String> = FIELDS.iter().map(|(k, t)| format!("{k} {t}")).collect();
        let sql = format!("create table tasks ({})", fields.join(", "));

        match self.conn().execute(&sql, []) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(_, Some(msg)))
                if msg == "table tasks already exists" =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_record(&self, start: &RunStart) -> Result<(), HistoryError> {
        self.conn().execute(
            "insert into tasks (batch_id, class_name, created_by_doc, doc_key, key, started_at, unique_key)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                start.batch_id,
                start.class_name,
                start.created_by_doc,
                start.doc_key,
                start.key,
                start.started_at,
                start.unique_key,
            ],
        )?;
        Ok(())
    }

    pub fn update_record(&self, unique_key: &str, done: &RunCompletion) -> Result<(), HistoryError> {
        let changed = self.conn().execute(
            "update tasks set args=?1, completed_at=?2, data_type=?3, ext=?4, hashstring=?5, storage_type=?6
             where unique_key=?7",
            params![
                done.args,
                done.completed_at,
                done.data_type,
                done.ext,
                done.hashstring.map(Hash32::to_hex).unwrap_or_default(),
                done.storage_type,
                unique_key,
            ],
        )?;

        match changed {
            0 => Err(HistoryError::MissingRecord(unique_key.to_string())),
            _ => Ok(()),
        }
    }

    pub fn record(&self, unique_key: &str) -> Result<Option<RunRecord>, HistoryError> {
        let record = self
            .conn()
            .query_row(
                "select * from tasks where unique_key = ?1",
                [unique_key],
                RunRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Up to `n` unique keys recorded in `batch_id`.
    pub fn all_in_batch(&self, batch_id: i64, n: usize) -> Result<Vec<String>, HistoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("select unique_key from tasks where batch_id = ?1 limit ?2")?;
        let keys = stmt
            .query_map(params![batch_id, n as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(keys)
    }

    /// Records of the most recent batch whose key contains `query`.
    pub fn query_like(&self, query: &str) -> Result<Vec<RunRecord>, HistoryError> {
        let Some(batch_id) = self.max_batch_id()? else {
            return Ok(vec![]);
        };

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "select * from tasks where batch_id = ?1 and instr(key, ?2) > 0 order by started_at",
        )?;
        let records = stmt
            .query_map(params![batch_id, query], RunRecord::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }

    /// Rebuilds the output handle of the document `doc_key` from its most
    /// recent recorded run.
    pub fn find_data_by_doc_key(
        &self,
        doc_key: &str,
        store: &dyn DataStore,
    ) -> Result<Data, HistoryError> {
        let row = self
            .conn()
            .query_row(
                "select data_type, key, ext, hashstring, args, storage_type from tasks
                 where key = ?1 and doc_key = ?1 and class_name in (?2, ?3) and completed_at is not null
                 order by batch_id desc, class_name = ?3 desc
                 limit 1",
                params![doc_key, INITIAL_ARTIFACT, FILTER_ARTIFACT],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((data_type, key, ext, hashstring, args, storage_type)) = row else {
            return Err(HistoryError::MissingData(doc_key.to_string()));
        };

        let hashstring = hashstring.unwrap_or_default();
        let hash = hashstring
            .parse::<Hash32>()
            .map_err(|_| HistoryError::Hashstring(hashstring.clone()))?;

        let args = match args {
            Some(args) => serde_json::from_str(&args)
                .map_err(|e| HistoryError::Deserialize(key.clone(), e))?,
            None => Args::new(),
        };

        let spec = DataSpec {
            data_type: data_type.unwrap_or_else(|| crate::data::GENERIC.to_string()),
            key,
            ext: ext.unwrap_or_default(),
            hash,
            args,
            storage_type: storage_type.unwrap_or_default(),
        };

        Ok(store.retrieve(&spec)?)
    }

    /// Same as [`find_data_by_doc_key`](Self::find_data_by_doc_key), for keys
    /// where `/` was replaced with `--`.
    pub fn find_data_by_websafe_key(
        &self,
        websafe_key: &str,
        store: &dyn DataStore,
    ) -> Result<Data, HistoryError> {
        self.find_data_by_doc_key(&websafe_key.replace("--", "/"), store)
    }

    pub fn max_batch_id(&self) -> Result<Option<i64>, HistoryError> {
        let id = self
            .conn()
            .query_row("select max(batch_id) from tasks", [], |row| row.get(0))?;
        Ok(id)
    }

    pub fn next_batch_id(&self) -> Result<i64, HistoryError> {
        Ok(match self.max_batch_id()? {
            Some(id) => id + 1,
            None => START_BATCH_ID,
        })
    }

    /// The most recent batch before `current`.
    pub fn previous_batch_id(&self, current: i64) -> Result<Option<i64>, HistoryError> {
        let id = self.conn().query_row(
            "select max(batch_id) from tasks where batch_id < ?1",
            [current],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Records created by `created_by` in `batch_id`, ordered by document
    /// key, then start time.
    pub fn children_in_batch(
        &self,
        batch_id: i64,
        created_by: &str,
    ) -> Result<Vec<RunRecord>, HistoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "select * from tasks where batch_id = ?1 and created_by_doc = ?2 order by doc_key, started_at",
        )?;
        let records = stmt
            .query_map(params![batch_id, created_by], RunRecord::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }

    /// Number of rows, across all batches.
    pub fn len(&self) -> Result<usize, HistoryError> {
        let n: i64 = self
            .conn()
            .query_row("select count(*) from tasks", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;

    fn start(key: &str, batch_id: i64) -> RunStart {
        RunStart {
            unique_key: format!("doc:{key}:{batch_id}"),
            batch_id,
            key: key.to_string(),
            doc_key: key.to_string(),
            class_name: "Doc".to_string(),
            created_by_doc: None,
            started_at: Utc::now(),
        }
    }

    fn completion(hash: Option<Hash32>) -> RunCompletion {
        RunCompletion {
            args: "{}".to_string(),
            hashstring: hash,
            ext: Some(".txt".to_string()),
            data_type: Some("generic".to_string()),
            storage_type: Some("memory".to_string()),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_then_update_is_one_row() {
        let history = RunHistory::in_memory().unwrap();
        let hash = Hash32::hash(b"abc");

        history.create_record(&start("abc.txt", 1001)).unwrap();
        history
            .update_record("doc:abc.txt:1001", &completion(Some(hash)))
            .unwrap();

        assert_eq!(history.len().unwrap(), 1);
        let record = history.record("doc:abc.txt:1001").unwrap().unwrap();
        assert_eq!(record.hashstring, Some(hash));
        assert_eq!(record.ext.as_deref(), Some(".txt"));
        assert!(record.is_complete());
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let history = RunHistory::in_memory().unwrap();
        history.create_record(&start("abc.txt", 1001)).unwrap();

        assert!(history.create_record(&start("abc.txt", 1001)).is_err());
    }

    #[test]
    fn test_update_missing_record() {
        let history = RunHistory::in_memory().unwrap();
        let err = history.update_record("nope:1", &completion(None)).unwrap_err();

        assert!(matches!(err, HistoryError::MissingRecord(_)));
    }

    #[test]
    fn test_create_table_idempotent() {
        let history = RunHistory::in_memory().unwrap();
        history.create_table().unwrap();
        history.create_table().unwrap();
    }

    #[test]
    fn test_batch_ids() {
        let history = RunHistory::in_memory().unwrap();
        assert_eq!(history.max_batch_id().unwrap(), None);
        assert_eq!(history.next_batch_id().unwrap(), START_BATCH_ID);

        history.create_record(&start("a.txt", 1001)).unwrap();
        history.create_record(&start("a.txt", 1004)).unwrap();

        assert_eq!(history.next_batch_id().unwrap(), 1005);
        assert_eq!(history.previous_batch_id(1004).unwrap(), Some(1001));
        assert_eq!(history.previous_batch_id(1001).unwrap(), None);
        assert_eq!(history.all_in_batch(1004, 10).unwrap(), vec!["doc:a.txt:1004"]);
    }

    #[test]
    fn test_query_like_latest_batch_only() {
        let history = RunHistory::in_memory().unwrap();
        history.create_record(&start("hello.py", 1001)).unwrap();
        history.create_record(&start("hello.py", 1002)).unwrap();
        history.create_record(&start("other.txt", 1002)).unwrap();

        let found = history.query_like("ello").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].batch_id, 1002);
    }

    #[test]
    fn test_children_ordered_by_doc_key() {
        let history = RunHistory::in_memory().unwrap();
        for key in ["b.py", "a.py", "c.py"] {
            let mut run = start(key, 1001);
            run.created_by_doc = Some("pattern:*.py".to_string());
            history.create_record(&run).unwrap();
        }
        history.create_record(&start("d.py", 1001)).unwrap();

        let keys: Vec<_> = history
            .children_in_batch(1001, "pattern:*.py")
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["a.py", "b.py", "c.py"]);
    }

    #[test]
    fn test_find_data_by_websafe_key() {
        let history = RunHistory::in_memory().unwrap();
        let store = MemoryStore::new();
        let hash = Hash32::hash(b"out");

        let mut data = Data::new("src/a.py|up", ".txt", hash);
        data.set_data(b"OUT".to_vec());
        store.store(&data).unwrap();

        let mut run = start("src/a.py|up", 1001);
        run.unique_key = "artifact:src/a.py|up:1001".to_string();
        run.class_name = FILTER_ARTIFACT.to_string();
        history.create_record(&run).unwrap();
        history
            .update_record("artifact:src/a.py|up:1001", &completion(Some(hash)))
            .unwrap();

        let found = history.find_data_by_websafe_key("src--a.py|up", &store).unwrap();
        assert_eq!(found.text(), "OUT");
        assert_eq!(found.ext, ".txt");

        assert!(matches!(
            history.find_data_by_doc_key("missing.py", &store),
            Err(HistoryError::MissingData(_))
        ));
    }

    #[test]
    fn test_serialize_task_args() {
        let args = Args::new().with("contents", "hello").with("foo", "bar");
        let hash = Hash32::hash(b"hello");

        let json = serialize_task_args("a.txt", &args, Some((hash, "generic"))).unwrap();
        let parsed: Args = serde_json::from_str(&json).unwrap();

        assert!(!parsed.contains("contents"));
        assert_eq!(parsed.get_str("contentshash"), Some(hash.to_hex().as_str()));
        assert_eq!(parsed.get_str("data-class-alias"), Some("generic"));

        let plain = serialize_task_args("b.txt", &Args::new().with("x", 1), None).unwrap();
        assert_eq!(plain, r#"{"x":1}"#);
    }
}
