//! Corruption detection, backup and recovery.
//!
//! Recovery works at table granularity: `retrieve` rebuilds the database
//! from whatever each source still yields, where the sources are the
//! current file, its backup copy and every deposited generation.

use crate::database::{Database, lock, remove_path};
use crate::operation::HandleOperation;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use wcdb_core::{ConfigError, Error, Result, quote_ident, quote_literal};
use wcdb_sqlite::{SqliteConnection, backup_database};

/// Called once, on a background thread, when corruption is detected.
pub type CorruptionNotification = Arc<dyn Fn(&Database) + Send + Sync>;
/// Decides which tables a backup keeps.
pub type BackupFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

const SOURCE_SCHEMA: &str = "wcdb_retrieve_source";
const BACKUP_PAGES_PER_STEP: i32 = 128;

#[derive(Default)]
pub(crate) struct RepairState {
    corrupted: bool,
    notified: bool,
    notification: Option<CorruptionNotification>,
    filter: Option<BackupFilter>,
    auto_backup: bool,
    last_backup: Option<Instant>,
    backup_running: bool,
}

/// A database file and its backup copy, either of which may be missing.
#[derive(Debug)]
struct SourceGroup {
    database: Option<PathBuf>,
    material: Option<PathBuf>,
}

impl SourceGroup {
    fn new(database: PathBuf, material: PathBuf) -> Self {
        Self {
            database: database.exists().then_some(database),
            material: material.exists().then_some(material),
        }
    }

    fn sources(&self) -> impl Iterator<Item = &Path> {
        self.database.iter().chain(self.material.iter()).map(PathBuf::as_path)
    }
}

fn memory_unsupported(operation: &str) -> Error {
    Error::Config(ConfigError {
        message: format!("{} is not supported for in-memory databases", operation),
    })
}

/// Run `f` with the database at `path` attached to `target`.
fn with_attached<T>(
    target: &SqliteConnection,
    path: &Path,
    f: impl FnOnce(&SqliteConnection) -> Result<T>,
) -> Result<T> {
    target.execute_raw(&format!(
        "ATTACH DATABASE {} AS {}",
        quote_literal(&path.to_string_lossy()),
        SOURCE_SCHEMA
    ))?;
    let result = f(target);
    if let Err(err) = target.execute_raw(&format!("DETACH DATABASE {}", SOURCE_SCHEMA)) {
        tracing::warn!(error = %err, "detach failed");
    }
    result
}

fn attached_table_sql(conn: &SqliteConnection, kind: &str, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT sql FROM {}.sqlite_master WHERE type = ?1 AND tbl_name = ?2 AND sql IS NOT NULL",
        SOURCE_SCHEMA
    ))?;
    stmt.bind_text(kind, 1)?;
    stmt.bind_text(table, 2)?;
    Ok(stmt
        .get_one_column()?
        .into_iter()
        .map(|v| v.to_text().into_owned())
        .collect())
}

/// Copy every readable row of `table` from `source` into `target`,
/// creating the table (and, best effort, its indexes) when missing.
fn copy_table(target: &SqliteConnection, source: &Path, table: &str) -> Result<()> {
    with_attached(target, source, |conn| {
        if !conn.table_exists(table)? {
            let create = attached_table_sql(conn, "table", table)?;
            let Some(sql) = create.first() else {
                return Err(Error::Config(ConfigError {
                    message: format!("table {} not found in {}", table, source.display()),
                }));
            };
            conn.execute_raw(sql)?;
            for index in attached_table_sql(conn, "index", table).unwrap_or_default() {
                if let Err(err) = conn.execute_raw(&index) {
                    tracing::debug!(error = %err, table, "index not copied");
                }
            }
        }
        let q = quote_ident(table);
        conn.execute_raw(&format!(
            "INSERT OR IGNORE INTO main.{q} SELECT * FROM {}.{q}",
            SOURCE_SCHEMA
        ))
    })
}

fn deposit_indices(dir: &Path) -> io::Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

impl Database {
    fn file_name(&self) -> String {
        Path::new(self.path())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    // ==================== Corruption ====================

    pub fn set_notification_when_corrupted(&self, notification: Option<CorruptionNotification>) {
        lock(&self.inner.repair).notification = notification;
    }

    /// Run an integrity check; notifies when the database is damaged.
    pub fn check_if_corrupted(&self) -> bool {
        let result = self
            .get_handle(false)
            .get_one_column_from_statement("PRAGMA quick_check", &[]);
        match result {
            Ok(values) => {
                let healthy = values.len() == 1 && values[0].to_text() == "ok";
                if !healthy {
                    tracing::warn!(path = %self.path(), problems = values.len(), "integrity check failed");
                    self.mark_corrupted();
                }
            }
            Err(err) if err.is_corruption() => self.mark_corrupted(),
            Err(err) => {
                tracing::debug!(error = %err, path = %self.path(), "integrity check did not run");
            }
        }
        self.check_if_is_already_corrupted()
    }

    /// Has corruption been detected since the last successful retrieve?
    pub fn check_if_is_already_corrupted(&self) -> bool {
        lock(&self.inner.repair).corrupted
    }

    pub(crate) fn mark_corrupted(&self) {
        let notification = {
            let mut state = lock(&self.inner.repair);
            state.corrupted = true;
            if state.notified {
                None
            } else {
                state.notified = state.notification.is_some();
                state.notification.clone()
            }
        };
        tracing::warn!(path = %self.path(), "database corrupted");
        if let Some(notification) = notification {
            let database = self.clone();
            let spawned = thread::Builder::new()
                .name("wcdb-corruption".into())
                .spawn(move || notification(&database));
            if let Err(err) = spawned {
                tracing::warn!(error = %err, "corruption notification not delivered");
            }
        }
    }

    // ==================== Backup ====================

    /// Keep only the tables `filter` accepts in future backups.
    pub fn filter_backup(&self, filter: Option<BackupFilter>) {
        lock(&self.inner.repair).filter = filter;
    }

    /// Back up after committed write transactions, at most once per
    /// `DatabaseConfig::auto_backup_interval`.
    pub fn enable_auto_backup(&self, enable: bool) {
        lock(&self.inner.repair).auto_backup = enable;
    }

    /// Copy the database to its backup file while it stays in use.
    ///
    /// The copy is written next to the backup file and renamed over it
    /// once complete.
    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path()))]
    pub fn backup(&self) -> Result<()> {
        if self.is_in_memory() {
            return Err(memory_unsupported("backup"));
        }
        let _maintenance = self.inner.maintenance_lock();
        let material = self.material_path();
        let partial = format!("{}.tmp", material);
        remove_path(Path::new(&partial))?;

        let source = self.inner.open_unpooled(None)?;
        let dest = self.inner.open_unpooled(Some(&partial))?;
        backup_database(&source, "main", &dest, BACKUP_PAGES_PER_STEP, |_| true)?;
        drop(source);
        dest.execute_raw("PRAGMA journal_mode = DELETE")?;

        let filter = lock(&self.inner.repair).filter.clone();
        if let Some(filter) = filter {
            for table in dest.table_names("main")? {
                if !filter(&table) {
                    dest.execute_raw(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table)))?;
                    tracing::debug!(table = %table, "table left out of backup");
                }
            }
        }
        drop(dest);

        fs::rename(&partial, &material)?;
        lock(&self.inner.repair).last_backup = Some(Instant::now());
        tracing::debug!(to = %material, "backup written");
        Ok(())
    }

    /// Schedule an automatic backup if one is enabled and due.
    pub(crate) fn on_write_committed(&self) {
        {
            let mut state = lock(&self.inner.repair);
            if !state.auto_backup || state.backup_running {
                return;
            }
            let interval = self.inner.config.auto_backup_interval;
            if state.last_backup.is_some_and(|last| last.elapsed() < interval) {
                return;
            }
            state.backup_running = true;
            state.last_backup = Some(Instant::now());
        }

        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("wcdb-backup".into())
            .spawn(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let database = Database::from_inner(inner);
                if let Err(err) = database.backup() {
                    tracing::warn!(error = %err, path = %database.path(), "automatic backup failed");
                }
                lock(&database.inner.repair).backup_running = false;
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "automatic backup not started");
            lock(&self.inner.repair).backup_running = false;
        }
    }

    // ==================== Deposit ====================

    /// Move the database and its backup aside into a new numbered
    /// directory under the deposit directory. The database starts over
    /// empty; `retrieve` merges the deposited data back.
    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path()))]
    pub fn deposit(&self) -> Result<()> {
        if self.is_in_memory() {
            return Err(memory_unsupported("deposit"));
        }
        self.run_exclusively("deposit", || {
            let dir = self.deposited_dir();
            let next = deposit_indices(&dir)?.last().map_or(0, |last| last + 1);
            let target = dir.join(next.to_string());
            fs::create_dir_all(&target)?;

            let main = PathBuf::from(self.path());
            let mut moved = 0;
            for path in self.paths() {
                if path == dir || !path.exists() {
                    continue;
                }
                if let Some(name) = path.file_name() {
                    fs::rename(&path, target.join(name))?;
                    moved += 1;
                }
            }
            tracing::debug!(from = %main.display(), to = %target.display(), moved, "database deposited");
            Ok(())
        })
    }

    pub fn contain_deposited_files(&self) -> bool {
        deposit_indices(&self.deposited_dir()).is_ok_and(|indices| !indices.is_empty())
    }

    pub fn remove_deposited_files(&self) -> Result<()> {
        self.run_exclusively("remove deposited files", || {
            remove_path(&self.deposited_dir())?;
            Ok(())
        })
    }

    // ==================== Retrieve ====================

    /// Current files first, then deposited generations newest first.
    fn retrieve_sources(&self) -> Result<Vec<SourceGroup>> {
        let mut groups = vec![SourceGroup::new(
            PathBuf::from(self.path()),
            PathBuf::from(self.material_path()),
        )];
        let name = self.file_name();
        let dir = self.deposited_dir();
        for index in deposit_indices(&dir)?.into_iter().rev() {
            let generation = dir.join(index.to_string());
            groups.push(SourceGroup::new(
                generation.join(&name),
                generation.join(format!("{}{}", name, crate::database::MATERIAL_SUFFIX)),
            ));
        }
        groups.retain(|g| g.database.is_some() || g.material.is_some());
        Ok(groups)
    }

    /// Tables of the first source in `group` that can be listed.
    fn group_tables(target: &SqliteConnection, group: &SourceGroup) -> Vec<String> {
        for source in group.sources() {
            match with_attached(target, source, |conn| conn.table_names(SOURCE_SCHEMA)) {
                Ok(tables) => return tables,
                Err(err) => {
                    tracing::debug!(error = %err, source = %source.display(), "source unreadable");
                }
            }
        }
        Vec::new()
    }

    /// Rebuild the database from its files, backup and deposited
    /// generations, table by table.
    ///
    /// Each table of each generation is copied from the database file, or
    /// from the backup when the file cannot provide it. `progress` receives
    /// `(fraction_done, increment)` after every table; returning `false`
    /// abandons the retrieve with `Error::Cancelled` and leaves the files
    /// untouched. Returns the fraction of tables recovered.
    #[tracing::instrument(level = "debug", skip(self, progress), fields(path = %self.path()))]
    pub fn retrieve<F>(&self, mut progress: F) -> Result<f64>
    where
        F: FnMut(f64, f64) -> bool,
    {
        if self.is_in_memory() {
            return Err(memory_unsupported("retrieve"));
        }
        self.run_exclusively("retrieve", || {
            let groups = self.retrieve_sources()?;
            let rebuilt = format!("{}.retrieve", self.path());
            remove_path(Path::new(&rebuilt))?;
            let target = self.inner.open_unpooled(Some(&rebuilt))?;

            let plan: Vec<(&SourceGroup, Vec<String>)> = groups
                .iter()
                .map(|group| (group, Self::group_tables(&target, group)))
                .collect();
            let total: usize = plan.iter().map(|(_, tables)| tables.len()).sum();
            let increment = if total == 0 { 1.0 } else { 1.0 / total as f64 };

            let mut done = 0;
            let mut recovered = 0;
            for (group, tables) in &plan {
                for table in tables {
                    let copied = group.sources().any(|source| match copy_table(&target, source, table) {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::debug!(error = %err, table = %table, source = %source.display(), "table not copied");
                            false
                        }
                    });
                    done += 1;
                    if copied {
                        recovered += 1;
                    }
                    if !progress(done as f64 * increment, increment) {
                        drop(target);
                        remove_path(Path::new(&rebuilt))?;
                        tracing::debug!("retrieve abandoned");
                        return Err(Error::Cancelled);
                    }
                }
            }
            drop(target);

            for path in self.paths().iter().take(4) {
                remove_path(path)?;
            }
            fs::rename(&rebuilt, self.path())?;
            {
                let mut state = lock(&self.inner.repair);
                state.corrupted = false;
                state.notified = false;
            }
            let score = if total == 0 { 1.0 } else { recovered as f64 / total as f64 };
            tracing::debug!(score, tables = total, "retrieve finished");
            Ok(score)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wcdb_core::Value;

    fn seeded(dir: &Path) -> Database {
        let mut db = Database::new(dir.join("main.db"));
        db.execute("CREATE TABLE a (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.execute("CREATE TABLE b (id INTEGER PRIMARY KEY)").unwrap();
        db.insert_rows(
            &[vec![Value::from(1), Value::from("x")], vec![Value::from(2), Value::from("y")]],
            &["id", "v"],
            "a",
        )
        .unwrap();
        db.insert_row(vec![Value::from(1)], &["id"], "b").unwrap();
        db
    }

    fn count(db: &mut Database, table: &str) -> i64 {
        db.get_value_from_statement(&format!("SELECT count(*) FROM {}", table), &[])
            .unwrap()
            .map_or(-1, |v| v.as_i64())
    }

    #[test]
    fn test_healthy_database_is_not_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded(dir.path());
        assert!(!db.check_if_corrupted());
        assert!(!db.check_if_is_already_corrupted());
    }

    #[test]
    fn test_backup_applies_filter() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded(dir.path());
        db.filter_backup(Some(Arc::new(|table: &str| table != "b")));
        db.backup().unwrap();

        let material = SqliteConnection::open_file(db.material_path()).unwrap();
        assert!(material.table_exists("a").unwrap());
        assert!(!material.table_exists("b").unwrap());
        assert!(!Path::new(&format!("{}.tmp", db.material_path())).exists());
    }

    #[test]
    fn test_deposit_then_retrieve_merges_generations() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = seeded(dir.path());
        db.deposit().unwrap();
        assert!(db.contain_deposited_files());
        assert!(!Path::new(db.path()).exists());

        db.execute("CREATE TABLE a (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.insert_row(vec![Value::from(3), Value::from("z")], &["id", "v"], "a")
            .unwrap();

        let mut reports = Vec::new();
        let score = db
            .retrieve(|done, increment| {
                reports.push((done, increment));
                true
            })
            .unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
        assert_eq!(reports.len(), 3);
        assert!((reports.last().unwrap().0 - 1.0).abs() < 1e-9);
        assert_eq!(count(&mut db, "a"), 3);
        assert_eq!(count(&mut db, "b"), 1);

        db.remove_deposited_files().unwrap();
        assert!(!db.contain_deposited_files());
    }

    #[test]
    fn test_retrieve_cancelled_by_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = seeded(dir.path());
        let err = db.retrieve(|_, _| false).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(count(&mut db, "a"), 2);
    }

    #[test]
    fn test_auto_backup_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = seeded(dir.path());
        db.enable_auto_backup(true);
        db.run_transaction(|h| {
            h.execute("INSERT INTO b (id) VALUES (2)")?;
            Ok(true)
        })
        .unwrap();
        let material = PathBuf::from(db.material_path());
        for _ in 0..200 {
            if material.exists() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(material.exists());
    }

    #[test]
    fn test_corruption_notified_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        db.set_notification_when_corrupted(Some(Arc::new(move |_: &Database| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        db.mark_corrupted();
        db.mark_corrupted();
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(db.check_if_is_already_corrupted());
    }

    #[test]
    fn test_memory_database_has_no_backup() {
        let db = Database::in_memory();
        assert!(matches!(db.backup(), Err(Error::Config(_))));
    }
}
