//! Incremental data migration.
//!
//! Rows move from a source table (in this database or an attached one)
//! into a target table in small batches, each in its own transaction, so
//! migration can proceed while the database is in use.
//!
//! Until a table has finished, table-level reads (`get_value`,
//! `get_all_rows`, `get_all_objects` and the like) read the target together
//! with the rows still in the source, so no row is missing from them
//! halfway through. Raw statements and writes see the target table only.

use crate::database::{Database, lock};
use crate::handle::Handle;
use crate::operation::HandleOperation;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use wcdb_core::{QueryOptions, Result, StatementSelect, Value, quote_ident, quote_literal};

/// Maximum number of rows moved by one `step_migration`.
pub const MIGRATION_BATCH: usize = 100;
/// Consecutive failed steps after which automatic migration gives up.
const TOLERABLE_FAILURES: u32 = 5;
const MIGRATION_SCHEMA: &str = "wcdb_migration_source";

/// Where the rows of `table` come from.
///
/// The migration filter is called once for every table of this database
/// and of the source database, with only `table` set, and opts a table in
/// by setting `source_table`. A missing target table is created with the
/// source's columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Target table
    pub table: String,
    pub source_table: Option<String>,
    /// SQL expression selecting the source rows to move
    pub filter_condition: Option<String>,
}

pub type MigrationFilter = Arc<dyn Fn(&mut MigrationInfo) + Send + Sync>;
/// Called with the table that finished migrating, and with `None` once
/// every table has.
pub type MigrationNotification = Arc<dyn Fn(&Database, Option<&MigrationInfo>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct MigrationState {
    filter: Option<MigrationFilter>,
    /// Source database file; `None` migrates within this database
    source_path: Option<String>,
    /// Tables still to migrate, resolved on the first step
    pending: Option<Vec<MigrationInfo>>,
    migrated: bool,
    notification: Option<MigrationNotification>,
    auto: bool,
    auto_running: bool,
    /// Bumped on every reconfiguration
    generation: u64,
}

/// Progress made by one batch.
enum Batch {
    Moved,
    TableDone(MigrationInfo),
    AllDone,
}

fn column_names(handle: &mut Handle, schema: &str, table: &str) -> Result<Vec<String>> {
    Ok(handle
        .get_one_column_from_statement(
            "SELECT name FROM pragma_table_info(?1, ?2)",
            &[Value::from(table), Value::from(schema)],
        )?
        .into_iter()
        .map(|v| v.to_text().into_owned())
        .collect())
}

/// Attach the source database to the handle's connection unless it
/// already is.
fn attach_source(handle: &mut Handle, path: &str) -> Result<()> {
    let attached = handle
        .get_value_from_statement(
            "SELECT count(*) FROM pragma_database_list WHERE name = ?1",
            &[Value::from(MIGRATION_SCHEMA)],
        )?
        .is_some_and(|v| v.as_i64() > 0);
    if !attached {
        handle.execute(&format!("ATTACH DATABASE {} AS {}", quote_literal(path), MIGRATION_SCHEMA))?;
    }
    Ok(())
}

/// Columns of the source that the target also has, quoted.
fn shared_columns(handle: &mut Handle, info: &MigrationInfo, source_table: &str, schema: &str) -> Result<String> {
    let target_columns = column_names(handle, "main", &info.table)?;
    Ok(column_names(handle, schema, source_table)?
        .into_iter()
        .filter(|c| target_columns.contains(c))
        .map(|c| quote_ident(&c))
        .collect::<Vec<_>>()
        .join(", "))
}

fn where_clause(info: &MigrationInfo) -> String {
    info.filter_condition
        .as_deref()
        .map(|c| format!(" WHERE {}", c))
        .unwrap_or_default()
}

/// Query yielding the target's rows together with the rows left in the
/// source.
fn union_query(handle: &mut Handle, info: &MigrationInfo, schema: &str) -> Result<Option<String>> {
    let Some(source_table) = &info.source_table else {
        return Ok(None);
    };
    if !handle.connection()?.table_names(schema)?.contains(source_table) {
        return Ok(None);
    }
    let source = format!("{}.{}", schema, quote_ident(source_table));
    if !handle.table_exists(&info.table)? {
        return Ok(Some(format!("SELECT * FROM {}{}", source, where_clause(info))));
    }
    let columns = shared_columns(handle, info, source_table, schema)?;
    Ok(Some(format!(
        "SELECT {columns} FROM main.{} UNION ALL SELECT {columns} FROM {source}{}",
        quote_ident(&info.table),
        where_clause(info)
    )))
}

/// Apply the filter to every candidate table.
fn resolve(handle: &mut Handle, filter: &MigrationFilter, schema: &str) -> Result<Vec<MigrationInfo>> {
    let conn = handle.connection()?;
    let targets = conn.table_names("main")?;
    let sources = if schema == "main" {
        targets.clone()
    } else {
        conn.table_names(schema)?
    };
    let candidates: BTreeSet<&String> = targets.iter().chain(sources.iter()).collect();

    let mut pending = Vec::new();
    for table in candidates {
        let mut info = MigrationInfo {
            table: table.clone(),
            ..Default::default()
        };
        filter(&mut info);
        let Some(source) = &info.source_table else {
            continue;
        };
        if schema == "main" && source == table {
            tracing::warn!(table = %table, "table cannot migrate onto itself");
            continue;
        }
        if sources.contains(source) {
            pending.push(info);
        }
    }
    tracing::debug!(tables = pending.len(), "migration resolved");
    Ok(pending)
}

/// Move one batch of `info` inside the current transaction. Returns
/// whether the source has no more rows to give.
fn migrate_batch(handle: &mut Handle, info: &MigrationInfo, schema: &str) -> Result<bool> {
    let Some(source_table) = &info.source_table else {
        return Ok(true);
    };
    let source = format!("{}.{}", schema, quote_ident(source_table));
    let target = format!("main.{}", quote_ident(&info.table));

    if !handle.table_exists(&info.table)? {
        handle.execute(&format!("CREATE TABLE {} AS SELECT * FROM {} WHERE 0", target, source))?;
        tracing::debug!(table = %info.table, "migration target created");
    }

    let columns = shared_columns(handle, info, source_table, schema)?;
    let condition = where_clause(info);
    let batch = format!(
        "SELECT rowid FROM {}{} ORDER BY rowid LIMIT {}",
        source, condition, MIGRATION_BATCH
    );

    handle.execute(&format!(
        "INSERT OR IGNORE INTO {target}({columns}) SELECT {columns} FROM {source} WHERE rowid IN ({batch})"
    ))?;
    handle.execute(&format!("DELETE FROM {} WHERE rowid IN ({})", source, batch))?;
    let moved = handle.changes()?;
    tracing::debug!(table = %info.table, moved, "migration batch");

    if moved < MIGRATION_BATCH as i64 {
        if info.filter_condition.is_none() {
            handle.execute(&format!("DROP TABLE IF EXISTS {}", source))?;
        }
        return Ok(true);
    }
    Ok(false)
}

impl Handle {
    /// `SELECT columns FROM table`, reading unmigrated rows too while
    /// `table` is migrating.
    pub(crate) fn select_from(&mut self, columns: &[&str], table: &str, options: &QueryOptions) -> Result<StatementSelect> {
        let statement = StatementSelect::new(table)
            .columns(columns.iter().copied())
            .options(options.clone());
        let database = self.database().clone();
        Ok(match database.migrating_source(self, table)? {
            Some(query) => statement.from_subquery(query),
            None => statement,
        })
    }
}

impl Database {
    /// Migrate tables within this database; `filter` picks the source of
    /// each target table.
    pub fn filter_migration(&self, filter: Option<MigrationFilter>) {
        self.configure_migration(None, filter);
    }

    /// Migrate tables out of the database file at `source_path`.
    pub fn add_migration_source(&self, source_path: impl Into<String>, filter: MigrationFilter) {
        self.configure_migration(Some(source_path.into()), Some(filter));
    }

    fn configure_migration(&self, source_path: Option<String>, filter: Option<MigrationFilter>) {
        let mut state = lock(&self.inner.migration);
        state.migrated = false;
        state.pending = None;
        state.source_path = source_path;
        state.filter = filter;
        state.generation += 1;
    }

    pub fn set_notification_when_migrated(&self, notification: Option<MigrationNotification>) {
        lock(&self.inner.migration).notification = notification;
    }

    /// Has every table finished migrating?
    pub fn is_migrated(&self) -> bool {
        lock(&self.inner.migration).migrated
    }

    /// Move at most `MIGRATION_BATCH` rows of one table in one
    /// transaction. Returns `true` once everything has migrated.
    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path()))]
    pub fn step_migration(&self) -> Result<bool> {
        let (filter, source_path, pending) = {
            let state = lock(&self.inner.migration);
            if state.migrated {
                return Ok(true);
            }
            let Some(filter) = state.filter.clone() else {
                return Ok(true);
            };
            (filter, state.source_path.clone(), state.pending.clone())
        };

        let mut handle = self.get_handle(true);
        let schema = if source_path.is_some() { MIGRATION_SCHEMA } else { "main" };
        if let Some(path) = &source_path {
            attach_source(&mut handle, path)?;
        }
        let outcome = self.step_attached(&mut handle, &filter, schema, pending);
        if source_path.is_some() {
            if let Err(err) = handle.execute(&format!("DETACH DATABASE {}", MIGRATION_SCHEMA)) {
                tracing::warn!(error = %err, "migration source not detached");
            }
        }
        handle.invalidate();

        let notification = lock(&self.inner.migration).notification.clone();
        match outcome? {
            Batch::Moved => Ok(false),
            Batch::TableDone(info) => {
                if let Some(notify) = &notification {
                    notify(self, Some(&info));
                }
                Ok(false)
            }
            Batch::AllDone => {
                tracing::debug!(path = %self.path(), "migration finished");
                if let Some(notify) = &notification {
                    notify(self, None);
                }
                Ok(true)
            }
        }
    }

    fn step_attached(
        &self,
        handle: &mut Handle,
        filter: &MigrationFilter,
        schema: &str,
        pending: Option<Vec<MigrationInfo>>,
    ) -> Result<Batch> {
        let mut pending = match pending {
            Some(pending) => pending,
            None => resolve(handle, filter, schema)?,
        };

        let Some(info) = pending.first().cloned() else {
            let mut state = lock(&self.inner.migration);
            state.pending = Some(pending);
            state.migrated = true;
            return Ok(Batch::AllDone);
        };

        let mut finished = false;
        handle.run_transaction(|h| {
            finished = migrate_batch(h, &info, schema)?;
            Ok(true)
        })?;

        if finished {
            pending.remove(0);
        }
        let all_done = pending.is_empty();
        {
            let mut state = lock(&self.inner.migration);
            state.pending = Some(pending);
            state.migrated = all_done;
        }
        Ok(match (finished, all_done) {
            (false, _) => Batch::Moved,
            (true, false) => Batch::TableDone(info),
            (true, true) => {
                // The last table finishing also finishes the migration.
                let notification = lock(&self.inner.migration).notification.clone();
                if let Some(notify) = notification {
                    notify(self, Some(&info));
                }
                Batch::AllDone
            }
        })
    }

    /// The query table-level reads of `table` use while rows of it may
    /// still sit in a migration source.
    pub(crate) fn migrating_source(&self, handle: &mut Handle, table: &str) -> Result<Option<String>> {
        let (filter, source_path, pending, generation) = {
            let state = lock(&self.inner.migration);
            if state.migrated {
                return Ok(None);
            }
            let Some(filter) = state.filter.clone() else {
                return Ok(None);
            };
            if state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.iter().all(|info| info.table != table))
            {
                return Ok(None);
            }
            (filter, state.source_path.clone(), state.pending.clone(), state.generation)
        };

        let schema = if source_path.is_some() { MIGRATION_SCHEMA } else { "main" };
        if let Some(path) = &source_path {
            // Attaching is impossible inside a transaction; such reads see
            // the target only.
            if let Err(err) = attach_source(handle, path) {
                tracing::debug!(error = %err, table = %table, "migration source not readable");
                return Ok(None);
            }
        }
        let pending = match pending {
            Some(pending) => pending,
            None => {
                let resolved = resolve(handle, &filter, schema)?;
                let mut state = lock(&self.inner.migration);
                if state.generation == generation && state.pending.is_none() {
                    state.pending = Some(resolved.clone());
                }
                resolved
            }
        };
        match pending.iter().find(|info| info.table == table) {
            Some(info) => union_query(handle, info, schema),
            None => Ok(None),
        }
    }

    /// Step migration on a background thread until it completes, is
    /// disabled, or fails too many times in a row.
    pub fn enable_auto_migration(&self, enable: bool) {
        {
            let mut state = lock(&self.inner.migration);
            state.auto = enable;
            if !enable || state.auto_running {
                return;
            }
            state.auto_running = true;
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.migration_interval;
        let spawned = thread::Builder::new()
            .name("wcdb-migration".into())
            .spawn(move || {
                let mut failures = 0;
                loop {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let database = Database::from_inner(inner);
                    let keep_going = lock(&database.inner.migration).auto
                        && match database.step_migration() {
                            Ok(done) => {
                                failures = 0;
                                !done
                            }
                            Err(err) => {
                                failures += 1;
                                tracing::warn!(error = %err, failures, "migration step failed");
                                failures < TOLERABLE_FAILURES
                            }
                        };
                    if !keep_going {
                        lock(&database.inner.migration).auto_running = false;
                        return;
                    }
                    drop(database);
                    thread::sleep(interval);
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "automatic migration not started");
            lock(&self.inner.migration).auto_running = false;
        }
    }
}
