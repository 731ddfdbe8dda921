use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rusqlite::{ffi, Connection, InterruptHandle};
use tracing::{debug, warn};

use crate::error::BackendError;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
// Checked on every VM jump so a cancelled statement stops before its first write.
const CANCEL_CHECK_OPS: std::os::raw::c_int = 1;

/// Tunables applied to every connection the backend opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Session provider over a SQLite database file.
///
/// Holds no connection of its own: each unit of work opens one, uses it on the
/// blocking pool and drops it on every exit path. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: Arc<PathBuf>,
    options: BackendOptions,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and bring the schema up to date.
    pub fn open(path: impl Into<PathBuf>, options: BackendOptions) -> Result<Self, BackendError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let backend = Self {
            path: Arc::new(path),
            options,
        };
        let conn = backend.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        run_migrations(&conn)?;
        debug!(path = ?backend.path, journal_mode = %mode, "data key database ready");

        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a fresh connection. The connection is released when `f` returns,
    /// and the running statement is interrupted if the returned future is dropped.
    pub async fn with_session<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connect()?;
        let (_conn, out) = run_interruptible(conn, f).await?;
        Ok(out?)
    }

    /// Start a caller-managed transaction. The caller decides when to commit or roll back.
    pub async fn begin(&self) -> Result<TxScope, BackendError> {
        let conn = self.connect()?;
        let (conn, out) = run_interruptible(conn, |c| c.execute_batch("BEGIN IMMEDIATE")).await?;
        out?;
        Ok(TxScope { conn: Some(conn) })
    }

    fn connect(&self) -> Result<Connection, BackendError> {
        let conn = Connection::open(self.path.as_path())?;
        conn.busy_timeout(self.options.busy_timeout)?;
        Ok(conn)
    }
}

/// A transaction owned by the caller.
///
/// Store operations that accept a scope only run statements inside it. End a scope
/// with [`TxScope::commit`] or [`TxScope::rollback`]; one dropped unfinished is rolled
/// back on the blocking pool when a runtime is available.
#[derive(Debug)]
pub struct TxScope {
    conn: Option<Connection>,
}

impl TxScope {
    /// Run `f` inside the transaction.
    ///
    /// If the future is dropped mid-statement the connection is lost and the scope
    /// reports [`BackendError::ScopeClosed`] from then on; SQLite rolls back the
    /// abandoned transaction when that connection closes.
    pub async fn run<T, F>(&mut self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.take().ok_or(BackendError::ScopeClosed)?;
        let (conn, out) = run_interruptible(conn, f).await?;
        self.conn = Some(conn);
        Ok(out?)
    }

    pub async fn commit(mut self) -> Result<(), BackendError> {
        self.run(|c| c.execute_batch("COMMIT")).await
    }

    pub async fn rollback(mut self) -> Result<(), BackendError> {
        self.run(|c| c.execute_batch("ROLLBACK")).await
    }
}

impl Drop for TxScope {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_autocommit() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || rollback_abandoned(&conn));
            }
            Err(_) => rollback_abandoned(&conn),
        }
    }
}

fn rollback_abandoned(conn: &Connection) {
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        warn!(error = %err, "failed to roll back abandoned transaction scope");
    }
}

/// Cancels the unit of work unless disarmed: marks it cancelled so a queued
/// closure never starts, and interrupts a statement that is already running.
struct InterruptOnDrop {
    cancelled: Arc<AtomicBool>,
    handle: Option<InterruptHandle>,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("interrupting abandoned sqlite statement");
            self.cancelled.store(true, Ordering::SeqCst);
            handle.interrupt();
        }
    }
}

async fn run_interruptible<T, F>(
    conn: Connection,
    f: F,
) -> Result<(Connection, rusqlite::Result<T>), BackendError>
where
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let guard = InterruptOnDrop {
        cancelled: Arc::clone(&cancelled),
        handle: Some(conn.get_interrupt_handle()),
    };
    let result = tokio::task::spawn_blocking(move || run_guarded(conn, &cancelled, f)).await?;
    guard.disarm();
    Ok(result)
}

/// Run `f` unless the work was cancelled while queued. A progress handler watches
/// the flag too, covering a cancel that lands after the check but before `f`'s
/// statement starts, which `sqlite3_interrupt` alone would miss.
fn run_guarded<T, F>(
    conn: Connection,
    cancelled: &Arc<AtomicBool>,
    f: F,
) -> (Connection, rusqlite::Result<T>)
where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
{
    if cancelled.load(Ordering::SeqCst) {
        return (conn, Err(interrupted()));
    }

    let watch = Arc::clone(cancelled);
    conn.progress_handler(
        CANCEL_CHECK_OPS,
        Some(move || watch.load(Ordering::SeqCst)),
    );
    let out = f(&conn);
    conn.progress_handler(0, None::<fn() -> bool>);
    (conn, out)
}

fn interrupted() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_INTERRUPT), None)
}

fn run_migrations(conn: &Connection) -> Result<(), BackendError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS data_keys (
            name            TEXT PRIMARY KEY NOT NULL,
            active          INTEGER NOT NULL,
            provider        TEXT NOT NULL,
            encrypted_data  BLOB NOT NULL,
            created         TEXT NOT NULL,
            updated         TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use rusqlite::ErrorCode;

    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SqliteBackend::open(
            dir.path().join("nested/keys.db"),
            BackendOptions::default(),
        )
        .expect("open backend");
        (dir, backend)
    }

    fn count(conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row("SELECT count(*) FROM data_keys", [], |row| row.get(0))
    }

    #[tokio::test]
    async fn open_creates_parent_dirs_and_schema() {
        let (_dir, backend) = open_temp();
        assert!(backend.path().exists());

        let rows = backend.with_session(count).await.expect("count");
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn reopen_keeps_existing_rows() {
        let (_dir, backend) = open_temp();
        backend
            .with_session(|c| {
                c.execute(
                    "INSERT INTO data_keys VALUES ('k', 1, 'p', x'01', 't', 't')",
                    [],
                )
            })
            .await
            .expect("insert");

        let reopened =
            SqliteBackend::open(backend.path().to_path_buf(), BackendOptions::default())
                .expect("reopen");
        assert_eq!(reopened.with_session(count).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn dropped_scope_rolls_back() {
        let (_dir, backend) = open_temp();
        let mut scope = backend.begin().await.expect("begin");
        scope
            .run(|c| {
                c.execute(
                    "INSERT INTO data_keys VALUES ('k', 1, 'p', x'01', 't', 't')",
                    [],
                )
            })
            .await
            .expect("insert in scope");
        drop(scope);

        assert_eq!(backend.with_session(count).await.expect("count"), 0);
        // The write lock is released, so a new scope can start.
        let next = backend.begin().await.expect("begin after abandoned scope");
        next.rollback().await.expect("rollback");
    }

    #[test]
    fn cancelled_work_never_starts() {
        let (_dir, backend) = open_temp();
        let conn = backend.connect().expect("connect");
        let cancelled = Arc::new(AtomicBool::new(true));

        let (_conn, out) = run_guarded(conn, &cancelled, |_| -> rusqlite::Result<()> {
            panic!("cancelled work must not run")
        });
        let err = out.expect_err("cancelled");
        assert_eq!(err.sqlite_error_code(), Some(ErrorCode::OperationInterrupted));
    }

    #[test]
    fn cancel_before_statement_starts_blocks_the_write() {
        let (_dir, backend) = open_temp();
        let conn = backend.connect().expect("connect");
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let (conn, out) = run_guarded(conn, &cancelled, move |c| {
            flag.store(true, Ordering::SeqCst);
            c.execute(
                "INSERT INTO data_keys VALUES ('k', 1, 'p', x'01', 't', 't')",
                [],
            )
        });
        let err = out.expect_err("insert should be interrupted");
        assert_eq!(err.sqlite_error_code(), Some(ErrorCode::OperationInterrupted));
        assert_eq!(count(&conn).expect("count"), 0);
    }

    #[tokio::test]
    async fn dropped_future_interrupts_running_statement() {
        let (_dir, backend) = open_temp();
        let (tx, rx) = mpsc::channel();

        let endless = backend.with_session(move |c| {
            let out: rusqlite::Result<i64> = c.query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                 SELECT count(*) FROM n",
                [],
                |row| row.get(0),
            );
            let _ = tx.send(out.as_ref().err().and_then(|e| e.sqlite_error_code()));
            out
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(200), endless).await;
        assert!(timed_out.is_err(), "query should not finish on its own");

        let code = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("blocking query should stop promptly");
        assert_eq!(code, Some(ErrorCode::OperationInterrupted));
    }
}
