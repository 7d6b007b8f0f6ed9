use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

use crate::create_timestamp;
use crate::submission::{NewSubmission, Submission, SubmissionId, SubmissionState};

pub const DATABASE_NAME: &str = "oj.sqlite3";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("submission {0} not found")]
    NotFound(SubmissionId),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt submission state: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A state change applied atomically to one stored submission
///
/// Returns whether it modified the record; unmodified records are not written back.
pub type Transition = Box<dyn FnOnce(&mut Submission) -> bool + Send>;

/// Result of [`SubmissionStore::apply_transition`]
#[derive(Debug, Clone)]
pub struct Applied {
    pub submission: Submission,
    pub changed: bool,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Persists a new submission in the `Compiling` state
    async fn create(&self, new: NewSubmission) -> Result<Submission, StoreError>;

    async fn read(&self, id: SubmissionId) -> Result<Submission, StoreError>;

    /// Atomic read-modify-write of one submission
    async fn apply_transition(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<Applied, StoreError>;

    /// Submissions that are still `Compiling` or `Grading`
    async fn list_unfinished(&self) -> Result<Vec<Submission>, StoreError>;
}

/// Submissions kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    last_id: SubmissionId,
    submissions: BTreeMap<SubmissionId, Submission>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn create(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let submission = Submission::new(inner.last_id, new, create_timestamp());
        inner.submissions.insert(submission.id, submission.clone());
        Ok(submission)
    }

    async fn read(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.inner
            .lock()
            .submissions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn apply_transition(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<Applied, StoreError> {
        let mut inner = self.inner.lock();
        let submission = inner
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        let changed = transition(submission);
        Ok(Applied {
            submission: submission.clone(),
            changed,
        })
    }

    async fn list_unfinished(&self) -> Result<Vec<Submission>, StoreError> {
        Ok(self
            .inner
            .lock()
            .submissions
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect())
    }
}

/// Submissions persisted in SQLite
///
/// The state-specific part of a submission is stored as JSON next to a plain
/// `status` column used for filtering. The pool holds a single connection, so
/// every transaction is serialized.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: impl AsRef<Path>) -> sqlx::Result<Self> {
        // rwc = read/write/create
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .connect(&db_url)
            .await?;

        let store = Self::from_pool(pool).await?;
        log::info!("Initialized database at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Wraps an existing pool, creating the schema when missing
    pub async fn from_pool(pool: SqlitePool) -> sqlx::Result<Self> {
        // PRAGMA statements cannot run inside a transaction
        for pragma_sql in &[
            "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
            "PRAGMA journal_mode = WAL;",
            "PRAGMA synchronous = NORMAL;",
        ] {
            sqlx::query(pragma_sql).execute(&pool).await?;
        }

        let mut tx = pool.begin().await?;
        for sql in &[
            r"
            CREATE TABLE IF NOT EXISTS submissions (
                id            INTEGER  PRIMARY KEY AUTOINCREMENT,
                created_at    TEXT     NOT NULL,
                updated_at    TEXT     NOT NULL,
                domain_id     TEXT     NOT NULL,
                problem_id    INTEGER  NOT NULL,
                user_id       INTEGER  NOT NULL,
                contest_id    INTEGER,
                team_id       INTEGER,
                language      TEXT     NOT NULL,
                source        TEXT     NOT NULL,
                status        TEXT     NOT NULL,
                state         TEXT     NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);",
        ] {
            sqlx::query(sql).execute(tx.as_mut()).await?;
        }
        tx.commit().await?;

        Ok(Self { pool })
    }

    async fn fetch_in(
        tx: &mut Transaction<'_, Sqlite>,
        id: SubmissionId,
    ) -> Result<Submission, StoreError> {
        let row = sqlx::query(
            r"
            SELECT id, created_at, domain_id, problem_id, user_id, contest_id, team_id,
                   language, source, state
            FROM submissions
            WHERE id = ?
            ",
        )
        .bind(id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(StoreError::NotFound(id))?;

        submission_from_row(&row)
    }
}

fn submission_from_row(row: &SqliteRow) -> Result<Submission, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(Submission {
        id: row.try_get("id")?,
        language: row.try_get("language")?,
        source: row.try_get("source")?,
        problem_id: row.try_get("problem_id")?,
        domain_id: row.try_get("domain_id")?,
        user_id: row.try_get("user_id")?,
        contest_id: row.try_get("contest_id")?,
        team_id: row.try_get("team_id")?,
        created_at: row.try_get("created_at")?,
        state: serde_json::from_str::<SubmissionState>(&state)?,
    })
}

#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn create(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        let now = create_timestamp();
        let state = SubmissionState::Compiling;
        let state_json = serde_json::to_string(&state)?;

        let result = sqlx::query(
            r"
            INSERT INTO submissions (created_at, updated_at, domain_id, problem_id, user_id,
                                     contest_id, team_id, language, source, status, state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&now)
        .bind(&now)
        .bind(&new.domain_id)
        .bind(new.problem_id)
        .bind(new.user_id)
        .bind(new.contest_id)
        .bind(new.team_id)
        .bind(&new.language)
        .bind(&new.source)
        .bind(state.name())
        .bind(&state_json)
        .execute(&self.pool)
        .await?;

        Ok(Submission::new(result.last_insert_rowid(), new, now))
    }

    async fn read(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        let mut tx = self.pool.begin().await?;
        let submission = Self::fetch_in(&mut tx, id).await?;
        tx.commit().await?;
        Ok(submission)
    }

    async fn apply_transition(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<Applied, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut submission = Self::fetch_in(&mut tx, id).await?;

        let changed = transition(&mut submission);
        if changed {
            sqlx::query(
                r"
                UPDATE submissions
                SET status = ?, state = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(submission.state.name())
            .bind(serde_json::to_string(&submission.state)?)
            .bind(create_timestamp())
            .bind(id)
            .execute(tx.as_mut())
            .await?;
        }

        tx.commit().await?;
        Ok(Applied {
            submission,
            changed,
        })
    }

    async fn list_unfinished(&self) -> Result<Vec<Submission>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, created_at, domain_id, problem_id, user_id, contest_id, team_id,
                   language, source, state
            FROM submissions
            WHERE status IN ('Compiling', 'Grading')
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(submission_from_row).collect()
    }
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}
