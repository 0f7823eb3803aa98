use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prh_core::{AuthorRef, FileChange, IdentityRecord, PullRequestKey, PullRequestRecord, Window};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use super::{
    ContactUpdate, KeySchema, MigrationOutcome, Page, Store, StoreError, StoreResult,
    UpsertOutcome, WindowQuery,
};

const LEGACY_KEY: &str = "pull_requests_number_key";
const COMPOSITE_KEY: &str = "pull_requests_number_repository_key";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pull_requests (
        id BIGSERIAL PRIMARY KEY,
        github_id BIGINT,
        number BIGINT NOT NULL,
        repository TEXT,
        title TEXT NOT NULL,
        state TEXT NOT NULL,
        html_url TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        author JSONB NOT NULL DEFAULT '{}'::jsonb,
        files JSONB NOT NULL DEFAULT '[]'::jsonb,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS pull_requests_updated_at_idx ON pull_requests (updated_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS identities (
        id BIGSERIAL PRIMARY KEY,
        github_id BIGINT UNIQUE,
        login TEXT,
        html_url TEXT,
        avatar_url TEXT,
        account_type TEXT,
        site_admin BOOLEAN NOT NULL DEFAULT FALSE,
        name TEXT,
        email TEXT UNIQUE,
        phone TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS identities_login_idx ON identities (lower(login))",
];

const PR_COLUMNS: &str = "github_id, number, repository, title, state, html_url, created_at, \
                          updated_at, author, files, recorded_at";

const IDENTITY_COLUMNS: &str =
    "id, github_id, login, html_url, avatar_url, account_type, site_admin, name, email, phone";

const WINDOW_FILTER: &str = "($1::timestamptz IS NULL \
     OR (created_at >= $1 AND created_at < $2) \
     OR (updated_at >= $1 AND updated_at < $2))";

/// Postgres-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute(&self, sql: &str) -> StoreResult<u64> {
        Ok(sqlx::query(sql).execute(&self.pool).await?.rows_affected())
    }

    /// Sets `default_repository` on rows whose repository is NULL (`matching`
    /// is `None`) or equals `matching`, unless that key is already taken.
    async fn normalize_repository(
        &self,
        matching: Option<&str>,
        default_repository: &str,
    ) -> StoreResult<u64> {
        let condition = match matching {
            Some(_) => "p.repository = $2",
            None => "p.repository IS NULL",
        };
        let sql = format!(
            r#"
            UPDATE pull_requests p
               SET repository = $1
             WHERE {condition}
               AND NOT EXISTS (
                   SELECT 1 FROM pull_requests q
                    WHERE q.number = p.number AND q.repository = $1
               )
            "#
        );
        let mut query = sqlx::query(&sql).bind(default_repository);
        if let Some(value) = matching {
            query = query.bind(value);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}

fn bare_name(repository: &str) -> &str {
    repository.rsplit('/').next().unwrap_or(repository)
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn is_unique_violation(err: &sqlx::Error) -> Option<Option<String>> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().map(ToString::to_string))
        }
        _ => None,
    }
}

fn identity_conflict(err: sqlx::Error, identity: &IdentityRecord) -> StoreError {
    match is_unique_violation(&err) {
        Some(Some(constraint)) if constraint.contains("github_id") => {
            StoreError::DuplicateIdentity(identity.github_id.unwrap_or_default())
        }
        Some(_) => StoreError::EmailTaken(identity.email.clone().unwrap_or_default()),
        None => StoreError::Database(err),
    }
}

fn pr_from_row(row: &PgRow) -> StoreResult<PullRequestRecord> {
    let author: serde_json::Value = row.try_get("author")?;
    let files: serde_json::Value = row.try_get("files")?;
    let github_id: Option<i64> = row.try_get("github_id")?;
    let number: i64 = row.try_get("number")?;
    let repository: Option<String> = row.try_get("repository")?;
    Ok(PullRequestRecord {
        github_id: github_id.map(from_db),
        number: from_db(number),
        repository: repository.unwrap_or_default(),
        title: row.try_get("title")?,
        state: row.try_get("state")?,
        html_url: row.try_get("html_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        author: serde_json::from_value::<AuthorRef>(author)?,
        files: serde_json::from_value::<Vec<FileChange>>(files)?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn identity_from_row(row: &PgRow) -> StoreResult<IdentityRecord> {
    let github_id: Option<i64> = row.try_get("github_id")?;
    Ok(IdentityRecord {
        id: Some(row.try_get("id")?),
        github_id: github_id.map(from_db),
        login: row.try_get("login")?,
        html_url: row.try_get("html_url")?,
        avatar_url: row.try_get("avatar_url")?,
        account_type: row.try_get("account_type")?,
        site_admin: row.try_get("site_admin")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
    })
}

fn window_bounds(window: Option<&Window>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    match window {
        Some(w) => (Some(w.start), Some(w.end)),
        None => (None, None),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            self.execute(statement).await?;
        }
        Ok(())
    }

    async fn key_schema(&self) -> StoreResult<KeySchema> {
        let rows = sqlx::query(
            r#"
            SELECT indexname::text AS indexname
              FROM pg_indexes
             WHERE schemaname = current_schema()
               AND tablename = 'pull_requests'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut schema = KeySchema::Unindexed;
        for row in rows {
            let name: String = row.try_get("indexname")?;
            if name == COMPOSITE_KEY {
                return Ok(KeySchema::NumberAndRepository);
            }
            if name == LEGACY_KEY {
                schema = KeySchema::NumberOnly;
            }
        }
        Ok(schema)
    }

    async fn migrate_key_schema(&self, default_repository: &str) -> StoreResult<MigrationOutcome> {
        let previous = self.key_schema().await?;
        if previous == KeySchema::NumberAndRepository {
            info!("pull request key schema already migrated");
            return Ok(MigrationOutcome::already_migrated());
        }

        self.execute("ALTER TABLE pull_requests ADD COLUMN IF NOT EXISTS repository TEXT")
            .await?;
        self.execute(&format!(
            "ALTER TABLE pull_requests DROP CONSTRAINT IF EXISTS {LEGACY_KEY}"
        ))
        .await?;
        self.execute(&format!("DROP INDEX IF EXISTS {LEGACY_KEY}")).await?;

        let duplicates_removed = self
            .execute(
                r#"
                DELETE FROM pull_requests a
                 USING pull_requests b
                 WHERE a.number = b.number
                   AND a.repository IS NOT DISTINCT FROM b.repository
                   AND a.id > b.id
                "#,
            )
            .await?;

        let composite_index = match self
            .execute(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {COMPOSITE_KEY} ON pull_requests (number, repository)"
            ))
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "composite key index not created; continuing without it");
                false
            }
        };

        let mut normalized = self.normalize_repository(None, default_repository).await?;
        normalized += self
            .normalize_repository(Some(""), default_repository)
            .await?;
        let bare = bare_name(default_repository);
        if bare != default_repository {
            normalized += self
                .normalize_repository(Some(bare), default_repository)
                .await?;
        }

        let outcome = MigrationOutcome {
            previous,
            duplicates_removed,
            normalized,
            composite_index,
        };
        info!(?outcome, "pull request key schema migrated");
        Ok(outcome)
    }

    async fn upsert_pull_request(&self, record: &PullRequestRecord) -> StoreResult<UpsertOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE pull_requests
               SET github_id = $3, title = $4, state = $5, html_url = $6,
                   created_at = $7, updated_at = $8, author = $9, files = $10,
                   recorded_at = $11
             WHERE number = $1 AND repository = $2
            "#,
        )
        .bind(to_db(record.number))
        .bind(&record.repository)
        .bind(record.github_id.map(to_db))
        .bind(&record.title)
        .bind(&record.state)
        .bind(&record.html_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(Json(&record.author))
        .bind(Json(&record.files))
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(UpsertOutcome::Updated);
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO pull_requests ({PR_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(record.github_id.map(to_db))
        .bind(to_db(record.number))
        .bind(&record.repository)
        .bind(&record.title)
        .bind(&record.state)
        .bind(&record.html_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(Json(&record.author))
        .bind(Json(&record.files))
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(UpsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err).is_some() => Err(StoreError::DuplicateKey {
                number: record.number,
                repository: record.repository.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> StoreResult<Option<PullRequestRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PR_COLUMNS} FROM pull_requests WHERE number = $1 AND repository = $2 LIMIT 1"
        ))
        .bind(to_db(number))
        .bind(repository)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pr_from_row).transpose()
    }

    async fn query_pull_requests(&self, query: &WindowQuery) -> StoreResult<Page<PullRequestRecord>> {
        let (start, end) = window_bounds(query.window.as_ref());
        let total: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS total FROM pull_requests WHERE {WINDOW_FILTER}"
        ))
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            "SELECT {PR_COLUMNS} FROM pull_requests WHERE {WINDOW_FILTER} \
             ORDER BY updated_at DESC, id DESC OFFSET $3 LIMIT $4"
        ))
        .bind(start)
        .bind(end)
        .bind(to_db(query.offset()))
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(pr_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page::new(items, from_db(total), query.page.max(1), query.limit))
    }

    async fn pull_requests_in(&self, window: &Window) -> StoreResult<Vec<PullRequestRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PR_COLUMNS} FROM pull_requests WHERE {WINDOW_FILTER} ORDER BY updated_at DESC, id DESC"
        ))
        .bind(Some(window.start))
        .bind(Some(window.end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pr_from_row).collect()
    }

    async fn all_pull_requests(&self) -> StoreResult<Vec<PullRequestRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PR_COLUMNS} FROM pull_requests ORDER BY repository, number"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pr_from_row).collect()
    }

    async fn set_author(&self, key: &PullRequestKey, author: &AuthorRef) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE pull_requests SET author = $3 WHERE number = $1 AND repository = $2",
        )
        .bind(to_db(key.number))
        .bind(&key.repository)
        .bind(Json(author))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_identity_by_github_id(&self, github_id: u64) -> StoreResult<Option<IdentityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE github_id = $1"
        ))
        .bind(to_db(github_id))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn find_identity_by_login(&self, login: &str) -> StoreResult<Option<IdentityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE lower(login) = lower($1) ORDER BY id LIMIT 1"
        ))
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn insert_identity(&self, identity: &IdentityRecord) -> StoreResult<IdentityRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO identities
                (github_id, login, html_url, avatar_url, account_type, site_admin, name, email, phone)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {IDENTITY_COLUMNS}
            "#
        ))
        .bind(identity.github_id.map(to_db))
        .bind(&identity.login)
        .bind(&identity.html_url)
        .bind(&identity.avatar_url)
        .bind(&identity.account_type)
        .bind(identity.site_admin)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(&identity.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| identity_conflict(err, identity))?;
        identity_from_row(&row)
    }

    async fn update_identity(&self, identity: &IdentityRecord) -> StoreResult<IdentityRecord> {
        let id = identity.id.ok_or(StoreError::IdentityNotFound(0))?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE identities
               SET github_id = $2, login = $3, html_url = $4, avatar_url = $5,
                   account_type = $6, site_admin = $7, name = $8, email = $9, phone = $10,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {IDENTITY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(identity.github_id.map(to_db))
        .bind(&identity.login)
        .bind(&identity.html_url)
        .bind(&identity.avatar_url)
        .bind(&identity.account_type)
        .bind(identity.site_admin)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(&identity.phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| identity_conflict(err, identity))?;
        match row {
            Some(row) => identity_from_row(&row),
            None => Err(StoreError::IdentityNotFound(id)),
        }
    }

    async fn all_identities(&self) -> StoreResult<Vec<IdentityRecord>> {
        let rows = sqlx::query(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn list_identities(&self, page: u32, limit: u32) -> StoreResult<Page<IdentityRecord>> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM identities")
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;
        let query = WindowQuery {
            window: None,
            page,
            limit,
        };
        let rows = sqlx::query(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id OFFSET $1 LIMIT $2"
        ))
        .bind(to_db(query.offset()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(identity_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page::new(items, from_db(total), page.max(1), limit))
    }

    async fn get_identity(&self, id: i64) -> StoreResult<Option<IdentityRecord>> {
        let row = sqlx::query(&format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn update_contact(&self, id: i64, update: &ContactUpdate) -> StoreResult<IdentityRecord> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE identities
               SET name = COALESCE($2, name),
                   email = COALESCE($3, email),
                   phone = COALESCE($4, phone),
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {IDENTITY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&update.name)
        .bind(&update.email)
        .bind(&update.phone)
        .fetch_optional(&self.pool)
        .await;
        match row {
            Ok(Some(row)) => identity_from_row(&row),
            Ok(None) => Err(StoreError::IdentityNotFound(id)),
            Err(err) if is_unique_violation(&err).is_some() => {
                Err(StoreError::EmailTaken(update.email.clone().unwrap_or_default()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_identity(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM identities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
