#![allow(clippy::missing_errors_doc)]

mod pool;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use contact_identity_core::{
    cluster_view, format_rfc3339, now_utc, parse_rfc3339_utc, resolve, sort_chronologically,
    ContactId, ContactRecord, ContactStore, IdentityError, IdentityView, LinkPrecedence,
    NewContact, Observation, Resolution, ResolveOptions, StoreError,
};
use rusqlite::{
    params, params_from_iter, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use tracing::{debug, info, warn};

use crate::pool::ConnectionPool;
pub use crate::pool::PoolStatus;

const CONTACTS_MIGRATION_VERSION: i64 = 1;
const MEMORY_DATABASE: &str = ":memory:";

const SCHEMA_CONTACTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT CHECK (
    phone_number IS NULL OR (phone_number <> '' AND phone_number NOT GLOB '*[^0-9]*')
  ),
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary', 'secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL AND linked_id <> id)
  )
);

CREATE INDEX IF NOT EXISTS idx_contacts_email
  ON contacts(email) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number
  ON contacts(phone_number) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id
  ON contacts(linked_id) WHERE deleted_at IS NULL;

CREATE TRIGGER IF NOT EXISTS trg_contacts_created_at_immutable
BEFORE UPDATE OF created_at ON contacts
WHEN NEW.created_at IS NOT OLD.created_at
BEGIN
  SELECT RAISE(ABORT, 'contacts.created_at is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_contacts_no_promotion
BEFORE UPDATE OF link_precedence ON contacts
WHEN OLD.link_precedence = 'secondary' AND NEW.link_precedence = 'primary'
BEGIN
  SELECT RAISE(ABORT, 'secondary contacts cannot be promoted');
END;
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
    /// Total tries for one `identify`, counting the first.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub resolve: ResolveOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            resolve: ResolveOptions::default(),
        }
    }
}

pub struct SqliteContactStore {
    pool: ConnectionPool,
    path: PathBuf,
    config: StoreConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
    pub contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub live_contacts: usize,
    pub primaries: usize,
    pub secondaries: usize,
    pub issues: Vec<IntegrityIssue>,
}

/// Accepts a plain filesystem path or a `sqlite://` / `sqlite:` / `file:` URL.
#[must_use]
pub fn database_path_from_url(url: &str) -> PathBuf {
    let trimmed = url.trim();
    let path = ["sqlite://", "sqlite:", "file:"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    PathBuf::from(path)
}

impl SqliteContactStore {
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self> {
        let mut config = config;
        if path == Path::new(MEMORY_DATABASE) {
            // Every connection to :memory: is a separate database.
            config.max_connections = 1;
        }
        config.max_attempts = config.max_attempts.max(1);

        let pool = ConnectionPool::new(
            path,
            config.max_connections,
            config.acquire_timeout,
            config.busy_timeout,
        )
        .with_context(|| format!("failed to create connection pool for {}", path.display()))?;
        drop(
            pool.acquire()
                .with_context(|| format!("failed to open sqlite database at {}", path.display()))?,
        );

        debug!(
            path = %path.display(),
            max_connections = config.max_connections,
            "opened contact store"
        );
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            config,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn close(&self) {
        self.pool.close();
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.pool.acquire().context("failed to acquire connection for migration")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_CONTACTS_V1)
            .context("failed to apply contacts schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let registered = conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CONTACTS_MIGRATION_VERSION, now],
            )
            .context("failed to register contacts schema migration")?;

        if registered > 0 {
            info!(version = CONTACTS_MIGRATION_VERSION, "applied contacts schema migration");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.pool.acquire().context("failed to acquire connection")?;
        if !table_exists(&conn, "schema_migrations")? {
            return Ok(None);
        }
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to read schema version")
    }

    /// Resolves one observation inside a write transaction, retrying the whole
    /// call on write conflicts.
    pub fn identify(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Resolution, IdentityError> {
        let observation = Observation::new(email, phone_number)?;
        self.identify_observation(&observation)
    }

    pub fn identify_observation(&self, observation: &Observation) -> Result<Resolution, IdentityError> {
        let mut attempt = 1_u32;
        loop {
            match self.identify_once(observation) {
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    warn!(attempt, error = %err, "identify hit a write conflict, retrying");
                    std::thread::sleep(self.config.retry_backoff * attempt);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(attempts = attempt, error = %err, "identify gave up after retries");
                    }
                    return Err(err);
                }
                Ok(resolution) => {
                    debug!(
                        primary_id = %resolution.view.primary_contact_id,
                        attempts = attempt,
                        wrote = resolution.report.wrote_anything(),
                        "identify committed"
                    );
                    return Ok(resolution);
                }
            }
        }
    }

    fn identify_once(&self, observation: &Observation) -> Result<Resolution, IdentityError> {
        let mut conn = self.pool.acquire()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_error)?;
        let mut store = SqliteContactTx::new(tx);
        let resolution = resolve(&mut store, observation, &self.config.resolve)?;
        store.commit()?;
        Ok(resolution)
    }

    /// Consolidated view of the cluster containing `contact_id`.
    pub fn cluster(&self, contact_id: ContactId) -> Result<Option<IdentityView>, IdentityError> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction().map_err(map_sqlite_error)?;
        let mut store = SqliteContactTx::new(tx);
        let view = cluster_view(&mut store, contact_id)?;
        store.commit()?;
        Ok(view)
    }

    pub fn get_contact(&self, contact_id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
        let conn = self.pool.acquire()?;
        Ok(fetch_one(&conn, contact_id)?)
    }

    /// Scans every live contact for broken cluster invariants.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.pool.acquire().context("failed to acquire connection")?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                 ORDER BY id"
            ))
            .context("failed to prepare integrity scan")?;
        let rows = stmt
            .query_map([], parse_contact_row)
            .context("failed to run integrity scan")?;
        let records = collect_rows(rows).context("failed to decode contact rows")?;

        Ok(build_integrity_report(&records))
    }

    #[cfg(test)]
    fn connection(&self) -> pool::PooledConnection {
        match self.pool.acquire() {
            Ok(conn) => conn,
            Err(err) => panic!("failed to acquire test connection: {err}"),
        }
    }
}

fn build_integrity_report(records: &[ContactRecord]) -> IntegrityReport {
    let by_id: BTreeMap<ContactId, &ContactRecord> =
        records.iter().map(|record| (record.id, record)).collect();
    let mut issues = Vec::new();

    let mut without_primary = Vec::new();
    let mut nested = Vec::new();
    let mut older_than_primary = Vec::new();
    for record in records.iter().filter(|record| !record.is_primary()) {
        match record.linked_id.and_then(|linked| by_id.get(&linked)) {
            None => without_primary.push(record.id),
            Some(parent) if !parent.is_primary() => nested.push(record.id),
            Some(parent) if record.chronological_key() < parent.chronological_key() => {
                older_than_primary.push(record.id);
            }
            Some(_) => {}
        }
    }

    if !without_primary.is_empty() {
        issues.push(IntegrityIssue {
            code: "secondary_without_live_primary".to_string(),
            severity: IntegrityIssueSeverity::Error,
            message: format!(
                "{} secondary contacts point at a missing or deleted record",
                without_primary.len()
            ),
            contact_ids: without_primary,
        });
    }
    if !nested.is_empty() {
        issues.push(IntegrityIssue {
            code: "nested_secondary".to_string(),
            severity: IntegrityIssueSeverity::Error,
            message: format!(
                "{} secondary contacts point at another secondary",
                nested.len()
            ),
            contact_ids: nested,
        });
    }
    if !older_than_primary.is_empty() {
        issues.push(IntegrityIssue {
            code: "secondary_older_than_primary".to_string(),
            severity: IntegrityIssueSeverity::Warning,
            message: format!(
                "{} secondary contacts were created before their primary",
                older_than_primary.len()
            ),
            contact_ids: older_than_primary,
        });
    }

    let mut roots_by_value: BTreeMap<(&str, &str), BTreeSet<ContactId>> = BTreeMap::new();
    for record in records {
        let Some(root) = record.cluster_root() else {
            continue;
        };
        if let Some(email) = record.email.as_deref() {
            roots_by_value.entry(("email", email)).or_default().insert(root);
        }
        if let Some(phone_number) = record.phone_number.as_deref() {
            roots_by_value
                .entry(("phone_number", phone_number))
                .or_default()
                .insert(root);
        }
    }
    let split: BTreeSet<ContactId> = roots_by_value
        .values()
        .filter(|roots| roots.len() > 1)
        .flatten()
        .copied()
        .collect();
    if !split.is_empty() {
        issues.push(IntegrityIssue {
            code: "identifier_shared_across_clusters".to_string(),
            severity: IntegrityIssueSeverity::Error,
            message: format!(
                "{} cluster roots share an email or phone number with another cluster",
                split.len()
            ),
            contact_ids: split.into_iter().collect(),
        });
    }

    let primaries = records.iter().filter(|record| record.is_primary()).count();
    let healthy = !issues
        .iter()
        .any(|issue| issue.severity == IntegrityIssueSeverity::Error);

    IntegrityReport {
        healthy,
        live_contacts: records.len(),
        primaries,
        secondaries: records.len() - primaries,
        issues,
    }
}

/// [`ContactStore`] bound to one open SQLite transaction.
///
/// Dropping it without [`SqliteContactTx::commit`] rolls everything back.
pub struct SqliteContactTx<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> SqliteContactTx<'conn> {
    #[must_use]
    pub fn new(tx: Transaction<'conn>) -> Self {
        Self { tx }
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().map_err(map_sqlite_error)
    }

    fn query_contacts<P>(&self, sql: &str, params: P) -> Result<Vec<ContactRecord>, StoreError>
    where
        P: rusqlite::Params,
    {
        let mut stmt = self.tx.prepare_cached(sql).map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params, parse_contact_row)
            .map_err(map_sqlite_error)?;
        let mut records = collect_rows(rows).map_err(map_sqlite_error)?;
        sort_chronologically(&mut records);
        Ok(records)
    }
}

impl ContactStore for SqliteContactTx<'_> {
    fn get(&mut self, id: ContactId) -> Result<Option<ContactRecord>, StoreError> {
        fetch_one(&self.tx, id)
    }

    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                   AND (email = ?1 OR phone_number = ?2)
                 ORDER BY created_at, id"
            ),
            params![email, phone_number],
        )
    }

    fn find_closure(
        &mut self,
        roots: &BTreeSet<ContactId>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=roots.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                   AND (id IN ({placeholders}) OR linked_id IN ({placeholders}))
                 ORDER BY created_at, id"
            ),
            params_from_iter(roots.iter().map(|id| id.0)),
        )
    }

    fn find_cluster_of(&mut self, primary_id: ContactId) -> Result<Vec<ContactRecord>, StoreError> {
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                   AND (id = ?1 OR linked_id = ?1)
                 ORDER BY created_at, id"
            ),
            params![primary_id.0],
        )
    }

    fn insert(&mut self, contact: NewContact<'_>) -> Result<ContactRecord, StoreError> {
        let now = now_utc();
        let stamp = format_rfc3339(now)?;
        self.tx
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, linked_id, link_precedence, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|id| id.0),
                    contact.link_precedence.as_str(),
                    stamp,
                ],
            )
            .map_err(map_sqlite_error)?;

        Ok(ContactRecord {
            id: ContactId(self.tx.last_insert_rowid()),
            email: contact.email.map(str::to_string),
            phone_number: contact.phone_number.map(str::to_string),
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    fn demote_and_relink(
        &mut self,
        contact_id: ContactId,
        new_linked_id: ContactId,
    ) -> Result<(), StoreError> {
        let stamp = format_rfc3339(now_utc())?;
        let updated = self
            .tx
            .execute(
                "UPDATE contacts
                 SET link_precedence = 'secondary', linked_id = ?2, updated_at = ?3
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![contact_id.0, new_linked_id.0, stamp],
            )
            .map_err(map_sqlite_error)?;

        if updated == 0 {
            return Err(StoreError::Constraint(format!(
                "cannot demote contact {contact_id}: no live record"
            )));
        }
        Ok(())
    }

    fn relink_children(
        &mut self,
        old_linked_id: ContactId,
        new_linked_id: ContactId,
    ) -> Result<usize, StoreError> {
        let stamp = format_rfc3339(now_utc())?;
        self.tx
            .execute(
                "UPDATE contacts
                 SET linked_id = ?2, updated_at = ?3
                 WHERE linked_id = ?1 AND deleted_at IS NULL",
                params![old_linked_id.0, new_linked_id.0, stamp],
            )
            .map_err(map_sqlite_error)
    }
}

fn fetch_one(conn: &rusqlite::Connection, id: ContactId) -> Result<Option<ContactRecord>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE id = ?1 AND deleted_at IS NULL"
        ),
        params![id.0],
        parse_contact_row,
    )
    .optional()
    .map_err(map_sqlite_error)
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRecord> {
    let precedence_raw: String = row.get(4)?;
    let link_precedence = LinkPrecedence::parse(&precedence_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid link_precedence: {precedence_raw}"),
            )),
        )
    })?;

    let created_at = parse_timestamp_column(5, &row.get::<_, String>(5)?)?;
    let updated_at = parse_timestamp_column(6, &row.get::<_, String>(6)?)?;
    let deleted_at = row
        .get::<_, Option<String>>(7)?
        .map(|raw| parse_timestamp_column(7, &raw))
        .transpose()?;

    Ok(ContactRecord {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get::<_, Option<i64>>(3)?.map(ContactId),
        link_precedence,
        created_at,
        updated_at,
        deleted_at,
    })
}

fn parse_timestamp_column(idx: usize, raw: &str) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn table_exists(conn: &rusqlite::Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check table existence for {table_name}"))?;
    Ok(count > 0)
}

/// Maps SQLite failures onto the store error taxonomy. Busy and locked
/// databases are write conflicts and therefore retryable.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::Conflict(err.to_string())
            }
            ErrorCode::ConstraintViolation => StoreError::Constraint(err.to_string()),
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly => StoreError::Connection(err.to_string()),
            ErrorCode::DatabaseCorrupt => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use contact_identity_core::{IntegrityPolicy, IntegrityViolation};
    use proptest::prelude::*;
    use std::sync::Arc;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("contact-store-test-{}.sqlite3", Ulid::new()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut target = path.as_os_str().to_owned();
            target.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(target));
        }
    }

    fn fixture_store() -> SqliteContactStore {
        fixture_store_with(StoreConfig::default())
    }

    fn fixture_store_with(config: StoreConfig) -> SqliteContactStore {
        let store = must(SqliteContactStore::open(Path::new(":memory:"), config));
        must(store.migrate());
        store
    }

    fn file_store(path: &Path, config: StoreConfig) -> SqliteContactStore {
        let store = must(SqliteContactStore::open(path, config));
        must(store.migrate());
        store
    }

    fn identify(store: &SqliteContactStore, email: Option<&str>, phone: Option<&str>) -> Resolution {
        must(store.identify(email, phone))
    }

    fn ids(raw: &[i64]) -> Vec<ContactId> {
        raw.iter().copied().map(ContactId).collect()
    }

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| (*value).to_string()).collect()
    }

    fn count_rows(store: &SqliteContactStore, sql: &str) -> i64 {
        must(store.connection().query_row(sql, [], |row| row.get::<_, i64>(0)))
    }

    #[test]
    fn schema_contract_contains_contacts_table_indexes_and_triggers() {
        let store = fixture_store();
        let conn = store.connection();
        assert!(must(table_exists(&conn, "contacts")));
        assert!(must(table_exists(&conn, "schema_migrations")));

        let trigger_count = must(conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'trigger'
               AND name IN ('trg_contacts_created_at_immutable', 'trg_contacts_no_promotion')",
            [],
            |row| row.get::<_, i64>(0),
        ));
        assert_eq!(trigger_count, 2);

        let index_count = must(conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'index' AND tbl_name = 'contacts' AND name LIKE 'idx_contacts_%'",
            [],
            |row| row.get::<_, i64>(0),
        ));
        assert_eq!(index_count, 3);
        drop(conn);

        assert_eq!(must(store.schema_version()), Some(CONTACTS_MIGRATION_VERSION));
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        let before = identify(&store, Some("lorraine@hillvalley.edu"), Some("123456"));

        must(store.migrate());
        must(store.migrate());

        let after = identify(&store, Some("lorraine@hillvalley.edu"), Some("123456"));
        assert_eq!(before.view, after.view);
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM schema_migrations"), 1);
    }

    #[test]
    fn shared_phone_creates_linked_secondary() {
        let store = fixture_store();
        let first = identify(&store, Some("lorraine@hillvalley.edu"), Some("123456"));
        assert_eq!(first.view.primary_contact_id, ContactId(1));
        assert!(first.view.secondary_contact_ids.is_empty());

        let second = identify(&store, Some("mcfly@hillvalley.edu"), Some("123456"));
        assert_eq!(
            second.view,
            IdentityView {
                primary_contact_id: ContactId(1),
                emails: strings(&["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]),
                phone_numbers: strings(&["123456"]),
                secondary_contact_ids: ids(&[2]),
            }
        );

        for (email, phone) in [
            (None, Some("123456")),
            (Some("lorraine@hillvalley.edu"), None),
            (Some("mcfly@hillvalley.edu"), None),
        ] {
            assert_eq!(identify(&store, email, phone).view, second.view);
        }
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM contacts"), 2);
    }

    #[test]
    fn bridging_request_merges_clusters_under_older_primary() {
        let store = fixture_store();
        let _ = identify(&store, Some("george@hillvalley.edu"), Some("919191"));
        let _ = identify(&store, Some("biffsucks@hillvalley.edu"), Some("717171"));

        let merged = identify(&store, Some("george@hillvalley.edu"), Some("717171"));

        assert_eq!(
            merged.view,
            IdentityView {
                primary_contact_id: ContactId(1),
                emails: strings(&["george@hillvalley.edu", "biffsucks@hillvalley.edu"]),
                phone_numbers: strings(&["919191", "717171"]),
                secondary_contact_ids: ids(&[2, 3]),
            }
        );
        assert_eq!(merged.report.demoted_primaries, ids(&[2]));
        assert_eq!(merged.report.created_secondary, Some(ContactId(3)));

        let biff = match must(store.get_contact(ContactId(2))) {
            Some(record) => record,
            None => panic!("expected demoted contact to remain live"),
        };
        assert_eq!(biff.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(biff.linked_id, Some(ContactId(1)));
        assert!(biff.updated_at >= biff.created_at);
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM contacts"), 3);
        assert!(must(store.integrity_check()).healthy);
    }

    #[test]
    fn replayed_bridging_request_leaves_cluster_unchanged() {
        let store = fixture_store();
        let _ = identify(&store, Some("george@hillvalley.edu"), Some("919191"));
        let _ = identify(&store, Some("biffsucks@hillvalley.edu"), Some("717171"));
        let merged = identify(&store, Some("george@hillvalley.edu"), Some("717171"));
        let rows = count_rows(&store, "SELECT COUNT(*) FROM contacts");

        let replay = identify(&store, Some("george@hillvalley.edu"), Some("717171"));

        assert_eq!(replay.view, merged.view);
        assert!(!replay.report.wrote_anything());
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM contacts"), rows);
    }

    #[test]
    fn merge_flattens_secondaries_of_demoted_primary() {
        let store = fixture_store();
        let _ = identify(&store, Some("a@example.com"), Some("111"));
        let _ = identify(&store, Some("b@example.com"), Some("222"));
        let _ = identify(&store, Some("b2@example.com"), Some("222"));

        let merged = identify(&store, Some("b2@example.com"), Some("111"));

        assert_eq!(merged.view.primary_contact_id, ContactId(1));
        assert_eq!(merged.view.secondary_contact_ids, ids(&[2, 3, 4]));
        let nested = count_rows(
            &store,
            "SELECT COUNT(*) FROM contacts c JOIN contacts p ON p.id = c.linked_id
             WHERE p.link_precedence = 'secondary'",
        );
        assert_eq!(nested, 0);
    }

    #[test]
    fn cluster_lookup_resolves_from_any_member() {
        let store = fixture_store();
        let _ = identify(&store, Some("lorraine@hillvalley.edu"), Some("123456"));
        let expected = identify(&store, Some("mcfly@hillvalley.edu"), Some("123456")).view;

        assert_eq!(must(store.cluster(ContactId(1))), Some(expected.clone()));
        assert_eq!(must(store.cluster(ContactId(2))), Some(expected));
        assert_eq!(must(store.cluster(ContactId(42))), None);
    }

    #[test]
    fn soft_deleted_contacts_are_invisible() {
        let store = fixture_store();
        let _ = identify(&store, Some("ghost@example.com"), Some("404"));
        must(store.connection().execute(
            "UPDATE contacts SET deleted_at = updated_at WHERE id = 1",
            [],
        ));

        let fresh = identify(&store, Some("ghost@example.com"), Some("404"));
        assert_eq!(fresh.view.primary_contact_id, ContactId(2));
        assert_eq!(fresh.report.created_primary, Some(ContactId(2)));
        assert_eq!(must(store.get_contact(ContactId(1))), None);
    }

    #[test]
    fn invalid_input_is_rejected_without_touching_the_database() {
        let store = fixture_store();
        for (email, phone) in [(None, None), (Some(""), Some("")), (None, Some("12ab"))] {
            assert!(matches!(
                store.identify(email, phone),
                Err(IdentityError::InvalidInput(_))
            ));
        }
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM contacts"), 0);
    }

    #[test]
    fn triggers_block_created_at_rewrites_and_promotions() {
        let store = fixture_store();
        let _ = identify(&store, Some("lorraine@hillvalley.edu"), Some("123456"));
        let _ = identify(&store, Some("mcfly@hillvalley.edu"), Some("123456"));
        let conn = store.connection();

        let rewrite = conn.execute(
            "UPDATE contacts SET created_at = '2000-01-01T00:00:00Z' WHERE id = 1",
            [],
        );
        match rewrite {
            Ok(_) => panic!("expected created_at rewrite to fail"),
            Err(err) => assert!(err.to_string().contains("immutable")),
        }

        let promotion = conn.execute(
            "UPDATE contacts SET link_precedence = 'primary', linked_id = NULL WHERE id = 2",
            [],
        );
        match promotion {
            Ok(_) => panic!("expected promotion to fail"),
            Err(err) => assert!(err.to_string().contains("cannot be promoted")),
        }
    }

    #[test]
    fn schema_checks_reject_malformed_rows() {
        let store = fixture_store();
        let conn = store.connection();
        let stamp = must(format_rfc3339(now_utc()));

        for (email, phone, linked, precedence) in [
            (None, None, None, "primary"),
            (None, Some("12-34"), None, "primary"),
            (Some("x@example.com"), None, Some(1_i64), "primary"),
            (Some("x@example.com"), None, None, "secondary"),
        ] {
            let result = conn.execute(
                "INSERT INTO contacts(email, phone_number, linked_id, link_precedence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![email, phone, linked, precedence, stamp],
            );
            match result {
                Ok(_) => panic!("row should be rejected: {email:?} {phone:?} {linked:?} {precedence}"),
                Err(err) => assert!(matches!(map_sqlite_error(err), StoreError::Constraint(_))),
            }
        }
    }

    #[test]
    fn failed_resolution_rolls_back_earlier_writes() {
        let store = fixture_store();
        let _ = identify(&store, Some("george@hillvalley.edu"), Some("919191"));
        let _ = identify(&store, Some("biffsucks@hillvalley.edu"), Some("717171"));
        must(store.connection().execute_batch(
            "CREATE TRIGGER trg_test_reject_pair BEFORE INSERT ON contacts
             WHEN NEW.email = 'george@hillvalley.edu' AND NEW.phone_number = '717171'
             BEGIN SELECT RAISE(ABORT, 'pair insert rejected'); END;",
        ));

        match store.identify(Some("george@hillvalley.edu"), Some("717171")) {
            Err(IdentityError::Store(StoreError::Constraint(message))) => {
                assert!(message.contains("pair insert rejected"), "{message}");
            }
            other => panic!("expected constraint failure, got {other:?}"),
        }

        let biff = match must(store.get_contact(ContactId(2))) {
            Some(record) => record,
            None => panic!("expected contact 2"),
        };
        assert_eq!(biff.link_precedence, LinkPrecedence::Primary);
        assert_eq!(biff.linked_id, None);
    }

    #[test]
    fn primary_missing_is_rejected_then_repaired_on_request() {
        let reject = fixture_store();
        let _ = identify(&reject, Some("p@example.com"), Some("100"));
        let _ = identify(&reject, Some("c@example.com"), Some("100"));
        must(reject.connection().execute(
            "UPDATE contacts SET deleted_at = updated_at WHERE id = 1",
            [],
        ));
        assert!(!must(reject.integrity_check()).healthy);

        match reject.identify(Some("c@example.com"), None) {
            Err(IdentityError::IntegrityViolation(IntegrityViolation::PrimaryMissing {
                root_ids,
            })) => assert_eq!(root_ids, ids(&[1])),
            other => panic!("expected primary-missing violation, got {other:?}"),
        }
        assert_eq!(count_rows(&reject, "SELECT COUNT(*) FROM contacts"), 2);

        let repair = fixture_store_with(StoreConfig {
            resolve: ResolveOptions {
                integrity_policy: IntegrityPolicy::Repair,
                ..ResolveOptions::default()
            },
            ..StoreConfig::default()
        });
        let _ = identify(&repair, Some("p@example.com"), Some("100"));
        let _ = identify(&repair, Some("c@example.com"), Some("100"));
        must(repair.connection().execute(
            "UPDATE contacts SET deleted_at = updated_at WHERE id = 1",
            [],
        ));

        let repaired = identify(&repair, Some("c@example.com"), None);
        assert_eq!(repaired.view.primary_contact_id, ContactId(3));
        assert_eq!(repaired.view.secondary_contact_ids, ids(&[2]));
        assert!(repaired.report.repaired.is_some());

        let report = must(repair.integrity_check());
        assert!(report.healthy, "{report:?}");
    }

    #[test]
    fn dangling_root_is_relinked_under_repair_policy() {
        let store = fixture_store_with(StoreConfig {
            resolve: ResolveOptions {
                integrity_policy: IntegrityPolicy::Repair,
                ..ResolveOptions::default()
            },
            ..StoreConfig::default()
        });
        let _ = identify(&store, Some("a@example.com"), Some("111"));
        let _ = identify(&store, Some("b@example.com"), Some("222"));
        let _ = identify(&store, Some("b2@example.com"), Some("222"));
        // Demote 2 without moving its secondary, leaving 3 nested under it.
        must(store.connection().execute(
            "UPDATE contacts SET link_precedence = 'secondary', linked_id = 1 WHERE id = 2",
            [],
        ));
        let broken = must(store.integrity_check());
        assert!(broken
            .issues
            .iter()
            .any(|issue| issue.code == "nested_secondary" && issue.contact_ids == ids(&[3])));

        let resolution = identify(&store, Some("b2@example.com"), Some("111"));

        assert_eq!(resolution.view.primary_contact_id, ContactId(1));
        assert!(matches!(
            resolution.report.repaired,
            Some(IntegrityViolation::DanglingRoots { .. })
        ));
        let child = match must(store.get_contact(ContactId(3))) {
            Some(record) => record,
            None => panic!("expected contact 3"),
        };
        assert_eq!(child.linked_id, Some(ContactId(1)));
        assert!(must(store.integrity_check()).healthy);
    }

    #[test]
    fn integrity_check_flags_identifiers_split_across_clusters() {
        let store = fixture_store();
        let _ = identify(&store, Some("a@example.com"), Some("111"));
        let stamp = must(format_rfc3339(now_utc()));
        must(store.connection().execute(
            "INSERT INTO contacts(email, phone_number, link_precedence, created_at, updated_at)
             VALUES ('a@example.com', '999', 'primary', ?1, ?1)",
            params![stamp],
        ));

        let report = must(store.integrity_check());
        assert!(!report.healthy);
        assert_eq!(report.primaries, 2);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.code == "identifier_shared_across_clusters"
                && issue.contact_ids == ids(&[1, 2])));
    }

    #[test]
    fn pool_exhaustion_surfaces_as_store_error_and_recovers() {
        let path = unique_temp_db_path();
        let store = file_store(
            &path,
            StoreConfig {
                max_connections: 1,
                acquire_timeout: Duration::from_millis(30),
                ..StoreConfig::default()
            },
        );

        let held = store.connection();
        match store.identify(Some("wait@example.com"), None) {
            Err(IdentityError::Store(StoreError::PoolExhausted { waited_ms })) => {
                assert_eq!(waited_ms, 30);
            }
            other => panic!("expected pool exhaustion, got {other:?}"),
        }
        drop(held);

        let resolution = identify(&store, Some("wait@example.com"), None);
        assert_eq!(resolution.view.primary_contact_id, ContactId(1));
        assert_eq!(store.pool_status().open_connections, 1);

        store.close();
        assert!(matches!(
            store.identify(Some("wait@example.com"), None),
            Err(IdentityError::Store(StoreError::Connection(_)))
        ));
        remove_db(&path);
    }

    #[test]
    fn sqlite_busy_timeout_allows_identify_after_lock_release() {
        let path = unique_temp_db_path();
        drop(file_store(&path, StoreConfig::default()));

        let lock_conn = match rusqlite::Connection::open(&path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let identify_path = path.clone();
        let identify_handle = std::thread::spawn(move || {
            let store = match SqliteContactStore::open(&identify_path, StoreConfig::default()) {
                Ok(value) => value,
                Err(err) => panic!("failed to open identify store: {err}"),
            };
            store.identify(Some("doc@hillvalley.edu"), Some("1955"))
        });

        std::thread::sleep(Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let identify_result = match identify_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("identify thread join failed: {err:?}"),
        };
        assert!(
            identify_result.is_ok(),
            "identify should succeed after lock release: {:?}",
            identify_result.err()
        );
        remove_db(&path);
    }

    #[test]
    fn lock_held_past_busy_timeout_is_retried_then_reported_as_conflict() {
        let path = unique_temp_db_path();
        let store = file_store(
            &path,
            StoreConfig {
                busy_timeout: Duration::from_millis(20),
                retry_backoff: Duration::from_millis(1),
                max_attempts: 2,
                ..StoreConfig::default()
            },
        );

        let lock_conn = match rusqlite::Connection::open(&path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let result = store.identify(Some("blocked@example.com"), None);
        match result {
            Err(err) => assert!(err.is_transient(), "expected conflict, got {err}"),
            Ok(resolution) => panic!("expected conflict, got {resolution:?}"),
        }

        if let Err(err) = lock_conn.execute_batch("ROLLBACK;") {
            panic!("failed to release write lock: {err}");
        }
        let _ = identify(&store, Some("blocked@example.com"), None);
        remove_db(&path);
    }

    #[test]
    fn concurrent_bridging_requests_leave_a_single_primary() {
        let path = unique_temp_db_path();
        let store = Arc::new(file_store(&path, StoreConfig::default()));
        let _ = identify(&store, Some("a@example.com"), Some("111"));
        let _ = identify(&store, Some("b@example.com"), Some("222"));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let phone = if worker % 2 == 0 { "222" } else { "111" };
                    let email = if worker % 2 == 0 { "a@example.com" } else { "b@example.com" };
                    store.identify(Some(email), Some(phone))
                })
            })
            .collect();

        for handle in handles {
            let resolution = match handle.join() {
                Ok(result) => must(result),
                Err(err) => panic!("worker panicked: {err:?}"),
            };
            assert_eq!(resolution.view.primary_contact_id, ContactId(1));
        }

        assert_eq!(
            count_rows(
                &store,
                "SELECT COUNT(*) FROM contacts WHERE link_precedence = 'primary'"
            ),
            1
        );
        assert!(must(store.integrity_check()).healthy);
        remove_db(&path);
    }

    #[test]
    fn database_urls_map_to_filesystem_paths() {
        assert_eq!(database_path_from_url("./contacts.sqlite3"), PathBuf::from("./contacts.sqlite3"));
        assert_eq!(database_path_from_url("sqlite://data/c.db"), PathBuf::from("data/c.db"));
        assert_eq!(database_path_from_url("sqlite:c.db?mode=rwc"), PathBuf::from("c.db"));
        assert_eq!(database_path_from_url("file:/tmp/c.db"), PathBuf::from("/tmp/c.db"));
        assert_eq!(database_path_from_url(":memory:"), PathBuf::from(":memory:"));
    }

    fn observation_strategy() -> impl Strategy<Value = (Option<u8>, Option<u8>)> {
        (proptest::option::of(0u8..5), proptest::option::of(0u8..5))
            .prop_filter("at least one field", |(email, phone)| {
                email.is_some() || phone.is_some()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_random_streams_keep_store_healthy(
            stream in prop::collection::vec(observation_strategy(), 1..30)
        ) {
            let store = fixture_store();
            for (email_code, phone_code) in stream {
                let email = email_code.map(|code| format!("user{code}@example.com"));
                let phone = phone_code.map(|code| format!("77{code}"));
                let resolution = identify(&store, email.as_deref(), phone.as_deref());
                prop_assert_eq!(
                    must(store.cluster(resolution.view.primary_contact_id)),
                    Some(resolution.view)
                );
            }
            let report = must(store.integrity_check());
            prop_assert!(report.healthy, "{:?}", report);
        }
    }
}
