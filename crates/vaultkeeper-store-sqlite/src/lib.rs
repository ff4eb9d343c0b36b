use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use vaultkeeper_core::{ModelId, PrimaryKey, Record, RecordStore, StoreError, UpsertOutcome};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  model TEXT NOT NULL,
  pk_kind TEXT NOT NULL CHECK (pk_kind IN ('int','str')),
  pk TEXT NOT NULL,
  fields_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (model, pk_kind, pk)
);

CREATE INDEX IF NOT EXISTS idx_records_model ON records(model);
";

const ORDER_BY_PK: &str =
    "ORDER BY pk_kind ASC, CASE WHEN pk_kind = 'int' THEN CAST(pk AS INTEGER) END ASC, pk ASC";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: u64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self
            .conn
            .transaction()
            .context("failed to start migration v1")?;
            tx.execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        Ok(())
    }

    /// Run quick-check and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let record_count = if schema_status.current_version >= 1 {
            let count: i64 = self
                .conn
                .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
                .context("failed to count records")?;
            u64::try_from(count).unwrap_or_default()
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_count,
            schema_status,
        })
    }

    fn list_models(&self) -> Result<Vec<ModelId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT model FROM records ORDER BY model ASC")
            .context("failed to prepare model listing")?;
        let mut rows = stmt.query([])?;
        let mut models = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            models.push(ModelId::parse(&raw).with_context(|| format!("stored model `{raw}`"))?);
        }
        Ok(models)
    }

    fn load_records(&self, model: &ModelId) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT pk_kind, pk, fields_json FROM records WHERE model = ?1 {ORDER_BY_PK}"
            ))
            .context("failed to prepare record listing")?;
        let mut rows = stmt.query(params![model.as_str()])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let pk_kind: String = row.get(0)?;
            let pk_raw: String = row.get(1)?;
            let fields_json: String = row.get(2)?;
            let pk = PrimaryKey::decode(&pk_kind, &pk_raw)
                .with_context(|| format!("invalid stored key for {model}"))?;
            let fields: Map<String, Value> = serde_json::from_str(&fields_json)
                .with_context(|| format!("failed to decode fields of {model}(pk={pk})"))?;
            records.push(Record::new(model.clone(), pk, fields));
        }

        Ok(records)
    }

    fn count_records(&self, model: &ModelId) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE model = ?1",
                params![model.as_str()],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count records of {model}"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn record_exists(&self, model: &ModelId, pk: &PrimaryKey) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE model = ?1 AND pk_kind = ?2 AND pk = ?3)",
            params![model.as_str(), pk.kind(), pk.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    fn write_record(&mut self, record: &Record, replace: bool) -> Result<Option<UpsertOutcome>> {
        let fields_json =
            serde_json::to_string(&record.fields).context("failed to serialize record fields")?;
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;

        let existed = tx
            .query_row(
                "SELECT 1 FROM records WHERE model = ?1 AND pk_kind = ?2 AND pk = ?3",
                params![
                    record.model.as_str(),
                    record.pk.kind(),
                    record.pk.to_string()
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up existing record")?
            .is_some();

        if existed && !replace {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO records(model, pk_kind, pk, fields_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(model, pk_kind, pk)
             DO UPDATE SET fields_json = excluded.fields_json, updated_at = excluded.updated_at",
            params![
                record.model.as_str(),
                record.pk.kind(),
                record.pk.to_string(),
                fields_json,
                now
            ],
        )
        .with_context(|| format!("failed to write {}(pk={})", record.model, record.pk))?;

        tx.commit().context("failed to commit write transaction")?;
        let outcome = if existed {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Inserted
        };
        Ok(Some(outcome))
    }

    fn delete_model_records(&mut self, model: &ModelId) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM records WHERE model = ?1",
                params![model.as_str()],
            )
            .with_context(|| format!("failed to delete records of {model}"))?;
        Ok(deleted as u64)
    }

    fn clear_records(&mut self, preserve: &[ModelId]) -> Result<u64> {
        let models = self.list_models()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start clear transaction")?;
        let mut deleted = 0_u64;
        for model in models.iter().filter(|model| !preserve.contains(model)) {
            deleted += tx
                .execute(
                    "DELETE FROM records WHERE model = ?1",
                    params![model.as_str()],
                )
                .with_context(|| format!("failed to clear records of {model}"))?
                as u64;
        }
        tx.commit().context("failed to commit clear transaction")?;
        Ok(deleted)
    }

    fn rewrite_field_values(
        &mut self,
        model: &ModelId,
        field: &str,
        assignments: &[(PrimaryKey, Value)],
    ) -> Result<usize> {
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start rewrite transaction")?;

        for (pk, value) in assignments {
            rewrite_one(&tx, model, pk, field, value, &now)?;
        }

        tx.commit().context("failed to commit rewrite transaction")?;
        Ok(assignments.len())
    }
}

impl RecordStore for SqliteStore {
    fn models(&self) -> Result<Vec<ModelId>, StoreError> {
        self.list_models().map_err(backend)
    }

    fn records_of(&self, model: &ModelId) -> Result<Vec<Record>, StoreError> {
        self.load_records(model).map_err(backend)
    }

    fn count(&self, model: &ModelId) -> Result<u64, StoreError> {
        self.count_records(model).map_err(backend)
    }

    fn contains(&self, model: &ModelId, pk: &PrimaryKey) -> Result<bool, StoreError> {
        self.record_exists(model, pk).map_err(backend)
    }

    fn upsert(&mut self, record: &Record) -> Result<UpsertOutcome, StoreError> {
        self.write_record(record, true)
            .map_err(backend)?
            .ok_or_else(|| StoreError::Backend("upsert reported no outcome".to_string()))
    }

    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError> {
        self.write_record(record, false)
            .map(|outcome| outcome.is_some())
            .map_err(backend)
    }

    fn delete_model(&mut self, model: &ModelId) -> Result<u64, StoreError> {
        self.delete_model_records(model).map_err(backend)
    }

    fn clear(&mut self, preserve: &[ModelId]) -> Result<u64, StoreError> {
        self.clear_records(preserve).map_err(backend)
    }

    fn rewrite_field(
        &mut self,
        model: &ModelId,
        field: &str,
        assignments: &[(PrimaryKey, Value)],
    ) -> Result<usize, StoreError> {
        self.rewrite_field_values(model, field, assignments)
            .map_err(backend)
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

fn rewrite_one(
    tx: &Transaction<'_>,
    model: &ModelId,
    pk: &PrimaryKey,
    field: &str,
    value: &Value,
    now: &str,
) -> Result<()> {
    let fields_json: Option<String> = tx
        .query_row(
            "SELECT fields_json FROM records WHERE model = ?1 AND pk_kind = ?2 AND pk = ?3",
            params![model.as_str(), pk.kind(), pk.to_string()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to load {model}(pk={pk}) for rewrite"))?;
    let Some(fields_json) = fields_json else {
        return Err(anyhow!("cannot rewrite {field} on missing record {model}(pk={pk})"));
    };

    let mut fields: Map<String, Value> = serde_json::from_str(&fields_json)
        .with_context(|| format!("failed to decode fields of {model}(pk={pk})"))?;
    fields.insert(field.to_string(), value.clone());

    tx.execute(
        "UPDATE records SET fields_json = ?4, updated_at = ?5
         WHERE model = ?1 AND pk_kind = ?2 AND pk = ?3",
        params![
            model.as_str(),
            pk.kind(),
            pk.to_string(),
            serde_json::to_string(&fields).context("failed to serialize record fields")?,
            now
        ],
    )
    .with_context(|| format!("failed to rewrite {field} on {model}(pk={pk})"))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
