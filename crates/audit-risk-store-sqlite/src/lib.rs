#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use audit_risk_core::{
    ensure_can_create_engagement, format_rfc3339, now_utc, parse_rfc3339_utc, AssessmentInput,
    AssessmentKind, Engagement, KraProgress, KraProgressInput, KraStatus, LegalReference,
    NewEngagement, NewRisk, NewRiskEvent, PersistenceGateway, Priority, RatingBandTable,
    RiskAssessment, RiskError, RiskEvent, RiskEventStatus, RiskRegisterEntry, SourceType,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const RISK_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RISK_V1: &str = r"
CREATE TABLE IF NOT EXISTS rating_band_tables (
  name TEXT PRIMARY KEY,
  table_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_events (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT,
  source_type TEXT NOT NULL CHECK (
    source_type IN ('planned', 'secretary', 'management', 'request')
  ),
  priority TEXT NOT NULL CHECK (priority IN ('low', 'medium', 'high', 'critical')),
  is_override INTEGER NOT NULL DEFAULT 0 CHECK (is_override IN (0, 1)),
  status TEXT NOT NULL CHECK (
    status IN (
      'pending',
      'under_review',
      'approved',
      'allocated',
      'in_progress',
      'on_hold',
      'completed',
      'cancelled',
      'rejected'
    )
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_risk_events_status_created
  ON risk_events(status, created_at);

CREATE TABLE IF NOT EXISTS engagements (
  id TEXT PRIMARY KEY,
  risk_event_id TEXT NOT NULL,
  title TEXT NOT NULL,
  lead_auditor TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (risk_event_id) REFERENCES risk_events(id)
);

CREATE INDEX IF NOT EXISTS idx_engagements_event
  ON engagements(risk_event_id, created_at);

CREATE TABLE IF NOT EXISTS risk_register (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  category TEXT NOT NULL,
  band_table TEXT NOT NULL,
  inherent_likelihood INTEGER NOT NULL CHECK (inherent_likelihood BETWEEN 1 AND 5),
  inherent_impact INTEGER NOT NULL CHECK (inherent_impact BETWEEN 1 AND 5),
  inherent_score INTEGER NOT NULL,
  inherent_rating TEXT NOT NULL,
  residual_likelihood INTEGER CHECK (
    residual_likelihood BETWEEN 1 AND 5 OR residual_likelihood IS NULL
  ),
  residual_impact INTEGER CHECK (residual_impact BETWEEN 1 AND 5 OR residual_impact IS NULL),
  residual_score INTEGER,
  residual_rating TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (band_table) REFERENCES rating_band_tables(name)
);

CREATE INDEX IF NOT EXISTS idx_risk_register_category
  ON risk_register(category, created_at);

CREATE TABLE IF NOT EXISTS risk_legal_references (
  risk_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  instrument TEXT NOT NULL,
  section TEXT,
  PRIMARY KEY (risk_id, position),
  FOREIGN KEY (risk_id) REFERENCES risk_register(id)
);

CREATE TABLE IF NOT EXISTS kra_progress (
  kra_activity_id TEXT NOT NULL,
  financial_year TEXT NOT NULL,
  quarter INTEGER NOT NULL CHECK (quarter BETWEEN 1 AND 4),
  target REAL NOT NULL,
  actual REAL NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('not_started', 'on_track', 'behind', 'completed')),
  comment TEXT,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (kra_activity_id, financial_year, quarter)
);
";

const RISK_EVENT_COLUMNS: &str =
    "id, title, description, source_type, priority, is_override, status, created_at, updated_at";

const RISK_REGISTER_COLUMNS: &str = "id, title, category, band_table,
    inherent_likelihood, inherent_impact, inherent_score, inherent_rating,
    residual_likelihood, residual_impact, residual_score, residual_rating,
    created_at, updated_at";

pub struct SqliteRiskStore {
    conn: Connection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskEventFilter {
    pub status: Option<RiskEventStatus>,
    pub source_type: Option<SourceType>,
    pub search: Option<String>,
    pub created_from: Option<OffsetDateTime>,
    pub created_to: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskFilter {
    pub category: Option<String>,
    /// Matched against the recomputed inherent rating, not the stored column.
    pub rating: Option<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RegisterDrift {
    pub risk_id: Ulid,
    pub kind: AssessmentKind,
    pub stored_score: Option<i64>,
    pub stored_rating: Option<String>,
    pub expected_score: u8,
    pub expected_rating: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RegisterCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub scanned: usize,
    pub drifted: Vec<RegisterDrift>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RescoreReport {
    pub contract_version: String,
    pub scanned: usize,
    pub corrected: usize,
}

/// Raw `risk_register` row before derived columns are re-checked.
struct StoredRiskRow {
    id: Ulid,
    title: String,
    category: String,
    band_table: String,
    inherent: StoredAssessment,
    residual: Option<StoredAssessment>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

struct StoredAssessment {
    input: AssessmentInput,
    score: Option<i64>,
    rating: Option<String>,
}

struct EvaluatedRisk {
    entry: RiskRegisterEntry,
    drift: Vec<RegisterDrift>,
}

impl SqliteRiskStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "opened risk store");
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RISK_V1)
            .context("failed to apply risk schema")?;

        let now = storage_timestamp(now_utc())?;
        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RISK_MIGRATION_VERSION, now],
            )
            .context("failed to register risk schema migration")?;
        if applied > 0 {
            info!(version = RISK_MIGRATION_VERSION, "applied risk schema migration");
        }

        for table in RatingBandTable::builtins() {
            let payload =
                serde_json::to_string(&table).context("failed to serialize band table")?;
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO rating_band_tables(name, table_json, updated_at)
                     VALUES (?1, ?2, ?3)",
                    params![table.name(), payload, now],
                )
                .with_context(|| format!("failed to seed band table {}", table.name()))?;
        }

        Ok(())
    }

    /// Stores a band table. Tables used for risk scoring MUST catch every
    /// score down to 1.
    pub fn upsert_band_table(&self, table: &RatingBandTable) -> Result<()> {
        table.ensure_complete(1)?;

        let payload = serde_json::to_string(table).context("failed to serialize band table")?;
        let now = storage_timestamp(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO rating_band_tables(name, table_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   table_json = excluded.table_json,
                   updated_at = excluded.updated_at",
                params![table.name(), payload, now],
            )
            .context("failed to upsert band table")?;

        info!(table = table.name(), bands = table.bands().len(), "stored band table");
        Ok(())
    }

    pub fn get_band_table(&self, name: &str) -> Result<Option<RatingBandTable>> {
        load_band_table(&self.conn, name)
    }

    pub fn list_band_tables(&self) -> Result<BTreeMap<String, RatingBandTable>> {
        load_band_tables(&self.conn)
    }

    pub fn create_risk_event(&mut self, input: &NewRiskEvent) -> Result<RiskEvent> {
        input.validate()?;

        let now = whole_seconds(now_utc())?;
        let event = RiskEvent {
            id: Ulid::new(),
            title: input.title.trim().to_string(),
            description: input.description.clone(),
            source_type: input.source_type,
            priority: audit_risk_core::priority_override(
                input.source_type,
                input.is_override,
                input.priority,
            ),
            is_override: input.is_override,
            status: RiskEventStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        self.conn
            .execute(
                "INSERT INTO risk_events(
                    id, title, description, source_type, priority,
                    is_override, status, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.id.to_string(),
                    event.title,
                    event.description,
                    event.source_type.as_str(),
                    event.priority.as_str(),
                    bool_to_sql(event.is_override),
                    event.status.as_str(),
                    format_rfc3339(event.created_at)?,
                    format_rfc3339(event.updated_at)?,
                ],
            )
            .context("failed to insert risk event")?;

        debug!(
            risk_event_id = %event.id,
            priority = event.priority.as_str(),
            "created risk event"
        );
        Ok(event)
    }

    pub fn get_risk_event(&self, id: Ulid) -> Result<Option<RiskEvent>> {
        load_risk_event(&self.conn, id)
    }

    pub fn list_risk_events(&self, filter: &RiskEventFilter) -> Result<Vec<RiskEvent>> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.status {
            values.push(SqlValue::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(source_type) = filter.source_type {
            values.push(SqlValue::Text(source_type.as_str().to_string()));
            clauses.push(format!("source_type = ?{}", values.len()));
        }
        if let Some(search) = filter.search.as_deref().filter(|value| !value.trim().is_empty()) {
            values.push(SqlValue::Text(contains_pattern(search.trim())));
            clauses.push(format!("title LIKE ?{} ESCAPE '\\'", values.len()));
        }
        if let Some(from) = filter.created_from {
            values.push(SqlValue::Text(storage_timestamp(from)?));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(to) = filter.created_to {
            values.push(SqlValue::Text(storage_timestamp(to)?));
            clauses.push(format!("created_at <= ?{}", values.len()));
        }

        let mut query = format!("SELECT {RISK_EVENT_COLUMNS} FROM risk_events");
        push_where(&mut query, &clauses);
        query.push_str(" ORDER BY created_at ASC, rowid ASC");
        push_limit(&mut query, filter.limit);

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_risk_event_row)?;
        collect_rows(rows)
    }

    /// Moves a risk event to `next` through a conditional status write.
    pub fn transition_risk_event(&mut self, id: Ulid, next: RiskEventStatus) -> Result<RiskEvent> {
        let at = whole_seconds(now_utc())?;
        let previous = audit_risk_core::transition_risk_event(self, id, next, at)?;
        info!(
            risk_event_id = %id,
            from = previous.as_str(),
            to = next.as_str(),
            "risk event status changed"
        );

        self.get_risk_event(id)?
            .ok_or_else(|| anyhow!("risk event {id} disappeared after status change"))
    }

    /// Creates an engagement after re-checking the source event's status in
    /// the same write transaction.
    pub fn create_engagement(&mut self, input: &NewEngagement) -> Result<Engagement> {
        input.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start engagement transaction")?;

        let Some(event) = load_risk_event(&tx, input.risk_event_id)? else {
            return Err(
                RiskError::Validation(format!("unknown risk event {}", input.risk_event_id))
                    .into(),
            );
        };
        ensure_can_create_engagement(&event)?;

        let engagement = Engagement {
            id: Ulid::new(),
            risk_event_id: event.id,
            title: input.title.trim().to_string(),
            lead_auditor: input.lead_auditor.clone(),
            created_at: whole_seconds(now_utc())?,
        };

        tx.execute(
            "INSERT INTO engagements(id, risk_event_id, title, lead_auditor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                engagement.id.to_string(),
                engagement.risk_event_id.to_string(),
                engagement.title,
                engagement.lead_auditor,
                format_rfc3339(engagement.created_at)?,
            ],
        )
        .context("failed to insert engagement")?;

        tx.commit()
            .context("failed to commit engagement transaction")?;

        debug!(
            engagement_id = %engagement.id,
            risk_event_id = %engagement.risk_event_id,
            "created engagement"
        );
        Ok(engagement)
    }

    pub fn list_engagements(&self, risk_event_id: Option<Ulid>) -> Result<Vec<Engagement>> {
        let mut query = "SELECT id, risk_event_id, title, lead_auditor, created_at
             FROM engagements"
            .to_string();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(event_id) = risk_event_id {
            values.push(SqlValue::Text(event_id.to_string()));
            query.push_str(" WHERE risk_event_id = ?1");
        }
        query.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_engagement_row)?;
        collect_rows(rows)
    }

    /// Inserts a register entry and its legal references atomically. The band
    /// table is resolved inside the same write transaction.
    pub fn create_risk(&mut self, input: &NewRisk) -> Result<RiskRegisterEntry> {
        input.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start risk transaction")?;

        let table = require_band_table(&tx, &input.band_table)?;
        let inherent = RiskAssessment::assess(AssessmentKind::Inherent, input.inherent, &table)?;
        let residual = input
            .residual
            .map(|residual| RiskAssessment::assess(AssessmentKind::Residual, residual, &table))
            .transpose()?;

        let now = whole_seconds(now_utc())?;
        let entry = RiskRegisterEntry {
            id: Ulid::new(),
            title: input.title.trim().to_string(),
            category: input.category.trim().to_string(),
            band_table: table.name().to_string(),
            inherent,
            residual,
            legal_references: input.legal_references.clone(),
            created_at: now,
            updated_at: now,
        };

        tx.execute(
            &format!(
                "INSERT INTO risk_register({RISK_REGISTER_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4,
                    ?5, ?6, ?7, ?8,
                    ?9, ?10, ?11, ?12,
                    ?13, ?14
                 )"
            ),
            params![
                entry.id.to_string(),
                entry.title,
                entry.category,
                entry.band_table,
                i64::from(entry.inherent.likelihood()),
                i64::from(entry.inherent.impact()),
                i64::from(entry.inherent.score()),
                entry.inherent.rating(),
                entry.residual.as_ref().map(|value| i64::from(value.likelihood())),
                entry.residual.as_ref().map(|value| i64::from(value.impact())),
                entry.residual.as_ref().map(|value| i64::from(value.score())),
                entry.residual.as_ref().map(RiskAssessment::rating),
                format_rfc3339(entry.created_at)?,
                format_rfc3339(entry.updated_at)?,
            ],
        )
        .context("failed to insert risk register entry")?;

        for (position, reference) in entry.legal_references.iter().enumerate() {
            tx.execute(
                "INSERT INTO risk_legal_references(risk_id, position, instrument, section)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.id.to_string(),
                    i64::try_from(position).context("legal reference position overflow")?,
                    reference.instrument,
                    reference.section,
                ],
            )
            .context("failed to insert legal reference")?;
        }

        tx.commit().context("failed to commit risk transaction")?;

        debug!(
            risk_id = %entry.id,
            inherent = %entry.inherent,
            legal_references = entry.legal_references.len(),
            "created risk register entry"
        );
        Ok(entry)
    }

    /// Returns the entry with score and rating recomputed from the stored
    /// likelihood and impact.
    pub fn get_risk(&self, id: Ulid) -> Result<Option<RiskRegisterEntry>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RISK_REGISTER_COLUMNS} FROM risk_register WHERE id = ?1"),
                params![id.to_string()],
                parse_risk_row,
            )
            .optional()
            .context("failed to query risk register entry")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tables = load_band_tables(&self.conn)?;
        let evaluated = evaluate_risk_row(&self.conn, row, &tables)?;
        for drift in &evaluated.drift {
            warn!(
                risk_id = %drift.risk_id,
                kind = drift.kind.as_str(),
                stored_score = ?drift.stored_score,
                stored_rating = ?drift.stored_rating,
                expected_score = drift.expected_score,
                expected_rating = %drift.expected_rating,
                "stored risk rating drifted from recomputed value"
            );
        }
        Ok(Some(evaluated.entry))
    }

    pub fn list_risks(&self, filter: &RiskFilter) -> Result<Vec<RiskRegisterEntry>> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(category) = filter.category.as_deref() {
            values.push(SqlValue::Text(category.trim().to_string()));
            clauses.push(format!("category = ?{}", values.len()));
        }
        if let Some(search) = filter.search.as_deref().filter(|value| !value.trim().is_empty()) {
            values.push(SqlValue::Text(contains_pattern(search.trim())));
            clauses.push(format!("title LIKE ?{} ESCAPE '\\'", values.len()));
        }

        let mut query = format!("SELECT {RISK_REGISTER_COLUMNS} FROM risk_register");
        push_where(&mut query, &clauses);
        query.push_str(" ORDER BY created_at ASC, rowid ASC");

        let rows = {
            let mut stmt = self.conn.prepare(&query)?;
            let mapped = stmt.query_map(params_from_iter(values.iter()), parse_risk_row)?;
            collect_rows(mapped)?
        };

        let tables = load_band_tables(&self.conn)?;
        let mut entries = Vec::new();
        for row in rows {
            let entry = evaluate_risk_row(&self.conn, row, &tables)?.entry;
            if let Some(rating) = filter.rating.as_deref() {
                if entry.inherent.rating() != rating {
                    continue;
                }
            }
            entries.push(entry);
            if filter.limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }
        }

        Ok(entries)
    }

    /// Replaces the raw inputs of one entry and recomputes its derived
    /// columns in a single write transaction.
    pub fn update_risk_assessment(
        &mut self,
        id: Ulid,
        inherent: AssessmentInput,
        residual: Option<AssessmentInput>,
    ) -> Result<RiskRegisterEntry> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start risk update transaction")?;

        let band_table = tx
            .query_row(
                "SELECT band_table FROM risk_register WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to query risk band table")?
            .ok_or_else(|| RiskError::Validation(format!("unknown risk {id}")))?;

        let table = require_band_table(&tx, &band_table)?;
        let inherent = RiskAssessment::assess(AssessmentKind::Inherent, inherent, &table)?;
        let residual = residual
            .map(|value| RiskAssessment::assess(AssessmentKind::Residual, value, &table))
            .transpose()?;

        write_assessments(&tx, id, &inherent, residual.as_ref(), whole_seconds(now_utc())?)?;
        tx.commit()
            .context("failed to commit risk update transaction")?;

        debug!(risk_id = %id, inherent = %inherent, "rescored risk register entry");
        self.get_risk(id)?
            .ok_or_else(|| anyhow!("risk {id} disappeared after update"))
    }

    /// Lists entries whose stored score or rating disagrees with the
    /// derivation from their raw inputs and current band table.
    pub fn register_check(&self) -> Result<RegisterCheck> {
        let rows = load_risk_rows(&self.conn)?;
        let tables = load_band_tables(&self.conn)?;
        let scanned = rows.len();

        let mut drifted = Vec::new();
        for row in rows {
            drifted.extend(evaluate_risk_row(&self.conn, row, &tables)?.drift);
        }

        Ok(RegisterCheck {
            contract_version: "register_check.v1".to_string(),
            healthy: drifted.is_empty(),
            scanned,
            drifted,
        })
    }

    /// Rewrites drifted score and rating columns from the raw inputs. Rows are
    /// read and written inside one write transaction and the raw inputs are
    /// never written.
    pub fn rescore_register(&mut self) -> Result<RescoreReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start rescore transaction")?;

        let rows = load_risk_rows(&tx)?;
        let tables = load_band_tables(&tx)?;
        let scanned = rows.len();

        let mut pending = Vec::new();
        for row in rows {
            let evaluated = evaluate_risk_row(&tx, row, &tables)?;
            if !evaluated.drift.is_empty() {
                pending.push(evaluated.entry);
            }
        }

        let now = whole_seconds(now_utc())?;
        for entry in &pending {
            write_derived(&tx, entry, now)?;
        }
        tx.commit().context("failed to commit rescore transaction")?;

        info!(scanned, corrected = pending.len(), "rescored risk register");
        Ok(RescoreReport {
            contract_version: "rescore_report.v1".to_string(),
            scanned,
            corrected: pending.len(),
        })
    }

    pub fn upsert_kra_progress(&mut self, input: &KraProgressInput) -> Result<KraProgress> {
        input.validate()?;

        let progress = KraProgress {
            kra_activity_id: input.kra_activity_id.trim().to_string(),
            financial_year: input.financial_year.trim().to_string(),
            quarter: input.quarter,
            target: input.target,
            actual: input.actual,
            status: input.status,
            comment: input.comment.clone(),
            updated_at: whole_seconds(now_utc())?,
        };

        self.conn
            .execute(
                "INSERT INTO kra_progress(
                    kra_activity_id, financial_year, quarter,
                    target, actual, status, comment, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(kra_activity_id, financial_year, quarter) DO UPDATE SET
                   target = excluded.target,
                   actual = excluded.actual,
                   status = excluded.status,
                   comment = excluded.comment,
                   updated_at = excluded.updated_at",
                params![
                    progress.kra_activity_id,
                    progress.financial_year,
                    i64::from(progress.quarter),
                    progress.target,
                    progress.actual,
                    progress.status.as_str(),
                    progress.comment,
                    format_rfc3339(progress.updated_at)?,
                ],
            )
            .context("failed to upsert kra progress")?;

        debug!(
            kra_activity_id = %progress.kra_activity_id,
            financial_year = %progress.financial_year,
            quarter = progress.quarter,
            "stored kra progress"
        );
        Ok(progress)
    }

    pub fn list_kra_progress(
        &self,
        financial_year: Option<&str>,
        quarter: Option<u8>,
    ) -> Result<Vec<KraProgress>> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(year) = financial_year {
            values.push(SqlValue::Text(year.trim().to_string()));
            clauses.push(format!("financial_year = ?{}", values.len()));
        }
        if let Some(quarter) = quarter {
            values.push(SqlValue::Integer(i64::from(quarter)));
            clauses.push(format!("quarter = ?{}", values.len()));
        }

        let mut query = "SELECT
                kra_activity_id, financial_year, quarter, target, actual,
                status, comment, updated_at
             FROM kra_progress"
            .to_string();
        push_where(&mut query, &clauses);
        query.push_str(" ORDER BY financial_year ASC, kra_activity_id ASC, quarter ASC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_kra_row)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl PersistenceGateway for SqliteRiskStore {
    fn risk_event_status(&self, id: Ulid) -> Result<Option<RiskEventStatus>, RiskError> {
        let raw = self
            .conn
            .query_row(
                "SELECT status FROM risk_events WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| RiskError::ExternalStore(format!("failed to read status: {err}")))?;

        raw.map(|value| {
            RiskEventStatus::parse(&value).ok_or_else(|| {
                RiskError::ExternalStore(format!("invalid stored status: {value}"))
            })
        })
        .transpose()
    }

    fn compare_and_set_status(
        &mut self,
        id: Ulid,
        expected: RiskEventStatus,
        next: RiskEventStatus,
        at: OffsetDateTime,
    ) -> Result<bool, RiskError> {
        let changed = self
            .conn
            .execute(
                "UPDATE risk_events
                 SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    next.as_str(),
                    format_rfc3339(at)?,
                    id.to_string(),
                    expected.as_str()
                ],
            )
            .map_err(|err| RiskError::ExternalStore(format!("failed to write status: {err}")))?;

        Ok(changed == 1)
    }
}

fn load_band_table(conn: &Connection, name: &str) -> Result<Option<RatingBandTable>> {
    let json = conn
        .query_row(
            "SELECT table_json FROM rating_band_tables WHERE name = ?1",
            params![name],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to query band table")?;

    json.as_deref().map(decode_band_table).transpose()
}

fn load_band_tables(conn: &Connection) -> Result<BTreeMap<String, RatingBandTable>> {
    let mut stmt =
        conn.prepare("SELECT name, table_json FROM rating_band_tables ORDER BY name ASC")?;

    let mut rows = stmt.query([])?;
    let mut map = BTreeMap::new();

    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let json: String = row.get(1)?;
        let table = decode_band_table(&json)
            .with_context(|| format!("failed to parse band table {name}"))?;
        map.insert(name, table);
    }

    Ok(map)
}

fn require_band_table(conn: &Connection, name: &str) -> Result<RatingBandTable> {
    match load_band_table(conn, name)? {
        Some(table) => Ok(table),
        None => Err(RiskError::Configuration(format!("unknown band table {name}")).into()),
    }
}

fn load_risk_rows(conn: &Connection) -> Result<Vec<StoredRiskRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RISK_REGISTER_COLUMNS} FROM risk_register ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map([], parse_risk_row)?;
    collect_rows(rows)
}

fn evaluate_risk_row(
    conn: &Connection,
    row: StoredRiskRow,
    tables: &BTreeMap<String, RatingBandTable>,
) -> Result<EvaluatedRisk> {
    let table = tables.get(&row.band_table).ok_or_else(|| {
        RiskError::Configuration(format!(
            "risk {} references unknown band table {}",
            row.id, row.band_table
        ))
    })?;

    let mut drift = Vec::new();
    let inherent = evaluate_stored(
        row.id,
        AssessmentKind::Inherent,
        &row.inherent,
        table,
        &mut drift,
    )?;
    let residual = row
        .residual
        .as_ref()
        .map(|stored| evaluate_stored(row.id, AssessmentKind::Residual, stored, table, &mut drift))
        .transpose()?;

    let legal_references = load_legal_references(conn, row.id)?;

    Ok(EvaluatedRisk {
        entry: RiskRegisterEntry {
            id: row.id,
            title: row.title,
            category: row.category,
            band_table: row.band_table,
            inherent,
            residual,
            legal_references,
            created_at: row.created_at,
            updated_at: row.updated_at,
        },
        drift,
    })
}

fn load_legal_references(conn: &Connection, risk_id: Ulid) -> Result<Vec<LegalReference>> {
    let mut stmt = conn.prepare(
        "SELECT instrument, section
         FROM risk_legal_references
         WHERE risk_id = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![risk_id.to_string()], |row| {
        Ok(LegalReference {
            instrument: row.get(0)?,
            section: row.get(1)?,
        })
    })?;
    collect_rows(rows)
}

fn evaluate_stored(
    risk_id: Ulid,
    kind: AssessmentKind,
    stored: &StoredAssessment,
    table: &RatingBandTable,
    drift: &mut Vec<RegisterDrift>,
) -> Result<RiskAssessment> {
    let assessed = RiskAssessment::assess(kind, stored.input, table)
        .with_context(|| format!("failed to rescore risk {risk_id}"))?;

    let consistent = match (stored.score, stored.rating.as_deref()) {
        (Some(score), Some(rating)) => assessed.matches_stored(score, rating),
        _ => false,
    };
    if !consistent {
        drift.push(RegisterDrift {
            risk_id,
            kind,
            stored_score: stored.score,
            stored_rating: stored.rating.clone(),
            expected_score: assessed.score(),
            expected_rating: assessed.rating().to_string(),
        });
    }

    Ok(assessed)
}

fn write_assessments(
    conn: &Connection,
    id: Ulid,
    inherent: &RiskAssessment,
    residual: Option<&RiskAssessment>,
    at: OffsetDateTime,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE risk_register SET
                inherent_likelihood = ?1,
                inherent_impact = ?2,
                inherent_score = ?3,
                inherent_rating = ?4,
                residual_likelihood = ?5,
                residual_impact = ?6,
                residual_score = ?7,
                residual_rating = ?8,
                updated_at = ?9
             WHERE id = ?10",
            params![
                i64::from(inherent.likelihood()),
                i64::from(inherent.impact()),
                i64::from(inherent.score()),
                inherent.rating(),
                residual.map(|value| i64::from(value.likelihood())),
                residual.map(|value| i64::from(value.impact())),
                residual.map(|value| i64::from(value.score())),
                residual.map(RiskAssessment::rating),
                format_rfc3339(at)?,
                id.to_string(),
            ],
        )
        .context("failed to update risk assessments")?;

    if changed != 1 {
        return Err(RiskError::Validation(format!("unknown risk {id}")).into());
    }
    Ok(())
}

fn write_derived(conn: &Connection, entry: &RiskRegisterEntry, at: OffsetDateTime) -> Result<()> {
    let residual = entry.residual.as_ref();
    conn.execute(
        "UPDATE risk_register SET
            inherent_score = ?1,
            inherent_rating = ?2,
            residual_score = ?3,
            residual_rating = ?4,
            updated_at = ?5
         WHERE id = ?6",
        params![
            i64::from(entry.inherent.score()),
            entry.inherent.rating(),
            residual.map(|value| i64::from(value.score())),
            residual.map(RiskAssessment::rating),
            format_rfc3339(at)?,
            entry.id.to_string(),
        ],
    )
    .context("failed to rewrite derived risk columns")?;
    Ok(())
}

fn load_risk_event(conn: &Connection, id: Ulid) -> Result<Option<RiskEvent>> {
    let event = conn
        .query_row(
            &format!("SELECT {RISK_EVENT_COLUMNS} FROM risk_events WHERE id = ?1"),
            params![id.to_string()],
            parse_risk_event_row,
        )
        .optional()
        .context("failed to query risk event")?;
    Ok(event)
}

fn decode_band_table(json: &str) -> Result<RatingBandTable> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("invalid stored band table JSON")?;
    Ok(RatingBandTable::from_json(&value)?)
}

fn parse_risk_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RiskEvent> {
    let source_raw: String = row.get(3)?;
    let priority_raw: String = row.get(4)?;
    let status_raw: String = row.get(6)?;

    let source_type = SourceType::parse(&source_raw)
        .ok_or_else(|| {
            invalid_column(3, Type::Text, format!("invalid source_type: {source_raw}"))
        })?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| invalid_column(4, Type::Text, format!("invalid priority: {priority_raw}")))?;
    let status = RiskEventStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(6, Type::Text, format!("invalid status: {status_raw}")))?;

    Ok(RiskEvent {
        id: parse_ulid(0, &row.get::<_, String>(0)?)?,
        title: row.get(1)?,
        description: row.get(2)?,
        source_type,
        priority,
        is_override: row.get::<_, i64>(5)? == 1,
        status,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(8)?)?,
    })
}

fn parse_engagement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Engagement> {
    Ok(Engagement {
        id: parse_ulid(0, &row.get::<_, String>(0)?)?,
        risk_event_id: parse_ulid(1, &row.get::<_, String>(1)?)?,
        title: row.get(2)?,
        lead_auditor: row.get(3)?,
        created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

fn parse_risk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRiskRow> {
    let inherent = StoredAssessment {
        input: AssessmentInput {
            likelihood: parse_level(row, 4)?,
            impact: parse_level(row, 5)?,
        },
        score: row.get(6)?,
        rating: row.get(7)?,
    };

    let residual_likelihood: Option<i64> = row.get(8)?;
    let residual_impact: Option<i64> = row.get(9)?;
    let residual = match (residual_likelihood, residual_impact) {
        (Some(_), Some(_)) => Some(StoredAssessment {
            input: AssessmentInput {
                likelihood: parse_level(row, 8)?,
                impact: parse_level(row, 9)?,
            },
            score: row.get(10)?,
            rating: row.get(11)?,
        }),
        (None, None) => None,
        _ => {
            return Err(invalid_column(
                8,
                Type::Integer,
                "residual likelihood and impact MUST both be set or both be NULL".to_string(),
            ))
        }
    };

    Ok(StoredRiskRow {
        id: parse_ulid(0, &row.get::<_, String>(0)?)?,
        title: row.get(1)?,
        category: row.get(2)?,
        band_table: row.get(3)?,
        inherent,
        residual,
        created_at: parse_timestamp(&row.get::<_, String>(12)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(13)?)?,
    })
}

fn parse_kra_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KraProgress> {
    let quarter_i64: i64 = row.get(2)?;
    let status_raw: String = row.get(5)?;

    let quarter = u8::try_from(quarter_i64)
        .map_err(|_| invalid_column(2, Type::Integer, format!("invalid quarter: {quarter_i64}")))?;
    let status = KraStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(5, Type::Text, format!("invalid kra status: {status_raw}")))?;

    Ok(KraProgress {
        kra_activity_id: row.get(0)?,
        financial_year: row.get(1)?,
        quarter,
        target: row.get(3)?,
        actual: row.get(4)?,
        status,
        comment: row.get(6)?,
        updated_at: parse_timestamp(&row.get::<_, String>(7)?)?,
    })
}

fn parse_level(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u8> {
    let value: i64 = row.get(index)?;
    u8::try_from(value)
        .map_err(|_| invalid_column(index, Type::Integer, format!("invalid level: {value}")))
}

fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw)
        .map_err(|_| invalid_column(index, Type::Text, format!("invalid ULID: {raw}")))
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(to_sql_error)
}

fn invalid_column(index: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: RiskError) -> rusqlite::Error {
    invalid_column(0, Type::Text, err.to_string())
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

/// Stored timestamps carry whole seconds so text ordering matches time
/// ordering.
fn whole_seconds(value: OffsetDateTime) -> Result<OffsetDateTime> {
    value
        .replace_nanosecond(0)
        .map_err(|err| anyhow!("failed to truncate timestamp: {err}"))
}

fn storage_timestamp(value: OffsetDateTime) -> Result<String> {
    Ok(format_rfc3339(whole_seconds(value)?)?)
}

/// `LIKE` pattern matching `needle` literally anywhere in the column.
fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn push_where(query: &mut String, clauses: &[String]) {
    if !clauses.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&clauses.join(" AND "));
    }
}

fn push_limit(query: &mut String, limit: Option<usize>) {
    if let Some(raw_limit) = limit {
        query.push_str(" LIMIT ");
        query.push_str(&raw_limit.to_string());
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
