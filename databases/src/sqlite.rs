//! SQLite persistence for the generation pipeline
//!
//! Connection management, schema creation and row lifecycle for
//! requests, test cases, metrics, coverage rows and the security audit
//! log. Checkpoints are written in the same transaction as the status
//! update so an observer sees either both old or both new.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use testops_core::models::{
    AgentName, AuditAction, CaseType, CoverageAnalysis, GenerationMetric, MetricStatus, Request,
    RequestStatus, RiskLevel, SecurityAuditLog, SecurityLayer, TestCase, TestType,
    ValidationStatus,
};

/// SQLite connection manager.
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
    db_path: String,
}

/// Page of test cases with the total row count for the query.
#[derive(Debug, Clone)]
pub struct TestCasePage {
    pub items: Vec<TestCase>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl SqliteStore {
    /// Create or open the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_string_lossy().to_string();

        info!("Opening SQLite database at {path}");

        let conn = Connection::open(&path)
            .map_err(|e| anyhow!("Failed to open SQLite database: {e}"))?;

        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(|e| anyhow!("Failed to enable foreign keys: {e}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .map_err(|e| anyhow!("Failed to set busy timeout: {e}"))?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
            db_path: path,
        })
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| anyhow!("Failed to open in-memory database: {e}"))?;
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(|e| anyhow!("Failed to enable foreign keys: {e}"))?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        })
    }

    pub fn database_path(&self) -> &str {
        &self.db_path
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| anyhow!("Failed to acquire connection lock: {e}"))
    }

    /// Create tables and the required indexes.
    pub fn initialize_schema(&self) -> Result<()> {
        info!("Initializing SQLite schema");

        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                owner TEXT,
                url TEXT NOT NULL,
                requirements TEXT NOT NULL,
                test_type TEXT NOT NULL,
                status TEXT NOT NULL,
                result_summary TEXT NOT NULL,
                error_message TEXT,
                error_code TEXT,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_seconds REAL,
                workflow_checkpoint_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
            CREATE INDEX IF NOT EXISTS idx_requests_created_at ON requests(created_at DESC);

            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                code TEXT NOT NULL,
                test_type TEXT NOT NULL,
                feature TEXT,
                story TEXT,
                title TEXT,
                severity TEXT,
                tags TEXT NOT NULL,
                code_hash TEXT NOT NULL,
                ast_hash TEXT,
                semantic_embedding TEXT,
                covered_requirements TEXT NOT NULL,
                priority INTEGER NOT NULL,
                validation_status TEXT NOT NULL,
                validation_issues TEXT NOT NULL,
                safety_risk_level TEXT NOT NULL,
                is_duplicate INTEGER NOT NULL,
                duplicate_of TEXT,
                similarity_score REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_cases_request ON test_cases(request_id);
            CREATE INDEX IF NOT EXISTS idx_test_cases_code_hash ON test_cases(code_hash);

            CREATE TABLE IF NOT EXISTS generation_metrics (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                model TEXT,
                tokens_input INTEGER,
                tokens_output INTEGER,
                tokens_total INTEGER,
                cost_usd REAL,
                status TEXT NOT NULL,
                error_message TEXT,
                agent_metrics TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_request
                ON generation_metrics(request_id, started_at);

            CREATE TABLE IF NOT EXISTS coverage_analysis (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                requirement_text TEXT NOT NULL,
                requirement_index INTEGER NOT NULL,
                is_covered INTEGER NOT NULL,
                covering_tests TEXT NOT NULL,
                coverage_count INTEGER NOT NULL,
                coverage_score REAL NOT NULL,
                has_gap INTEGER NOT NULL,
                gap_description TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_coverage_request
                ON coverage_analysis(request_id);

            CREATE TABLE IF NOT EXISTS security_audit_log (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                test_id TEXT,
                security_layer TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                issues TEXT NOT NULL,
                blocked_patterns TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_request
                ON security_audit_log(request_id);

            CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                request_id TEXT PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
                checkpoint_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(|e| anyhow!("Failed to create schema: {e}"))?;

        drop(conn);
        info!("SQLite schema initialized");
        Ok(())
    }

    // ---- requests ----

    pub fn insert_request(&self, request: &Request) -> Result<()> {
        debug!("Inserting request {}", request.id);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO requests (id, owner, url, requirements, test_type, status,
                result_summary, error_message, error_code, retry_count, max_retries,
                created_at, started_at, completed_at, duration_seconds, workflow_checkpoint_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16);",
            params![
                request.id.to_string(),
                request.owner.map(|o| o.to_string()),
                request.url,
                serde_json::to_string(&request.requirements)?,
                request.test_type.as_str(),
                request.status.as_str(),
                serde_json::to_string(&request.result_summary)?,
                request.error_message,
                request.error_code,
                request.retry_count,
                request.max_retries,
                request.created_at.to_rfc3339(),
                request.started_at.map(|t| t.to_rfc3339()),
                request.completed_at.map(|t| t.to_rfc3339()),
                request.duration_seconds,
                request.workflow_checkpoint_id.map(|c| c.to_string()),
            ],
        )
        .map_err(|e| anyhow!("Failed to insert request: {e}"))?;

        Ok(())
    }

    pub fn get_request(&self, id: Uuid) -> Result<Option<Request>> {
        let conn = self.conn()?;
        let request = conn
            .query_row(
                "SELECT id, owner, url, requirements, test_type, status, result_summary,
                        error_message, error_code, retry_count, max_retries, created_at,
                        started_at, completed_at, duration_seconds, workflow_checkpoint_id
                 FROM requests WHERE id = ?1;",
                params![id.to_string()],
                Self::map_request_row,
            )
            .optional()
            .map_err(|e| anyhow!("Failed to query request: {e}"))?;
        Ok(request)
    }

    /// Move a request to `next`, enforcing the forward-only transition
    /// rule. Terminal transitions also stamp completion time and
    /// duration.
    pub fn transition_status(&self, id: Uuid, next: RequestStatus) -> Result<Request> {
        let current = self
            .get_request(id)?
            .ok_or_else(|| anyhow!("Request not found: {id}"))?;

        if !current.status.can_transition_to(next) {
            return Err(anyhow!(
                "Illegal status transition {} -> {} for request {id}",
                current.status.as_str(),
                next.as_str()
            ));
        }

        let now = Utc::now();
        let conn = self.conn()?;
        if next.is_terminal() {
            let duration = current
                .started_at
                .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
            conn.execute(
                "UPDATE requests SET status = ?2, completed_at = ?3, duration_seconds = ?4
                 WHERE id = ?1;",
                params![id.to_string(), next.as_str(), now.to_rfc3339(), duration],
            )
            .map_err(|e| anyhow!("Failed to update request status: {e}"))?;
        } else {
            let started_at = current
                .started_at
                .unwrap_or(now);
            conn.execute(
                "UPDATE requests SET status = ?2, started_at = ?3 WHERE id = ?1;",
                params![id.to_string(), next.as_str(), started_at.to_rfc3339()],
            )
            .map_err(|e| anyhow!("Failed to update request status: {e}"))?;
        }
        drop(conn);

        debug!(
            "Request {id}: {} -> {}",
            current.status.as_str(),
            next.as_str()
        );
        self.get_request(id)?
            .ok_or_else(|| anyhow!("Request disappeared during update: {id}"))
    }

    /// Terminal failure with a stable machine-readable code.
    pub fn mark_failed(&self, id: Uuid, error_code: &str, error_message: &str) -> Result<()> {
        warn!("Request {id} failed ({error_code}): {error_message}");
        self.transition_status(id, RequestStatus::Failed)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE requests SET error_code = ?2, error_message = ?3 WHERE id = ?1;",
            params![id.to_string(), error_code, error_message],
        )
        .map_err(|e| anyhow!("Failed to record error details: {e}"))?;
        Ok(())
    }

    pub fn set_result_summary(
        &self,
        id: Uuid,
        summary: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE requests SET result_summary = ?2 WHERE id = ?1;",
            params![id.to_string(), serde_json::to_string(summary)?],
        )
        .map_err(|e| anyhow!("Failed to store result summary: {e}"))?;
        Ok(())
    }

    pub fn set_retry_count(&self, id: Uuid, retry_count: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE requests SET retry_count = ?2 WHERE id = ?1;",
            params![id.to_string(), retry_count],
        )
        .map_err(|e| anyhow!("Failed to store retry count: {e}"))?;
        Ok(())
    }

    pub fn delete_request(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn
            .execute("DELETE FROM requests WHERE id = ?1;", params![id.to_string()])
            .map_err(|e| anyhow!("Failed to delete request: {e}"))?;
        Ok(affected > 0)
    }

    // ---- checkpoints ----

    /// Write checkpoint and status in one transaction.
    pub fn save_checkpoint(
        &self,
        request_id: Uuid,
        checkpoint_id: Uuid,
        payload: &str,
        status: RequestStatus,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| anyhow!("Failed to open transaction: {e}"))?;

        tx.execute(
            "INSERT INTO workflow_checkpoints (request_id, checkpoint_id, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(request_id) DO UPDATE SET
                checkpoint_id = excluded.checkpoint_id,
                payload = excluded.payload,
                updated_at = excluded.updated_at;",
            params![
                request_id.to_string(),
                checkpoint_id.to_string(),
                payload,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| anyhow!("Failed to write checkpoint: {e}"))?;

        tx.execute(
            "UPDATE requests SET status = ?2, workflow_checkpoint_id = ?3 WHERE id = ?1;",
            params![
                request_id.to_string(),
                status.as_str(),
                checkpoint_id.to_string(),
            ],
        )
        .map_err(|e| anyhow!("Failed to update request for checkpoint: {e}"))?;

        tx.commit()
            .map_err(|e| anyhow!("Failed to commit checkpoint: {e}"))?;

        debug!("Checkpoint {checkpoint_id} saved for request {request_id}");
        Ok(())
    }

    pub fn load_checkpoint(&self, request_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn()?;
        let payload = conn
            .query_row(
                "SELECT payload FROM workflow_checkpoints WHERE request_id = ?1;",
                params![request_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| anyhow!("Failed to load checkpoint: {e}"))?;
        Ok(payload)
    }

    // ---- test cases ----

    /// Insert a batch of test cases atomically.
    pub fn insert_test_cases(&self, tests: &[TestCase]) -> Result<()> {
        debug!("Inserting {} test cases", tests.len());

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| anyhow!("Failed to open transaction: {e}"))?;

        for test in tests {
            tx.execute(
                "INSERT INTO test_cases (id, request_id, name, code, test_type, feature,
                    story, title, severity, tags, code_hash, ast_hash, semantic_embedding,
                    covered_requirements, priority, validation_status, validation_issues,
                    safety_risk_level, is_duplicate, duplicate_of, similarity_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22);",
                params![
                    test.id.to_string(),
                    test.request_id.to_string(),
                    test.name,
                    test.code,
                    test.test_type.as_str(),
                    test.feature,
                    test.story,
                    test.title,
                    test.severity,
                    serde_json::to_string(&test.tags)?,
                    test.code_hash,
                    test.ast_hash,
                    test.semantic_embedding
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&test.covered_requirements)?,
                    test.priority,
                    test.validation_status.as_str(),
                    serde_json::to_string(&test.validation_issues)?,
                    test.safety_risk_level.as_str(),
                    test.is_duplicate as i64,
                    test.duplicate_of.map(|d| d.to_string()),
                    test.similarity_score,
                    test.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| anyhow!("Failed to insert test case: {e}"))?;
        }

        tx.commit()
            .map_err(|e| anyhow!("Failed to commit test cases: {e}"))?;
        Ok(())
    }

    pub fn tests_for_request(&self, request_id: Uuid) -> Result<Vec<TestCase>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, request_id, name, code, test_type, feature, story, title,
                        severity, tags, code_hash, ast_hash, semantic_embedding,
                        covered_requirements, priority, validation_status, validation_issues,
                        safety_risk_level, is_duplicate, duplicate_of, similarity_score,
                        created_at
                 FROM test_cases WHERE request_id = ?1 ORDER BY created_at ASC, id ASC;",
            )
            .map_err(|e| anyhow!("Failed to prepare statement: {e}"))?;

        let tests = stmt
            .query_map(params![request_id.to_string()], Self::map_test_case_row)
            .map_err(|e| anyhow!("Failed to query test cases: {e}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to collect test cases: {e}"))?;

        Ok(tests)
    }

    /// Paged search over test cases. `search` matches name or code via
    /// LIKE; `test_type` filters exactly. Page numbering starts at 1.
    pub fn search_tests(
        &self,
        search: Option<&str>,
        test_type: Option<CaseType>,
        page: usize,
        page_size: usize,
    ) -> Result<TestCasePage> {
        let page = page.max(1);
        let pattern = search.map(|s| format!("%{s}%"));
        let type_str = test_type.map(|t| t.as_str().to_string());

        let conn = self.conn()?;

        let mut where_clauses = Vec::new();
        if pattern.is_some() {
            where_clauses.push("(name LIKE ?1 OR code LIKE ?1)");
        }
        if type_str.is_some() {
            where_clauses.push(if pattern.is_some() {
                "test_type = ?2"
            } else {
                "test_type = ?1"
            });
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM test_cases {where_sql};");
        let query_sql = format!(
            "SELECT id, request_id, name, code, test_type, feature, story, title,
                    severity, tags, code_hash, ast_hash, semantic_embedding,
                    covered_requirements, priority, validation_status, validation_issues,
                    safety_risk_level, is_duplicate, duplicate_of, similarity_score, created_at
             FROM test_cases {where_sql}
             ORDER BY created_at DESC, id ASC LIMIT {} OFFSET {};",
            page_size,
            (page - 1) * page_size
        );

        let total: i64 = match (&pattern, &type_str) {
            (Some(p), Some(t)) => conn.query_row(&count_sql, params![p, t], |r| r.get(0)),
            (Some(p), None) => conn.query_row(&count_sql, params![p], |r| r.get(0)),
            (None, Some(t)) => conn.query_row(&count_sql, params![t], |r| r.get(0)),
            (None, None) => conn.query_row(&count_sql, [], |r| r.get(0)),
        }
        .map_err(|e| anyhow!("Failed to count test cases: {e}"))?;

        let mut stmt = conn
            .prepare(&query_sql)
            .map_err(|e| anyhow!("Failed to prepare search: {e}"))?;

        let rows = match (&pattern, &type_str) {
            (Some(p), Some(t)) => stmt.query_map(params![p, t], Self::map_test_case_row),
            (Some(p), None) => stmt.query_map(params![p], Self::map_test_case_row),
            (None, Some(t)) => stmt.query_map(params![t], Self::map_test_case_row),
            (None, None) => stmt.query_map([], Self::map_test_case_row),
        }
        .map_err(|e| anyhow!("Failed to search test cases: {e}"))?;

        let items = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to collect search results: {e}"))?;

        Ok(TestCasePage {
            items,
            total: total as usize,
            page,
            page_size,
        })
    }

    // ---- metrics ----

    pub fn append_metric(&self, metric: &GenerationMetric) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO generation_metrics (id, request_id, agent_name, step_number,
                started_at, completed_at, duration_ms, model, tokens_input, tokens_output,
                tokens_total, cost_usd, status, error_message, agent_metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15);",
            params![
                metric.id.to_string(),
                metric.request_id.to_string(),
                metric.agent_name.as_str(),
                metric.step_number,
                metric.started_at.to_rfc3339(),
                metric.completed_at.to_rfc3339(),
                metric.duration_ms,
                metric.model,
                metric.tokens_input,
                metric.tokens_output,
                metric.tokens_total,
                metric.cost_usd,
                metric.status.as_str(),
                metric.error_message,
                serde_json::to_string(&metric.agent_metrics)?,
            ],
        )
        .map_err(|e| anyhow!("Failed to insert metric: {e}"))?;
        Ok(())
    }

    pub fn metrics_for_request(&self, request_id: Uuid) -> Result<Vec<GenerationMetric>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, request_id, agent_name, step_number, started_at, completed_at,
                        duration_ms, model, tokens_input, tokens_output, tokens_total,
                        cost_usd, status, error_message, agent_metrics
                 FROM generation_metrics WHERE request_id = ?1
                 ORDER BY started_at ASC, step_number ASC;",
            )
            .map_err(|e| anyhow!("Failed to prepare statement: {e}"))?;

        let metrics = stmt
            .query_map(params![request_id.to_string()], Self::map_metric_row)
            .map_err(|e| anyhow!("Failed to query metrics: {e}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to collect metrics: {e}"))?;

        Ok(metrics)
    }

    // ---- coverage ----

    /// Replace all coverage rows for a request atomically.
    pub fn replace_coverage(&self, request_id: Uuid, rows: &[CoverageAnalysis]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| anyhow!("Failed to open transaction: {e}"))?;

        tx.execute(
            "DELETE FROM coverage_analysis WHERE request_id = ?1;",
            params![request_id.to_string()],
        )
        .map_err(|e| anyhow!("Failed to clear prior coverage: {e}"))?;

        for row in rows {
            tx.execute(
                "INSERT INTO coverage_analysis (id, request_id, requirement_text,
                    requirement_index, is_covered, covering_tests, coverage_count,
                    coverage_score, has_gap, gap_description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
                params![
                    row.id.to_string(),
                    row.request_id.to_string(),
                    row.requirement_text,
                    row.requirement_index,
                    row.is_covered as i64,
                    serde_json::to_string(
                        &row.covering_tests
                            .iter()
                            .map(|t| t.to_string())
                            .collect::<Vec<_>>()
                    )?,
                    row.coverage_count,
                    row.coverage_score,
                    row.has_gap as i64,
                    row.gap_description,
                ],
            )
            .map_err(|e| anyhow!("Failed to insert coverage row: {e}"))?;
        }

        tx.commit()
            .map_err(|e| anyhow!("Failed to commit coverage rows: {e}"))?;
        Ok(())
    }

    pub fn coverage_for_request(&self, request_id: Uuid) -> Result<Vec<CoverageAnalysis>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, request_id, requirement_text, requirement_index, is_covered,
                        covering_tests, coverage_count, coverage_score, has_gap, gap_description
                 FROM coverage_analysis WHERE request_id = ?1 ORDER BY requirement_index ASC;",
            )
            .map_err(|e| anyhow!("Failed to prepare statement: {e}"))?;

        let rows = stmt
            .query_map(params![request_id.to_string()], Self::map_coverage_row)
            .map_err(|e| anyhow!("Failed to query coverage: {e}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to collect coverage rows: {e}"))?;

        Ok(rows)
    }

    // ---- security audit ----

    pub fn append_audit(&self, entry: &SecurityAuditLog) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO security_audit_log (id, request_id, test_id, security_layer,
                risk_level, issues, blocked_patterns, action_taken, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                entry.id.to_string(),
                entry.request_id.to_string(),
                entry.test_id.map(|t| t.to_string()),
                entry.security_layer.as_str(),
                entry.risk_level.as_str(),
                serde_json::to_string(&entry.issues)?,
                serde_json::to_string(&entry.blocked_patterns)?,
                entry.action_taken.as_str(),
                serde_json::to_string(&entry.details)?,
                entry.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| anyhow!("Failed to insert audit entry: {e}"))?;
        Ok(())
    }

    pub fn audits_for_request(&self, request_id: Uuid) -> Result<Vec<SecurityAuditLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, request_id, test_id, security_layer, risk_level, issues,
                        blocked_patterns, action_taken, details, created_at
                 FROM security_audit_log WHERE request_id = ?1 ORDER BY created_at ASC;",
            )
            .map_err(|e| anyhow!("Failed to prepare statement: {e}"))?;

        let rows = stmt
            .query_map(params![request_id.to_string()], Self::map_audit_row)
            .map_err(|e| anyhow!("Failed to query audit log: {e}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to collect audit rows: {e}"))?;

        Ok(rows)
    }

    // ---- row mapping ----

    fn map_request_row(row: &Row) -> rusqlite::Result<Request> {
        let requirements: Vec<String> =
            serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
        let result_summary = serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default();

        Ok(Request {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
            owner: row
                .get::<_, Option<String>>(1)?
                .and_then(|o| Uuid::parse_str(&o).ok()),
            url: row.get(2)?,
            requirements,
            test_type: TestType::from_str(&row.get::<_, String>(4)?).unwrap_or(TestType::Ui),
            status: RequestStatus::from_str(&row.get::<_, String>(5)?)
                .unwrap_or(RequestStatus::Pending),
            result_summary,
            error_message: row.get(7)?,
            error_code: row.get(8)?,
            retry_count: row.get(9)?,
            max_retries: row.get(10)?,
            created_at: parse_timestamp(&row.get::<_, String>(11)?),
            started_at: row.get::<_, Option<String>>(12)?.map(|t| parse_timestamp(&t)),
            completed_at: row.get::<_, Option<String>>(13)?.map(|t| parse_timestamp(&t)),
            duration_seconds: row.get(14)?,
            workflow_checkpoint_id: row
                .get::<_, Option<String>>(15)?
                .and_then(|c| Uuid::parse_str(&c).ok()),
        })
    }

    fn map_test_case_row(row: &Row) -> rusqlite::Result<TestCase> {
        Ok(TestCase {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
            request_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
            name: row.get(2)?,
            code: row.get(3)?,
            test_type: CaseType::from_str(&row.get::<_, String>(4)?).unwrap_or(CaseType::Automated),
            feature: row.get(5)?,
            story: row.get(6)?,
            title: row.get(7)?,
            severity: row.get(8)?,
            tags: serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
            code_hash: row.get(10)?,
            ast_hash: row.get(11)?,
            semantic_embedding: row
                .get::<_, Option<String>>(12)?
                .and_then(|e| serde_json::from_str(&e).ok()),
            covered_requirements: serde_json::from_str(&row.get::<_, String>(13)?)
                .unwrap_or_default(),
            priority: row.get(14)?,
            validation_status: ValidationStatus::from_str(&row.get::<_, String>(15)?)
                .unwrap_or(ValidationStatus::Warning),
            validation_issues: serde_json::from_str(&row.get::<_, String>(16)?)
                .unwrap_or_default(),
            safety_risk_level: RiskLevel::from_str(&row.get::<_, String>(17)?)
                .unwrap_or(RiskLevel::Safe),
            is_duplicate: row.get::<_, i64>(18)? != 0,
            duplicate_of: row
                .get::<_, Option<String>>(19)?
                .and_then(|d| Uuid::parse_str(&d).ok()),
            similarity_score: row.get(20)?,
            created_at: parse_timestamp(&row.get::<_, String>(21)?),
        })
    }

    fn map_metric_row(row: &Row) -> rusqlite::Result<GenerationMetric> {
        let agent_name = match row.get::<_, String>(2)?.as_str() {
            "reconnaissance" => AgentName::Reconnaissance,
            "generator" => AgentName::Generator,
            "validator" => AgentName::Validator,
            _ => AgentName::Optimizer,
        };
        let status = match row.get::<_, String>(12)?.as_str() {
            "success" => MetricStatus::Success,
            "retry" => MetricStatus::Retry,
            _ => MetricStatus::Failed,
        };

        Ok(GenerationMetric {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
            request_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
            agent_name,
            step_number: row.get(3)?,
            started_at: parse_timestamp(&row.get::<_, String>(4)?),
            completed_at: parse_timestamp(&row.get::<_, String>(5)?),
            duration_ms: row.get(6)?,
            model: row.get(7)?,
            tokens_input: row.get(8)?,
            tokens_output: row.get(9)?,
            tokens_total: row.get(10)?,
            cost_usd: row.get(11)?,
            status,
            error_message: row.get(13)?,
            agent_metrics: serde_json::from_str(&row.get::<_, String>(14)?).unwrap_or_default(),
        })
    }

    fn map_coverage_row(row: &Row) -> rusqlite::Result<CoverageAnalysis> {
        let covering: Vec<String> =
            serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
        Ok(CoverageAnalysis {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
            request_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
            requirement_text: row.get(2)?,
            requirement_index: row.get::<_, i64>(3)? as usize,
            is_covered: row.get::<_, i64>(4)? != 0,
            covering_tests: covering
                .iter()
                .filter_map(|t| Uuid::parse_str(t).ok())
                .collect(),
            coverage_count: row.get::<_, i64>(6)? as usize,
            coverage_score: row.get(7)?,
            has_gap: row.get::<_, i64>(8)? != 0,
            gap_description: row.get(9)?,
        })
    }

    fn map_audit_row(row: &Row) -> rusqlite::Result<SecurityAuditLog> {
        let layer = match row.get::<_, String>(3)?.as_str() {
            "static" => SecurityLayer::Static,
            "ast" => SecurityLayer::Ast,
            "behavioral" => SecurityLayer::Behavioral,
            _ => SecurityLayer::Sandbox,
        };
        let action = match row.get::<_, String>(7)?.as_str() {
            "allowed" => AuditAction::Allowed,
            "blocked" => AuditAction::Blocked,
            "regenerate" => AuditAction::Regenerate,
            _ => AuditAction::Warning,
        };

        Ok(SecurityAuditLog {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
            request_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
            test_id: row
                .get::<_, Option<String>>(2)?
                .and_then(|t| Uuid::parse_str(&t).ok()),
            security_layer: layer,
            risk_level: RiskLevel::from_str(&row.get::<_, String>(4)?).unwrap_or(RiskLevel::Safe),
            issues: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
            blocked_patterns: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
            action_taken: action,
            details: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
            created_at: parse_timestamp(&row.get::<_, String>(9)?),
        })
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
