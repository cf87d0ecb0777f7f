// src/stats/mod.rs — Run statistics

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::infra::errors::RllmError;
use crate::provider::UsageMetrics;

const SCHEMA_VERSION: i64 = 1;

/// One record per node invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub program_path: String,
    pub program_name: String,
    pub model: String,
    pub success: bool,
    pub input_schema_ok: bool,
    pub output_schema_ok: bool,
    pub usage: UsageMetrics,
}

/// Aggregated history for one `(program path, model)` pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunAggregate {
    pub program_path: String,
    pub model: Option<String>,
    pub total_runs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub output_schema_compliance_pct: f64,
    pub input_schema_compliance_pct: f64,
    pub avg_latency_ms: f64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub max_completion_tokens: u64,
    pub ms_per_1k_tokens: f64,
}

/// Stats collaborator. Implementations must tolerate concurrent
/// append-only writes from independent engine invocations.
pub trait StatsSink: Send + Sync {
    fn record_run(&self, record: &RunRecord) -> Result<(), RllmError>;
    fn aggregate(&self, program_path: &str, model: Option<&str>) -> Result<RunAggregate, RllmError>;
}

/// SQLite-backed store.
pub struct SqliteStats {
    conn: Mutex<Connection>,
}

impl SqliteStats {
    pub fn open(path: &Path) -> Result<Self, RllmError> {
        Self::init(Connection::open(path)?)
    }

    /// Transient store for tests and one-shot runs.
    pub fn in_memory() -> Result<Self, RllmError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RllmError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 program_path TEXT NOT NULL,
                 program_name TEXT NOT NULL,
                 model TEXT NOT NULL,
                 success INTEGER NOT NULL,
                 output_schema_ok INTEGER NOT NULL,
                 input_schema_ok INTEGER NOT NULL,
                 latency_ms REAL NOT NULL,
                 prompt_tokens INTEGER NOT NULL,
                 completion_tokens INTEGER NOT NULL,
                 total_tokens INTEGER NOT NULL,
                 created_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO meta(key, value) VALUES('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StatsSink for SqliteStats {
    fn record_run(&self, record: &RunRecord) -> Result<(), RllmError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO runs(program_path, program_name, model, success,
                              output_schema_ok, input_schema_ok, latency_ms,
                              prompt_tokens, completion_tokens, total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.program_path,
                record.program_name,
                record.model,
                record.success as i64,
                record.output_schema_ok as i64,
                record.input_schema_ok as i64,
                record.usage.latency_ms,
                record.usage.prompt_tokens as i64,
                record.usage.completion_tokens as i64,
                record.usage.total_tokens as i64,
            ],
        )?;
        Ok(())
    }

    fn aggregate(&self, program_path: &str, model: Option<&str>) -> Result<RunAggregate, RllmError> {
        let mut where_clause = "WHERE program_path = ?1".to_string();
        if model.is_some() {
            where_clause.push_str(" AND model = ?2");
        }
        let query = format!(
            "SELECT
                 COUNT(*),
                 COALESCE(SUM(success), 0),
                 COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0),
                 COALESCE(AVG(output_schema_ok) * 100.0, 0.0),
                 COALESCE(AVG(input_schema_ok) * 100.0, 0.0),
                 COALESCE(AVG(latency_ms), 0.0),
                 COALESCE(AVG(prompt_tokens), 0.0),
                 COALESCE(AVG(completion_tokens), 0.0),
                 COALESCE(MAX(completion_tokens), 0),
                 COALESCE(AVG(CASE WHEN total_tokens > 0
                                   THEN (latency_ms / total_tokens) * 1000
                                   ELSE NULL END), 0.0)
             FROM runs {where_clause}"
        );

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&query)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RunAggregate> {
            Ok(RunAggregate {
                program_path: program_path.to_string(),
                model: model.map(str::to_string),
                total_runs: row.get::<_, i64>(0)? as u64,
                success_count: row.get::<_, i64>(1)? as u64,
                failure_count: row.get::<_, i64>(2)? as u64,
                output_schema_compliance_pct: row.get(3)?,
                input_schema_compliance_pct: row.get(4)?,
                avg_latency_ms: row.get(5)?,
                avg_prompt_tokens: row.get(6)?,
                avg_completion_tokens: row.get(7)?,
                max_completion_tokens: row.get::<_, i64>(8)? as u64,
                ms_per_1k_tokens: row.get(9)?,
            })
        };
        let aggregate = match model {
            Some(m) => stmt.query_row(params![program_path, m], map_row)?,
            None => stmt.query_row(params![program_path], map_row)?,
        };
        Ok(aggregate)
    }
}

/// In-memory sink for tests and callers that do not persist history.
#[derive(Default)]
pub struct MemoryStats {
    runs: Mutex<Vec<RunRecord>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StatsSink for MemoryStats {
    fn record_run(&self, record: &RunRecord) -> Result<(), RllmError> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    fn aggregate(&self, program_path: &str, model: Option<&str>) -> Result<RunAggregate, RllmError> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let selected: Vec<&RunRecord> = runs
            .iter()
            .filter(|r| r.program_path == program_path)
            .filter(|r| model.map_or(true, |m| r.model == m))
            .collect();

        let mut aggregate = RunAggregate {
            program_path: program_path.to_string(),
            model: model.map(str::to_string),
            total_runs: selected.len() as u64,
            ..RunAggregate::default()
        };
        if selected.is_empty() {
            return Ok(aggregate);
        }

        let n = selected.len() as f64;
        aggregate.success_count = selected.iter().filter(|r| r.success).count() as u64;
        aggregate.failure_count = aggregate.total_runs - aggregate.success_count;
        aggregate.output_schema_compliance_pct =
            selected.iter().filter(|r| r.output_schema_ok).count() as f64 / n * 100.0;
        aggregate.input_schema_compliance_pct =
            selected.iter().filter(|r| r.input_schema_ok).count() as f64 / n * 100.0;
        aggregate.avg_latency_ms = selected.iter().map(|r| r.usage.latency_ms).sum::<f64>() / n;
        aggregate.avg_prompt_tokens =
            selected.iter().map(|r| r.usage.prompt_tokens as f64).sum::<f64>() / n;
        aggregate.avg_completion_tokens = selected
            .iter()
            .map(|r| r.usage.completion_tokens as f64)
            .sum::<f64>()
            / n;
        aggregate.max_completion_tokens = selected
            .iter()
            .map(|r| r.usage.completion_tokens)
            .max()
            .unwrap_or(0);
        let paced: Vec<f64> = selected
            .iter()
            .filter(|r| r.usage.total_tokens > 0)
            .map(|r| r.usage.latency_ms / r.usage.total_tokens as f64 * 1000.0)
            .collect();
        if !paced.is_empty() {
            aggregate.ms_per_1k_tokens = paced.iter().sum::<f64>() / paced.len() as f64;
        }
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(path: &str, model: &str, success: bool, latency_ms: f64) -> RunRecord {
        RunRecord {
            program_path: path.to_string(),
            program_name: "p".to_string(),
            model: model.to_string(),
            success,
            input_schema_ok: true,
            output_schema_ok: success,
            usage: UsageMetrics {
                latency_ms,
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            },
        }
    }

    #[test]
    fn test_sqlite_record_and_aggregate() {
        let store = SqliteStats::in_memory().unwrap();
        store.record_run(&record("/p.rllm", "m", true, 100.0)).unwrap();
        store.record_run(&record("/p.rllm", "m", false, 300.0)).unwrap();
        store.record_run(&record("/other.rllm", "m", true, 9.0)).unwrap();

        let agg = store.aggregate("/p.rllm", None).unwrap();
        assert_eq!(agg.total_runs, 2);
        assert_eq!(agg.success_count, 1);
        assert_eq!(agg.failure_count, 1);
        assert_eq!(agg.avg_latency_ms, 200.0);
        assert_eq!(agg.output_schema_compliance_pct, 50.0);
        assert_eq!(agg.input_schema_compliance_pct, 100.0);
        assert_eq!(agg.max_completion_tokens, 50);
    }

    #[test]
    fn test_sqlite_aggregate_filters_by_model() {
        let store = SqliteStats::in_memory().unwrap();
        store.record_run(&record("/p.rllm", "a", true, 10.0)).unwrap();
        store.record_run(&record("/p.rllm", "b", true, 90.0)).unwrap();

        let agg = store.aggregate("/p.rllm", Some("a")).unwrap();
        assert_eq!(agg.total_runs, 1);
        assert_eq!(agg.avg_latency_ms, 10.0);
    }

    #[test]
    fn test_sqlite_aggregate_empty() {
        let store = SqliteStats::in_memory().unwrap();
        let agg = store.aggregate("/nope.rllm", None).unwrap();
        assert_eq!(agg.total_runs, 0);
        assert_eq!(agg.avg_latency_ms, 0.0);
    }

    #[test]
    fn test_sqlite_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStats::open(&dir.path().join("stats.db")).unwrap();
        store.record_run(&record("/p.rllm", "m", true, 5.0)).unwrap();
        assert_eq!(store.aggregate("/p.rllm", None).unwrap().total_runs, 1);
    }

    #[test]
    fn test_memory_stats_matches_sqlite_shape() {
        let store = MemoryStats::new();
        store.record_run(&record("/p.rllm", "m", true, 100.0)).unwrap();
        store.record_run(&record("/p.rllm", "m", false, 300.0)).unwrap();

        let agg = store.aggregate("/p.rllm", None).unwrap();
        assert_eq!(agg.total_runs, 2);
        assert_eq!(agg.avg_latency_ms, 200.0);
        assert_eq!(agg.output_schema_compliance_pct, 50.0);
        // latency 100/150*1000 and 300/150*1000, averaged
        assert_eq!(agg.ms_per_1k_tokens, (100.0 / 150.0 * 1000.0 + 2000.0) / 2.0);
    }
}
