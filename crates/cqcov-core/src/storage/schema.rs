pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS run_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id TEXT NOT NULL,
  cq_id TEXT NOT NULL,
  mt_id TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('pass', 'fail')),
  row_count INTEGER,
  failure_reason TEXT,
  data_revision TEXT NOT NULL,
  query_sha256 TEXT,
  batch_id INTEGER,
  duration_ms INTEGER,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_records_pair
  ON run_records(project_id, cq_id, mt_id, created_at DESC, id DESC);

CREATE TRIGGER IF NOT EXISTS run_records_append_only
  BEFORE UPDATE ON run_records
BEGIN
  SELECT RAISE(ABORT, 'run_records are append-only');
END;

CREATE TABLE IF NOT EXISTS batch_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id TEXT NOT NULL,
  cqs_json TEXT NOT NULL,
  mts_json TEXT NOT NULL,
  force_rerun INTEGER NOT NULL,
  status TEXT NOT NULL,
  total_pairs INTEGER NOT NULL DEFAULT 0,
  scheduled_pairs INTEGER NOT NULL DEFAULT 0,
  skipped_pairs INTEGER NOT NULL DEFAULT 0,
  completed_pairs INTEGER NOT NULL DEFAULT 0,
  failed_pairs INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  created_at TEXT NOT NULL,
  completed_at TEXT,
  updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_batch_jobs_project ON batch_jobs(project_id, id DESC);
"#;
