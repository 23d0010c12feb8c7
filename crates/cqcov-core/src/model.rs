use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub type RunRecordId = i64;
pub type BatchId = i64;

/// Current time at the precision the store keeps (microseconds).
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A competency question as exposed by the authoring side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompetencyQuestion {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mt: Option<String>,
}

/// A named data snapshot. `data_revision` changes whenever the underlying data does.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Microtheory {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, alias = "revision")]
    pub data_revision: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(Outcome::Pass),
            "fail" => Some(Outcome::Fail),
            _ => None,
        }
    }
}

/// What a query executor reports for one (CQ, MT) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecOutcome {
    Pass { row_count: u64 },
    Fail { reason: String },
}

impl ExecOutcome {
    pub fn pass(row_count: u64) -> Self {
        ExecOutcome::Pass { row_count }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        ExecOutcome::Fail {
            reason: reason.into(),
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            ExecOutcome::Pass { .. } => Outcome::Pass,
            ExecOutcome::Fail { .. } => Outcome::Fail,
        }
    }
}

/// One immutable execution attempt of a CQ against an MT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: RunRecordId,
    pub project_id: String,
    pub cq_id: String,
    pub mt_id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub data_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Passed against the MT revision that is current now. Only such records let a batch skip
    /// the pair.
    pub fn is_fresh_pass(&self, current_revision: &str) -> bool {
        self.outcome == Outcome::Pass && self.data_revision == current_revision
    }
}

/// A run record before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRecord {
    pub project_id: String,
    pub cq_id: String,
    pub mt_id: String,
    pub outcome: Outcome,
    pub row_count: Option<u64>,
    pub failure_reason: Option<String>,
    pub data_revision: String,
    pub query_sha256: Option<String>,
    pub batch_id: Option<BatchId>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl NewRunRecord {
    /// Builds a record for `cq` x `mt` from an executor result, stamped now.
    ///
    /// Row counts only survive on `pass`; failure reasons only on `fail`.
    pub fn from_exec(
        project_id: &str,
        cq: &CompetencyQuestion,
        mt: &Microtheory,
        exec: &ExecOutcome,
    ) -> Self {
        let (outcome, row_count, failure_reason) = match exec {
            ExecOutcome::Pass { row_count } => (Outcome::Pass, Some(*row_count), None),
            ExecOutcome::Fail { reason } => (Outcome::Fail, None, Some(reason.clone())),
        };
        Self {
            project_id: project_id.to_string(),
            cq_id: cq.id.clone(),
            mt_id: mt.id.clone(),
            outcome,
            row_count,
            failure_reason,
            data_revision: mt.data_revision.clone(),
            query_sha256: Some(crate::fingerprint::query_sha256(&cq.query)),
            batch_id: None,
            duration_ms: None,
            created_at: now_utc(),
        }
    }

    /// Overrides the revision taken from `mt` in [`NewRunRecord::from_exec`].
    pub fn with_data_revision(mut self, revision: impl Into<String>) -> Self {
        self.data_revision = revision.into();
        self
    }

    pub fn with_batch(mut self, batch_id: Option<BatchId>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn into_record(self, id: RunRecordId) -> RunRecord {
        RunRecord {
            id,
            project_id: self.project_id,
            cq_id: self.cq_id,
            mt_id: self.mt_id,
            outcome: self.outcome,
            row_count: self.row_count,
            failure_reason: self.failure_reason,
            data_revision: self.data_revision,
            query_sha256: self.query_sha256,
            batch_id: self.batch_id,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub cq_id: String,
    pub mt_id: String,
}

impl PairKey {
    pub fn new(cq_id: impl Into<String>, mt_id: impl Into<String>) -> Self {
        Self {
            cq_id: cq_id.into(),
            mt_id: mt_id.into(),
        }
    }
}

/// Latest known result for one (CQ, MT) pair. `latest == None` means "no run".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageCell {
    pub cq_id: String,
    pub mt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<RunRecord>,
}

impl CoverageCell {
    pub fn outcome(&self) -> Option<Outcome> {
        self.latest.as_ref().map(|r| r.outcome)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.latest
            .as_ref()
            .and_then(|r| r.failure_reason.as_deref())
    }

    pub fn is_fresh_pass(&self, current_revision: &str) -> bool {
        self.latest
            .as_ref()
            .is_some_and(|r| r.is_fresh_pass(current_revision))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub total_pairs: u64,
    pub pairs_with_run: u64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub no_run_count: u64,
    /// pass_count / pairs_with_run, 0.0 when nothing has run.
    pub pass_rate: f64,
    /// pairs_with_run / total_pairs as a percentage, 0.0 for an empty universe.
    pub coverage_pct: f64,
}

impl Summary {
    pub fn from_cells(cells: &[CoverageCell]) -> Self {
        let mut s = Summary {
            total_pairs: cells.len() as u64,
            ..Default::default()
        };
        for c in cells {
            match c.outcome() {
                Some(Outcome::Pass) => s.pass_count += 1,
                Some(Outcome::Fail) => s.fail_count += 1,
                None => s.no_run_count += 1,
            }
        }
        s.pairs_with_run = s.pass_count + s.fail_count;
        if s.pairs_with_run > 0 {
            s.pass_rate = s.pass_count as f64 / s.pairs_with_run as f64;
        }
        if s.total_pairs > 0 {
            s.coverage_pct = (s.pairs_with_run as f64 / s.total_pairs as f64) * 100.0;
        }
        s
    }
}

/// Grid of cells for the selected CQs x MTs, in declaration order (CQ-major).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageMatrix {
    pub project_id: String,
    pub cqs: Vec<CompetencyQuestion>,
    pub mts: Vec<Microtheory>,
    pub cells: Vec<CoverageCell>,
    pub summary: Summary,
    pub generated_at: DateTime<Utc>,
}

impl CoverageMatrix {
    pub fn cell(&self, cq_id: &str, mt_id: &str) -> Option<&CoverageCell> {
        self.cells
            .iter()
            .find(|c| c.cq_id == cq_id && c.mt_id == mt_id)
    }
}

/// Which ids a request covers. An empty filter means the whole project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    All,
    Only(Vec<String>),
}

impl Selection {
    pub fn from_filter(ids: Option<&[String]>) -> Self {
        match ids {
            Some(ids) if !ids.is_empty() => Selection::Only(ids.to_vec()),
            _ => Selection::All,
        }
    }

    pub fn ids(&self) -> Option<&[String]> {
        match self {
            Selection::All => None,
            Selection::Only(ids) => Some(ids),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Cancelled | BatchStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BatchStatus::Queued),
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "cancelled" => Some(BatchStatus::Cancelled),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            BatchStatus::Queued => 0,
            BatchStatus::Running => 1,
            BatchStatus::Completed => 2,
            BatchStatus::Cancelled => 3,
            BatchStatus::Failed => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => BatchStatus::Queued,
            1 => BatchStatus::Running,
            2 => BatchStatus::Completed,
            3 => BatchStatus::Cancelled,
            _ => BatchStatus::Failed,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    /// Size of the CQ x MT universe.
    pub total_pairs: u64,
    /// Pairs left after the staleness filter.
    pub scheduled_pairs: u64,
    pub skipped_pairs: u64,
    /// Executed pairs whose record was committed (pass or fail).
    pub completed_pairs: u64,
    pub failed_pairs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub project_id: String,
    #[serde(default)]
    pub cqs: Selection,
    #[serde(default)]
    pub mts: Selection,
    #[serde(default)]
    pub force_rerun: bool,
}

impl BatchRequest {
    pub fn all(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            cqs: Selection::All,
            mts: Selection::All,
            force_rerun: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_rerun = true;
        self
    }
}

/// Snapshot of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: BatchId,
    pub project_id: String,
    pub cqs: Selection,
    pub mts: Selection,
    pub force_rerun: bool,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
