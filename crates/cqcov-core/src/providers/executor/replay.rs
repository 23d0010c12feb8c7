use super::QueryExecutor;
use crate::fingerprint::query_sha256;
use crate::model::{CompetencyQuestion, ExecOutcome, Outcome};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

/// One recorded execution. Either `query` or `cq` identifies the question; `project` scopes a
/// `cq` reference.
#[derive(Debug, Clone, Deserialize)]
struct ReplayEntry {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    cq: Option<String>,
    #[serde(default)]
    query: Option<String>,
    mt: String,
    outcome: Outcome,
    #[serde(default)]
    rows: Option<u64>,
    #[serde(default)]
    reason: Option<String>,
}

/// Answers from a JSONL file of recorded outcomes instead of a live endpoint.
///
/// Entries are keyed by query fingerprint and MT; a later line for the same pair wins.
#[derive(Debug, Clone)]
pub struct ReplayExecutor {
    outcomes: HashMap<(String, String), ExecOutcome>,
}

impl ReplayExecutor {
    /// `cqs` yields `(project_id, cq)` for every CQ a `cq` reference in the file may name.
    pub fn from_path<'a, P, I>(path: P, cqs: I) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = (&'a str, &'a CompetencyQuestion)>,
    {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open replay file '{}'", path.display()))?;
        let reader = std::io::BufReader::new(file);

        // cq id -> (project id, query) for every project defining it
        let mut by_id: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for (project, cq) in cqs {
            by_id
                .entry(cq.id.as_str())
                .or_default()
                .push((project, cq.query.as_str()));
        }

        let mut outcomes = HashMap::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(&line)
                .with_context(|| format!("line {}: parse error", i + 1))?;

            let query = match (&entry.query, &entry.cq) {
                (Some(q), _) => q.clone(),
                (None, Some(id)) => {
                    let mut candidates: Vec<&str> = by_id
                        .get(id.as_str())
                        .into_iter()
                        .flatten()
                        .filter(|(p, _)| entry.project.as_deref().map_or(true, |want| want == *p))
                        .map(|(_, q)| *q)
                        .collect();
                    candidates.sort_by_key(|q| query_sha256(q));
                    candidates.dedup_by_key(|q| query_sha256(q));
                    match candidates.as_slice() {
                        [q] => q.to_string(),
                        [] => {
                            tracing::warn!(
                                event = "cqcov.replay.unknown_cq",
                                line = i + 1,
                                cq = %id,
                                project = entry.project.as_deref().unwrap_or(""),
                                "replay entry references unknown competency question"
                            );
                            continue;
                        }
                        _ => anyhow::bail!(
                            "line {}: cq '{}' has different queries in several projects; add 'project'",
                            i + 1,
                            id
                        ),
                    }
                }
                (None, None) => anyhow::bail!("line {}: entry needs 'query' or 'cq'", i + 1),
            };

            let outcome = match entry.outcome {
                Outcome::Pass => ExecOutcome::pass(entry.rows.unwrap_or(0)),
                Outcome::Fail => {
                    ExecOutcome::fail(entry.reason.unwrap_or_else(|| "recorded failure".into()))
                }
            };
            outcomes.insert((query_sha256(&query), entry.mt), outcome);
        }

        Ok(Self { outcomes })
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[async_trait]
impl QueryExecutor for ReplayExecutor {
    async fn execute(&self, query: &str, mt_id: &str) -> anyhow::Result<ExecOutcome> {
        Ok(self
            .outcomes
            .get(&(query_sha256(query), mt_id.to_string()))
            .cloned()
            .unwrap_or_else(|| ExecOutcome::fail("no recorded outcome")))
    }

    fn provider_name(&self) -> &'static str {
        "replay"
    }
}
