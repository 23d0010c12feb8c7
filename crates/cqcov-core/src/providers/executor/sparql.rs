use super::QueryExecutor;
use crate::model::ExecOutcome;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

const MAX_REASON_BYTES: usize = 200;

/// Executes CQs over the SPARQL 1.1 protocol.
pub struct SparqlExecutor {
    pub endpoint: String,
    pub client: reqwest::Client,
}

impl SparqlExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl QueryExecutor for SparqlExecutor {
    async fn execute(&self, query: &str, mt_id: &str) -> anyhow::Result<ExecOutcome> {
        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("default-graph-uri", mt_id)])
            .header(CONTENT_TYPE, "application/sparql-query")
            .header(ACCEPT, "application/sparql-results+json")
            .body(query.to_string())
            .send()
            .await
            .with_context(|| format!("sparql request to {} failed", self.endpoint))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(ExecOutcome::fail(format!(
                "http {}: {}",
                status.as_u16(),
                excerpt(&body)
            )));
        }

        interpret_results(&body)
    }

    fn provider_name(&self) -> &'static str {
        "sparql"
    }
}

/// Maps a `application/sparql-results+json` body to an outcome.
///
/// SELECT passes with at least one binding row; ASK passes on `true`.
pub fn interpret_results(body: &str) -> anyhow::Result<ExecOutcome> {
    let json: serde_json::Value =
        serde_json::from_str(body).context("sparql response is not valid JSON")?;

    if let Some(b) = json.get("boolean").and_then(|v| v.as_bool()) {
        return Ok(if b {
            ExecOutcome::pass(1)
        } else {
            ExecOutcome::fail("ask returned false")
        });
    }

    let rows = json
        .pointer("/results/bindings")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("sparql response missing results.bindings"))?
        .len() as u64;

    Ok(if rows > 0 {
        ExecOutcome::pass(rows)
    } else {
        ExecOutcome::fail("no results")
    })
}

fn excerpt(s: &str) -> String {
    let s = s.trim();
    if s.len() <= MAX_REASON_BYTES {
        return s.to_string();
    }
    let mut end = MAX_REASON_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
