use crate::model::ExecOutcome;
use async_trait::async_trait;

/// Runs one CQ query against one microtheory.
///
/// `Err` means the executor itself broke (transport, malformed response); callers record it as
/// a failed run, same as an explicit [`ExecOutcome::Fail`].
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, mt_id: &str) -> anyhow::Result<ExecOutcome>;

    fn provider_name(&self) -> &'static str;
}

pub mod fake;
pub mod replay;
pub mod sparql;

pub use fake::{FakeBehavior, FakeExecutor};
pub use replay::ReplayExecutor;
pub use sparql::SparqlExecutor;
