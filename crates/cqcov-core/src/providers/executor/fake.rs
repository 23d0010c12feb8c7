use super::QueryExecutor;
use crate::model::ExecOutcome;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum FakeBehavior {
    Outcome(ExecOutcome),
    /// `execute` returns `Err` with this message.
    Error(String),
    /// Never answers; only a timeout ends the call.
    Hang,
    Panic(String),
}

/// Scripted executor keyed by (query, mt). Counts calls and peak concurrency.
#[derive(Debug)]
pub struct FakeExecutor {
    default: FakeBehavior,
    scripted: HashMap<(String, String), FakeBehavior>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executed: Mutex<Vec<(String, String)>>,
}

impl FakeExecutor {
    pub fn new(default: FakeBehavior) -> Self {
        Self {
            default,
            scripted: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn passing(row_count: u64) -> Self {
        Self::new(FakeBehavior::Outcome(ExecOutcome::pass(row_count)))
    }

    pub fn script(mut self, query: &str, mt_id: &str, behavior: FakeBehavior) -> Self {
        self.scripted
            .insert((query.to_string(), mt_id.to_string()), behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// (query, mt) pairs in the order execution started.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, query: &str, mt_id: &str) -> anyhow::Result<ExecOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut v) = self.executed.lock() {
            v.push((query.to_string(), mt_id.to_string()));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = self
            .scripted
            .get(&(query.to_string(), mt_id.to_string()))
            .unwrap_or(&self.default)
            .clone();

        match behavior {
            FakeBehavior::Outcome(o) => Ok(o),
            FakeBehavior::Error(msg) => Err(anyhow::anyhow!(msg)),
            FakeBehavior::Hang => std::future::pending().await,
            FakeBehavior::Panic(msg) => panic!("{}", msg),
        }
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}
