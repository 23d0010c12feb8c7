use crate::model::{BatchJob, BatchStatus, CoverageCell, CoverageMatrix, Outcome, RunRecord, Summary};
use std::fmt::Write;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

fn glyph(cell: Option<&CoverageCell>) -> &'static str {
    match cell.and_then(|c| c.outcome()) {
        Some(Outcome::Pass) => "✅",
        Some(Outcome::Fail) => "❌",
        None => "·",
    }
}

/// CQ rows by MT columns, followed by failure reasons and the summary line.
pub fn render_matrix(m: &CoverageMatrix) -> String {
    let mut out = String::new();
    let label_w = m
        .cqs
        .iter()
        .map(|c| c.id.chars().count())
        .max()
        .unwrap_or(0)
        .max(2);

    let _ = writeln!(out, "\nCoverage matrix for project '{}'", m.project_id);
    for (i, mt) in m.mts.iter().enumerate() {
        let _ = writeln!(out, "  [{}] {}", i + 1, mt.id);
    }
    let _ = write!(out, "{:<label_w$}", "CQ");
    for i in 0..m.mts.len() {
        let _ = write!(out, " {:>4}", format!("[{}]", i + 1));
    }
    let _ = writeln!(out);

    for cq in &m.cqs {
        let _ = write!(out, "{:<label_w$}", cq.id);
        for mt in &m.mts {
            // Glyphs are double-width; pad to line up with the "[n]" headers.
            let _ = write!(out, "   {}", glyph(m.cell(&cq.id, &mt.id)));
        }
        let _ = writeln!(out);
    }

    let failures: Vec<&CoverageCell> = m
        .cells
        .iter()
        .filter(|c| c.outcome() == Some(Outcome::Fail))
        .collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\nFailures:");
        for c in failures {
            let _ = writeln!(
                out,
                "❌ {} @ {}: {}",
                c.cq_id,
                c.mt_id,
                c.failure_reason().unwrap_or("(no reason)")
            );
        }
    }

    let _ = writeln!(out, "\n{}", RULE);
    let _ = writeln!(out, "{}", summary_line(&m.summary));
    out
}

pub fn summary_line(s: &Summary) -> String {
    format!(
        "Summary: {} pairs, {} passed, {} failed, {} no run | coverage {:.1}%, pass rate {:.1}%",
        s.total_pairs,
        s.pass_count,
        s.fail_count,
        s.no_run_count,
        s.coverage_pct,
        s.pass_rate * 100.0
    )
}

pub fn print_matrix(m: &CoverageMatrix) {
    eprint!("{}", render_matrix(m));
}

pub fn progress_line(job: &BatchJob) -> String {
    format!(
        "batch #{} {}: {}/{} done, {} failed, {} skipped",
        job.id,
        job.status,
        job.counts.completed_pairs,
        job.counts.scheduled_pairs,
        job.counts.failed_pairs,
        job.counts.skipped_pairs
    )
}

pub fn print_batch(job: &BatchJob) {
    let icon = match job.status {
        BatchStatus::Completed if job.counts.failed_pairs == 0 => "✅",
        BatchStatus::Completed => "⚠️ ",
        BatchStatus::Cancelled => "⏹️ ",
        BatchStatus::Failed => "💥",
        BatchStatus::Queued | BatchStatus::Running => "⏳",
    };
    eprintln!("\n{}", RULE);
    eprintln!("{} {}", icon, progress_line(job));
    if let Some(err) = &job.error {
        eprintln!("    error: {}", err);
    }
}

pub fn print_record(r: &RunRecord) {
    let duration = r
        .duration_ms
        .map(|d| format!("({:.1}s)", d as f64 / 1000.0))
        .unwrap_or_default();
    match r.outcome {
        Outcome::Pass => eprintln!(
            "✅ #{:<6} {}  {} rows  rev {}  {}",
            r.id,
            r.created_at.to_rfc3339(),
            r.row_count.unwrap_or(0),
            r.data_revision,
            duration
        ),
        Outcome::Fail => eprintln!(
            "❌ #{:<6} {}  {}  rev {}  {}",
            r.id,
            r.created_at.to_rfc3339(),
            r.failure_reason.as_deref().unwrap_or("(no reason)"),
            r.data_revision,
            duration
        ),
    }
}
