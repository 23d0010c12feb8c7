use super::universe::resolve_universe;
use crate::catalog::Catalog;
use crate::errors::Result;
use crate::model::{now_utc, CoverageCell, CoverageMatrix, PairKey, Selection, Summary};
use crate::storage::RunRecordStore;

/// Builds the coverage matrix for a project, optionally narrowed to some CQs and MTs.
///
/// Pure read: one bulk "latest per pair" query, no locking against concurrent batch writers.
pub fn build_matrix<S: RunRecordStore + ?Sized>(
    catalog: &dyn Catalog,
    store: &S,
    project_id: &str,
    cq_ids: Option<&[String]>,
    mt_ids: Option<&[String]>,
) -> Result<CoverageMatrix> {
    let universe = resolve_universe(
        catalog,
        project_id,
        &Selection::from_filter(cq_ids),
        &Selection::from_filter(mt_ids),
    )?;

    let mut latest =
        store.all_latest_for_universe(project_id, &universe.cq_ids(), &universe.mt_ids())?;

    let cells: Vec<CoverageCell> = universe
        .pairs()
        .map(|(cq, mt)| CoverageCell {
            cq_id: cq.id.clone(),
            mt_id: mt.id.clone(),
            latest: latest.remove(&PairKey::new(cq.id.clone(), mt.id.clone())),
        })
        .collect();
    let summary = Summary::from_cells(&cells);

    tracing::debug!(
        event = "cqcov.matrix.built",
        project = %project_id,
        pairs = summary.total_pairs,
        pass = summary.pass_count,
        fail = summary.fail_count,
        "coverage matrix built"
    );

    Ok(CoverageMatrix {
        project_id: project_id.to_string(),
        cqs: universe.cqs,
        mts: universe.mts,
        cells,
        summary,
        generated_at: now_utc(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::model::{CompetencyQuestion, Microtheory, NewRunRecord, Outcome};
    use crate::storage::Store;
    use chrono::{TimeZone, Utc};

    fn setup() -> (StaticCatalog, Store) {
        let catalog = StaticCatalog::new();
        catalog.insert_project(
            "p",
            ["cq1", "cq2", "cq3"]
                .iter()
                .map(|id| CompetencyQuestion {
                    id: id.to_string(),
                    query: "ASK {}".into(),
                    ..Default::default()
                })
                .collect(),
            ["mt1", "mt2"]
                .iter()
                .map(|id| Microtheory {
                    id: id.to_string(),
                    data_revision: "1".into(),
                    ..Default::default()
                })
                .collect(),
        );
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        (catalog, store)
    }

    fn append(store: &Store, cq: &str, mt: &str, outcome: Outcome, at_secs: i64) {
        store
            .append(&NewRunRecord {
                project_id: "p".into(),
                cq_id: cq.into(),
                mt_id: mt.into(),
                outcome,
                row_count: (outcome == Outcome::Pass).then_some(1),
                failure_reason: (outcome == Outcome::Fail).then(|| "no results".to_string()),
                data_revision: "1".into(),
                query_sha256: None,
                batch_id: None,
                duration_ms: None,
                created_at: Utc.timestamp_opt(at_secs, 0).unwrap(),
            })
            .unwrap();
    }

    #[test]
    fn no_records_means_no_run_everywhere() {
        let (catalog, store) = setup();
        let m = build_matrix(&catalog, &store, "p", None, None).unwrap();

        assert_eq!(m.cells.len(), 6);
        assert!(m.cells.iter().all(|c| c.latest.is_none()));
        assert_eq!(m.summary.no_run_count, 6);
        assert_eq!(m.summary.coverage_pct, 0.0);
        assert_eq!(m.summary.pass_rate, 0.0);
    }

    #[test]
    fn summary_counts_only_pairs_with_a_run() {
        let (catalog, store) = setup();
        append(&store, "cq1", "mt1", Outcome::Pass, 10);
        append(&store, "cq1", "mt2", Outcome::Fail, 10);
        append(&store, "cq2", "mt1", Outcome::Pass, 10);

        let m = build_matrix(&catalog, &store, "p", None, None).unwrap();
        assert_eq!(m.summary.pairs_with_run, 3);
        assert_eq!(m.summary.pass_count, 2);
        assert_eq!(m.summary.fail_count, 1);
        assert_eq!(m.summary.no_run_count, 3);
        assert!((m.summary.pass_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.summary.coverage_pct - 50.0).abs() < 1e-9);
        assert_eq!(
            m.cell("cq1", "mt2").and_then(|c| c.failure_reason()),
            Some("no results")
        );
    }

    #[test]
    fn late_arriving_older_record_does_not_change_cell() {
        let (catalog, store) = setup();
        append(&store, "cq1", "mt1", Outcome::Fail, 200);
        append(&store, "cq1", "mt1", Outcome::Pass, 100);

        let m = build_matrix(&catalog, &store, "p", None, None).unwrap();
        assert_eq!(m.cell("cq1", "mt1").unwrap().outcome(), Some(Outcome::Fail));
    }

    #[test]
    fn filters_narrow_the_grid() {
        let (catalog, store) = setup();
        append(&store, "cq3", "mt2", Outcome::Pass, 10);

        let cqs = vec!["cq3".to_string()];
        let mts = vec!["mt2".to_string()];
        let m = build_matrix(&catalog, &store, "p", Some(&cqs), Some(&mts)).unwrap();
        assert_eq!(m.cells.len(), 1);
        assert_eq!(m.summary.coverage_pct, 100.0);
        assert_eq!(m.summary.pass_rate, 1.0);
    }

    #[test]
    fn empty_universe_yields_empty_matrix() {
        let (catalog, store) = setup();
        catalog.insert_project("empty", vec![], vec![]);
        let m = build_matrix(&catalog, &store, "empty", None, None).unwrap();
        assert!(m.cells.is_empty());
        assert_eq!(m.summary, Summary::default());
    }
}
