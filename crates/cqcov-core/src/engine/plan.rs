use crate::coverage::Universe;
use crate::model::{CompetencyQuestion, Microtheory, PairKey, RunRecord};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub cq: CompetencyQuestion,
    pub mt: Microtheory,
}

impl WorkItem {
    pub fn key(&self) -> PairKey {
        PairKey::new(self.cq.id.clone(), self.mt.id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkSet {
    pub items: Vec<WorkItem>,
    pub total_pairs: u64,
    pub skipped_pairs: u64,
}

/// Filters the universe down to the pairs a batch must execute.
///
/// Without `force_rerun` a pair is skipped iff its latest record passed against the MT's current
/// data revision. Failed, never-run and revision-mismatched pairs are always kept.
pub fn plan_work_set(
    universe: &Universe,
    latest: &HashMap<PairKey, RunRecord>,
    force_rerun: bool,
) -> WorkSet {
    let mut set = WorkSet {
        total_pairs: universe.pair_count(),
        ..Default::default()
    };

    for (cq, mt) in universe.pairs() {
        let fresh = !force_rerun
            && latest
                .get(&PairKey::new(cq.id.clone(), mt.id.clone()))
                .is_some_and(|r| r.is_fresh_pass(&mt.data_revision));
        if fresh {
            set.skipped_pairs += 1;
        } else {
            set.items.push(WorkItem {
                cq: cq.clone(),
                mt: mt.clone(),
            });
        }
    }
    set
}
