use crate::catalog::Catalog;
use crate::errors::{CoverageError, EntityKind, Result};
use crate::model::{CompetencyQuestion, Microtheory, PairKey, Selection};
use std::collections::HashSet;

/// The CQs and MTs a request covers, in catalog declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Universe {
    pub cqs: Vec<CompetencyQuestion>,
    pub mts: Vec<Microtheory>,
}

impl Universe {
    pub fn cq_ids(&self) -> Vec<String> {
        self.cqs.iter().map(|c| c.id.clone()).collect()
    }

    pub fn mt_ids(&self) -> Vec<String> {
        self.mts.iter().map(|m| m.id.clone()).collect()
    }

    pub fn pair_count(&self) -> u64 {
        (self.cqs.len() * self.mts.len()) as u64
    }

    /// CQ-major cross product.
    pub fn pairs(&self) -> impl Iterator<Item = (&CompetencyQuestion, &Microtheory)> + '_ {
        self.cqs
            .iter()
            .flat_map(move |cq| self.mts.iter().map(move |mt| (cq, mt)))
    }

    pub fn keys(&self) -> impl Iterator<Item = PairKey> + '_ {
        self.pairs().map(|(cq, mt)| PairKey::new(cq.id.clone(), mt.id.clone()))
    }
}

/// Resolves a project's CQ and MT universes, narrowed by the selections.
///
/// Fails with `NotFound` for an unknown project or for any selected id the project does not have.
/// Duplicate ids in a selection collapse to one entry.
pub fn resolve_universe(
    catalog: &dyn Catalog,
    project_id: &str,
    cqs: &Selection,
    mts: &Selection,
) -> Result<Universe> {
    if !catalog.project_exists(project_id) {
        return Err(CoverageError::not_found(EntityKind::Project, project_id));
    }

    let all_cqs = catalog.list_cqs(project_id)?;
    let all_mts = catalog.list_mts(project_id)?;

    Ok(Universe {
        cqs: narrow(all_cqs, cqs, EntityKind::CompetencyQuestion, |c| &c.id)?,
        mts: narrow(all_mts, mts, EntityKind::Microtheory, |m| &m.id)?,
    })
}

fn narrow<T>(
    all: Vec<T>,
    selection: &Selection,
    kind: EntityKind,
    id_of: impl Fn(&T) -> &String,
) -> Result<Vec<T>> {
    let Some(wanted) = selection.ids() else {
        return Ok(all);
    };

    let known: HashSet<&str> = all.iter().map(|t| id_of(t).as_str()).collect();
    if let Some(missing) = wanted.iter().find(|id| !known.contains(id.as_str())) {
        return Err(CoverageError::not_found(kind, missing.clone()));
    }

    let wanted: HashSet<&str> = wanted.iter().map(String::as_str).collect();
    Ok(all
        .into_iter()
        .filter(|t| wanted.contains(id_of(t).as_str()))
        .collect())
}
