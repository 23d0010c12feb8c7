//! Read side of the authoring subsystem: which CQs and MTs a project has.

use crate::config::WorkspaceConfig;
use crate::errors::{CoverageError, EntityKind, Result};
use crate::model::{CompetencyQuestion, Microtheory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub trait Catalog: Send + Sync {
    fn project_exists(&self, project_id: &str) -> bool;

    /// CQs of a project in declaration order.
    fn list_cqs(&self, project_id: &str) -> Result<Vec<CompetencyQuestion>>;

    /// MTs of a project in declaration order, with their current data revision.
    fn list_mts(&self, project_id: &str) -> Result<Vec<Microtheory>>;

    /// Current data revision of one MT.
    fn data_revision(&self, project_id: &str, mt_id: &str) -> Result<String> {
        self.list_mts(project_id)?
            .into_iter()
            .find(|m| m.id == mt_id)
            .map(|m| m.data_revision)
            .ok_or_else(|| CoverageError::not_found(EntityKind::Microtheory, mt_id))
    }
}

#[derive(Debug, Clone, Default)]
struct ProjectEntry {
    cqs: Vec<CompetencyQuestion>,
    mts: Vec<Microtheory>,
}

/// In-process catalog, typically built from the workspace config. Lock poisoning is ignored.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    projects: RwLock<HashMap<String, ProjectEntry>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &WorkspaceConfig) -> Self {
        let catalog = Self::new();
        for p in &cfg.projects {
            catalog.insert_project(&p.id, p.cqs.clone(), p.mts.clone());
        }
        catalog
    }

    /// Adds or replaces a project.
    pub fn insert_project(
        &self,
        project_id: &str,
        cqs: Vec<CompetencyQuestion>,
        mts: Vec<Microtheory>,
    ) {
        self.write()
            .insert(project_id.to_string(), ProjectEntry { cqs, mts });
    }

    /// Records that an MT's data changed. Returns the previous revision.
    pub fn set_data_revision(
        &self,
        project_id: &str,
        mt_id: &str,
        revision: impl Into<String>,
    ) -> Result<String> {
        let mut projects = self.write();
        let entry = projects
            .get_mut(project_id)
            .ok_or_else(|| CoverageError::not_found(EntityKind::Project, project_id))?;
        let mt = entry
            .mts
            .iter_mut()
            .find(|m| m.id == mt_id)
            .ok_or_else(|| CoverageError::not_found(EntityKind::Microtheory, mt_id))?;
        Ok(std::mem::replace(&mut mt.data_revision, revision.into()))
    }

    fn with_project<T>(&self, project_id: &str, f: impl FnOnce(&ProjectEntry) -> T) -> Result<T> {
        self.read()
            .get(project_id)
            .map(f)
            .ok_or_else(|| CoverageError::not_found(EntityKind::Project, project_id))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ProjectEntry>> {
        self.projects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ProjectEntry>> {
        self.projects.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for StaticCatalog {
    fn project_exists(&self, project_id: &str) -> bool {
        self.read().contains_key(project_id)
    }

    fn list_cqs(&self, project_id: &str) -> Result<Vec<CompetencyQuestion>> {
        self.with_project(project_id, |p| p.cqs.clone())
    }

    fn list_mts(&self, project_id: &str) -> Result<Vec<Microtheory>> {
        self.with_project(project_id, |p| p.mts.clone())
    }

    fn data_revision(&self, project_id: &str, mt_id: &str) -> Result<String> {
        self.with_project(project_id, |p| {
            p.mts
                .iter()
                .find(|m| m.id == mt_id)
                .map(|m| m.data_revision.clone())
        })?
        .ok_or_else(|| CoverageError::not_found(EntityKind::Microtheory, mt_id))
    }
}
