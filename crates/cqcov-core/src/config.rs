use crate::errors::CoverageError;
use crate::model::{CompetencyQuestion, Microtheory, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod env;
pub mod path_resolver;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;
pub const DEFAULT_PARALLEL: usize = 4;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(
        default = "default_version",
        rename = "configVersion",
        alias = "version"
    )]
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

impl WorkspaceConfig {
    pub fn project(&self, id: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_batch_per_project: Option<bool>,
    /// Seconds a non-terminal job row may go without an update before another process treats it
    /// as abandoned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_lease_seconds: Option<u64>,
}

impl Settings {
    pub fn parallel(&self) -> usize {
        self.parallel.unwrap_or(DEFAULT_PARALLEL).max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS).max(1))
    }

    pub fn single_batch_per_project(&self) -> bool {
        self.single_batch_per_project.unwrap_or(true)
    }

    /// Defaults to twice the pair timeout plus 30s: a live job commits a pair at least once per
    /// timeout.
    pub fn job_lease(&self) -> Duration {
        match self.job_lease_seconds {
            Some(secs) => Duration::from_secs(secs.max(1)),
            None => self.timeout() * 2 + Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// SPARQL 1.1 protocol endpoint; the MT id is passed as `default-graph-uri`.
    Sparql { endpoint: String },
    /// Recorded outcomes (JSONL), for offline and reproducible runs.
    Replay { file: PathBuf },
    /// Answers every pair with the same outcome.
    Fake {
        #[serde(default = "default_fake_outcome")]
        outcome: Outcome,
        #[serde(default)]
        row_count: u64,
    },
}

fn default_fake_outcome() -> Outcome {
    Outcome::Pass
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub cqs: Vec<CompetencyQuestion>,
    #[serde(default)]
    pub mts: Vec<Microtheory>,
}

/// Loads and validates a workspace config.
///
/// Unknown keys are an error in `strict` mode and a warning otherwise.
pub fn load_config(path: &Path, strict: bool) -> Result<WorkspaceConfig, CoverageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CoverageError::Config(format!("failed to read config {}: {}", path.display(), e))
    })?;
    let mut cfg = parse_config(&raw, strict)?;

    let resolver = path_resolver::PathResolver::new(path);
    if let Some(ExecutorConfig::Replay { file }) = cfg.executor.as_mut() {
        resolver.resolve(file);
    }

    env::apply_env_overrides(&mut cfg.settings);
    Ok(cfg)
}

/// Parses and validates config text. Paths are left as written.
pub fn parse_config(raw: &str, strict: bool) -> Result<WorkspaceConfig, CoverageError> {
    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);
    let cfg: WorkspaceConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| CoverageError::Config(format!("failed to parse YAML: {}", e)))?;

    let meaningful_unknowns: Vec<&String> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    if !meaningful_unknowns.is_empty() {
        if strict {
            return Err(CoverageError::Config(format!(
                "unknown fields in strict mode: {:?}",
                meaningful_unknowns
            )));
        }
        tracing::warn!(
            event = "cqcov.config.ignored_fields",
            fields = ?meaningful_unknowns,
            "ignored unknown config fields"
        );
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(CoverageError::Config(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }

    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &WorkspaceConfig) -> Result<(), CoverageError> {
    if cfg.projects.is_empty() {
        return Err(CoverageError::Config("config has no projects".into()));
    }

    let mut project_ids = HashSet::new();
    for p in &cfg.projects {
        if p.id.trim().is_empty() {
            return Err(CoverageError::Config("project with empty id".into()));
        }
        if !project_ids.insert(p.id.as_str()) {
            return Err(CoverageError::Config(format!(
                "duplicate project id '{}'",
                p.id
            )));
        }

        let mut mt_ids = HashSet::new();
        for mt in &p.mts {
            if mt.id.trim().is_empty() || !mt_ids.insert(mt.id.as_str()) {
                return Err(CoverageError::Config(format!(
                    "project '{}': empty or duplicate microtheory id '{}'",
                    p.id, mt.id
                )));
            }
        }

        let mut cq_ids = HashSet::new();
        for cq in &p.cqs {
            if cq.id.trim().is_empty() || !cq_ids.insert(cq.id.as_str()) {
                return Err(CoverageError::Config(format!(
                    "project '{}': empty or duplicate competency question id '{}'",
                    p.id, cq.id
                )));
            }
            if cq.query.trim().is_empty() {
                return Err(CoverageError::Config(format!(
                    "project '{}': competency question '{}' has no query",
                    p.id, cq.id
                )));
            }
            if let Some(default_mt) = &cq.default_mt {
                if !mt_ids.contains(default_mt.as_str()) {
                    return Err(CoverageError::Config(format!(
                        "project '{}': competency question '{}' references unknown microtheory '{}'",
                        p.id, cq.id, default_mt
                    )));
                }
            }
        }
    }
    Ok(())
}

pub const SAMPLE_CONFIG: &str = r#"configVersion: 1
settings:
  parallel: 4
  timeout_seconds: 30
  single_batch_per_project: true
  job_lease_seconds: 90
executor:
  type: sparql
  endpoint: http://localhost:3030/kb/sparql
projects:
  - id: demo
    name: Demo knowledge base
    mts:
      - id: urn:mt:base
        label: Base facts
        data_revision: "1"
      - id: urn:mt:geo
        label: Geography
        data_revision: "1"
    cqs:
      - id: cq-capitals
        name: Capitals
        problem: Which cities are capitals of a country?
        query: |
          SELECT ?city WHERE { ?city <urn:ex:capitalOf> ?country }
        default_mt: urn:mt:geo
      - id: cq-population
        name: Population known
        problem: Does every country have a population figure?
        query: |
          ASK { ?c a <urn:ex:Country> ; <urn:ex:population> ?p }
"#;

pub fn write_sample_config(path: &Path) -> Result<(), CoverageError> {
    std::fs::write(path, SAMPLE_CONFIG)
        .map_err(|e| CoverageError::Config(format!("failed to write sample config: {}", e)))?;
    Ok(())
}
