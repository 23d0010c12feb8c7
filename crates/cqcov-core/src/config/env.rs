use super::Settings;

pub const ENV_PARALLEL: &str = "CQCOV_PARALLEL";
pub const ENV_TIMEOUT_SECONDS: &str = "CQCOV_TIMEOUT_SECONDS";

/// Applies `CQCOV_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |k| std::env::var(k).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup. Unparseable values are ignored.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup(ENV_PARALLEL) {
        if let Ok(n) = v.trim().parse() {
            settings.parallel = Some(n);
        }
    }
    if let Some(v) = lookup(ENV_TIMEOUT_SECONDS) {
        if let Ok(n) = v.trim().parse() {
            settings.timeout_seconds = Some(n);
        }
    }
}
