//! Configuration file management and the resolution chain: CLI flag >
//! env var > config file > built-in default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::RunArgs;

/// Which clone manager materializes per-task working copies. Distinct
/// from `backend`, which names the agent CLI to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    Git,
    Container,
}

impl std::str::FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "git" => Ok(Isolation::Git),
            "container" => Ok(Isolation::Container),
            other => bail!("unknown isolation {other:?}; expected \"git\" or \"container\""),
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::Git => write!(f, "git"),
            Isolation::Container => write!(f, "container"),
        }
    }
}

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// `~/.config/drover/config.toml`, entirely optional -- every field
/// defers to env var or built-in default when absent.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunSection {
    pub concurrency: Option<usize>,
    pub max_tasks: Option<usize>,
    pub max_retries: Option<u32>,
    pub require_review: Option<bool>,
    pub merge_on_success: Option<bool>,
    pub dry_run: Option<bool>,
    pub runner_timeout_secs: Option<u64>,
    pub watchdog_timeout_secs: Option<u64>,
    pub watchdog_interval_secs: Option<u64>,
    pub retry_budget: Option<u32>,
    pub backend: Option<String>,
    pub isolation: Option<String>,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub repo_root: Option<String>,
    pub scheduler_state_path: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Always XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("drover")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load_config() -> Option<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path).ok()?;
    toml::from_str(&contents).ok()
}

pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub parent_id: String,
    pub concurrency: usize,
    pub max_tasks: Option<usize>,
    pub max_retries: u32,
    pub require_review: bool,
    pub merge_on_success: bool,
    pub dry_run: bool,
    pub runner_timeout: Duration,
    pub watchdog_timeout: Duration,
    pub watchdog_interval: Duration,
    pub retry_budget: u32,
    pub backend: String,
    pub isolation: Isolation,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub repo_root: PathBuf,
    pub scheduler_state_path: PathBuf,
}

/// One resolution step: CLI flag, then env var, then config file
/// value, then a built-in default. `field` names the knob for error
/// messages; `source` (once a value is picked) names where it came
/// from, also for error messages.
struct Pick<'a, T> {
    field: &'a str,
    value: T,
    source: &'static str,
}

fn pick_opt<T: Clone>(
    field: &'static str,
    cli: Option<T>,
    env_var: &str,
    env_parse: impl Fn(&str) -> Result<T>,
    file_value: Option<T>,
    default: T,
) -> Result<Pick<'static, T>> {
    if let Some(v) = cli {
        return Ok(Pick { field, value: v, source: "CLI flag" });
    }
    if let Ok(raw) = std::env::var(env_var) {
        let v = env_parse(&raw).with_context(|| format!("invalid value for {env_var}"))?;
        return Ok(Pick { field, value: v, source: "environment" });
    }
    if let Some(v) = file_value {
        return Ok(Pick { field, value: v, source: "config file" });
    }
    Ok(Pick { field, value: default, source: "built-in default" })
}

impl ResolvedConfig {
    /// Resolve every knob using CLI flag > env var > config file >
    /// built-in default, then apply spec.md's §6 validation rules.
    pub fn resolve(args: &RunArgs) -> Result<Self> {
        let file = load_config().unwrap_or_default();
        let run = file.run;

        let parent_id = args
            .parent_id
            .clone()
            .or_else(|| std::env::var("DROVER_PARENT_ID").ok())
            .context("parent/root id is required: pass --parent-id or set DROVER_PARENT_ID")?;

        let concurrency = pick_opt(
            "concurrency",
            args.concurrency,
            "DROVER_CONCURRENCY",
            |s| Ok(s.parse::<usize>()?),
            run.concurrency,
            4,
        )?;
        if concurrency.value == 0 {
            bail!("invalid {} (source: {}): must be > 0", concurrency.field, concurrency.source);
        }

        let max_tasks = pick_opt(
            "max_tasks",
            args.max_tasks.map(Some),
            "DROVER_MAX_TASKS",
            |s| Ok(Some(s.parse::<usize>()?)),
            run.max_tasks.map(Some),
            None,
        )?;

        let max_retries = pick_opt(
            "max_retries",
            args.max_retries,
            "DROVER_MAX_RETRIES",
            |s| Ok(s.parse::<u32>()?),
            run.max_retries,
            2,
        )?;

        let require_review = pick_opt(
            "require_review",
            args.require_review,
            "DROVER_REQUIRE_REVIEW",
            |s| Ok(parse_bool(s)?),
            run.require_review,
            true,
        )?;

        let merge_on_success = pick_opt(
            "merge_on_success",
            args.merge_on_success,
            "DROVER_MERGE_ON_SUCCESS",
            |s| Ok(parse_bool(s)?),
            run.merge_on_success,
            true,
        )?;

        let dry_run = pick_opt(
            "dry_run",
            args.dry_run.then_some(true),
            "DROVER_DRY_RUN",
            |s| Ok(parse_bool(s)?),
            run.dry_run,
            false,
        )?;

        let runner_timeout_secs = pick_opt(
            "runner_timeout",
            args.runner_timeout_secs,
            "DROVER_RUNNER_TIMEOUT",
            |s| Ok(s.parse::<u64>()?),
            run.runner_timeout_secs,
            1800,
        )?;

        let watchdog_timeout_secs = pick_opt(
            "watchdog_timeout",
            args.watchdog_timeout_secs,
            "DROVER_WATCHDOG_TIMEOUT",
            |s| Ok(s.parse::<u64>()?),
            run.watchdog_timeout_secs,
            120,
        )?;
        if watchdog_timeout_secs.value == 0 {
            bail!("invalid {} (source: {}): must be > 0", watchdog_timeout_secs.field, watchdog_timeout_secs.source);
        }

        let watchdog_interval_secs = pick_opt(
            "watchdog_interval",
            args.watchdog_interval_secs,
            "DROVER_WATCHDOG_INTERVAL",
            |s| Ok(s.parse::<u64>()?),
            run.watchdog_interval_secs,
            15,
        )?;
        if watchdog_interval_secs.value == 0 {
            bail!("invalid {} (source: {}): must be > 0", watchdog_interval_secs.field, watchdog_interval_secs.source);
        }

        let retry_budget = pick_opt(
            "retry_budget",
            args.retry_budget,
            "DROVER_RETRY_BUDGET",
            |s| Ok(s.parse::<u32>()?),
            run.retry_budget,
            2,
        )?;

        let backend = pick_opt(
            "backend",
            args.backend.clone(),
            "DROVER_BACKEND",
            |s| Ok(s.to_string()),
            run.backend.clone(),
            "claude".to_string(),
        )?;

        let isolation = pick_opt(
            "isolation",
            args.isolation.clone(),
            "DROVER_ISOLATION",
            |s| s.parse::<Isolation>(),
            run.isolation.as_deref().map(str::parse).transpose()?,
            Isolation::Git,
        )?;

        let model = pick_opt(
            "model",
            args.model.clone().map(Some),
            "DROVER_MODEL",
            |s| Ok(Some(s.to_string())),
            run.model.clone().map(Some),
            None,
        )?;

        let profile = pick_opt(
            "profile",
            args.profile.clone().map(Some),
            "DROVER_PROFILE",
            |s| Ok(Some(s.to_string())),
            run.profile.clone().map(Some),
            None,
        )?;

        let repo_root = pick_opt(
            "repo_root",
            args.repo_root.clone().map(Some),
            "DROVER_REPO_ROOT",
            |s| Ok(Some(PathBuf::from(s))),
            run.repo_root.clone().map(PathBuf::from).map(Some),
            None,
        )?;
        let repo_root = repo_root.value.unwrap_or_else(|| PathBuf::from("."));

        let scheduler_state_path = pick_opt(
            "scheduler_state_path",
            args.scheduler_state_path.clone().map(Some),
            "DROVER_STATE_PATH",
            |s| Ok(Some(PathBuf::from(s))),
            run.scheduler_state_path.clone().map(PathBuf::from).map(Some),
            None,
        )?;
        let scheduler_state_path =
            scheduler_state_path.value.unwrap_or_else(|| config_dir().join("state").join(format!("{parent_id}.json")));

        Ok(ResolvedConfig {
            parent_id,
            concurrency: concurrency.value,
            max_tasks: max_tasks.value,
            max_retries: max_retries.value,
            require_review: require_review.value,
            merge_on_success: merge_on_success.value,
            dry_run: dry_run.value,
            runner_timeout: Duration::from_secs(runner_timeout_secs.value),
            watchdog_timeout: Duration::from_secs(watchdog_timeout_secs.value),
            watchdog_interval: Duration::from_secs(watchdog_interval_secs.value),
            retry_budget: retry_budget.value,
            backend: backend.value,
            isolation: isolation.value,
            model: model.value,
            profile: profile.value,
            repo_root,
            scheduler_state_path,
        })
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn base_args() -> RunArgs {
        RunArgs {
            parent_id: Some("root-1".to_string()),
            concurrency: None,
            max_tasks: None,
            max_retries: None,
            require_review: None,
            merge_on_success: None,
            dry_run: false,
            runner_timeout_secs: None,
            watchdog_timeout_secs: None,
            watchdog_interval_secs: None,
            retry_budget: None,
            backend: None,
            isolation: None,
            model: None,
            profile: None,
            repo_root: None,
            scheduler_state_path: None,
        }
    }

    #[test]
    fn resolve_applies_built_in_defaults() {
        let _lock = lock_env();
        let resolved = ResolvedConfig::resolve(&base_args()).unwrap();
        assert_eq!(resolved.concurrency, 4);
        assert_eq!(resolved.max_retries, 2);
        assert!(resolved.require_review);
        assert_eq!(resolved.backend, "claude");
        assert_eq!(resolved.isolation, Isolation::Git);
    }

    #[test]
    fn resolve_cli_flag_overrides_env() {
        let _lock = lock_env();
        unsafe { std::env::set_var("DROVER_CONCURRENCY", "9") };
        let mut args = base_args();
        args.concurrency = Some(3);
        let resolved = ResolvedConfig::resolve(&args).unwrap();
        unsafe { std::env::remove_var("DROVER_CONCURRENCY") };
        assert_eq!(resolved.concurrency, 3);
    }

    #[test]
    fn resolve_env_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("DROVER_MAX_RETRIES", "7") };
        let resolved = ResolvedConfig::resolve(&base_args()).unwrap();
        unsafe { std::env::remove_var("DROVER_MAX_RETRIES") };
        assert_eq!(resolved.max_retries, 7);
    }

    #[test]
    fn resolve_rejects_zero_concurrency() {
        let _lock = lock_env();
        let mut args = base_args();
        args.concurrency = Some(0);
        let err = ResolvedConfig::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn resolve_rejects_zero_watchdog_interval() {
        let _lock = lock_env();
        let mut args = base_args();
        args.watchdog_interval_secs = Some(0);
        let err = ResolvedConfig::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("watchdog_interval"));
    }

    #[test]
    fn resolve_requires_parent_id() {
        let _lock = lock_env();
        let mut args = base_args();
        args.parent_id = None;
        unsafe { std::env::remove_var("DROVER_PARENT_ID") };
        let err = ResolvedConfig::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("parent"));
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        assert!(config_path().ends_with("drover/config.toml"));
    }
}
