//! `routeload run` command implementation.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use routeload::loadtest::config::LoadTestConfig;
use routeload::loadtest::engine::LoadTestEngine;
use routeload::loadtest::error::LoadTestError;
use routeload::loadtest::report::{write_report, SummaryReport};
use routeload::loadtest::summary::render_summary;
use routeload::loadtest::threshold::ThresholdReport;

use super::{RunArgs, DEFAULT_CONFIG_FILE};

/// Exit status when at least one threshold failed.
pub const EXIT_THRESHOLDS_FAILED: u8 = 99;

/// Exit status when thresholds could not be evaluated.
pub const EXIT_EVALUATION_ERROR: u8 = 98;

/// Execute the `run` command.
///
/// Loads config (explicit path, auto-discovery, or built-in defaults),
/// applies CLI overrides, runs the engine, prints the summary and writes the
/// JSON summary. The returned exit code reflects the threshold outcome.
pub async fn execute_run(args: RunArgs) -> Result<ExitCode> {
    if args.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    // Step 1: Load config
    let mut config = match resolve_config_path(args.config.as_deref())? {
        Some(path) => {
            eprintln!("Loading config from: {}", path.display());
            LoadTestConfig::load(&path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?
        },
        None => {
            eprintln!("No {DEFAULT_CONFIG_FILE} found, using built-in defaults");
            LoadTestConfig::default()
        },
    };

    // Step 2: Apply CLI overrides
    apply_overrides(&mut config, &args);

    // Step 3: Build and run the engine
    let summary_path = config.settings.summary_path.clone();
    eprintln!(
        "Target: {} ({} stages, {}s, up to {} VUs)",
        config.settings.base_url,
        config.stage.len(),
        config.total_duration().as_secs(),
        config.max_target_vus()
    );

    let progress = !args.quiet && std::io::stderr().is_terminal();
    let engine = LoadTestEngine::new(config)
        .context("Invalid configuration")?
        .with_progress(progress)
        .with_signal_handling(true);

    let result = engine.run().await.context("Load test failed")?;

    // Step 4: Summary on stdout
    let thresholds = result.evaluate_thresholds();
    if let Err(e) = &thresholds {
        tracing::error!(error = %e, "threshold evaluation failed");
    }
    println!("{}", render_summary(&result, thresholds.as_ref()));

    // Step 5: JSON summary (unless --no-report)
    if !args.no_report {
        let report = SummaryReport::from_result(&result, thresholds.as_ref());
        match write_report(&report, &summary_path) {
            Ok(()) => {
                eprintln!();
                eprintln!("Summary written to: {}", summary_path.display());
            },
            Err(e) => {
                eprintln!();
                eprintln!("Warning: Failed to write summary: {e}");
            },
        }
    }

    Ok(ExitCode::from(exit_status(&thresholds)))
}

/// Map the threshold evaluation to a process exit status.
fn exit_status(thresholds: &Result<ThresholdReport, LoadTestError>) -> u8 {
    match thresholds {
        Ok(report) if report.passed() => 0,
        Ok(_) => EXIT_THRESHOLDS_FAILED,
        Err(_) => EXIT_EVALUATION_ERROR,
    }
}

/// Resolve which config file to load.
///
/// An explicit path must exist. Without one, `routeload.toml` is searched
/// for from the current directory upwards; `None` means no file was found.
fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `routeload init` to create one.",
                    path.display()
                );
            }
            Ok(Some(path.to_path_buf()))
        },
        None => {
            let cwd = std::env::current_dir()?;
            Ok(discover_config(&cwd))
        },
    }
}

/// Find `routeload.toml` by walking parent directories from `start`.
fn discover_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Apply CLI flag overrides to a loaded config.
fn apply_overrides(config: &mut LoadTestConfig, args: &RunArgs) {
    if let Some(base_url) = &args.base_url {
        config.settings.base_url = base_url.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.settings.timeout_ms = timeout_ms;
    }
    if let Some(period_ms) = args.period_ms {
        config.settings.iteration_period_ms = period_ms;
    }
    if let Some(path) = &args.summary_export {
        config.settings.summary_path = path.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeload::loadtest::threshold::{Threshold, ThresholdOutcome, ThresholdStatus};

    #[test]
    fn test_apply_overrides_replaces_given_fields() {
        let mut config = LoadTestConfig::default();
        let args = RunArgs {
            base_url: Some("http://localhost:5000".to_string()),
            timeout_ms: Some(2500),
            summary_export: Some(PathBuf::from("out/result.json")),
            ..RunArgs::default()
        };

        apply_overrides(&mut config, &args);

        assert_eq!(config.settings.base_url, "http://localhost:5000");
        assert_eq!(config.settings.timeout_ms, 2500);
        assert_eq!(config.settings.iteration_period_ms, 1000);
        assert_eq!(
            config.settings.summary_path,
            PathBuf::from("out/result.json")
        );
    }

    #[test]
    fn test_apply_overrides_without_flags_is_noop() {
        let mut config = LoadTestConfig::default();
        apply_overrides(&mut config, &RunArgs::default());
        assert_eq!(config, LoadTestConfig::default());
    }

    #[test]
    fn test_apply_overrides_period() {
        let mut config = LoadTestConfig::default();
        let args = RunArgs {
            period_ms: Some(250),
            ..RunArgs::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.settings.iteration_period_ms, 250);
    }

    #[test]
    fn test_discover_config_walks_up() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(DEFAULT_CONFIG_FILE), "").unwrap();

        let found = discover_config(&nested).unwrap();
        assert_eq!(found, root.path().join(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_discover_config_prefers_nearest() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(DEFAULT_CONFIG_FILE), "").unwrap();
        std::fs::write(nested.join(DEFAULT_CONFIG_FILE), "").unwrap();

        assert_eq!(
            discover_config(&nested).unwrap(),
            nested.join(DEFAULT_CONFIG_FILE)
        );
    }

    #[test]
    fn test_resolve_config_path_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = resolve_config_path(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_exit_status_mapping() {
        let passed = ThresholdReport { outcomes: vec![] };
        assert_eq!(exit_status(&Ok(passed)), 0);

        let failed = ThresholdReport {
            outcomes: vec![ThresholdOutcome {
                threshold: Threshold::parse("http_req_failed", "rate<0.01").unwrap(),
                status: ThresholdStatus::Failed { observed: 0.5 },
            }],
        };
        assert_eq!(exit_status(&Ok(failed)), EXIT_THRESHOLDS_FAILED);

        let error = Err(LoadTestError::Threshold {
            message: "unknown metric 'nope'".to_string(),
        });
        assert_eq!(exit_status(&error), EXIT_EVALUATION_ERROR);
    }
}
