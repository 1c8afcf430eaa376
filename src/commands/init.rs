//! `routeload init` command implementation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use routeload::loadtest::config::STARTER_TEMPLATE;

use super::DEFAULT_CONFIG_FILE;

/// Execute the `init` command.
///
/// Writes the starter config to `path`, or `./routeload.toml` when no path
/// is given. Refuses to overwrite an existing file unless `force` is set.
pub fn execute_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = match path {
        Some(p) => p,
        None => std::env::current_dir()?.join(DEFAULT_CONFIG_FILE),
    };

    write_starter_config(&config_path, force)?;
    eprintln!("Created {}", config_path.display());
    eprintln!("Edit the stages, coordinates and thresholds to fit your service.");

    Ok(())
}

fn write_starter_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            config_path.display()
        );
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    std::fs::write(config_path, STARTER_TEMPLATE)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeload::loadtest::config::LoadTestConfig;

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(DEFAULT_CONFIG_FILE);

        write_starter_config(&path, false).unwrap();

        let loaded = LoadTestConfig::load(&path).unwrap();
        assert_eq!(loaded, LoadTestConfig::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "# mine").unwrap();

        let err = write_starter_config(&path, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");
    }

    #[test]
    fn test_init_force_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "# mine").unwrap();

        write_starter_config(&path, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), STARTER_TEMPLATE);
    }
}
