pub mod schema;

pub use schema::{AgentConfig, BackendConfig, Config, StorageConfig, CONFIG_FILE_NAME};

use anyhow::{bail, Result};
use directories::ProjectDirs;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Overrides the platform config directory when `--config-dir` is absent.
pub const CONFIG_DIR_ENV: &str = "AGENT_DRIVER_CONFIG_DIR";

/// Picks the config directory: explicit flag, then environment, then platform default.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    resolve_config_dir_from(explicit, std::env::var_os(CONFIG_DIR_ENV))
}

fn resolve_config_dir_from(explicit: Option<&Path>, env: Option<OsString>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        if dir.as_os_str().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = env.filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    match ProjectDirs::from("org", "chiffon", "agent-driver") {
        Some(dirs) => Ok(dirs.config_dir().to_path_buf()),
        None => bail!("could not determine a config directory; pass --config-dir or set {CONFIG_DIR_ENV}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins_over_environment() {
        let dir = resolve_config_dir_from(
            Some(Path::new("/tmp/explicit")),
            Some(OsString::from("/tmp/from-env")),
        )
        .expect("resolved");
        assert_eq!(dir, PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn environment_is_used_without_flag() {
        let dir = resolve_config_dir_from(None, Some(OsString::from("/tmp/from-env")))
            .expect("resolved");
        assert_eq!(dir, PathBuf::from("/tmp/from-env"));
    }

    #[test]
    fn empty_flag_is_rejected() {
        assert!(resolve_config_dir_from(Some(Path::new("")), None).is_err());
    }
}
