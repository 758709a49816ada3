//! Invocation settings.
//!
//! Layered once at process start: built-in defaults, then an optional YAML
//! file, then the environment (`DCCN_OPT_DIR`, `MRIQC_VERSION`, `USER`).
//! Nothing below this module reads the environment.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_OPT_DIR: &str = "DCCN_OPT_DIR";
pub const ENV_TOOL_VERSION: &str = "MRIQC_VERSION";
pub const ENV_USER: &str = "USER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    pub qsub: String,
    pub qselect: String,
    pub qstat: String,
    /// Upper bound for every scheduler call; a hung `qstat` must not stall the batch.
    pub timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            qselect: "qselect".to_string(),
            qstat: "qstat".to_string(),
            timeout_secs: 120,
        }
    }
}

impl SchedulerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Software installation root that holds `mriqc/<version>/`.
    pub opt_dir: PathBuf,
    pub tool_version: String,
    /// Owner of ephemeral working directories.
    pub user: String,
    /// Explicit container image; derived from `opt_dir` and `tool_version` when unset.
    pub container_image: Option<PathBuf>,
    pub scratch_root: PathBuf,
    pub participant_walltime: String,
    pub group_walltime: String,
    pub scheduler: SchedulerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            opt_dir: PathBuf::from("/opt"),
            tool_version: String::new(),
            user: String::new(),
            container_image: None,
            scratch_root: PathBuf::from("/tmp"),
            participant_walltime: "24:00:00".to_string(),
            group_walltime: "0:10:00".to_string(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then `config_file`, then the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Settings> {
        let mut settings = match config_file {
            Some(path) => Self::from_yaml_file(path)?,
            None => Settings::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Settings> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml_str(data: &str) -> Result<Settings> {
        if data.trim().is_empty() {
            return Ok(Settings::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Environment values win over file values; empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(ENV_OPT_DIR) {
            self.opt_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_TOOL_VERSION) {
            self.tool_version = v;
        }
        if let Some(v) = get(ENV_USER) {
            self.user = v;
        }
    }

    pub fn container_image(&self) -> PathBuf {
        if let Some(image) = &self.container_image {
            return image.clone();
        }
        let version = &self.tool_version;
        self.opt_dir
            .join("mriqc")
            .join(version)
            .join(format!("mriqc-{}.simg", version))
    }

    /// Per-user parent of ephemeral working directories.
    pub fn scratch_dir(&self) -> Result<PathBuf> {
        if self.user.trim().is_empty() {
            return Err(anyhow!(
                "cannot place temporary working directories: {} is not set (pass --workdir instead)",
                ENV_USER
            ));
        }
        Ok(self.scratch_root.join(&self.user).join("work_mriqc"))
    }
}
