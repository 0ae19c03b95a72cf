//! Installation-wide and per-project settings.
//!
//! Core settings load from a config file plus `PREARCHIVE_*` environment
//! overrides; per-project policy is resolved through [`ProjectSettingsSource`]
//! so the handlers stay independent of where project configuration lives.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use prearchive_model::AutoArchivePolicy;

/// Installation-wide behaviour of the merge engines and handlers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Root of the quarantine area; sessions live under
    /// `<root>/<project>/<timestamp>/<folder>`.
    pub prearchive_root: PathBuf,
    /// Root of the permanent archive.
    pub archive_root: PathBuf,
    /// Prefer content-unique identifiers over relative paths when matching
    /// catalog entries during a merge.
    pub identify_by_uid: bool,
    /// Keep overwritten files (and their catalog metadata) in a timestamped
    /// history area instead of deleting them.
    pub retain_file_history: bool,
    /// Compute checksums for every catalog entry when formalizing catalogs.
    pub require_checksums: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            prearchive_root: PathBuf::from("/data/prearchive"),
            archive_root: PathBuf::from("/data/archive"),
            identify_by_uid: true,
            retain_file_history: true,
            require_checksums: false,
        }
    }
}

impl CoreSettings {
    /// Load settings using the layered sources convention:
    /// 1) `$PREARCHIVE_CONFIG` (TOML file) when set,
    /// 2) `prearchive.toml` in the working directory when present,
    /// 3) `PREARCHIVE_*` environment overrides on top,
    /// 4) defaults for anything not named.
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("PREARCHIVE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        } else {
            builder =
                builder.add_source(config::File::with_name("prearchive").required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("PREARCHIVE"))
            .build()
            .context("failed to assemble prearchive configuration sources")?
            .try_deserialize()
            .context("failed to deserialize prearchive configuration")?;
        Ok(settings)
    }
}

/// Per-project policy consulted by the rebuild/separate/archive handlers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub auto_archive: AutoArchivePolicy,
    /// Split combined-modality sessions (PET/MR, PET/CT) into per-modality
    /// sessions before archiving.
    pub split_combined_modalities: bool,
    /// Overrides the installation-wide checksum requirement when set.
    pub require_checksums: Option<bool>,
}

/// Where per-project settings come from. The production implementation is
/// backed by the project registry; tests use the static map.
pub trait ProjectSettingsSource: Send + Sync {
    /// Settings for `project`; `None` selects the unassigned-area defaults.
    fn project(&self, project: Option<&str>) -> ProjectSettings;
}

/// Fixed project-settings map with a fallback default.
#[derive(Debug, Default)]
pub struct StaticProjectSettings {
    default: ProjectSettings,
    overrides: HashMap<String, ProjectSettings>,
}

impl StaticProjectSettings {
    pub fn new(default: ProjectSettings) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>, settings: ProjectSettings) -> Self {
        self.overrides.insert(project.into(), settings);
        self
    }
}

impl ProjectSettingsSource for StaticProjectSettings {
    fn project(&self, project: Option<&str>) -> ProjectSettings {
        project
            .and_then(|p| self.overrides.get(p))
            .unwrap_or(&self.default)
            .clone()
    }
}
