//! Runner configuration
//!
//! [`MLRunnerConfig`] is everything `mlrun` needs to launch one run. Values
//! come from `.mlrun.*` config files discovered by
//! [`MLRunnerConfigLoader`] and from CLI flags, with the usual
//! later-layer-wins merging.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::config::{ConfigError, ConfigLoader};

/// Validation errors for the runner configuration
#[derive(Debug, thiserror::Error)]
pub enum RunnerConfigError {
    #[error("`{0}` is required")]
    Missing(&'static str),

    #[error("`{0}` cannot be empty")]
    Empty(&'static str),

    #[error("invalid pattern in `{field}`: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: Box<regex::Error>,
    },
}

/// A command to execute: either a shell line or an argv vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through the platform shell (`sh -c`)
    Shell(String),
    /// Run directly as program + arguments
    Exec(Vec<String>),
}

impl CommandLine {
    pub fn is_empty(&self) -> bool {
        match self {
            CommandLine::Shell(s) => s.trim().is_empty(),
            CommandLine::Exec(args) => args.is_empty(),
        }
    }

    /// One-line display form, used as the default experiment name.
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(s) => s.clone(),
            CommandLine::Exec(args) => args.join(" "),
        }
    }
}

fn default_source_includes() -> Vec<String> {
    vec![r".*\.(py|pl|rb|js|sh|r|bat|cmd|exe|jar)$".to_string()]
}

fn default_source_excludes() -> Vec<String> {
    vec![r".*[\\/](\.svn|\.cvs|\.git|\.hg|\.DS_Store|\.idea|node_modules|__pycache__)$"
        .to_string()]
}

fn default_true() -> bool {
    true
}

/// Which files go into the source snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    /// Root of the source tree; defaults to the work dir.
    pub root: Option<PathBuf>,
    /// Regex patterns a file must match to be included.
    #[serde(default = "default_source_includes")]
    pub includes: Vec<String>,
    /// Regex patterns that reject files and prune directories.
    #[serde(default = "default_source_excludes")]
    pub excludes: Vec<String>,
    /// Pack the selection into `source.zip` inside the storage dir.
    #[serde(default = "default_true")]
    pub make_archive: bool,
    /// Also copy the selected files into the storage dir.
    pub copy_to_dest: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: None,
            includes: default_source_includes(),
            excludes: default_source_excludes(),
            make_archive: true,
            copy_to_dest: false,
        }
    }
}

fn default_log_file() -> String {
    "console.log".to_string()
}

fn default_result_files() -> Vec<String> {
    vec!["result.json".to_string(), "webapp.json".to_string()]
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_watch_interval() -> u64 {
    10
}

/// How the launcher integrates with the running program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Capture file for the program's merged stdout/stderr, relative to the
    /// storage dir.
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Watch result files and push their contents to the server.
    #[serde(default = "default_true")]
    pub watch_results: bool,
    /// JSON files (relative to the storage dir) to watch for updates.
    #[serde(default = "default_result_files")]
    pub result_files: Vec<String>,
    /// Seconds between server heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds between result file polls.
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    /// Sniff the program's stdout for served web UIs (e.g. TensorBoard).
    #[serde(default = "default_true")]
    pub parse_stdout: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            watch_results: true,
            result_files: default_result_files(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            watch_interval_secs: default_watch_interval(),
            parse_stdout: true,
        }
    }
}

/// Configuration for one `mlrun` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MLRunnerConfig {
    /// URI of the MLStorage server (required).
    pub server: Option<String>,
    /// The program to run (required, non-empty).
    pub args: Option<CommandLine>,
    /// Experiment name; defaults to the command line.
    pub name: Option<String>,
    /// Experiment description.
    pub description: Option<String>,
    /// Experiment tags.
    pub tags: Option<Vec<String>>,
    /// Extra environment variables for the program.
    pub env: BTreeMap<String, String>,
    /// GPU indices; exported as `CUDA_VISIBLE_DEVICES`.
    pub gpu: Vec<u32>,
    /// Working directory for the program; defaults to the current dir.
    pub work_dir: Option<PathBuf>,
    /// Auxiliary programs kept alive while the main program runs.
    pub daemon: Vec<CommandLine>,
    /// Resume an interrupted experiment by document id.
    pub resume_from: Option<String>,
    /// Start from a copy of another experiment's storage dir.
    pub clone_from: Option<String>,
    pub source: SourceConfig,
    pub integration: IntegrationConfig,
}

impl MLRunnerConfig {
    /// Check required fields and pattern syntax.
    pub fn validate(self) -> Result<Self, RunnerConfigError> {
        match &self.server {
            None => return Err(RunnerConfigError::Missing("server")),
            Some(s) if s.trim().is_empty() => return Err(RunnerConfigError::Empty("server")),
            Some(_) => {}
        }
        match &self.args {
            None => return Err(RunnerConfigError::Missing("args")),
            Some(args) if args.is_empty() => return Err(RunnerConfigError::Empty("args")),
            Some(_) => {}
        }
        for daemon in &self.daemon {
            if daemon.is_empty() {
                return Err(RunnerConfigError::Empty("daemon"));
            }
        }
        compile_patterns(&self.source.includes, "source.includes")?;
        compile_patterns(&self.source.excludes, "source.excludes")?;
        Ok(self)
    }
}

/// Compile regex patterns, attributing failures to `field`.
pub fn compile_patterns(
    patterns: &[String],
    field: &'static str,
) -> Result<Vec<Regex>, RunnerConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| RunnerConfigError::Pattern {
                field,
                source: Box::new(e),
            })
        })
        .collect()
}

/// File names probed, in order, inside every discovery directory.
const CONFIG_FILE_NAMES: [&str; 3] = [".mlrun.yml", ".mlrun.yaml", ".mlrun.json"];

/// Discovers and folds `.mlrun.*` config files.
///
/// Discovery order (lowest precedence first): system paths, then the
/// work dir's ancestor chain from the root down, then explicit config
/// files. Within a directory `.mlrun.yml` loads before `.mlrun.yaml`
/// before `.mlrun.json`.
pub struct MLRunnerConfigLoader {
    loader: ConfigLoader<MLRunnerConfig>,
    config_files: Vec<PathBuf>,
    work_dir: Option<PathBuf>,
    system_paths: Vec<PathBuf>,
}

impl MLRunnerConfigLoader {
    /// Create a loader seeded with programmatic values (lowest precedence).
    pub fn new(config: MLRunnerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            loader: ConfigLoader::with_seed(&config)?,
            config_files: Vec::new(),
            work_dir: None,
            system_paths: default_system_paths(),
        })
    }

    /// Explicit config files, loaded last (highest file precedence).
    #[must_use]
    pub fn config_files(mut self, files: Vec<PathBuf>) -> Self {
        self.config_files = files;
        self
    }

    /// Work dir whose ancestor chain is scanned for `.mlrun.*` files.
    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Override the system discovery paths (defaults: home and the user
    /// config dir).
    #[must_use]
    pub fn system_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_paths = paths;
        self
    }

    /// All config files that would be loaded, in load order.
    pub fn list_config_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut push_dir = |files: &mut Vec<PathBuf>, dir: &Path| {
            for name in CONFIG_FILE_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    files.push(candidate);
                }
            }
        };

        for dir in &self.system_paths {
            push_dir(&mut files, dir);
        }
        if let Some(work_dir) = &self.work_dir {
            let mut chain: Vec<&Path> = work_dir.ancestors().collect();
            chain.reverse();
            for dir in chain {
                push_dir(&mut files, dir);
            }
        }
        for file in &self.config_files {
            if file.is_file() {
                files.push(file.clone());
            }
        }
        files
    }

    /// Load every discovered file into the merge tree.
    pub fn load_config_files(
        &mut self,
        mut on_load: Option<&mut dyn FnMut(&Path)>,
    ) -> Result<(), ConfigError> {
        for file in self.list_config_files() {
            self.loader.load_file(&file)?;
            if let Some(callback) = on_load.as_deref_mut() {
                callback(&file);
            }
        }
        Ok(())
    }

    /// Merge an extra override layer (e.g. CLI flags) on top.
    pub fn load_object(
        &mut self,
        object: Map<String, serde_json::Value>,
    ) -> Result<(), ConfigError> {
        self.loader.load_object(object)
    }

    /// The merged config, unvalidated; [`MLRunner::run`](super::MLRunner::run)
    /// validates before launching.
    pub fn get(&self) -> Result<MLRunnerConfig, ConfigError> {
        self.loader.get()
    }
}

fn default_system_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home);
    }
    if let Some(config) = dirs::config_dir() {
        paths.push(config.join("mlrun"));
    }
    paths
}
