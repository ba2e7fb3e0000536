//! The launch command

use serde_json::{Map, Value};
use tracing::info;

use super::Cli;
use crate::runner::{MLRunner, MLRunnerConfig, MLRunnerConfigLoader};

/// Execute the launch described by the parsed arguments and return the
/// program's exit code.
pub fn run_command(cli: Cli) -> Result<i32, String> {
    let work_dir = match &cli.work_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| e.to_string())?,
    };

    let mut loader = MLRunnerConfigLoader::new(MLRunnerConfig::default())
        .map_err(|e| e.to_string())?
        .work_dir(&work_dir)
        .config_files(cli.config_file.clone());

    let mut on_load = |path: &std::path::Path| info!(file = %path.display(), "config file loaded");
    loader
        .load_config_files(Some(&mut on_load))
        .map_err(|e| e.to_string())?;

    // Flags beat every config file.
    loader
        .load_object(flag_overrides(&cli))
        .map_err(|e| e.to_string())?;

    let config = loader.get().map_err(|e| e.to_string())?;
    let runner = MLRunner::new(config);
    runner.run().map_err(|e| e.to_string())
}

/// The override layer contributed by command line flags. Only flags the
/// user actually passed appear, so config file values survive elsewhere.
fn flag_overrides(cli: &Cli) -> Map<String, Value> {
    let mut overrides = Map::new();
    if let Some(server) = &cli.server {
        overrides.insert("server".to_string(), Value::String(server.clone()));
    }
    if let Some(name) = &cli.name {
        overrides.insert("name".to_string(), Value::String(name.clone()));
    }
    if let Some(description) = &cli.description {
        overrides.insert(
            "description".to_string(),
            Value::String(description.clone()),
        );
    }
    if !cli.tags.is_empty() {
        overrides.insert(
            "tags".to_string(),
            Value::Array(cli.tags.iter().cloned().map(Value::String).collect()),
        );
    }
    if !cli.env.is_empty() {
        let mut env = Map::new();
        for (key, value) in &cli.env {
            env.insert(key.clone(), Value::String(value.clone()));
        }
        overrides.insert("env".to_string(), Value::Object(env));
    }
    if !cli.gpu.is_empty() {
        overrides.insert(
            "gpu".to_string(),
            Value::Array(cli.gpu.iter().map(|&n| Value::from(n)).collect()),
        );
    }
    if let Some(work_dir) = &cli.work_dir {
        overrides.insert(
            "work_dir".to_string(),
            Value::String(work_dir.to_string_lossy().into_owned()),
        );
    }
    if !cli.daemon.is_empty() {
        overrides.insert(
            "daemon".to_string(),
            Value::Array(cli.daemon.iter().cloned().map(Value::String).collect()),
        );
    }
    if let Some(id) = &cli.resume_from {
        overrides.insert("resume_from".to_string(), Value::String(id.clone()));
    }
    if let Some(id) = &cli.clone_from {
        overrides.insert("clone_from".to_string(), Value::String(id.clone()));
    }
    if cli.no_source_archive {
        overrides.insert("source.make_archive".to_string(), Value::Bool(false));
    }
    if !cli.args.is_empty() {
        overrides.insert(
            "args".to_string(),
            Value::Array(cli.args.iter().cloned().map(Value::String).collect()),
        );
    }
    overrides
}
