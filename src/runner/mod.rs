//! The `mlrun` launcher
//!
//! [`MLRunner`] ties everything together: it creates (or resumes) an
//! experiment document on the MLStorage server, launches the user's program
//! inside the server-assigned storage dir with the `MLSTORAGE_*` integration
//! environment, snapshots the source tree, keeps daemons and heartbeats
//! alive, mirrors result files to the server, and finally reports the
//! program's exit code.

pub mod config;
pub mod output;
pub mod program;
pub mod source;
pub mod watcher;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

pub use config::{CommandLine, IntegrationConfig, MLRunnerConfig, MLRunnerConfigLoader,
                 RunnerConfigError, SourceConfig};

use crate::client::{ClientError, ExperimentDoc, MLStorageClient, RunStatus};
use crate::config::ConfigError;
use output::{LineBuffered, WebUiHandler};
use program::{ProgramHost, ProgramKiller};
use source::{SourceCopier, SourceError};
use watcher::JsonFileWatcher;

/// Exit code reported when the program cannot be spawned at all.
pub const LAUNCH_FAILED_EXIT_CODE: i32 = 127;

/// Pause between daemon restarts.
const DAEMON_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Environment variable telling the program which server to report to.
pub const ENV_SERVER_URI: &str = "MLSTORAGE_SERVER_URI";
/// Environment variable carrying the experiment document id.
pub const ENV_EXPERIMENT_ID: &str = "MLSTORAGE_EXPERIMENT_ID";
/// Environment variable carrying the server-assigned output directory.
pub const ENV_OUTPUT_DIR: &str = "MLSTORAGE_OUTPUT_DIR";

/// Errors from launching a run
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] RunnerConfigError),

    #[error(transparent)]
    ConfigLoad(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Launches one experiment run.
pub struct MLRunner {
    config: MLRunnerConfig,
}

impl MLRunner {
    pub fn new(config: MLRunnerConfig) -> Self {
        Self { config }
    }

    /// Run the experiment to completion and return the program's exit code.
    pub fn run(self) -> Result<i32> {
        let config = self.config.validate()?;
        Self::launch(config)
    }

    fn launch(config: MLRunnerConfig) -> Result<i32> {
        let server = config.server.clone().unwrap_or_default();
        let args = config
            .args
            .clone()
            .unwrap_or(CommandLine::Exec(Vec::new()));

        let client = Arc::new(MLStorageClient::new(&server)?);
        let work_dir = match &config.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        // Create or resume the experiment document.
        let doc = Self::resolve_doc(&client, &config, &args)?;
        let id = doc.id.clone();

        // From here on the document exists on the server; a setup failure
        // must not leave it stuck in RUNNING state.
        match Self::execute(&config, &client, &server, &doc, &work_dir, args) {
            Ok(exit_code) => Ok(exit_code),
            Err(e) => {
                Self::report_failure(&client, &id, &e);
                Err(e)
            }
        }
    }

    fn execute(
        config: &MLRunnerConfig,
        client: &Arc<MLStorageClient>,
        server: &str,
        doc: &ExperimentDoc,
        work_dir: &Path,
        args: CommandLine,
    ) -> Result<i32> {
        let id = doc.id.clone();
        let storage_dir = PathBuf::from(doc.require_storage_dir()?);
        fs::create_dir_all(&storage_dir)?;
        info!(id = %id, storage_dir = %storage_dir.display(), "experiment run starting");

        if let Some(clone_from) = &config.clone_from {
            if config.resume_from.is_none() {
                Self::clone_storage(client, clone_from, &storage_dir)?;
            }
        }

        Self::snapshot_source(config, work_dir, &storage_dir)?;

        let env = build_program_env(config, server, &id, &storage_dir);

        // Background machinery: daemons, result watcher, heartbeats.
        let daemons = DaemonPool::start(&config.daemon, &env, work_dir, &storage_dir, config);
        let watcher = Self::start_watcher(config, client, &id, &storage_dir);
        let heartbeat = Heartbeat::start(
            Arc::clone(client),
            id.clone(),
            Duration::from_secs(config.integration.heartbeat_interval_secs),
        );

        // The main program.
        let exit_code =
            Self::run_program(config, client, &id, &storage_dir, work_dir, env, args);

        // Teardown order: daemons die first, then the watcher takes its
        // final look at the result files, then heartbeats stop.
        daemons.stop();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        heartbeat.stop();

        Self::finish(client, &id, exit_code);
        Ok(exit_code)
    }

    /// Mark the document FAILED when the run dies before the program starts.
    fn report_failure(client: &MLStorageClient, id: &str, error: &RunnerError) {
        let mut fields = Map::new();
        fields.insert(
            "error".to_string(),
            serde_json::json!({"message": error.to_string()}),
        );
        if let Err(e) = client.set_finished(id, RunStatus::Failed, fields) {
            error!("failed to mark experiment failed: {e}");
        }
    }

    fn resolve_doc(
        client: &MLStorageClient,
        config: &MLRunnerConfig,
        args: &CommandLine,
    ) -> Result<ExperimentDoc> {
        if let Some(id) = &config.resume_from {
            return Ok(client.get(id)?);
        }

        let mut fields = Map::new();
        let name = config.name.clone().unwrap_or_else(|| args.display());
        fields.insert("name".to_string(), Value::String(name));
        if let Some(description) = &config.description {
            fields.insert("description".to_string(), Value::String(description.clone()));
        }
        if let Some(tags) = &config.tags {
            fields.insert(
                "tags".to_string(),
                Value::Array(tags.iter().cloned().map(Value::String).collect()),
            );
        }
        fields.insert(
            "args".to_string(),
            serde_json::to_value(args).unwrap_or(Value::Null),
        );
        // The merged launcher config, kept on the doc for reproducibility.
        if let Ok(value) = serde_json::to_value(config) {
            fields.insert("mlrun".to_string(), value);
        }
        fields.insert(
            "start_time".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        Ok(client.create(fields)?)
    }

    fn clone_storage(
        client: &MLStorageClient,
        clone_from: &str,
        storage_dir: &Path,
    ) -> Result<()> {
        let origin = client.get(clone_from)?;
        let origin_dir = PathBuf::from(origin.require_storage_dir()?);
        if origin_dir.is_dir() {
            info!(from = %origin_dir.display(), "cloning storage dir");
            copy_dir_all(&origin_dir, storage_dir)?;
        } else {
            warn!(from = %origin_dir.display(), "clone source storage dir does not exist");
        }
        Ok(())
    }

    fn snapshot_source(
        config: &MLRunnerConfig,
        work_dir: &Path,
        storage_dir: &Path,
    ) -> Result<()> {
        if !config.source.make_archive && !config.source.copy_to_dest {
            return Ok(());
        }
        let root = config
            .source
            .root
            .clone()
            .unwrap_or_else(|| work_dir.to_path_buf());
        let mut copier = SourceCopier::new(
            &root,
            storage_dir,
            &config.source.includes,
            &config.source.excludes,
        )?;
        if config.source.make_archive {
            let count = copier.pack_zip(&storage_dir.join("source.zip"))?;
            info!(count, "source archive packed");
        }
        if config.source.copy_to_dest {
            copier.clone_dir()?;
        }
        Ok(())
    }

    fn start_watcher(
        config: &MLRunnerConfig,
        client: &Arc<MLStorageClient>,
        id: &str,
        storage_dir: &Path,
    ) -> Option<JsonFileWatcher> {
        if !config.integration.watch_results {
            return None;
        }
        let mut files = vec!["config.json".to_string(), "config.defaults.json".to_string()];
        for file in &config.integration.result_files {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
        let client = Arc::clone(client);
        let id = id.to_string();
        Some(JsonFileWatcher::start(
            storage_dir,
            files,
            Duration::from_secs(config.integration.watch_interval_secs),
            move |name, object| {
                let field = match name {
                    "result.json" => "result",
                    "webapp.json" => "webapp",
                    "config.json" => "config",
                    "config.defaults.json" => "default_config",
                    _ => "result",
                };
                let mut fields = Map::new();
                fields.insert(field.to_string(), Value::Object(object.clone()));
                if let Err(e) = client.update(&id, fields) {
                    warn!(file = %name, "failed to push {field} update: {e}");
                }
            },
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_program(
        config: &MLRunnerConfig,
        client: &Arc<MLStorageClient>,
        id: &str,
        storage_dir: &Path,
        work_dir: &Path,
        env: BTreeMap<String, String>,
        args: CommandLine,
    ) -> i32 {
        let mut host = ProgramHost::new(args)
            .env(env)
            .work_dir(work_dir)
            .log_file(storage_dir.join(&config.integration.log_file))
            .append_log(true)
            .log_to_stdout(true);

        if config.integration.parse_stdout {
            let client = Arc::clone(client);
            let id = id.to_string();
            let webapps: Arc<Mutex<Map<String, Value>>> = Arc::new(Mutex::new(Map::new()));
            host = host.parser(Box::new(LineBuffered::new(WebUiHandler::new(
                move |name: &str, uri: &str| {
                    let mut apps = webapps.lock().unwrap_or_else(PoisonError::into_inner);
                    let seen = apps.get(name).and_then(Value::as_str) == Some(uri);
                    if !seen {
                        apps.insert(name.to_string(), Value::String(uri.to_string()));
                        let mut fields = Map::new();
                        fields.insert("webapp".to_string(), Value::Object(apps.clone()));
                        if let Err(e) = client.update(&id, fields) {
                            warn!("failed to push webapp update: {e}");
                        }
                    }
                },
            ))));
        }

        match host.run() {
            Ok(code) => code,
            Err(e) => {
                error!("failed to launch program: {e}");
                let mut fields = Map::new();
                fields.insert(
                    "error".to_string(),
                    serde_json::json!({"message": format!("failed to launch program: {e}")}),
                );
                if let Err(e) = client.update(id, fields) {
                    warn!("failed to report launch error: {e}");
                }
                LAUNCH_FAILED_EXIT_CODE
            }
        }
    }

    /// Report the final status. Server trouble at this point is logged but
    /// never overrides the program's exit code.
    fn finish(client: &MLStorageClient, id: &str, exit_code: i32) {
        let status = if exit_code == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let mut fields = Map::new();
        fields.insert("exit_code".to_string(), Value::from(exit_code));
        if status == RunStatus::Failed {
            fields.insert(
                "error".to_string(),
                serde_json::json!({
                    "message": format!("main program exited with code {exit_code}")
                }),
            );
        }
        match client.set_finished(id, status, fields) {
            Ok(_) => info!(id = %id, exit_code, "experiment run finished"),
            Err(e) => error!("failed to mark experiment finished: {e}"),
        }
    }
}

/// Integration environment for the launched program and its daemons.
fn build_program_env(
    config: &MLRunnerConfig,
    server: &str,
    id: &str,
    storage_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env = config.env.clone();
    env.insert(ENV_SERVER_URI.to_string(), server.to_string());
    env.insert(ENV_EXPERIMENT_ID.to_string(), id.to_string());
    env.insert(
        ENV_OUTPUT_DIR.to_string(),
        storage_dir.to_string_lossy().into_owned(),
    );
    if !config.gpu.is_empty() {
        let devices = config
            .gpu
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), devices);
    }
    env
}

/// Recursive directory copy, used when cloning a previous run's storage.
fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Keeps daemon programs alive until the main program finishes.
struct DaemonPool {
    stop: Arc<AtomicBool>,
    // One slot per daemon, holding the killer for its current incarnation.
    killers: Arc<Mutex<Vec<Option<ProgramKiller>>>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl DaemonPool {
    fn start(
        daemons: &[CommandLine],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
        storage_dir: &Path,
        config: &MLRunnerConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let killers: Arc<Mutex<Vec<Option<ProgramKiller>>>> =
            Arc::new(Mutex::new(vec![None; daemons.len()]));
        let mut threads = Vec::new();

        for (index, daemon) in daemons.iter().enumerate() {
            let daemon = daemon.clone();
            let env = env.clone();
            let work_dir = work_dir.to_path_buf();
            let log_file = storage_dir.join(format!(
                "daemon.{index}.{}",
                &config.integration.log_file
            ));
            let stop = Arc::clone(&stop);
            let killers = Arc::clone(&killers);

            threads.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let host = ProgramHost::new(daemon.clone())
                        .env(env.clone())
                        .work_dir(&work_dir)
                        .log_file(&log_file)
                        .append_log(true)
                        .log_to_stdout(false);
                    let handle = match host.spawn() {
                        Ok(handle) => handle,
                        Err(e) => {
                            warn!(daemon = %daemon.display(), "daemon failed to start: {e}");
                            break;
                        }
                    };
                    // Registered so the pool can kill it on stop; restarts
                    // replace the slot instead of growing the list.
                    killers.lock().unwrap_or_else(PoisonError::into_inner)[index] =
                        Some(handle.killer());
                    match handle.wait() {
                        Ok(code) => {
                            if !stop.load(Ordering::SeqCst) {
                                warn!(daemon = %daemon.display(), code, "daemon exited, restarting");
                            }
                        }
                        Err(e) => {
                            warn!(daemon = %daemon.display(), "daemon wait failed: {e}");
                            break;
                        }
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(DAEMON_RESTART_DELAY);
                }
            }));
        }

        Self {
            stop,
            killers,
            threads,
        }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        for killer in self
            .killers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
        {
            killer.kill();
        }
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Periodic server heartbeats on a background thread.
struct Heartbeat {
    stop_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Heartbeat {
    fn start(client: Arc<MLStorageClient>, id: String, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = client.heartbeat(&id) {
                        warn!("heartbeat failed: {e}");
                    }
                }
                _ => break,
            }
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
