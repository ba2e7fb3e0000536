//! Experiment context for training programs
//!
//! A program that wants the same conveniences `mlrun` provides to Python
//! scripts can open an [`Experiment`] at startup: it resolves the output
//! directory (server-assigned when launched under `mlrun`), restores and
//! saves the typed config, accumulates result metrics into `result.json`,
//! and packs result subdirectories into zip archives.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use ml_essentials::experiment::Experiment;
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct TrainConfig {
//!     max_epoch: u32,
//!     learning_rate: f64,
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut exp: Experiment<TrainConfig> = Experiment::new("train").open()?;
//!     let epochs = exp.config().max_epoch;
//!     for _epoch in 0..epochs {
//!         // train...
//!     }
//!     exp.update_results([("test_acc".to_string(), 0.95.into())])?;
//!     exp.close()?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::client::{ClientError, MLStorageClient};
use crate::config::{defaults_of, to_flat_map, ConfigError, ConfigLoader};
use crate::runner::{ENV_EXPERIMENT_ID, ENV_OUTPUT_DIR, ENV_SERVER_URI};

/// Errors from the experiment context
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("existing result file is not a JSON object: {0}")]
    BadResultFile(PathBuf),
}

/// Result alias for experiment operations
pub type Result<T> = std::result::Result<T, ExperimentError>;

struct DeferredArchive {
    source_dir: String,
    archive_file: Option<String>,
    delete_source: bool,
}

/// Configures and opens an [`Experiment`].
pub struct ExperimentBuilder<T> {
    script_name: String,
    output_dir: Option<PathBuf>,
    load_config_file: bool,
    save_config_file: bool,
    args: Option<Vec<String>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> ExperimentBuilder<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(script_name: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            output_dir: None,
            load_config_file: true,
            save_config_file: true,
            args: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Use this output directory instead of the resolved default.
    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Restore config values from files in the output dir (default true).
    /// Resumed runs pick up their previous configuration this way.
    #[must_use]
    pub fn load_config_file(mut self, enabled: bool) -> Self {
        self.load_config_file = enabled;
        self
    }

    /// Write `config.json` and `config.defaults.json` (default true).
    #[must_use]
    pub fn save_config_file(mut self, enabled: bool) -> Self {
        self.save_config_file = enabled;
        self
    }

    /// Command line arguments to parse for `--key=value` config overrides.
    /// Defaults to the process arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = Some(args);
        self
    }

    /// Resolve the output dir, load the config and enter the experiment.
    pub fn open(self) -> Result<Experiment<T>> {
        let args = self
            .args
            .unwrap_or_else(|| std::env::args().skip(1).collect());
        let (args, arg_output_dir) = extract_output_dir(args);

        // Output dir priority: --output-dir, then the builder, then the
        // launcher-assigned dir, then ./results/<script_name>.
        let output_dir = arg_output_dir
            .map(PathBuf::from)
            .or(self.output_dir)
            .or_else(|| std::env::var(ENV_OUTPUT_DIR).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(format!("./results/{}", self.script_name)));
        let output_dir = absolutize(output_dir)?;

        let mut loader: ConfigLoader<T> = ConfigLoader::new();
        if self.load_config_file {
            for name in ["config.yml", "config.json"] {
                let path = output_dir.join(name);
                if path.is_file() {
                    loader.load_file(&path)?;
                }
            }
        }
        loader.parse_args(&args)?;
        let config = loader.get()?;

        fs::create_dir_all(&output_dir)?;

        let id = std::env::var(ENV_EXPERIMENT_ID).ok().filter(|s| !s.is_empty());
        let client = match std::env::var(ENV_SERVER_URI) {
            Ok(uri) if !uri.is_empty() => Some(MLStorageClient::new(&uri)?),
            _ => None,
        };

        let mut exp = Experiment {
            script_name: self.script_name,
            output_dir,
            config,
            results: Map::new(),
            id,
            client,
            save_config_file: self.save_config_file,
            deferred: Vec::new(),
            closed: false,
        };
        if exp.save_config_file {
            exp.save_config()?;
        }
        Ok(exp)
    }
}

/// An open experiment: typed config, output dir and result accumulation.
pub struct Experiment<T> {
    script_name: String,
    output_dir: PathBuf,
    config: T,
    results: Map<String, Value>,
    id: Option<String>,
    client: Option<MLStorageClient>,
    save_config_file: bool,
    deferred: Vec<DeferredArchive>,
    closed: bool,
}

impl<T> Experiment<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Start configuring an experiment for `script_name`.
    pub fn new(script_name: impl Into<String>) -> ExperimentBuilder<T> {
        ExperimentBuilder::new(script_name)
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn config(&self) -> &T {
        &self.config
    }

    /// Mutable config access. Call [`save_config`](Self::save_config) to
    /// persist modifications before `close`.
    pub fn config_mut(&mut self) -> &mut T {
        &mut self.config
    }

    /// The experiment id assigned by the launcher, if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The storage server client, when launched under `mlrun`.
    pub fn client(&self) -> Option<&MLStorageClient> {
        self.client.as_ref()
    }

    pub fn results(&self) -> &Map<String, Value> {
        &self.results
    }

    /// Write `config.json` and `config.defaults.json` in flattened
    /// dotted-key form, the shape the storage server indexes.
    pub fn save_config(&self) -> Result<()> {
        write_flat_json(&self.output_dir.join("config.json"), &to_flat_map(&self.config)?)?;
        write_flat_json(
            &self.output_dir.join("config.defaults.json"),
            &defaults_of::<T>()?,
        )?;
        Ok(())
    }

    /// Write `result.json`, merging over whatever is already on disk so
    /// results from a resumed run accumulate.
    pub fn save_results(&self) -> Result<()> {
        let path = self.output_dir.join("result.json");
        let mut merged = match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => match serde_json::from_str(&text)? {
                Value::Object(map) => map,
                _ => return Err(ExperimentError::BadResultFile(path)),
            },
            _ => Map::new(),
        };
        for (key, value) in &self.results {
            merged.insert(key.clone(), value.clone());
        }
        if !merged.is_empty() {
            fs::write(&path, serde_json::to_string_pretty(&Value::Object(merged))?)?;
        }
        Ok(())
    }

    /// Merge `updates` into the in-memory results and persist them.
    pub fn update_results(
        &mut self,
        updates: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<()> {
        for (key, value) in updates {
            self.results.insert(key, value);
        }
        self.save_results()
    }

    /// The absolute path of `relpath` inside the output dir.
    pub fn abspath(&self, relpath: impl AsRef<Path>) -> PathBuf {
        self.output_dir.join(relpath)
    }

    /// Create a directory (and its ancestors) inside the output dir.
    pub fn make_dirs(&self, relpath: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.abspath(relpath);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Create the parent directory of `relpath` inside the output dir.
    pub fn make_parent(&self, relpath: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.abspath(relpath);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Write a file inside the output dir, creating parents as needed.
    pub fn put_file_content(
        &self,
        relpath: impl AsRef<Path>,
        content: &[u8],
        append: bool,
    ) -> Result<()> {
        let path = self.make_parent(relpath)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        file.write_all(content)?;
        Ok(())
    }

    /// Read a file inside the output dir.
    pub fn get_file_content(&self, relpath: impl AsRef<Path>) -> Result<Vec<u8>> {
        Ok(fs::read(self.abspath(relpath))?)
    }

    /// Pack a result subdirectory into a zip archive.
    ///
    /// `archive_file` defaults to `source_dir + ".zip"`. If the archive
    /// already exists its entries are kept, with files from `source_dir`
    /// replacing entries of the same name. With `delete_source` the source
    /// directory is removed afterwards, which keeps the inode count down
    /// across many repeated runs.
    pub fn make_archive(
        &self,
        source_dir: &str,
        archive_file: Option<&str>,
        delete_source: bool,
    ) -> Result<PathBuf> {
        let source = self.abspath(source_dir);
        if !source.is_dir() {
            return Err(ExperimentError::NotADirectory(source));
        }
        let archive = match archive_file {
            Some(name) => self.abspath(name),
            None => {
                let trimmed = source_dir.trim_end_matches(['/', '\\']);
                self.abspath(format!("{trimmed}.zip"))
            }
        };

        // Old entries first so new files of the same name win.
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if archive.is_file() {
            let mut old = ZipArchive::new(File::open(&archive)?)?;
            for index in 0..old.len() {
                let mut entry = old.by_index(index)?;
                if entry.is_dir() {
                    continue;
                }
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                entries.insert(entry.name().to_string(), content);
            }
        }
        collect_dir(&source, "", &mut entries)?;

        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = ZipWriter::new(File::create(&archive)?);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, content) in &entries {
            writer.start_file(name, options)?;
            writer.write_all(content)?;
        }
        writer.finish()?;

        if delete_source {
            fs::remove_dir_all(&source)?;
        }
        Ok(archive)
    }

    /// Defer a [`make_archive`](Self::make_archive) until `close`.
    pub fn make_archive_on_exit(
        &mut self,
        source_dir: &str,
        archive_file: Option<&str>,
        delete_source: bool,
    ) {
        self.deferred.push(DeferredArchive {
            source_dir: source_dir.to_string(),
            archive_file: archive_file.map(str::to_string),
            delete_source,
        });
    }

    /// Leave the experiment: run deferred archives, then persist the
    /// config and results one last time.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<()> {
        let deferred = std::mem::take(&mut self.deferred);
        let mut first_error = None;
        for archive in deferred {
            let result = self.make_archive(
                &archive.source_dir,
                archive.archive_file.as_deref(),
                archive.delete_source,
            );
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        if self.save_config_file {
            if let Err(e) = self.save_config() {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.save_results() {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T> Drop for Experiment<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            // Fallback for code paths that never reach close().
            if let Err(e) = self.close_impl_dyn() {
                warn!("experiment teardown failed: {e}");
            }
        }
    }
}

impl<T> Experiment<T> {
    // Drop cannot require the serde bounds, so the fallback only persists
    // the results, which need no typed config.
    fn close_impl_dyn(&mut self) -> Result<()> {
        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            warn!("deferred archives skipped; call close() to run them");
        }
        let path = self.output_dir.join("result.json");
        let mut merged = match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => match serde_json::from_str(&text)? {
                Value::Object(map) => map,
                _ => return Err(ExperimentError::BadResultFile(path)),
            },
            _ => Map::new(),
        };
        for (key, value) in &self.results {
            merged.insert(key.clone(), value.clone());
        }
        if !merged.is_empty() {
            fs::write(&path, serde_json::to_string_pretty(&Value::Object(merged))?)?;
        }
        Ok(())
    }
}

/// Pull `--output-dir <DIR>` / `--output-dir=<DIR>` out of the args.
fn extract_output_dir(args: Vec<String>) -> (Vec<String>, Option<String>) {
    let mut rest = Vec::with_capacity(args.len());
    let mut output_dir = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--output-dir=") {
            output_dir = Some(value.to_string());
        } else if arg == "--output-dir" {
            output_dir = iter.next();
        } else {
            rest.push(arg);
        }
    }
    (rest, output_dir)
}

fn absolutize(path: PathBuf) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn write_flat_json(path: &Path, flat: &BTreeMap<String, Value>) -> Result<()> {
    let mut map = Map::new();
    for (key, value) in flat {
        map.insert(key.clone(), value.clone());
    }
    fs::write(path, serde_json::to_string_pretty(&Value::Object(map))?)?;
    Ok(())
}

fn collect_dir(dir: &Path, prefix: &str, out: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if entry.file_type()?.is_dir() {
            collect_dir(&entry.path(), &rel, out)?;
        } else {
            out.insert(rel, fs::read(entry.path())?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct DemoConfig {
        max_epoch: u32,
        learning_rate: f64,
        optimizer: String,
    }

    impl Default for DemoConfig {
        fn default() -> Self {
            Self {
                max_epoch: 100,
                learning_rate: 0.001,
                optimizer: "adam".to_string(),
            }
        }
    }

    fn open_in(dir: &Path, args: Vec<String>) -> Experiment<DemoConfig> {
        Experiment::new("demo")
            .output_dir(dir)
            .args(args)
            .open()
            .expect("experiment should open")
    }

    #[test]
    fn defaults_and_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = open_in(dir.path(), vec!["--max_epoch=200".to_string()]);

        assert_eq!(exp.config().max_epoch, 200);
        assert_eq!(exp.config().learning_rate, 0.001);
        assert_eq!(exp.output_dir(), dir.path());

        let saved: Value = serde_json::from_slice(
            &fs::read(dir.path().join("config.json")).expect("config.json should exist"),
        )
        .expect("valid json");
        assert_eq!(saved["max_epoch"], json!(200));

        let defaults: Value = serde_json::from_slice(
            &fs::read(dir.path().join("config.defaults.json")).expect("defaults should exist"),
        )
        .expect("valid json");
        assert_eq!(defaults["max_epoch"], json!(100));
        exp.close().expect("close should succeed");
    }

    #[test]
    fn config_file_restored_on_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let exp = open_in(dir.path(), vec!["--optimizer=sgd".to_string()]);
            exp.close().expect("close should succeed");
        }
        // Second open without args resumes the saved config.
        let exp = open_in(dir.path(), Vec::new());
        assert_eq!(exp.config().optimizer, "sgd");
        exp.close().expect("close should succeed");
    }

    #[test]
    fn output_dir_argument_wins() {
        let base = tempfile::tempdir().expect("tempdir");
        let chosen = base.path().join("chosen");
        let exp: Experiment<DemoConfig> = Experiment::new("demo")
            .output_dir(base.path().join("ignored"))
            .args(vec![format!("--output-dir={}", chosen.display())])
            .open()
            .expect("experiment should open");
        assert_eq!(exp.output_dir(), chosen);
        exp.close().expect("close should succeed");
    }

    #[test]
    fn results_merge_over_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("result.json"),
            r#"{"epoch": 3, "train_loss": 0.5}"#,
        )
        .expect("seed result file");

        let mut exp = open_in(dir.path(), Vec::new());
        exp.update_results([("train_loss".to_string(), json!(0.25))])
            .expect("update should succeed");

        let merged: Value = serde_json::from_slice(
            &fs::read(dir.path().join("result.json")).expect("result.json should exist"),
        )
        .expect("valid json");
        assert_eq!(merged["epoch"], json!(3));
        assert_eq!(merged["train_loss"], json!(0.25));
        exp.close().expect("close should succeed");
    }

    #[test]
    fn archives_merge_existing_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = open_in(dir.path(), Vec::new());

        exp.put_file_content("ckpt/epoch1.bin", b"one", false)
            .expect("write file");
        exp.make_archive("ckpt", None, true).expect("first archive");
        assert!(!dir.path().join("ckpt").exists());

        exp.put_file_content("ckpt/epoch2.bin", b"two", false)
            .expect("write file");
        exp.make_archive("ckpt", None, true).expect("second archive");

        let mut archive =
            ZipArchive::new(File::open(dir.path().join("ckpt.zip")).expect("open archive"))
                .expect("valid archive");
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        assert!(names.contains(&"epoch1.bin".to_string()));
        assert!(names.contains(&"epoch2.bin".to_string()));
        exp.close().expect("close should succeed");
    }

    #[test]
    fn path_helpers_stay_inside_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = open_in(dir.path(), Vec::new());

        let nested = exp.make_dirs("a/b").expect("make_dirs");
        assert!(nested.is_dir());
        assert_eq!(nested, dir.path().join("a/b"));

        exp.put_file_content("a/c/notes.txt", b"hello", false)
            .expect("put content");
        assert_eq!(
            exp.get_file_content("a/c/notes.txt").expect("get content"),
            b"hello"
        );
        exp.close().expect("close should succeed");
    }
}
