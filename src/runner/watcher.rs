//! Result file watcher
//!
//! Programs running under `mlrun` report by writing JSON files
//! (`result.json`, `webapp.json`, ...) into their storage dir. The watcher
//! polls those files from a background thread and hands every changed,
//! well-formed object to a callback, which the runner turns into document
//! updates. Stopping forces one final check so a write that lands just
//! before exit is still pushed.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, SystemTime};

use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Watches JSON files in a directory from a background thread.
pub struct JsonFileWatcher {
    stop_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl JsonFileWatcher {
    /// Start watching `files` (relative to `dir`), polling every
    /// `interval`. The callback receives the file name and the parsed
    /// object whenever a file changes.
    pub fn start<F>(dir: impl Into<PathBuf>, files: Vec<String>, interval: Duration, callback: F) -> Self
    where
        F: FnMut(&str, &Map<String, Value>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel();
        let dir = dir.into();
        let handle = thread::spawn(move || watch_loop(dir, files, interval, stop_rx, callback));
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the watcher after one final check.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JsonFileWatcher {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

type FileStamp = (SystemTime, u64);

fn watch_loop<F>(
    dir: PathBuf,
    files: Vec<String>,
    interval: Duration,
    stop_rx: mpsc::Receiver<()>,
    mut callback: F,
) where
    F: FnMut(&str, &Map<String, Value>),
{
    let mut seen: HashMap<String, FileStamp> = HashMap::new();
    loop {
        let stopping = !matches!(stop_rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout));
        check_files(&dir, &files, &mut seen, &mut callback);
        if stopping {
            break;
        }
    }
}

fn check_files<F>(
    dir: &PathBuf,
    files: &[String],
    seen: &mut HashMap<String, FileStamp>,
    callback: &mut F,
) where
    F: FnMut(&str, &Map<String, Value>),
{
    for name in files {
        let path = dir.join(name);
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        let stamp: FileStamp = (
            meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            meta.len(),
        );
        if seen.get(name) == Some(&stamp) {
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(object)) => {
                    debug!(file = %name, "result file changed");
                    seen.insert(name.clone(), stamp);
                    callback(name, &object);
                }
                Ok(_) => {
                    warn!(file = %name, "result file is not a JSON object");
                    seen.insert(name.clone(), stamp);
                }
                // Likely caught mid-write; retry on the next tick.
                Err(e) => debug!(file = %name, "result file not parseable yet: {e}"),
            },
            Err(e) => warn!(file = %name, "cannot read result file: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn final_check_catches_last_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let watcher = JsonFileWatcher::start(
            dir.path(),
            vec!["result.json".to_string()],
            Duration::from_secs(3600),
            move |name, object| {
                sink.lock()
                    .unwrap()
                    .push((name.to_string(), Value::Object(object.clone())));
            },
        );

        fs::write(dir.path().join("result.json"), r#"{"acc": 0.9}"#).unwrap();
        watcher.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "result.json");
        assert_eq!(seen[0].1["acc"], serde_json::json!(0.9));
    }

    #[test]
    fn unchanged_files_fire_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("webapp.json"), r#"{"TensorBoard": "http://x:6006"}"#).unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let watcher = JsonFileWatcher::start(
            dir.path(),
            vec!["webapp.json".to_string()],
            Duration::from_millis(20),
            move |_, _| *sink.lock().unwrap() += 1,
        );
        thread::sleep(Duration::from_millis(120));
        watcher.stop();

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn non_object_json_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("result.json"), "[1, 2, 3]").unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let watcher = JsonFileWatcher::start(
            dir.path(),
            vec!["result.json".to_string()],
            Duration::from_secs(3600),
            move |_, _| *sink.lock().unwrap() += 1,
        );
        watcher.stop();

        assert_eq!(*count.lock().unwrap(), 0);
    }
}
