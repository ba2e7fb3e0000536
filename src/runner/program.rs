//! Program host
//!
//! Spawns the user's command, merges its stderr into the captured stream,
//! tees everything to the log file (and our stdout), and returns the exit
//! code. Daemons use [`ProgramHost::spawn`] directly so the runner can kill
//! them once the main program finishes.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::config::CommandLine;
use super::output::{OutputLogger, OutputParser};

/// Poll interval while waiting for the child to exit.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Read buffer size for the output pipes.
const CHUNK_SIZE: usize = 8192;

/// Hosts one program execution.
pub struct ProgramHost {
    command: CommandLine,
    env: BTreeMap<String, String>,
    work_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    append_log: bool,
    log_to_stdout: bool,
    parser: Option<Box<dyn OutputParser>>,
}

impl ProgramHost {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            work_dir: None,
            log_file: None,
            append_log: true,
            log_to_stdout: true,
            parser: None,
        }
    }

    /// Extra environment variables for the child.
    #[must_use]
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Working directory for the child.
    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Capture file for merged stdout/stderr.
    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Append to an existing capture file instead of truncating it.
    #[must_use]
    pub fn append_log(mut self, append: bool) -> Self {
        self.append_log = append;
        self
    }

    /// Tee captured output to our own stdout.
    #[must_use]
    pub fn log_to_stdout(mut self, enabled: bool) -> Self {
        self.log_to_stdout = enabled;
        self
    }

    /// Attach an output parser.
    #[must_use]
    pub fn parser(mut self, parser: Box<dyn OutputParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    fn build_command(&self) -> io::Result<Command> {
        let mut cmd = match &self.command {
            CommandLine::Shell(line) => {
                let mut cmd = Command::new(shell_program());
                cmd.arg(shell_flag()).arg(line);
                cmd
            }
            CommandLine::Exec(args) => {
                let (program, rest) = args.split_first().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "command line is empty")
                })?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
        };
        // Keep interpreter output unbuffered so the capture stays live.
        cmd.env("PYTHONUNBUFFERED", "1");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }

    /// Spawn the program without waiting for it.
    pub fn spawn(mut self) -> io::Result<ProgramHandle> {
        // Reject an unrunnable command before touching the log file.
        let mut cmd = self.build_command()?;
        let logger = OutputLogger::open(
            self.log_file.as_deref(),
            self.append_log,
            self.log_to_stdout,
        )?;
        let mut child = cmd.spawn()?;
        debug!(command = %self.command.display(), "program started");

        let sink = Arc::new(Mutex::new(Sink {
            logger,
            parser: self.parser.take(),
        }));

        let mut io_threads = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            io_threads.push(spawn_reader(stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            io_threads.push(spawn_reader(stderr, Arc::clone(&sink)));
        }

        Ok(ProgramHandle {
            child: Arc::new(Mutex::new(child)),
            io_threads,
            sink,
        })
    }

    /// Run the program to completion and return its exit code.
    pub fn run(self) -> io::Result<i32> {
        self.spawn()?.wait()
    }
}

struct Sink {
    logger: OutputLogger,
    parser: Option<Box<dyn OutputParser>>,
}

impl Sink {
    fn write(&mut self, chunk: &[u8]) {
        self.logger.write(chunk);
        if let Some(parser) = &mut self.parser {
            parser.parse(chunk);
        }
    }

    fn flush(&mut self) {
        if let Some(parser) = &mut self.parser {
            parser.flush();
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    sink: Arc<Mutex<Sink>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("program output read failed: {e}");
                    break;
                }
            }
        }
    })
}

/// A spawned program that can be awaited or killed.
pub struct ProgramHandle {
    child: Arc<Mutex<Child>>,
    io_threads: Vec<thread::JoinHandle<()>>,
    sink: Arc<Mutex<Sink>>,
}

impl ProgramHandle {
    /// Wait for the program to exit; drains output and flushes the parser.
    pub fn wait(mut self) -> io::Result<i32> {
        let status = loop {
            let polled = self
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()?;
            match polled {
                Some(status) => break status,
                None => thread::sleep(WAIT_POLL),
            }
        };
        for handle in self.io_threads.drain(..) {
            let _ = handle.join();
        }
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
        Ok(exit_code(status))
    }

    /// Kill the program. Safe to call after it has already exited.
    pub fn kill(&self) {
        kill_child(&self.child);
    }

    /// A handle that can kill the program from another thread while this
    /// handle is blocked in [`wait`](Self::wait).
    pub fn killer(&self) -> ProgramKiller {
        ProgramKiller {
            child: Arc::clone(&self.child),
        }
    }
}

/// Kill-only view of a spawned program.
#[derive(Clone)]
pub struct ProgramKiller {
    child: Arc<Mutex<Child>>,
}

impl ProgramKiller {
    pub fn kill(&self) {
        kill_child(&self.child);
    }
}

fn kill_child(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = child.kill() {
        if e.kind() != io::ErrorKind::InvalidInput {
            debug!("kill failed: {e}");
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(unix)]
fn shell_program() -> &'static str {
    "sh"
}

#[cfg(unix)]
fn shell_flag() -> &'static str {
    "-c"
}

#[cfg(not(unix))]
fn shell_program() -> &'static str {
    "cmd"
}

#[cfg(not(unix))]
fn shell_flag() -> &'static str {
    "/C"
}
