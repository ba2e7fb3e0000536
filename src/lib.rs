//! ML Essentials
//!
//! Utilities for running and tracking machine learning experiments against
//! an ML Storage server:
//!
//! - [`config`]: layered config loading with dotted-key merging.
//! - [`client`]: HTTP client for the server's experiment document API.
//! - [`runner`]: the `mlrun` launcher that hosts a program, snapshots its
//!   source, and relays its metadata and results to the server.
//! - [`experiment`]: the in-process context a launched program can open to
//!   read its config and write its results.
//! - [`cli`]: the `mlrun` binary's argument parsing and command.

pub mod cli;
pub mod client;
pub mod config;
pub mod experiment;
pub mod runner;

pub use client::{ExperimentDoc, MLStorageClient, RunStatus};
pub use config::ConfigLoader;
pub use experiment::Experiment;
pub use runner::{MLRunner, MLRunnerConfig, MLRunnerConfigLoader};
pub use runner::{ENV_EXPERIMENT_ID, ENV_OUTPUT_DIR, ENV_SERVER_URI};
