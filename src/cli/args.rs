//! CLI argument parsing for the `mlrun` launcher

use clap::Parser;
use std::path::PathBuf;

/// mlrun: run an experiment and report it to an ML Storage server
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "mlrun")]
#[command(version)]
#[command(about = "Run a program as a tracked experiment on an ML Storage server")]
#[command(
    after_help = "Example:\n  mlrun -s http://server:8080 -- python train.py --max_epoch=200"
)]
pub struct Cli {
    /// URI of the ML Storage server
    #[arg(short, long, env = "MLSTORAGE_SERVER_URI", value_name = "URI")]
    pub server: Option<String>,

    /// Experiment name (defaults to the command line)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Experiment description
    #[arg(long)]
    pub description: Option<String>,

    /// Tag attached to the experiment document
    #[arg(short, long = "tags", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Environment variable for the program
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// GPU device index to expose via CUDA_VISIBLE_DEVICES
    #[arg(short, long = "gpu", value_name = "N")]
    pub gpu: Vec<u32>,

    /// Working directory for the program
    #[arg(short = 'w', long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Extra config file, loaded after the discovered `.mlrun.*` files
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Vec<PathBuf>,

    /// Daemon command (shell form) kept alive alongside the program
    #[arg(long = "daemon", value_name = "CMD")]
    pub daemon: Vec<String>,

    /// Resume a previous experiment instead of creating a new one
    #[arg(long, value_name = "ID", conflicts_with = "clone_from")]
    pub resume_from: Option<String>,

    /// Start from a copy of a previous experiment's storage dir
    #[arg(long, value_name = "ID")]
    pub clone_from: Option<String>,

    /// Do not pack the source tree into source.zip
    #[arg(long)]
    pub no_source_archive: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// The program and its arguments
    #[arg(last = true, required = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

/// Parse CLI arguments from a string slice (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_launch() {
        let cli = parse_args([
            "mlrun", "-s", "http://server:8080", "--", "python", "train.py",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("http://server:8080"));
        assert_eq!(cli.args, vec!["python", "train.py"]);
        assert!(!cli.no_source_archive);
    }

    #[test]
    fn test_parse_full_flags() {
        let cli = parse_args([
            "mlrun",
            "-s",
            "http://server:8080",
            "-n",
            "mnist baseline",
            "--description",
            "first attempt",
            "-t",
            "mnist",
            "-t",
            "baseline",
            "-e",
            "SEED=42",
            "-g",
            "0",
            "-g",
            "1",
            "-w",
            "/work",
            "-c",
            "extra.yml",
            "--daemon",
            "tensorboard --logdir .",
            "--no-source-archive",
            "--",
            "python",
            "train.py",
            "--max_epoch=200",
        ])
        .unwrap();
        assert_eq!(cli.name.as_deref(), Some("mnist baseline"));
        assert_eq!(cli.tags, vec!["mnist", "baseline"]);
        assert_eq!(cli.env, vec![("SEED".to_string(), "42".to_string())]);
        assert_eq!(cli.gpu, vec![0, 1]);
        assert_eq!(cli.work_dir, Some(PathBuf::from("/work")));
        assert_eq!(cli.config_file, vec![PathBuf::from("extra.yml")]);
        assert_eq!(cli.daemon, vec!["tensorboard --logdir ."]);
        assert!(cli.no_source_archive);
        assert_eq!(cli.args, vec!["python", "train.py", "--max_epoch=200"]);
    }

    #[test]
    fn test_program_args_are_required() {
        assert!(parse_args(["mlrun", "-s", "http://server:8080"]).is_err());
    }

    #[test]
    fn test_env_requires_key_value_form() {
        assert!(parse_args(["mlrun", "-e", "NOEQUALS", "--", "true"]).is_err());
        assert!(parse_args(["mlrun", "-e", "=bare", "--", "true"]).is_err());
    }

    #[test]
    fn test_resume_conflicts_with_clone() {
        assert!(parse_args([
            "mlrun",
            "--resume-from",
            "abc",
            "--clone-from",
            "def",
            "--",
            "true",
        ])
        .is_err());
    }

    #[test]
    fn test_flags_after_separator_go_to_program() {
        let cli = parse_args(["mlrun", "--", "python", "train.py", "--verbose"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(cli.args, vec!["python", "train.py", "--verbose"]);
    }
}
