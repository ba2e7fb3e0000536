//! mlrun CLI
//!
//! Launcher that runs a program as a tracked experiment on an ML Storage
//! server.
//!
//! # Usage
//!
//! ```bash
//! # Run a training script
//! mlrun -s http://server:8080 -- python train.py
//!
//! # With a name, tags and GPU assignment
//! mlrun -s http://server:8080 -n "mnist baseline" -t mnist -g 0 -- python train.py
//!
//! # Resume an interrupted experiment
//! mlrun -s http://server:8080 --resume-from 5e01234 -- python train.py
//! ```

use clap::Parser;
use ml_essentials::cli::{init_logging, run_command, Cli};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run_command(cli) {
        // The launcher exits with the program's own exit code.
        Ok(code) => ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
