//! CLI entry point (§6): `rtl-fanout [config_path]`.
//!
//! Mirrors the three-line startup banner `rtl_mus.py::main()` prints before
//! anything else, reworked for this project's own name and attribution
//! rather than copied verbatim.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use core::config::Config;
use logging::LogConfig;

/// Multi-user fan-out proxy for a single `rtl_tcp` dongle.
#[derive(Debug, Parser)]
#[command(name = "rtl-fanout", version, about)]
struct Args {
    /// Path to the TOML config file (§6: "program [config_module_name]").
    #[arg(default_value = "rtl-fanout.toml")]
    config: PathBuf,

    /// Override `log_file_path` from the config file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    println!("rtl-fanout {} - multi-user rtl_tcp fan-out proxy", env!("CARGO_PKG_VERSION"));
    println!("    distributed under the GNU GPL v3");
    println!();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(log_file) = args.log_file {
        config.log_file_path = Some(log_file);
    }

    let _logging_guard = match logging::init(LogConfig {
        log_file_path: config.log_file_path.clone(),
    }) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(core::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}
