//! pass-indexer-checker: smoke test for PASS repository-to-index propagation.
//!
//! Exit status is 0 when every check passes and 1 otherwise.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use pass_indexer_checker_core::app::{App, AppOptions};
use pass_indexer_checker_core::config::DEFAULT_CONFIG_FILE;
use pass_indexer_checker_core::error::format_error_with_remediation;
use pass_indexer_checker_core::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use pass_indexer_checker_core::notify::DEFAULT_MAIL_CONFIG_FILE;
use pass_indexer_checker_core::wait::CancelToken;
use tracing::warn;

/// Check that the PASS index is configured, populated, and tracking repository writes
#[derive(Parser, Debug)]
#[command(
    name = "pass-indexer-checker",
    version,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Print help message
    #[arg(short = 'h', long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Print version information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// E-mail a failure report using the mail settings file
    #[arg(short = 'e', long = "email")]
    email: bool,

    /// Settings file; missing means defaults
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Mail settings file, required with --email
    #[arg(long, value_name = "PATH", default_value = DEFAULT_MAIL_CONFIG_FILE)]
    mail_config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, value_name = "LEVEL", default_value = "info", value_parser = parse_log_level)]
    log_level: String,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Also append logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }

    fn app_options(&self) -> AppOptions {
        AppOptions {
            email: self.email,
            config_path: self.config.clone(),
            mail_config_path: self.mail_config.clone(),
        }
    }
}

fn parse_log_level(value: &str) -> Result<String, String> {
    value.parse::<LogLevel>().map(|_| value.to_string())
}

/// Accept the single-dash long forms `-help` and `-version`.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some("-help") => OsString::from("--help"),
            Some("-version") => OsString::from("--version"),
            _ => arg,
        })
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    if let Err(e) = init_logging(&cli.log_config()).context("failed to initialize logging") {
        eprintln!("Error: {e:#}");
        return ExitCode::from(1);
    }

    let (handle, cancel) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping");
            handle.cancel();
        }
    });

    match run(&cli, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", format_error_with_remediation(&e));
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli, cancel: &CancelToken) -> pass_indexer_checker_core::Result<()> {
    let app = App::load(&cli.app_options())?;
    app.run(cancel).await?;
    Ok(())
}
