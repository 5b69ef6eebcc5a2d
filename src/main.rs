mod backup;
mod configure;
mod error;
mod iam;
mod identity;
mod inventory;
mod progress;
mod report;
mod rotate;
mod settings;
mod storage;
#[cfg(test)]
mod testutil;

use crate::error::{ExitStatus, RotateError};
use crate::iam::Aws;
use crate::rotate::Rotator;
use crate::settings::{LogMode, Logging, Settings};
use crate::storage::Storage;
use clap::{Parser, ValueEnum};
use std::fs;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Rotates the access keys of locally configured AWS profiles.
#[derive(Debug, Parser)]
#[clap(version)]
struct Opts {
    /// Profile in the shared credentials file
    #[clap(short, long, default_value = "default")]
    profile: String,

    #[clap(short, long, value_enum, default_value = "list")]
    operation: Operation,

    /// Operate on the keys of another iam user (or the profile holding them)
    #[clap(short, long)]
    user_name: Option<String>,

    /// Suppress key lists and progress output
    #[clap(short, long)]
    quiet: bool,

    /// Edit local settings (with --debug, show them)
    #[clap(short, long)]
    configure: bool,

    /// Report key age and expiration for every profile
    #[clap(short = 'R', long)]
    key_report: bool,

    #[clap(short, long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Operation {
    /// Show the access keys of the profile
    List,
    /// Rotate the access keys of the profile
    Up,
}

fn init_logging(logging: &Logging, debug: bool) -> anyhow::Result<()> {
    let default = if debug {
        "debug"
    } else if logging.enabled {
        "info"
    } else {
        "off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.enabled && logging.mode == LogMode::File {
        let dir = logging.path.parent().filter(|p| !p.as_os_str().is_empty());
        let file = logging
            .path
            .file_name()
            .ok_or_else(|| anyhow::format_err!("no file name in {}", logging.path.display()))?;
        if let Some(dir) = dir {
            fs::create_dir_all(dir)?;
        }
        let appender = tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), file);
        builder.with_ansi(false).with_writer(appender).init();
    } else {
        builder.with_writer(io::stderr).init();
    }
    Ok(())
}

/// Settings for this run. `--configure` accepts a file that fails
/// validation so it can be repaired; the wizard validates before saving.
async fn load_settings(path: &Path, configure: bool) -> Result<Settings, RotateError> {
    let settings = if configure {
        Settings::read(path).await?
    } else {
        Settings::load(path).await?
    };
    Ok(settings)
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let settings_path = Settings::path().map_err(RotateError::from)?;
    let settings = load_settings(&settings_path, opts.configure).await?;
    init_logging(&settings.logging, opts.debug)?;
    tracing::debug!(opts = ?opts);

    if opts.configure {
        return configure::main(settings, settings_path, opts.debug).await;
    }

    let path = Storage::path().map_err(RotateError::from)?;
    let mut storage = Storage::load(&path).await.map_err(RotateError::from)?;
    let connector = Aws;

    if opts.key_report {
        report::run(&connector, &storage, &settings.key_metadata, opts.quiet).await;
        return Ok(());
    }

    let surrogate = opts.user_name.as_deref();
    let mut rotator = Rotator::new(&settings, &connector, opts.quiet);
    match opts.operation {
        Operation::List => {
            rotator.list(&storage, &opts.profile, surrogate).await?;
        }
        Operation::Up => {
            let outcome = rotator.rotate(&mut storage, &opts.profile, surrogate).await?;
            tracing::info!(
                profile = %outcome.profile,
                deprecated = %outcome.deprecated_key_id,
                access_key_id = %outcome.access_key_id,
                verified = outcome.verified,
                stages = ?outcome.stages,
                "rotation complete"
            );
            if !opts.quiet {
                println!(
                    "Rotated {}: {} replaced by {}",
                    outcome.profile, outcome.deprecated_key_id, outcome.access_key_id
                );
                if !outcome.verified {
                    println!("The new key could not be confirmed yet; check again with --operation list.");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(error = %message, "aborted");
            eprintln!("Error: {message}");
            ExitStatus::of(&err).into()
        }
    }
}
