use crate::error::RotateError;
use crate::settings::{LogMode, Settings};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Edits the local settings interactively, or with `show` prints the
/// effective settings instead.
pub(crate) async fn main(settings: Settings, path: PathBuf, show: bool) -> anyhow::Result<()> {
    if show {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        if let Err(err) = settings.validate() {
            println!("\nWarning: {err}. Run with --configure to correct it.");
        }
        if tokio::fs::metadata(&path).await.is_err() {
            println!(
                "\nNo settings file at {}; defaults are in effect. Run with --configure to create one.",
                path.display()
            );
        }
        return Ok(());
    }

    let edited = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        wizard(stdin.lock(), stdout.lock(), &settings)
    })
    .await??;
    let edited = edited.ok_or(RotateError::Cancelled)?;
    edited.validate().map_err(RotateError::from)?;
    edited.save(&path).await.map_err(RotateError::from)?;
    tracing::info!(path = %path.display(), "settings saved");
    println!("\nSettings written to {}", path.display());
    Ok(())
}

/// Runs the question sequence, starting from `current`. Returns `None` when
/// the opening prompt is declined.
pub(crate) fn wizard<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    current: &Settings,
) -> io::Result<Option<Settings>> {
    let mut prompt = Prompt {
        input: &mut input,
        output: &mut output,
    };
    writeln!(prompt.output, "\n    aws-key-rotate local configuration\n")?;
    if !prompt.confirm("Configure local settings now?", false)? {
        writeln!(prompt.output, "Cancelled, settings unchanged.")?;
        return Ok(None);
    }

    let mut settings = current.clone();

    let logging = &mut settings.logging;
    logging.enabled = prompt.confirm("Enable logging?", logging.enabled)?;
    if logging.enabled {
        logging.mode = prompt.parse("Log to FILE or STREAM?", logging.mode)?;
        if logging.mode == LogMode::File {
            logging.path = prompt.path("Log file path", &logging.path)?;
        }
    }

    let keys = &mut settings.key_metadata;
    keys.keyage_max_days = prompt.parse("Maximum key age in days", keys.keyage_max_days)?;
    keys.keyage_warning_days =
        prompt.parse("Warn when fewer days than this remain", keys.keyage_warning_days)?;
    keys.key_deprecation = prompt.parse(
        "Key to retire when two exist (AGE or CURRENT_IN_USE)",
        keys.key_deprecation,
    )?;
    keys.rotation_delay_secs =
        prompt.parse("Seconds to wait for new keys to propagate", keys.rotation_delay_secs)?;

    let backup = &mut settings.key_backup;
    backup.enabled = prompt.confirm("Write a backup copy of new keys?", backup.enabled)?;
    if backup.enabled {
        backup.location = prompt.path("Backup directory", &backup.location)?;
    }

    Ok(Some(settings))
}

struct Prompt<'a, R, W> {
    input: &'a mut R,
    output: &'a mut W,
}

impl<R: BufRead, W: Write> Prompt<'_, R, W> {
    /// Reads one answer; an empty line or end of input yields `None`.
    fn ask(&mut self, question: &str, hint: &str) -> io::Result<Option<String>> {
        write!(self.output, "{question} [{hint}]: ")?;
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        let answer = line.trim();
        Ok((!answer.is_empty()).then(|| answer.to_owned()))
    }

    fn confirm(&mut self, question: &str, default: bool) -> io::Result<bool> {
        let hint = if default { "Y/n" } else { "y/N" };
        loop {
            let Some(answer) = self.ask(question, hint)? else {
                return Ok(default);
            };
            match answer.to_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => writeln!(self.output, "  '{answer}' is not y or n")?,
            }
        }
    }

    fn parse<T>(&mut self, question: &str, default: T) -> io::Result<T>
    where
        T: FromStr + ToString,
    {
        let hint = default.to_string();
        loop {
            let Some(answer) = self.ask(question, &hint)? else {
                return Ok(default);
            };
            match answer.parse() {
                Ok(value) => return Ok(value),
                Err(_) => writeln!(self.output, "  '{answer}' is not a valid answer")?,
            }
        }
    }

    fn path(&mut self, question: &str, default: &Path) -> io::Result<PathBuf> {
        Ok(self
            .ask(question, &default.display().to_string())?
            .map_or_else(|| default.to_owned(), PathBuf::from))
    }
}
